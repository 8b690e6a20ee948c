// PSKT: partially signed koyotecoin transaction library
//
// Written in 2022-2023 by
//     The Koyotecoin developers
//
// This software is distributed without any warranty.
//
// You should have received a copy of the Apache-2.0 License
// along with this software.
// If not, see <https://opensource.org/licenses/Apache-2.0>.

//! Raw PSKT key/value records: the untyped layer underneath the typed
//! field schedule. Records whose type code the decoder does not recognize
//! are kept at this level so they survive a re-encode byte-for-byte.

use std::fmt::{self, Display, Formatter};

use bitcoin::consensus::encode::{deserialize_partial, serialize, VarInt};
use bitcoin::hashes::hex::ToHex;

/// Type code carried by every proprietary record.
pub const PROPRIETARY_TYPE: u8 = 0xfc;

/// A raw record key: one-byte type code plus free-form key data.
///
/// Ordering is (type code, key bytes), which is also the canonical record
/// emission order within a section.
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct Key {
    /// The type code of this key.
    pub type_value: u8,
    /// The key data itself.
    pub key: Vec<u8>,
}

impl Key {
    /// Key with the given type code and empty key data.
    pub fn from_type(type_value: u8) -> Key {
        Key {
            type_value,
            key: vec![],
        }
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "type: {:#x}, key: {}", self.type_value, self.key.to_hex())
    }
}

/// Key of a proprietary record: a third-party identifier, a subtype under
/// that identifier and free-form key data.
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct ProprietaryKey {
    /// Identifier of the namespace owner (usually an ASCII vendor tag).
    pub prefix: Vec<u8>,
    /// Record subtype within the namespace.
    pub subtype: u8,
    /// Key data within the (prefix, subtype) namespace.
    pub key: Vec<u8>,
}

impl ProprietaryKey {
    /// Parses the key data of a `0xfc` record.
    ///
    /// Returns `None` when the data is too short to contain the declared
    /// prefix and the subtype byte.
    pub fn from_key_data(data: &[u8]) -> Option<ProprietaryKey> {
        let (len, consumed) = deserialize_partial::<VarInt>(data).ok()?;
        let prefix_end = consumed.checked_add(len.0 as usize)?;
        if data.len() < prefix_end + 1 {
            return None;
        }
        Some(ProprietaryKey {
            prefix: data[consumed..prefix_end].to_vec(),
            subtype: data[prefix_end],
            key: data[prefix_end + 1..].to_vec(),
        })
    }

    /// Serializes into the key data of a `0xfc` record.
    pub fn to_key_data(&self) -> Vec<u8> {
        let mut data = serialize(&VarInt(self.prefix.len() as u64));
        data.extend_from_slice(&self.prefix);
        data.push(self.subtype);
        data.extend_from_slice(&self.key);
        data
    }

    /// The raw record key carrying this proprietary key.
    pub fn to_key(&self) -> Key {
        Key {
            type_value: PROPRIETARY_TYPE,
            key: self.to_key_data(),
        }
    }
}

impl Display for ProprietaryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prefix: {}, subtype: {:#x}, key: {}",
            self.prefix.to_hex(),
            self.subtype,
            self.key.to_hex()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn proprietary_key_data_roundtrip() {
        let key = ProprietaryKey {
            prefix: b"kyc".to_vec(),
            subtype: 7,
            key: vec![0xde, 0xad],
        };
        let data = key.to_key_data();
        assert_eq!(ProprietaryKey::from_key_data(&data), Some(key));
    }

    #[test]
    fn proprietary_key_data_short() {
        // declares a 5-byte prefix but carries only 2 bytes after it
        assert_eq!(ProprietaryKey::from_key_data(&[5, b'a', b'b']), None);
        assert_eq!(ProprietaryKey::from_key_data(&[]), None);
    }

    #[test]
    fn key_ordering_is_type_then_bytes() {
        let a = Key {
            type_value: 1,
            key: vec![0xff],
        };
        let b = Key {
            type_value: 2,
            key: vec![0x00],
        };
        assert!(a < b);
    }
}
