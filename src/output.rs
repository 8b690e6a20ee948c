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

use std::collections::{BTreeMap, BTreeSet};

use bitcoin::util::bip32::KeySource;
use bitcoin::util::taproot::TapLeafHash;
use bitcoin::{PublicKey, Script, XOnlyPublicKey};

use crate::input::merge_map;
use crate::raw;
use crate::sign::SignatureData;

/// A leaf of the taproot script tree as it is declared on an output:
/// depth in the tree, leaf version and the script itself. The tree is a
/// depth-first ordered list of these.
pub type TapTreeLeaf = (u8, u8, Script);

/// Per-output record of a PSKT: spending metadata future holders of the
/// created coin will need.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Output {
    /// The redeem script for this output.
    pub redeem_script: Option<Script>,

    /// The witness script for this output.
    pub witness_script: Option<Script>,

    /// Master fingerprint and derivation path for keys this output pays.
    pub bip32_derivation: BTreeMap<bitcoin::secp256k1::PublicKey, KeySource>,

    /// Taproot internal key.
    pub tap_internal_key: Option<XOnlyPublicKey>,

    /// Taproot script tree, depth-first.
    pub tap_tree: Option<Vec<TapTreeLeaf>>,

    /// Taproot key origins: x-only key to the leaf hashes it appears in
    /// and its key source.
    pub tap_bip32_derivation: BTreeMap<XOnlyPublicKey, (BTreeSet<TapLeafHash>, KeySource)>,

    /// Proprietary key-value pairs for this output.
    pub proprietary: BTreeMap<raw::ProprietaryKey, Vec<u8>>,

    /// Unknown key-value pairs for this output.
    pub unknown: BTreeMap<raw::Key, Vec<u8>>,
}

impl Output {
    /// Whether every field of the record is absent or empty.
    pub fn is_null(&self) -> bool {
        self.redeem_script.is_none()
            && self.witness_script.is_none()
            && self.bip32_derivation.is_empty()
            && self.tap_internal_key.is_none()
            && self.tap_tree.is_none()
            && self.tap_bip32_derivation.is_empty()
            && self.proprietary.is_empty()
            && self.unknown.is_empty()
    }

    /// Fuses `other` into this record with the same field rules as the
    /// per-input merge.
    pub fn combine(&mut self, other: Output) {
        merge_map(&mut self.bip32_derivation, other.bip32_derivation);
        merge_map(&mut self.tap_bip32_derivation, other.tap_bip32_derivation);
        merge_map(&mut self.proprietary, other.proprietary);
        merge_map(&mut self.unknown, other.unknown);

        if self.redeem_script.is_none() {
            self.redeem_script = other.redeem_script;
        }
        if self.witness_script.is_none() {
            self.witness_script = other.witness_script;
        }
        if self.tap_internal_key.is_none() {
            self.tap_internal_key = other.tap_internal_key;
        }
        if self.tap_tree.is_none() {
            self.tap_tree = other.tap_tree;
        }
    }

    /// Copies the record into a [`SignatureData`] bundle so the metadata
    /// updater can run the signing pipeline against the output script.
    pub fn fill_signature_data(&self) -> SignatureData {
        let mut sigdata = SignatureData::default();
        sigdata.redeem_script = self.redeem_script.clone();
        sigdata.witness_script = self.witness_script.clone();
        for (pubkey, origin) in &self.bip32_derivation {
            let pubkey = PublicKey::new(*pubkey);
            sigdata
                .misc_pubkeys
                .insert(pubkey.pubkey_hash(), (pubkey, Some(origin.clone())));
        }
        sigdata.tr_spenddata.internal_key = self.tap_internal_key;
        for (pubkey, leaves_origin) in &self.tap_bip32_derivation {
            sigdata
                .taproot_misc_pubkeys
                .insert(*pubkey, leaves_origin.clone());
        }
        sigdata
    }

    /// Writes provider-discovered metadata back into the record. Unlike
    /// the input-side counterpart there is no terminal form: outputs only
    /// ever accumulate scripts and key origins.
    pub fn from_signature_data(&mut self, sigdata: SignatureData) {
        if self.redeem_script.is_none() {
            self.redeem_script = sigdata.redeem_script;
        }
        if self.witness_script.is_none() {
            self.witness_script = sigdata.witness_script;
        }
        for (_, (pubkey, origin)) in sigdata.misc_pubkeys {
            if let Some(origin) = origin {
                self.bip32_derivation.insert(pubkey.inner, origin);
            }
        }
        if self.tap_internal_key.is_none() {
            self.tap_internal_key = sigdata.tr_spenddata.internal_key;
        }
        for (pubkey, leaves_origin) in sigdata.taproot_misc_pubkeys {
            self.tap_bip32_derivation
                .entry(pubkey)
                .or_insert(leaves_origin);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn combine_fills_only_empty_scalars() {
        let a_script = Script::from(vec![0x51]);
        let b_script = Script::from(vec![0x52]);

        let mut a = Output {
            witness_script: Some(a_script.clone()),
            ..Output::default()
        };
        let b = Output {
            witness_script: Some(b_script),
            redeem_script: Some(a_script.clone()),
            ..Output::default()
        };
        a.combine(b);

        // existing value wins, absent value is filled
        assert_eq!(a.witness_script, Some(a_script.clone()));
        assert_eq!(a.redeem_script, Some(a_script));
    }

    #[test]
    fn null_predicate() {
        let mut output = Output::default();
        assert!(output.is_null());
        output.unknown.insert(raw::Key::from_type(0xee), vec![1]);
        assert!(!output.is_null());
    }
}
