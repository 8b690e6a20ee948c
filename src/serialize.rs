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

//! Bit-exact PSKT wire codec.
//!
//! A serialized PSKT is the 5-byte magic prefix, the global key/value
//! section, one section per transaction input and one per output, each
//! section a run of `<varint keylen><keytype byte><key data><varint
//! vallen><value data>` records closed by a single `0x00` byte. Records
//! with unrecognized type codes round-trip verbatim through the `unknown`
//! maps. Encoding is canonical: known records ascending by type code,
//! then proprietary, then unknown.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use base64::Engine;
use bitcoin::consensus::encode::{deserialize, deserialize_partial, serialize, VarInt};
use bitcoin::hashes::{hash160, ripemd160, sha256, sha256d, Hash};
use bitcoin::util::bip32::{ChildNumber, DerivationPath, ExtendedPubKey, Fingerprint, KeySource};
use bitcoin::util::taproot::{TapBranchHash, TapLeafHash};
use bitcoin::{PublicKey, Script, Transaction, TxOut, Witness, XOnlyPublicKey};

use crate::input::PsktSighashType;
use crate::raw;
use crate::{Input, Output, Pskt};

/// Magic prefix every serialized PSKT starts with: `pskt` plus `0xff`.
pub const PSKT_MAGIC: [u8; 5] = [0x70, 0x73, 0x6b, 0x74, 0xff];

// Global section type codes.
const PSKT_GLOBAL_UNSIGNED_TX: u8 = 0x00;
const PSKT_GLOBAL_XPUB: u8 = 0x01;
const PSKT_GLOBAL_VERSION: u8 = 0xfb;

// Per-input section type codes.
const PSKT_IN_NON_WITNESS_UTXO: u8 = 0x00;
const PSKT_IN_WITNESS_UTXO: u8 = 0x01;
const PSKT_IN_PARTIAL_SIG: u8 = 0x02;
const PSKT_IN_SIGHASH_TYPE: u8 = 0x03;
const PSKT_IN_REDEEM_SCRIPT: u8 = 0x04;
const PSKT_IN_WITNESS_SCRIPT: u8 = 0x05;
const PSKT_IN_BIP32_DERIVATION: u8 = 0x06;
const PSKT_IN_FINAL_SCRIPTSIG: u8 = 0x07;
const PSKT_IN_FINAL_SCRIPTWITNESS: u8 = 0x08;
const PSKT_IN_RIPEMD160: u8 = 0x0a;
const PSKT_IN_SHA256: u8 = 0x0b;
const PSKT_IN_HASH160: u8 = 0x0c;
const PSKT_IN_HASH256: u8 = 0x0d;
const PSKT_IN_TAP_KEY_SIG: u8 = 0x13;
const PSKT_IN_TAP_SCRIPT_SIG: u8 = 0x14;
const PSKT_IN_TAP_LEAF_SCRIPT: u8 = 0x15;
const PSKT_IN_TAP_BIP32_DERIVATION: u8 = 0x16;
const PSKT_IN_TAP_INTERNAL_KEY: u8 = 0x17;
const PSKT_IN_TAP_MERKLE_ROOT: u8 = 0x18;

// Per-output section type codes.
const PSKT_OUT_REDEEM_SCRIPT: u8 = 0x00;
const PSKT_OUT_WITNESS_SCRIPT: u8 = 0x01;
const PSKT_OUT_BIP32_DERIVATION: u8 = 0x02;
const PSKT_OUT_TAP_INTERNAL_KEY: u8 = 0x05;
const PSKT_OUT_TAP_TREE: u8 = 0x06;
const PSKT_OUT_TAP_BIP32_DERIVATION: u8 = 0x07;

/// Errors of decoding a PSKT from raw bytes.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum DecodeError {
    /// the data does not start with the PSKT magic prefix
    BadMagic,

    /// the data ends in the middle of a record
    Truncated,

    /// extra bytes remain after the last per-output section
    TrailingBytes,

    /// two records within one section share the key ({0})
    DuplicateKey(raw::Key),

    /// malformed key or value for a record of type {0:#04x}
    InvalidTypeValue(u8),

    /// the global section carries no unsigned transaction
    MissingUnsignedTx,

    /// the scriptSig of unsigned-transaction input #{0} is not empty
    UnsignedTxHasScriptSigs(usize),

    /// the witness of unsigned-transaction input #{0} is not empty
    UnsignedTxHasScriptWitnesses(usize),

    /// the data holds {actual} of the {expected} per-input and per-output
    /// sections
    SectionCountMismatch {
        /// Sections required by the unsigned transaction.
        expected: usize,
        /// Sections present before the data ended.
        actual: usize,
    },
}

/// Encoding into the canonical PSKT byte form.
pub trait Serialize {
    /// Serializes into raw bytes.
    fn serialize(&self) -> Vec<u8>;
}

/// Decoding from PSKT bytes.
pub trait Deserialize: Sized {
    /// Deserializes from raw bytes.
    fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError>;
}

impl Serialize for Pskt {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&PSKT_MAGIC);
        encode_global(&mut buf, self);
        for input in &self.inputs {
            encode_input(&mut buf, input);
        }
        for output in &self.outputs {
            encode_output(&mut buf, output);
        }
        buf
    }
}

impl Deserialize for Pskt {
    fn deserialize(bytes: &[u8]) -> Result<Pskt, DecodeError> {
        let mut reader = Reader::new(bytes);
        if reader.read_bytes(5)? != PSKT_MAGIC {
            return Err(DecodeError::BadMagic);
        }

        let mut pskt = decode_global(&mut reader)?;
        let expected = pskt.unsigned_tx.input.len() + pskt.unsigned_tx.output.len();

        for index in 0..pskt.unsigned_tx.input.len() {
            if reader.is_empty() {
                return Err(DecodeError::SectionCountMismatch {
                    expected,
                    actual: index,
                });
            }
            pskt.inputs.push(decode_input(&mut reader)?);
        }
        for index in 0..pskt.unsigned_tx.output.len() {
            if reader.is_empty() {
                return Err(DecodeError::SectionCountMismatch {
                    expected,
                    actual: pskt.unsigned_tx.input.len() + index,
                });
            }
            pskt.outputs.push(decode_output(&mut reader)?);
        }
        if !reader.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }

        Ok(pskt)
    }
}

/// Parse errors of the base64 text framing.
#[derive(Debug, Display, Error, From)]
#[display(inner)]
pub enum PsktParseError {
    /// Invalid PSKT payload.
    #[from]
    Data(DecodeError),

    /// Invalid base64 framing.
    #[from]
    Base64(base64::DecodeError),
}

impl Display for Pskt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let engine = base64::engine::GeneralPurpose::new(
            &base64::alphabet::STANDARD,
            base64::engine::GeneralPurposeConfig::new(),
        );
        f.write_str(&engine.encode(self.serialize()))
    }
}

impl FromStr for Pskt {
    type Err = PsktParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let engine = base64::engine::GeneralPurpose::new(
            &base64::alphabet::STANDARD,
            base64::engine::GeneralPurposeConfig::new(),
        );
        let bytes = engine.decode(s)?;
        Pskt::deserialize(&bytes).map_err(PsktParseError::from)
    }
}

// ------------------------------------------------------------------------
// record-level reading

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let (value, consumed) = deserialize_partial::<VarInt>(&self.data[self.pos..])
            .map_err(|_| DecodeError::Truncated)?;
        self.pos += consumed;
        Ok(value.0)
    }

    fn read_bytes(&mut self, len: u64) -> Result<&'a [u8], DecodeError> {
        let len = usize::try_from(len).map_err(|_| DecodeError::Truncated)?;
        if self.data.len() - self.pos < len {
            return Err(DecodeError::Truncated);
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Next record of the current section, `None` at the terminator.
    /// `seen` implements the per-section duplicate-key rule.
    fn read_record(
        &mut self,
        seen: &mut BTreeSet<raw::Key>,
    ) -> Result<Option<(raw::Key, Vec<u8>)>, DecodeError> {
        let key_len = self.read_varint()?;
        if key_len == 0 {
            return Ok(None);
        }
        let key_bytes = self.read_bytes(key_len)?;
        let key = raw::Key {
            type_value: key_bytes[0],
            key: key_bytes[1..].to_vec(),
        };
        let value_len = self.read_varint()?;
        let value = self.read_bytes(value_len)?.to_vec();

        if !seen.insert(key.clone()) {
            return Err(DecodeError::DuplicateKey(key));
        }
        Ok(Some((key, value)))
    }
}

fn write_record(buf: &mut Vec<u8>, type_value: u8, key_data: &[u8], value: &[u8]) {
    buf.extend(serialize(&VarInt(key_data.len() as u64 + 1)));
    buf.push(type_value);
    buf.extend_from_slice(key_data);
    buf.extend(serialize(&VarInt(value.len() as u64)));
    buf.extend_from_slice(value);
}

fn write_unknown(buf: &mut Vec<u8>, key: &raw::Key, value: &[u8]) {
    write_record(buf, key.type_value, &key.key, value);
}

// ------------------------------------------------------------------------
// typed value helpers

fn consensus_value<T: bitcoin::consensus::Decodable>(
    type_value: u8,
    value: &[u8],
) -> Result<T, DecodeError> {
    deserialize(value).map_err(|_| DecodeError::InvalidTypeValue(type_value))
}

fn expect_empty_key(key: &raw::Key) -> Result<(), DecodeError> {
    if key.key.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::InvalidTypeValue(key.type_value))
    }
}

fn u32_value(type_value: u8, value: &[u8]) -> Result<u32, DecodeError> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| DecodeError::InvalidTypeValue(type_value))?;
    Ok(u32::from_le_bytes(bytes))
}

fn key_source_from_slice(type_value: u8, value: &[u8]) -> Result<KeySource, DecodeError> {
    if value.len() < 4 || value.len() % 4 != 0 {
        return Err(DecodeError::InvalidTypeValue(type_value));
    }
    let fingerprint = Fingerprint::from(&value[0..4]);
    let path = value[4..]
        .chunks(4)
        .map(|chunk| {
            ChildNumber::from(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        })
        .collect::<Vec<_>>();
    Ok((fingerprint, DerivationPath::from(path)))
}

fn key_source_to_vec(source: &KeySource) -> Vec<u8> {
    let mut value = source.0[..].to_vec();
    for child in source.1.as_ref() {
        value.extend(u32::from(*child).to_le_bytes());
    }
    value
}

fn hash_value<H: Hash>(type_value: u8, data: &[u8]) -> Result<H, DecodeError> {
    H::from_slice(data).map_err(|_| DecodeError::InvalidTypeValue(type_value))
}

fn preimage_value<H: Hash>(key: &raw::Key, preimage: &[u8]) -> Result<H, DecodeError> {
    let declared = hash_value::<H>(key.type_value, &key.key)?;
    if <H as Hash>::hash(preimage) != declared {
        return Err(DecodeError::InvalidTypeValue(key.type_value));
    }
    Ok(declared)
}

fn signature_value(type_value: u8, value: &[u8]) -> Result<Vec<u8>, DecodeError> {
    match value.len() {
        64 | 65 => Ok(value.to_vec()),
        _ => Err(DecodeError::InvalidTypeValue(type_value)),
    }
}

// ------------------------------------------------------------------------
// global section

fn encode_global(buf: &mut Vec<u8>, pskt: &Pskt) {
    write_record(
        buf,
        PSKT_GLOBAL_UNSIGNED_TX,
        &[],
        &serialize(&pskt.unsigned_tx),
    );
    for (origin, xpubs) in &pskt.xpubs {
        for xpub in xpubs {
            write_record(buf, PSKT_GLOBAL_XPUB, &xpub.encode(), &key_source_to_vec(origin));
        }
    }
    if let Some(version) = pskt.version {
        write_record(buf, PSKT_GLOBAL_VERSION, &[], &version.to_le_bytes());
    }
    for (key, value) in &pskt.proprietary {
        write_record(buf, raw::PROPRIETARY_TYPE, &key.to_key_data(), value);
    }
    for (key, value) in &pskt.unknown {
        write_unknown(buf, key, value);
    }
    buf.push(0);
}

fn decode_global(reader: &mut Reader) -> Result<Pskt, DecodeError> {
    let mut seen = BTreeSet::new();
    let mut unsigned_tx: Option<Transaction> = None;
    let mut version = None;
    let mut xpubs = std::collections::BTreeMap::new();
    let mut proprietary = std::collections::BTreeMap::new();
    let mut unknown = std::collections::BTreeMap::new();

    while let Some((key, value)) = reader.read_record(&mut seen)? {
        match key.type_value {
            PSKT_GLOBAL_UNSIGNED_TX => {
                expect_empty_key(&key)?;
                let tx: Transaction = consensus_value(key.type_value, &value)?;
                for (index, txin) in tx.input.iter().enumerate() {
                    if !txin.script_sig.is_empty() {
                        return Err(DecodeError::UnsignedTxHasScriptSigs(index));
                    }
                    if !txin.witness.is_empty() {
                        return Err(DecodeError::UnsignedTxHasScriptWitnesses(index));
                    }
                }
                unsigned_tx = Some(tx);
            }
            PSKT_GLOBAL_XPUB => {
                let xpub = ExtendedPubKey::decode(&key.key)
                    .map_err(|_| DecodeError::InvalidTypeValue(key.type_value))?;
                let origin = key_source_from_slice(key.type_value, &value)?;
                xpubs
                    .entry(origin)
                    .or_insert_with(BTreeSet::new)
                    .insert(xpub);
            }
            PSKT_GLOBAL_VERSION => {
                expect_empty_key(&key)?;
                version = Some(u32_value(key.type_value, &value)?);
            }
            raw::PROPRIETARY_TYPE => {
                let prop = raw::ProprietaryKey::from_key_data(&key.key)
                    .ok_or(DecodeError::InvalidTypeValue(key.type_value))?;
                proprietary.insert(prop, value);
            }
            _ => {
                unknown.insert(key, value);
            }
        }
    }

    let unsigned_tx = unsigned_tx.ok_or(DecodeError::MissingUnsignedTx)?;
    Ok(Pskt {
        inputs: Vec::with_capacity(unsigned_tx.input.len()),
        outputs: Vec::with_capacity(unsigned_tx.output.len()),
        unsigned_tx,
        version,
        xpubs,
        proprietary,
        unknown,
    })
}

// ------------------------------------------------------------------------
// per-input sections

fn encode_input(buf: &mut Vec<u8>, input: &Input) {
    if let Some(tx) = &input.non_witness_utxo {
        write_record(buf, PSKT_IN_NON_WITNESS_UTXO, &[], &serialize(tx));
    }
    if let Some(txout) = &input.witness_utxo {
        write_record(buf, PSKT_IN_WITNESS_UTXO, &[], &serialize(txout));
    }
    for (pubkey, sig) in &input.partial_sigs {
        write_record(buf, PSKT_IN_PARTIAL_SIG, &pubkey.to_bytes(), sig);
    }
    if let Some(sighash) = input.sighash_type {
        write_record(buf, PSKT_IN_SIGHASH_TYPE, &[], &sighash.to_u32().to_le_bytes());
    }
    if let Some(script) = &input.redeem_script {
        write_record(buf, PSKT_IN_REDEEM_SCRIPT, &[], script.as_bytes());
    }
    if let Some(script) = &input.witness_script {
        write_record(buf, PSKT_IN_WITNESS_SCRIPT, &[], script.as_bytes());
    }
    for (pubkey, origin) in &input.bip32_derivation {
        write_record(
            buf,
            PSKT_IN_BIP32_DERIVATION,
            &pubkey.serialize(),
            &key_source_to_vec(origin),
        );
    }
    if let Some(script) = &input.final_script_sig {
        write_record(buf, PSKT_IN_FINAL_SCRIPTSIG, &[], script.as_bytes());
    }
    if let Some(witness) = &input.final_script_witness {
        write_record(buf, PSKT_IN_FINAL_SCRIPTWITNESS, &[], &serialize(witness));
    }
    for (hash, preimage) in &input.ripemd160_preimages {
        write_record(buf, PSKT_IN_RIPEMD160, &hash.into_inner(), preimage);
    }
    for (hash, preimage) in &input.sha256_preimages {
        write_record(buf, PSKT_IN_SHA256, &hash.into_inner(), preimage);
    }
    for (hash, preimage) in &input.hash160_preimages {
        write_record(buf, PSKT_IN_HASH160, &hash.into_inner(), preimage);
    }
    for (hash, preimage) in &input.hash256_preimages {
        write_record(buf, PSKT_IN_HASH256, &hash.into_inner(), preimage);
    }
    if let Some(sig) = &input.tap_key_sig {
        write_record(buf, PSKT_IN_TAP_KEY_SIG, &[], sig);
    }
    for ((pubkey, leaf_hash), sig) in &input.tap_script_sigs {
        let mut key_data = pubkey.serialize().to_vec();
        key_data.extend_from_slice(&leaf_hash.into_inner());
        write_record(buf, PSKT_IN_TAP_SCRIPT_SIG, &key_data, sig);
    }
    for ((script, leaf_ver), control_blocks) in &input.tap_scripts {
        let mut value = script.to_bytes();
        value.push(*leaf_ver);
        for control_block in control_blocks {
            write_record(buf, PSKT_IN_TAP_LEAF_SCRIPT, control_block, &value);
        }
    }
    for (pubkey, (leaves, origin)) in &input.tap_bip32_derivation {
        write_record(
            buf,
            PSKT_IN_TAP_BIP32_DERIVATION,
            &pubkey.serialize(),
            &tap_key_source_to_vec(leaves, origin),
        );
    }
    if let Some(pubkey) = &input.tap_internal_key {
        write_record(buf, PSKT_IN_TAP_INTERNAL_KEY, &[], &pubkey.serialize());
    }
    if let Some(root) = &input.tap_merkle_root {
        write_record(buf, PSKT_IN_TAP_MERKLE_ROOT, &[], &root.into_inner());
    }
    for (key, value) in &input.proprietary {
        write_record(buf, raw::PROPRIETARY_TYPE, &key.to_key_data(), value);
    }
    for (key, value) in &input.unknown {
        write_unknown(buf, key, value);
    }
    buf.push(0);
}

fn decode_input(reader: &mut Reader) -> Result<Input, DecodeError> {
    let mut seen = BTreeSet::new();
    let mut input = Input::default();

    while let Some((key, value)) = reader.read_record(&mut seen)? {
        match key.type_value {
            PSKT_IN_NON_WITNESS_UTXO => {
                expect_empty_key(&key)?;
                input.non_witness_utxo = Some(consensus_value::<Transaction>(key.type_value, &value)?);
            }
            PSKT_IN_WITNESS_UTXO => {
                expect_empty_key(&key)?;
                input.witness_utxo = Some(consensus_value::<TxOut>(key.type_value, &value)?);
            }
            PSKT_IN_PARTIAL_SIG => {
                let pubkey = PublicKey::from_slice(&key.key)
                    .map_err(|_| DecodeError::InvalidTypeValue(key.type_value))?;
                input.partial_sigs.insert(pubkey, value);
            }
            PSKT_IN_SIGHASH_TYPE => {
                expect_empty_key(&key)?;
                input.sighash_type =
                    Some(PsktSighashType::from_u32(u32_value(key.type_value, &value)?));
            }
            PSKT_IN_REDEEM_SCRIPT => {
                expect_empty_key(&key)?;
                input.redeem_script = Some(Script::from(value));
            }
            PSKT_IN_WITNESS_SCRIPT => {
                expect_empty_key(&key)?;
                input.witness_script = Some(Script::from(value));
            }
            PSKT_IN_BIP32_DERIVATION => {
                let pubkey = bitcoin::secp256k1::PublicKey::from_slice(&key.key)
                    .map_err(|_| DecodeError::InvalidTypeValue(key.type_value))?;
                input
                    .bip32_derivation
                    .insert(pubkey, key_source_from_slice(key.type_value, &value)?);
            }
            PSKT_IN_FINAL_SCRIPTSIG => {
                expect_empty_key(&key)?;
                input.final_script_sig = Some(Script::from(value));
            }
            PSKT_IN_FINAL_SCRIPTWITNESS => {
                expect_empty_key(&key)?;
                input.final_script_witness =
                    Some(consensus_value::<Witness>(key.type_value, &value)?);
            }
            PSKT_IN_RIPEMD160 => {
                let hash = preimage_value::<ripemd160::Hash>(&key, &value)?;
                input.ripemd160_preimages.insert(hash, value);
            }
            PSKT_IN_SHA256 => {
                let hash = preimage_value::<sha256::Hash>(&key, &value)?;
                input.sha256_preimages.insert(hash, value);
            }
            PSKT_IN_HASH160 => {
                let hash = preimage_value::<hash160::Hash>(&key, &value)?;
                input.hash160_preimages.insert(hash, value);
            }
            PSKT_IN_HASH256 => {
                let hash = preimage_value::<sha256d::Hash>(&key, &value)?;
                input.hash256_preimages.insert(hash, value);
            }
            PSKT_IN_TAP_KEY_SIG => {
                expect_empty_key(&key)?;
                input.tap_key_sig = Some(signature_value(key.type_value, &value)?);
            }
            PSKT_IN_TAP_SCRIPT_SIG => {
                if key.key.len() != 64 {
                    return Err(DecodeError::InvalidTypeValue(key.type_value));
                }
                let pubkey = XOnlyPublicKey::from_slice(&key.key[..32])
                    .map_err(|_| DecodeError::InvalidTypeValue(key.type_value))?;
                let leaf_hash = hash_value::<TapLeafHash>(key.type_value, &key.key[32..])?;
                input
                    .tap_script_sigs
                    .insert((pubkey, leaf_hash), signature_value(key.type_value, &value)?);
            }
            PSKT_IN_TAP_LEAF_SCRIPT => {
                if key.key.len() < 33 || (key.key.len() - 33) % 32 != 0 || value.is_empty() {
                    return Err(DecodeError::InvalidTypeValue(key.type_value));
                }
                let (script, leaf_ver) = value.split_at(value.len() - 1);
                input
                    .tap_scripts
                    .entry((Script::from(script.to_vec()), leaf_ver[0]))
                    .or_default()
                    .insert(key.key.clone());
            }
            PSKT_IN_TAP_BIP32_DERIVATION => {
                let pubkey = XOnlyPublicKey::from_slice(&key.key)
                    .map_err(|_| DecodeError::InvalidTypeValue(key.type_value))?;
                input
                    .tap_bip32_derivation
                    .insert(pubkey, tap_key_source_from_slice(key.type_value, &value)?);
            }
            PSKT_IN_TAP_INTERNAL_KEY => {
                expect_empty_key(&key)?;
                input.tap_internal_key = Some(
                    XOnlyPublicKey::from_slice(&value)
                        .map_err(|_| DecodeError::InvalidTypeValue(key.type_value))?,
                );
            }
            PSKT_IN_TAP_MERKLE_ROOT => {
                expect_empty_key(&key)?;
                input.tap_merkle_root = Some(hash_value::<TapBranchHash>(key.type_value, &value)?);
            }
            raw::PROPRIETARY_TYPE => {
                let prop = raw::ProprietaryKey::from_key_data(&key.key)
                    .ok_or(DecodeError::InvalidTypeValue(key.type_value))?;
                input.proprietary.insert(prop, value);
            }
            _ => {
                input.unknown.insert(key, value);
            }
        }
    }

    Ok(input)
}

// ------------------------------------------------------------------------
// per-output sections

fn encode_output(buf: &mut Vec<u8>, output: &Output) {
    if let Some(script) = &output.redeem_script {
        write_record(buf, PSKT_OUT_REDEEM_SCRIPT, &[], script.as_bytes());
    }
    if let Some(script) = &output.witness_script {
        write_record(buf, PSKT_OUT_WITNESS_SCRIPT, &[], script.as_bytes());
    }
    for (pubkey, origin) in &output.bip32_derivation {
        write_record(
            buf,
            PSKT_OUT_BIP32_DERIVATION,
            &pubkey.serialize(),
            &key_source_to_vec(origin),
        );
    }
    if let Some(pubkey) = &output.tap_internal_key {
        write_record(buf, PSKT_OUT_TAP_INTERNAL_KEY, &[], &pubkey.serialize());
    }
    if let Some(tree) = &output.tap_tree {
        let mut value = Vec::new();
        for (depth, leaf_ver, script) in tree {
            value.push(*depth);
            value.push(*leaf_ver);
            value.extend(serialize(&VarInt(script.len() as u64)));
            value.extend_from_slice(script.as_bytes());
        }
        write_record(buf, PSKT_OUT_TAP_TREE, &[], &value);
    }
    for (pubkey, (leaves, origin)) in &output.tap_bip32_derivation {
        write_record(
            buf,
            PSKT_OUT_TAP_BIP32_DERIVATION,
            &pubkey.serialize(),
            &tap_key_source_to_vec(leaves, origin),
        );
    }
    for (key, value) in &output.proprietary {
        write_record(buf, raw::PROPRIETARY_TYPE, &key.to_key_data(), value);
    }
    for (key, value) in &output.unknown {
        write_unknown(buf, key, value);
    }
    buf.push(0);
}

fn decode_output(reader: &mut Reader) -> Result<Output, DecodeError> {
    let mut seen = BTreeSet::new();
    let mut output = Output::default();

    while let Some((key, value)) = reader.read_record(&mut seen)? {
        match key.type_value {
            PSKT_OUT_REDEEM_SCRIPT => {
                expect_empty_key(&key)?;
                output.redeem_script = Some(Script::from(value));
            }
            PSKT_OUT_WITNESS_SCRIPT => {
                expect_empty_key(&key)?;
                output.witness_script = Some(Script::from(value));
            }
            PSKT_OUT_BIP32_DERIVATION => {
                let pubkey = bitcoin::secp256k1::PublicKey::from_slice(&key.key)
                    .map_err(|_| DecodeError::InvalidTypeValue(key.type_value))?;
                output
                    .bip32_derivation
                    .insert(pubkey, key_source_from_slice(key.type_value, &value)?);
            }
            PSKT_OUT_TAP_INTERNAL_KEY => {
                expect_empty_key(&key)?;
                output.tap_internal_key = Some(
                    XOnlyPublicKey::from_slice(&value)
                        .map_err(|_| DecodeError::InvalidTypeValue(key.type_value))?,
                );
            }
            PSKT_OUT_TAP_TREE => {
                expect_empty_key(&key)?;
                let mut tree = Vec::new();
                let mut tree_reader = Reader::new(&value);
                while !tree_reader.is_empty() {
                    let header = tree_reader
                        .read_bytes(2)
                        .map_err(|_| DecodeError::InvalidTypeValue(key.type_value))?;
                    let (depth, leaf_ver) = (header[0], header[1]);
                    let script_len = tree_reader
                        .read_varint()
                        .map_err(|_| DecodeError::InvalidTypeValue(key.type_value))?;
                    let script = tree_reader
                        .read_bytes(script_len)
                        .map_err(|_| DecodeError::InvalidTypeValue(key.type_value))?;
                    tree.push((depth, leaf_ver, Script::from(script.to_vec())));
                }
                output.tap_tree = Some(tree);
            }
            PSKT_OUT_TAP_BIP32_DERIVATION => {
                let pubkey = XOnlyPublicKey::from_slice(&key.key)
                    .map_err(|_| DecodeError::InvalidTypeValue(key.type_value))?;
                output
                    .tap_bip32_derivation
                    .insert(pubkey, tap_key_source_from_slice(key.type_value, &value)?);
            }
            raw::PROPRIETARY_TYPE => {
                let prop = raw::ProprietaryKey::from_key_data(&key.key)
                    .ok_or(DecodeError::InvalidTypeValue(key.type_value))?;
                output.proprietary.insert(prop, value);
            }
            _ => {
                output.unknown.insert(key, value);
            }
        }
    }

    Ok(output)
}

// ------------------------------------------------------------------------
// taproot bip32 values: varint leaf count, leaf hashes, then key source

fn tap_key_source_to_vec(leaves: &BTreeSet<TapLeafHash>, origin: &KeySource) -> Vec<u8> {
    let mut value = serialize(&VarInt(leaves.len() as u64));
    for leaf in leaves {
        value.extend_from_slice(&leaf.into_inner());
    }
    value.extend(key_source_to_vec(origin));
    value
}

fn tap_key_source_from_slice(
    type_value: u8,
    value: &[u8],
) -> Result<(BTreeSet<TapLeafHash>, KeySource), DecodeError> {
    let mut reader = Reader::new(value);
    let count = reader
        .read_varint()
        .map_err(|_| DecodeError::InvalidTypeValue(type_value))?;
    let mut leaves = BTreeSet::new();
    for _ in 0..count {
        let bytes = reader
            .read_bytes(32)
            .map_err(|_| DecodeError::InvalidTypeValue(type_value))?;
        leaves.insert(hash_value::<TapLeafHash>(type_value, bytes)?);
    }
    let origin = key_source_from_slice(type_value, &value[reader.pos..])?;
    Ok((leaves, origin))
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::hex::{FromHex, ToHex};

    // The BIP-174 interchange vector re-framed with the PSKT magic: one
    // legacy input carrying its predecessor transaction, two untouched
    // outputs.
    const FIXTURE: &str = "\
        70736b74ff0100750200000001268171371edff285e937adeea4b37b78000c0566\
        cbb3ad64641713ca42171bf60000000000feffffff02d3dff505000000001976a91\
        4d0c59903c5bac2868760e90fd521a4665aa7652088ac00e1f5050000000017a914\
        3545e6e33b832c47050f24d3eeb93c9c03948bc787b32e1300000100fda50101000\
        00000010289a3c71eab4d20e0371bbba4cc698fa295c9463afa2e397f8533ccb62f\
        9567e50100000017160014be18d152a9b012039daf3da7de4f53349eecb985fffff\
        fff86f8aa43a71dff1448893a530a7237ef6b4608bbb2dd2d0171e63aec6a4890b4\
        0100000017160014fe3e9ef1a745e974d902c4355943abcb34bd5353ffffffff020\
        0c2eb0b000000001976a91485cff1097fd9e008bb34af709c62197b38978a4888ac\
        72fef84e2c00000017a914339725ba21efd62ac753a9bcd067d6c7a6a39d0587024\
        7304402202712be22e0270f394f568311dc7ca9a68970b8025fdd3b240229f07f8a\
        5f3a240220018b38d7dcd314e734c9276bd6fb40f673325bc4baa144c800d2f2f02\
        db2765c012103d2e15674941bad4a996372cb87e1856d3652606d98562fe39c5e9e\
        7e413f210502483045022100d12b852d85dcd961d2f5f4ab660654df6eedcc794c0\
        c33ce5cc309ffb5fce58d022067338a8e0e1725c197fb1a88af59f51e44e4255b20\
        167c8684031c05d1f2592a01210223b72beef0965d10be0778efecd61fcac6f79a4\
        ea169393380734464f84f2ab300000000000000";

    fn fixture_bytes() -> Vec<u8> {
        Vec::<u8>::from_hex(FIXTURE).unwrap()
    }

    #[test]
    fn fixture_roundtrip_is_canonical() {
        let bytes = fixture_bytes();
        let pskt = Pskt::deserialize(&bytes).unwrap();

        assert_eq!(pskt.inputs.len(), 1);
        assert_eq!(pskt.outputs.len(), 2);
        assert!(pskt.inputs[0].non_witness_utxo.is_some());
        assert_eq!(pskt.version(), 0);

        // canonical re-encode reproduces the bytes exactly
        assert_eq!(pskt.serialize().to_hex(), FIXTURE);

        // base64 framing round-trips through Display / FromStr
        let text = pskt.to_string();
        assert_eq!(text.parse::<Pskt>().unwrap(), pskt);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = fixture_bytes();
        bytes[4] = 0xfe;
        assert_eq!(Pskt::deserialize(&bytes), Err(DecodeError::BadMagic));
        assert_eq!(Pskt::deserialize(&bytes[..3]), Err(DecodeError::Truncated));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = fixture_bytes();
        bytes.push(0x00);
        assert_eq!(Pskt::deserialize(&bytes), Err(DecodeError::TrailingBytes));
    }

    #[test]
    fn rejects_missing_sections() {
        let bytes = fixture_bytes();
        // strip the two (empty) output sections
        let truncated = &bytes[..bytes.len() - 2];
        assert_eq!(
            Pskt::deserialize(truncated),
            Err(DecodeError::SectionCountMismatch {
                expected: 3,
                actual: 1,
            })
        );
    }

    #[test]
    fn rejects_duplicate_keys() {
        let pskt = Pskt::deserialize(&fixture_bytes()).unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&PSKT_MAGIC);
        write_record(&mut bytes, PSKT_GLOBAL_UNSIGNED_TX, &[], &serialize(&pskt.unsigned_tx));
        write_record(&mut bytes, PSKT_GLOBAL_UNSIGNED_TX, &[], &serialize(&pskt.unsigned_tx));
        bytes.push(0);
        assert_eq!(
            Pskt::deserialize(&bytes),
            Err(DecodeError::DuplicateKey(raw::Key::from_type(
                PSKT_GLOBAL_UNSIGNED_TX
            )))
        );
    }

    #[test]
    fn rejects_global_section_without_tx() {
        let bytes = [PSKT_MAGIC.as_slice(), &[0x00]].concat();
        assert_eq!(
            Pskt::deserialize(&bytes),
            Err(DecodeError::MissingUnsignedTx)
        );
    }

    #[test]
    fn unknown_and_proprietary_fields_roundtrip() {
        let mut pskt = Pskt::deserialize(&fixture_bytes()).unwrap();

        pskt.unknown.insert(
            raw::Key {
                type_value: 0xef,
                key: vec![0x01, 0x02],
            },
            vec![0xaa, 0xbb],
        );
        pskt.proprietary.insert(
            raw::ProprietaryKey {
                prefix: b"kyc".to_vec(),
                subtype: 1,
                key: vec![9],
            },
            vec![0xcc],
        );
        pskt.inputs[0].unknown.insert(
            raw::Key {
                type_value: 0xe0,
                key: vec![],
            },
            vec![0x01],
        );
        pskt.version = Some(0);

        let decoded = Pskt::deserialize(&pskt.serialize()).unwrap();
        assert_eq!(decoded, pskt);
        // a version record is kept distinct from the absent default
        assert_eq!(decoded.version, Some(0));
    }

    #[test]
    fn sighash_and_partial_sig_records_roundtrip() {
        let mut pskt = Pskt::deserialize(&fixture_bytes()).unwrap();
        let pubkey = PublicKey::from_slice(
            &Vec::<u8>::from_hex(
                "0223b72beef0965d10be0778efecd61fcac6f79a4ea169393380734464f84f2ab3",
            )
            .unwrap(),
        )
        .unwrap();
        pskt.inputs[0].partial_sigs.insert(pubkey, vec![0x30, 0x01, 0x01]);
        pskt.inputs[0].sighash_type = Some(PsktSighashType::from_u32(1));

        let decoded = Pskt::deserialize(&pskt.serialize()).unwrap();
        assert_eq!(decoded, pskt);
    }
}
