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

use bitcoin::blockdata::transaction::NonStandardSighashType;
use bitcoin::hashes::{hash160, ripemd160, sha256, sha256d};
use bitcoin::util::bip32::KeySource;
use bitcoin::util::sighash;
use bitcoin::util::taproot::{TapBranchHash, TapLeafHash};
use bitcoin::{
    EcdsaSighashType, PublicKey, SchnorrSighashType, Script, Transaction, TxIn, TxOut, Txid,
    Witness, XOnlyPublicKey,
};

use crate::raw;
use crate::sign::SignatureData;

/// A signature-hash flag as it travels in a PSKT record: any consensus
/// `u32`, converted fallibly into the ECDSA or Schnorr interpretation at
/// the point of use.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct PsktSighashType {
    inner: u32,
}

impl PsktSighashType {
    /// Wraps a raw consensus value.
    #[inline]
    pub fn from_u32(value: u32) -> PsktSighashType {
        PsktSighashType { inner: value }
    }

    /// The raw consensus value.
    #[inline]
    pub fn to_u32(self) -> u32 {
        self.inner
    }

    /// Interprets the flag for ECDSA signing.
    ///
    /// Errors when the value is not one of the standard sighash types.
    pub fn ecdsa_hash_ty(self) -> Result<EcdsaSighashType, NonStandardSighashType> {
        EcdsaSighashType::from_standard(self.inner)
    }

    /// Interprets the flag for Schnorr signing.
    pub fn schnorr_hash_ty(self) -> Result<SchnorrSighashType, sighash::Error> {
        if self.inner > 0xff {
            return Err(sighash::Error::InvalidSighashType(self.inner));
        }
        SchnorrSighashType::from_u8(self.inner as u8)
    }
}

impl From<EcdsaSighashType> for PsktSighashType {
    fn from(ty: EcdsaSighashType) -> PsktSighashType {
        PsktSighashType { inner: ty.to_u32() }
    }
}

/// Errors resolving the output an input spends from the UTXO information
/// carried by its PSKT record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum UtxoError {
    /// neither `witness_utxo` nor `non_witness_utxo` is present
    Missing,

    /// provided `non_witness_utxo` has txid {actual} while the input spends
    /// {expected}
    TxidMismatch {
        /// Txid referenced by the input's outpoint.
        expected: Txid,
        /// Txid of the provided predecessor transaction.
        actual: Txid,
    },

    /// provided `non_witness_utxo` has no output #{0} referenced by the
    /// input
    VoutOutOfRange(u32),
}

/// Per-input record of a PSKT: everything the workflow accumulates about
/// one spend, every field independently optional.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Input {
    /// The full predecessor transaction. Required for safely signing
    /// non-witness spends; lets the prevout be verified against its hash.
    pub non_witness_utxo: Option<Transaction>,

    /// Just the spent output. Sufficient for witness spends.
    pub witness_utxo: Option<TxOut>,

    /// Partial signatures keyed by the signing public key. Values are
    /// DER-encoded signatures with the sighash byte appended.
    pub partial_sigs: BTreeMap<PublicKey, Vec<u8>>,

    /// The sighash type every signature for this input must commit to.
    pub sighash_type: Option<PsktSighashType>,

    /// The redeem script for this input.
    pub redeem_script: Option<Script>,

    /// The witness script for this input.
    pub witness_script: Option<Script>,

    /// Master fingerprint and derivation path for keys able to sign this
    /// input.
    pub bip32_derivation: BTreeMap<bitcoin::secp256k1::PublicKey, KeySource>,

    /// The finalized, fully-constructed scriptSig.
    pub final_script_sig: Option<Script>,

    /// The finalized, fully-constructed witness stack.
    pub final_script_witness: Option<Witness>,

    /// RIPEMD160 hash to preimage map.
    pub ripemd160_preimages: BTreeMap<ripemd160::Hash, Vec<u8>>,

    /// SHA256 hash to preimage map.
    pub sha256_preimages: BTreeMap<sha256::Hash, Vec<u8>>,

    /// HASH160 hash to preimage map.
    pub hash160_preimages: BTreeMap<hash160::Hash, Vec<u8>>,

    /// HASH256 hash to preimage map.
    pub hash256_preimages: BTreeMap<sha256d::Hash, Vec<u8>>,

    /// Serialized Schnorr signature for the taproot key path, with the
    /// sighash byte appended when not default.
    pub tap_key_sig: Option<Vec<u8>>,

    /// Taproot script-path signatures keyed by (x-only key, leaf hash).
    pub tap_script_sigs: BTreeMap<(XOnlyPublicKey, TapLeafHash), Vec<u8>>,

    /// Taproot leaf scripts: (script, leaf version) to the control blocks
    /// proving their commitment.
    pub tap_scripts: BTreeMap<(Script, u8), BTreeSet<Vec<u8>>>,

    /// Taproot key origins: x-only key to the leaf hashes it appears in
    /// and its key source.
    pub tap_bip32_derivation: BTreeMap<XOnlyPublicKey, (BTreeSet<TapLeafHash>, KeySource)>,

    /// Taproot internal key.
    pub tap_internal_key: Option<XOnlyPublicKey>,

    /// Taproot merkle root of the script tree.
    pub tap_merkle_root: Option<TapBranchHash>,

    /// Proprietary key-value pairs for this input.
    pub proprietary: BTreeMap<raw::ProprietaryKey, Vec<u8>>,

    /// Unknown key-value pairs for this input.
    pub unknown: BTreeMap<raw::Key, Vec<u8>>,
}

impl Input {
    /// Whether every field of the record is absent or empty.
    pub fn is_null(&self) -> bool {
        self.non_witness_utxo.is_none()
            && self.witness_utxo.is_none()
            && self.partial_sigs.is_empty()
            && self.sighash_type.is_none()
            && self.redeem_script.is_none()
            && self.witness_script.is_none()
            && self.bip32_derivation.is_empty()
            && self.final_script_sig.is_none()
            && self.final_script_witness.is_none()
            && self.ripemd160_preimages.is_empty()
            && self.sha256_preimages.is_empty()
            && self.hash160_preimages.is_empty()
            && self.hash256_preimages.is_empty()
            && self.tap_key_sig.is_none()
            && self.tap_script_sigs.is_empty()
            && self.tap_scripts.is_empty()
            && self.tap_bip32_derivation.is_empty()
            && self.tap_internal_key.is_none()
            && self.tap_merkle_root.is_none()
            && self.proprietary.is_empty()
            && self.unknown.is_empty()
    }

    /// Whether the input already carries its terminal signed form.
    #[inline]
    pub fn is_signed(&self) -> bool {
        self.final_script_sig.is_some() || self.final_script_witness.is_some()
    }

    /// Resolves the output this input spends.
    ///
    /// A present `non_witness_utxo` takes precedence and is verified
    /// against the input's outpoint: its txid must match and the prevout
    /// index must be in range. Otherwise `witness_utxo` is used as-is.
    pub fn spent_output<'a>(&'a self, txin: &TxIn) -> Result<&'a TxOut, UtxoError> {
        if let Some(tx) = &self.non_witness_utxo {
            let prevout = txin.previous_output;
            let txid = tx.txid();
            if txid != prevout.txid {
                return Err(UtxoError::TxidMismatch {
                    expected: prevout.txid,
                    actual: txid,
                });
            }
            tx.output
                .get(prevout.vout as usize)
                .ok_or(UtxoError::VoutOutOfRange(prevout.vout))
        } else if let Some(txout) = &self.witness_utxo {
            Ok(txout)
        } else {
            Err(UtxoError::Missing)
        }
    }

    /// The ECDSA sighash type to sign with: the stored flag, or `ALL`.
    pub fn ecdsa_hash_ty(&self) -> Result<EcdsaSighashType, NonStandardSighashType> {
        self.sighash_type
            .map(PsktSighashType::ecdsa_hash_ty)
            .unwrap_or(Ok(EcdsaSighashType::All))
    }

    /// The Schnorr sighash type to sign with: the stored flag, or default.
    pub fn schnorr_hash_ty(&self) -> Result<SchnorrSighashType, sighash::Error> {
        self.sighash_type
            .map(PsktSighashType::schnorr_hash_ty)
            .unwrap_or(Ok(SchnorrSighashType::Default))
    }

    /// Fuses `other` into this record: map-valued fields take the union
    /// with existing entries winning, scalar fields fill only when empty.
    pub fn combine(&mut self, other: Input) {
        if self.non_witness_utxo.is_none() {
            self.non_witness_utxo = other.non_witness_utxo;
        }
        if self.witness_utxo.is_none() {
            self.witness_utxo = other.witness_utxo;
        }

        merge_map(&mut self.partial_sigs, other.partial_sigs);
        merge_map(&mut self.bip32_derivation, other.bip32_derivation);
        merge_map(&mut self.ripemd160_preimages, other.ripemd160_preimages);
        merge_map(&mut self.sha256_preimages, other.sha256_preimages);
        merge_map(&mut self.hash160_preimages, other.hash160_preimages);
        merge_map(&mut self.hash256_preimages, other.hash256_preimages);
        merge_map(&mut self.tap_script_sigs, other.tap_script_sigs);
        merge_map(&mut self.tap_scripts, other.tap_scripts);
        merge_map(&mut self.tap_bip32_derivation, other.tap_bip32_derivation);
        merge_map(&mut self.proprietary, other.proprietary);
        merge_map(&mut self.unknown, other.unknown);

        if self.sighash_type.is_none() {
            self.sighash_type = other.sighash_type;
        }
        if self.redeem_script.is_none() {
            self.redeem_script = other.redeem_script;
        }
        if self.witness_script.is_none() {
            self.witness_script = other.witness_script;
        }
        if self.final_script_sig.is_none() {
            self.final_script_sig = other.final_script_sig;
        }
        if self.final_script_witness.is_none() {
            self.final_script_witness = other.final_script_witness;
        }
        if self.tap_key_sig.is_none() {
            self.tap_key_sig = other.tap_key_sig;
        }
        if self.tap_internal_key.is_none() {
            self.tap_internal_key = other.tap_internal_key;
        }
        if self.tap_merkle_root.is_none() {
            self.tap_merkle_root = other.tap_merkle_root;
        }
    }

    /// Copies the record into a neutral [`SignatureData`] bundle for the
    /// signing pipeline. An already-finalized input produces a complete
    /// bundle and nothing else.
    pub fn fill_signature_data(&self) -> SignatureData {
        let mut sigdata = SignatureData::default();

        if self.is_signed() {
            if let Some(script_sig) = &self.final_script_sig {
                sigdata.script_sig = script_sig.clone();
            }
            if let Some(witness) = &self.final_script_witness {
                sigdata.script_witness = witness.clone();
            }
            sigdata.complete = true;
            return sigdata;
        }

        for (pubkey, sig) in &self.partial_sigs {
            sigdata
                .signatures
                .insert(pubkey.pubkey_hash(), (*pubkey, sig.clone()));
        }
        sigdata.redeem_script = self.redeem_script.clone();
        sigdata.witness_script = self.witness_script.clone();
        for (pubkey, origin) in &self.bip32_derivation {
            let pubkey = PublicKey::new(*pubkey);
            sigdata
                .misc_pubkeys
                .insert(pubkey.pubkey_hash(), (pubkey, Some(origin.clone())));
        }

        sigdata.taproot_key_path_sig = self.tap_key_sig.clone();
        for (key, sig) in &self.tap_script_sigs {
            sigdata.taproot_script_sigs.insert(*key, sig.clone());
        }
        sigdata.tr_spenddata.internal_key = self.tap_internal_key;
        sigdata.tr_spenddata.merkle_root = self.tap_merkle_root;
        for (leaf, control_blocks) in &self.tap_scripts {
            sigdata
                .tr_spenddata
                .scripts
                .entry(leaf.clone())
                .or_default()
                .extend(control_blocks.iter().cloned());
        }
        for (pubkey, leaves_origin) in &self.tap_bip32_derivation {
            sigdata
                .taproot_misc_pubkeys
                .insert(*pubkey, leaves_origin.clone());
        }

        sigdata
    }

    /// Writes a [`SignatureData`] produced by the signing pipeline back
    /// into the record. A complete bundle replaces the working fields with
    /// the terminal script forms; a partial one merges.
    pub fn from_signature_data(&mut self, sigdata: SignatureData) {
        if sigdata.complete {
            self.partial_sigs.clear();
            self.bip32_derivation.clear();
            self.redeem_script = None;
            self.witness_script = None;

            if !sigdata.script_sig.is_empty() {
                self.final_script_sig = Some(sigdata.script_sig);
            }
            if !sigdata.script_witness.is_empty() {
                self.final_script_witness = Some(sigdata.script_witness);
            }
            return;
        }

        for (_, (pubkey, sig)) in sigdata.signatures {
            self.partial_sigs.insert(pubkey, sig);
        }
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

        if self.tap_key_sig.is_none() {
            self.tap_key_sig = sigdata.taproot_key_path_sig;
        }
        for (key, sig) in sigdata.taproot_script_sigs {
            self.tap_script_sigs.entry(key).or_insert(sig);
        }
        if self.tap_internal_key.is_none() {
            self.tap_internal_key = sigdata.tr_spenddata.internal_key;
        }
        if self.tap_merkle_root.is_none() {
            self.tap_merkle_root = sigdata.tr_spenddata.merkle_root;
        }
        for (leaf, control_blocks) in sigdata.tr_spenddata.scripts {
            self.tap_scripts
                .entry(leaf)
                .or_default()
                .extend(control_blocks);
        }
        for (pubkey, leaves_origin) in sigdata.taproot_misc_pubkeys {
            self.tap_bip32_derivation
                .entry(pubkey)
                .or_insert(leaves_origin);
        }
    }

    /// Looks up a proprietary value by its namespaced key.
    pub fn proprietary_value(&self, prefix: &[u8], subtype: u8, key: &[u8]) -> Option<&[u8]> {
        self.proprietary
            .get(&raw::ProprietaryKey {
                prefix: prefix.to_vec(),
                subtype,
                key: key.to_vec(),
            })
            .map(Vec::as_slice)
    }

    /// Stores a proprietary value, replacing a previous one under the same
    /// key.
    pub fn insert_proprietary(&mut self, key: raw::ProprietaryKey, value: Vec<u8>) {
        self.proprietary.insert(key, value);
    }
}

pub(crate) fn merge_map<K: Ord, V>(map: &mut BTreeMap<K, V>, other: BTreeMap<K, V>) {
    for (k, v) in other {
        map.entry(k).or_insert(v);
    }
}
