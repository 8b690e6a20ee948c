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

//! Signature creators: the capability producing and checking raw
//! signatures for one transaction input. The transaction-bound creator
//! computes real sighashes and signs through the signing provider's
//! secrets; the dummy creator is the metadata-only mode used by updaters,
//! the finalizer and the analyzer, which never fabricates a signature and
//! accepts any already present.

use bitcoin::schnorr::TapTweak;
use bitcoin::secp256k1::{ecdsa, schnorr, Message};
use bitcoin::util::sighash::{Prevouts, SighashCache};
use bitcoin::util::taproot::{TapBranchHash, TapLeafHash};
use bitcoin::{
    EcdsaSighashType, PublicKey, SchnorrSighashType, Script, Transaction, TxOut, XOnlyPublicKey,
};
use secp256k1::SECP256K1;

use super::SigningProvider;
use crate::input::PsktSighashType;

/// Which sighash algorithm a script position is signed under.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub enum SigVersion {
    /// Pre-segwit signature hashing.
    Base,
    /// Segwit v0 (BIP-143) signature hashing.
    WitnessV0,
    /// Taproot key-path (BIP-341) signature hashing.
    Taproot,
    /// Tapscript leaf (BIP-342) signature hashing.
    Tapscript,
}

/// Spent-output data gathered ahead of signing so witness signature
/// hashes can be computed. When some input's UTXO cannot be resolved the
/// data is initialized in partial mode: `spent_outputs` stays absent,
/// taproot signing becomes unavailable, legacy and segwit-v0 ECDSA keep
/// working.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct PrecomputedPsktData {
    /// Every spent output in input order, when all could be resolved.
    pub spent_outputs: Option<Vec<TxOut>>,
}

/// Capability producing and verifying raw signatures for a single input.
pub trait SignatureCreator {
    /// Creates a DER-encoded ECDSA signature with the sighash byte
    /// appended, or `None` when the provider lacks the secret key or the
    /// sighash cannot be computed.
    fn create_ecdsa_sig(
        &self,
        provider: &dyn SigningProvider,
        pubkey: &PublicKey,
        script_code: &Script,
        sig_version: SigVersion,
    ) -> Option<Vec<u8>>;

    /// Checks an existing ECDSA signature against the sighash it commits
    /// to.
    fn verify_ecdsa_sig(
        &self,
        sig: &[u8],
        pubkey: &PublicKey,
        script_code: &Script,
        sig_version: SigVersion,
    ) -> bool;

    /// Creates a Schnorr signature (64 bytes, sighash byte appended when
    /// not default). `leaf_hash` absent means key-path: the provider's
    /// key pair is tweaked with `merkle_root` before signing.
    fn create_schnorr_sig(
        &self,
        provider: &dyn SigningProvider,
        key: &XOnlyPublicKey,
        merkle_root: Option<TapBranchHash>,
        leaf_hash: Option<TapLeafHash>,
    ) -> Option<Vec<u8>>;

    /// Checks an existing Schnorr signature. For key-path checks `key` is
    /// the tweaked output key.
    fn verify_schnorr_sig(
        &self,
        sig: &[u8],
        key: &XOnlyPublicKey,
        leaf_hash: Option<TapLeafHash>,
    ) -> bool;
}

/// Metadata-only creator: never signs, never rejects.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct DummySignatureCreator;

impl SignatureCreator for DummySignatureCreator {
    fn create_ecdsa_sig(
        &self,
        _provider: &dyn SigningProvider,
        _pubkey: &PublicKey,
        _script_code: &Script,
        _sig_version: SigVersion,
    ) -> Option<Vec<u8>> {
        None
    }

    fn verify_ecdsa_sig(
        &self,
        _sig: &[u8],
        _pubkey: &PublicKey,
        _script_code: &Script,
        _sig_version: SigVersion,
    ) -> bool {
        true
    }

    fn create_schnorr_sig(
        &self,
        _provider: &dyn SigningProvider,
        _key: &XOnlyPublicKey,
        _merkle_root: Option<TapBranchHash>,
        _leaf_hash: Option<TapLeafHash>,
    ) -> Option<Vec<u8>> {
        None
    }

    fn verify_schnorr_sig(
        &self,
        _sig: &[u8],
        _key: &XOnlyPublicKey,
        _leaf_hash: Option<TapLeafHash>,
    ) -> bool {
        true
    }
}

/// Creator bound to one input of a concrete transaction.
pub struct TxSignatureCreator<'a> {
    tx: &'a Transaction,
    input_index: usize,
    amount: u64,
    sighash_type: PsktSighashType,
    txdata: &'a PrecomputedPsktData,
}

impl<'a> TxSignatureCreator<'a> {
    /// Binds a creator to `tx.input[input_index]` spending `amount`.
    pub fn new(
        tx: &'a Transaction,
        input_index: usize,
        amount: u64,
        sighash_type: PsktSighashType,
        txdata: &'a PrecomputedPsktData,
    ) -> TxSignatureCreator<'a> {
        TxSignatureCreator {
            tx,
            input_index,
            amount,
            sighash_type,
            txdata,
        }
    }

    fn ecdsa_sighash_message(
        &self,
        hash_ty: EcdsaSighashType,
        script_code: &Script,
        sig_version: SigVersion,
    ) -> Option<Message> {
        let mut cache = SighashCache::new(self.tx);
        let sighash = match sig_version {
            SigVersion::Base => cache
                .legacy_signature_hash(self.input_index, script_code, hash_ty.to_u32())
                .ok()?,
            SigVersion::WitnessV0 => cache
                .segwit_signature_hash(self.input_index, script_code, self.amount, hash_ty)
                .ok()?,
            SigVersion::Taproot | SigVersion::Tapscript => return None,
        };
        Some(Message::from_slice(&sighash[..]).expect("sighash is 32 bytes"))
    }

    fn schnorr_sighash_message(
        &self,
        hash_ty: SchnorrSighashType,
        leaf_hash: Option<TapLeafHash>,
    ) -> Option<Message> {
        let spent = self.txdata.spent_outputs.as_ref()?;
        let prevouts = Prevouts::All(spent.as_slice());
        let mut cache = SighashCache::new(self.tx);
        let sighash = match leaf_hash {
            None => cache
                .taproot_key_spend_signature_hash(self.input_index, &prevouts, hash_ty)
                .ok()?,
            Some(leaf) => cache
                .taproot_script_spend_signature_hash(self.input_index, &prevouts, leaf, hash_ty)
                .ok()?,
        };
        Some(Message::from_slice(&sighash[..]).expect("sighash is 32 bytes"))
    }
}

impl<'a> SignatureCreator for TxSignatureCreator<'a> {
    fn create_ecdsa_sig(
        &self,
        provider: &dyn SigningProvider,
        pubkey: &PublicKey,
        script_code: &Script,
        sig_version: SigVersion,
    ) -> Option<Vec<u8>> {
        let secret = provider.secret_key(&pubkey.pubkey_hash())?;
        let hash_ty = self.sighash_type.ecdsa_hash_ty().ok()?;
        let msg = self.ecdsa_sighash_message(hash_ty, script_code, sig_version)?;

        let sig = SECP256K1.sign_ecdsa(&msg, &secret);
        let mut bytes = sig.serialize_der().to_vec();
        bytes.push(hash_ty.to_u32() as u8);
        Some(bytes)
    }

    fn verify_ecdsa_sig(
        &self,
        sig: &[u8],
        pubkey: &PublicKey,
        script_code: &Script,
        sig_version: SigVersion,
    ) -> bool {
        if sig.is_empty() {
            return false;
        }
        let (der, hash_byte) = sig.split_at(sig.len() - 1);
        let hash_ty = EcdsaSighashType::from_consensus(hash_byte[0] as u32);
        let msg = match self.ecdsa_sighash_message(hash_ty, script_code, sig_version) {
            Some(msg) => msg,
            None => return false,
        };
        let signature = match ecdsa::Signature::from_der(der) {
            Ok(signature) => signature,
            Err(_) => return false,
        };
        SECP256K1.verify_ecdsa(&msg, &signature, &pubkey.inner).is_ok()
    }

    fn create_schnorr_sig(
        &self,
        provider: &dyn SigningProvider,
        key: &XOnlyPublicKey,
        merkle_root: Option<TapBranchHash>,
        leaf_hash: Option<TapLeafHash>,
    ) -> Option<Vec<u8>> {
        let keypair = provider.keypair(key)?;
        let hash_ty = self.sighash_type.schnorr_hash_ty().ok()?;
        let msg = self.schnorr_sighash_message(hash_ty, leaf_hash)?;

        let keypair = match leaf_hash {
            None => keypair.tap_tweak(SECP256K1, merkle_root).to_inner(),
            Some(_) => keypair,
        };
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&msg, &keypair);

        let mut bytes = sig.as_ref().to_vec();
        if hash_ty != SchnorrSighashType::Default {
            bytes.push(hash_ty as u8);
        }
        Some(bytes)
    }

    fn verify_schnorr_sig(
        &self,
        sig: &[u8],
        key: &XOnlyPublicKey,
        leaf_hash: Option<TapLeafHash>,
    ) -> bool {
        let (raw, hash_ty) = match sig.len() {
            64 => (sig, SchnorrSighashType::Default),
            65 => match SchnorrSighashType::from_u8(sig[64]) {
                Ok(hash_ty) => (&sig[..64], hash_ty),
                Err(_) => return false,
            },
            _ => return false,
        };
        let msg = match self.schnorr_sighash_message(hash_ty, leaf_hash) {
            Some(msg) => msg,
            None => return false,
        };
        let signature = match schnorr::Signature::from_slice(raw) {
            Ok(signature) => signature,
            Err(_) => return false,
        };
        SECP256K1.verify_schnorr(&signature, &msg, key).is_ok()
    }
}
