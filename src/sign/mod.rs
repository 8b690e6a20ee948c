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

//! Signing capabilities: the neutral [`SignatureData`] bundle exchanged
//! with providers, the [`SigningProvider`] lookup interface, and the
//! signature-creator machinery living in the submodules.

use std::collections::{BTreeMap, BTreeSet};

use bitcoin::secp256k1::{KeyPair, SecretKey};
use bitcoin::util::bip32::KeySource;
use bitcoin::util::taproot::{TapBranchHash, TapLeafHash};
use bitcoin::{
    OutPoint, PubkeyHash, PublicKey, Script, ScriptHash, TxOut, WScriptHash, Witness,
    XOnlyPublicKey,
};

mod creator;
mod signer;

pub use creator::{
    DummySignatureCreator, PrecomputedPsktData, SigVersion, SignatureCreator, TxSignatureCreator,
};
pub use signer::{
    precompute_pskt_data, produce_signature, sign_pskt_input, update_pskt_output, SignError,
    SignInputError,
};

/// Taproot spend metadata: the internal key, the merkle root of the
/// script tree and every known leaf script with the control blocks
/// committing to it.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct TaprootSpendData {
    /// Internal (pre-tweak) key.
    pub internal_key: Option<XOnlyPublicKey>,
    /// Merkle root of the script tree; absent for key-only outputs.
    pub merkle_root: Option<TapBranchHash>,
    /// (script, leaf version) to the set of serialized control blocks.
    pub scripts: BTreeMap<(Script, u8), BTreeSet<Vec<u8>>>,
}

/// Neutral bundle exchanged between a PSKT input (or output) and the
/// signing pipeline: everything known about how the spent script can be
/// satisfied, plus a report of what is still missing.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct SignatureData {
    /// The assembled solution satisfies the spent script.
    pub complete: bool,
    /// A witness-form solution was produced.
    pub witness: bool,
    /// Assembled scriptSig (possibly partial).
    pub script_sig: Script,
    /// Assembled witness stack (possibly partial).
    pub script_witness: Witness,
    /// ECDSA signatures keyed by the key id of their public key.
    pub signatures: BTreeMap<PubkeyHash, (PublicKey, Vec<u8>)>,
    /// Public keys met along the way, with origin info when known.
    pub misc_pubkeys: BTreeMap<PubkeyHash, (PublicKey, Option<KeySource>)>,
    /// Redeem script, once known.
    pub redeem_script: Option<Script>,
    /// Witness script, once known.
    pub witness_script: Option<Script>,
    /// Taproot key-path signature.
    pub taproot_key_path_sig: Option<Vec<u8>>,
    /// Taproot script-path signatures keyed by (x-only key, leaf hash).
    pub taproot_script_sigs: BTreeMap<(XOnlyPublicKey, TapLeafHash), Vec<u8>>,
    /// Taproot spend metadata.
    pub tr_spenddata: TaprootSpendData,
    /// Taproot keys met along the way with their leaves and origins.
    pub taproot_misc_pubkeys: BTreeMap<XOnlyPublicKey, (BTreeSet<TapLeafHash>, KeySource)>,
    /// Key ids whose public key could not be found.
    pub missing_pubkeys: Vec<PubkeyHash>,
    /// Key ids whose signature could not be created.
    pub missing_sigs: Vec<PubkeyHash>,
    /// Hash of a redeem script that could not be found.
    pub missing_redeem_script: Option<ScriptHash>,
    /// Hash of a witness script that could not be found.
    pub missing_witness_script: Option<WScriptHash>,
}

/// Lookup capability the signing pipeline drives: given hashes found in a
/// script it returns whatever key and script material the holder knows.
/// Every method defaults to knowing nothing, so providers implement only
/// the lookups they can serve; a provider may deliberately hide secrets
/// or origin information by leaving those methods unimplemented.
pub trait SigningProvider {
    /// Redeem script matching a P2SH script hash.
    fn redeem_script(&self, _hash: &ScriptHash) -> Option<Script> {
        None
    }

    /// Witness script matching a P2WSH script hash.
    fn witness_script(&self, _hash: &WScriptHash) -> Option<Script> {
        None
    }

    /// Public key matching a key id.
    fn pubkey(&self, _key_id: &PubkeyHash) -> Option<PublicKey> {
        None
    }

    /// BIP-32 origin of the key with the given id.
    fn key_origin(&self, _key_id: &PubkeyHash) -> Option<KeySource> {
        None
    }

    /// Secret key matching a key id.
    fn secret_key(&self, _key_id: &PubkeyHash) -> Option<SecretKey> {
        None
    }

    /// Leaf hashes and origin of a taproot key.
    fn taproot_key_origin(
        &self,
        _key: &XOnlyPublicKey,
    ) -> Option<(BTreeSet<TapLeafHash>, KeySource)> {
        None
    }

    /// Spend metadata of a taproot output key.
    fn taproot_spend_data(&self, _output_key: &XOnlyPublicKey) -> Option<TaprootSpendData> {
        None
    }

    /// Full key pair matching an x-only key.
    fn keypair(&self, _key: &XOnlyPublicKey) -> Option<KeyPair> {
        None
    }
}

/// The provider that knows nothing. Used by the finalizer and the
/// analyzer, which only ever work with material already in the PSKT.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct DummySigningProvider;

impl SigningProvider for DummySigningProvider {}

/// In-memory fillable [`SigningProvider`], the store signers and tests
/// assemble their key material into.
#[derive(Clone, Debug, Default)]
pub struct MemorySigningProvider {
    redeem_scripts: BTreeMap<ScriptHash, Script>,
    witness_scripts: BTreeMap<WScriptHash, Script>,
    keys: BTreeMap<PubkeyHash, (PublicKey, Option<SecretKey>)>,
    origins: BTreeMap<PubkeyHash, KeySource>,
    tap_origins: BTreeMap<XOnlyPublicKey, (BTreeSet<TapLeafHash>, KeySource)>,
    tap_spend_data: BTreeMap<XOnlyPublicKey, TaprootSpendData>,
    keypairs: BTreeMap<XOnlyPublicKey, KeyPair>,
}

impl MemorySigningProvider {
    /// Registers a script under both its P2SH and P2WSH hashes.
    pub fn add_script(&mut self, script: Script) {
        self.redeem_scripts.insert(script.script_hash(), script.clone());
        self.witness_scripts.insert(script.wscript_hash(), script);
    }

    /// Registers a public key, optionally with its secret half.
    pub fn add_key(&mut self, pubkey: PublicKey, secret: Option<SecretKey>) {
        self.keys.insert(pubkey.pubkey_hash(), (pubkey, secret));
    }

    /// Registers the BIP-32 origin of a public key.
    pub fn add_origin(&mut self, pubkey: PublicKey, origin: KeySource) {
        self.origins.insert(pubkey.pubkey_hash(), origin);
    }

    /// Registers a taproot key origin.
    pub fn add_taproot_origin(
        &mut self,
        key: XOnlyPublicKey,
        leaves: BTreeSet<TapLeafHash>,
        origin: KeySource,
    ) {
        self.tap_origins.insert(key, (leaves, origin));
    }

    /// Registers spend metadata under a taproot output key.
    pub fn add_taproot_spend_data(&mut self, output_key: XOnlyPublicKey, data: TaprootSpendData) {
        self.tap_spend_data.insert(output_key, data);
    }

    /// Registers a key pair under its x-only key.
    pub fn add_keypair(&mut self, keypair: KeyPair) {
        let (key, _parity) = XOnlyPublicKey::from_keypair(&keypair);
        self.keypairs.insert(key, keypair);
    }
}

impl SigningProvider for MemorySigningProvider {
    fn redeem_script(&self, hash: &ScriptHash) -> Option<Script> {
        self.redeem_scripts.get(hash).cloned()
    }

    fn witness_script(&self, hash: &WScriptHash) -> Option<Script> {
        self.witness_scripts.get(hash).cloned()
    }

    fn pubkey(&self, key_id: &PubkeyHash) -> Option<PublicKey> {
        self.keys.get(key_id).map(|(pubkey, _)| *pubkey)
    }

    fn key_origin(&self, key_id: &PubkeyHash) -> Option<KeySource> {
        self.origins.get(key_id).cloned()
    }

    fn secret_key(&self, key_id: &PubkeyHash) -> Option<SecretKey> {
        self.keys.get(key_id).and_then(|(_, secret)| *secret)
    }

    fn taproot_key_origin(
        &self,
        key: &XOnlyPublicKey,
    ) -> Option<(BTreeSet<TapLeafHash>, KeySource)> {
        self.tap_origins.get(key).cloned()
    }

    fn taproot_spend_data(&self, output_key: &XOnlyPublicKey) -> Option<TaprootSpendData> {
        self.tap_spend_data.get(output_key).cloned()
    }

    fn keypair(&self, key: &XOnlyPublicKey) -> Option<KeyPair> {
        self.keypairs.get(key).copied()
    }
}

/// The narrow chainstate capability assumed by the updater: resolve an
/// outpoint to the output it created.
pub trait ResolveUtxo {
    /// Returns the output the given outpoint refers to, if known.
    fn resolve_utxo(&self, outpoint: &OutPoint) -> Option<TxOut>;
}

impl ResolveUtxo for BTreeMap<OutPoint, TxOut> {
    fn resolve_utxo(&self, outpoint: &OutPoint) -> Option<TxOut> {
        self.get(outpoint).cloned()
    }
}
