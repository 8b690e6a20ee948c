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

//! JSON tree emitted by `decodepskt`: the full content of a PSKT with
//! binary fields rendered as hex strings, plus the fee when every spent
//! output is known.

use std::collections::BTreeMap;

use bitcoin::hashes::hex::ToHex;
use serde::{Deserialize, Serialize};

use crate::{Input, Output, Pskt};

/// Result of the `decodepskt` RPC.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DecodePskt {
    /// The unsigned transaction.
    pub tx: DecodeTx,
    /// PSKT format version (0 when the record is absent).
    pub version: u32,
    /// Global extended public keys with their origins.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub xpubs: Vec<GlobalXpub>,
    /// Global proprietary records.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub proprietary: Vec<ProprietaryRecord>,
    /// Unrecognized global records, raw key hex to value hex.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub unknown: BTreeMap<String, String>,
    /// Per-input maps.
    pub inputs: Vec<DecodePsktInput>,
    /// Per-output maps.
    pub outputs: Vec<DecodePsktOutput>,
    /// Transaction fee in atomic units, when computable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
}

/// Summary of the unsigned transaction.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DecodeTx {
    /// Transaction id.
    pub txid: String,
    /// Transaction version.
    pub version: i32,
    /// Transaction locktime.
    pub locktime: u32,
    /// Inputs of the unsigned transaction.
    pub vin: Vec<DecodeTxIn>,
    /// Outputs of the unsigned transaction.
    pub vout: Vec<DecodeTxOut>,
}

/// One input of the unsigned transaction.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DecodeTxIn {
    /// Txid of the spent output.
    pub txid: String,
    /// Index of the spent output.
    pub vout: u32,
    /// Sequence number.
    pub sequence: u32,
}

/// One output of the unsigned transaction (also used for witness UTXOs).
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DecodeTxOut {
    /// Amount in atomic units.
    pub value: u64,
    /// Output script, hex.
    pub script_pub_key: String,
}

/// A global xpub record.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GlobalXpub {
    /// Base58 serialized extended public key.
    pub xpub: String,
    /// Master key fingerprint, hex.
    pub master_fingerprint: String,
    /// Derivation path.
    pub path: String,
}

/// A BIP-32 derivation entry.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Bip32Deriv {
    /// Public key, hex.
    pub pubkey: String,
    /// Master key fingerprint, hex.
    pub master_fingerprint: String,
    /// Derivation path.
    pub path: String,
}

/// A taproot script-path signature entry.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TaprootScriptPathSig {
    /// X-only public key, hex.
    pub pubkey: String,
    /// Leaf hash, hex.
    pub leaf_hash: String,
    /// Signature bytes, hex.
    pub sig: String,
}

/// A taproot leaf script with its control blocks.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TaprootScript {
    /// Leaf script, hex.
    pub script: String,
    /// Leaf version.
    pub leaf_ver: u8,
    /// Serialized control blocks, hex.
    pub control_blocks: Vec<String>,
}

/// A taproot BIP-32 derivation entry.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TaprootBip32Deriv {
    /// X-only public key, hex.
    pub pubkey: String,
    /// Master key fingerprint, hex.
    pub master_fingerprint: String,
    /// Derivation path.
    pub path: String,
    /// Leaf hashes the key appears in, hex.
    pub leaf_hashes: Vec<String>,
}

/// One leaf of an output's taproot tree.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TaprootTreeLeaf {
    /// Depth in the tree.
    pub depth: u8,
    /// Leaf version.
    pub leaf_ver: u8,
    /// Leaf script, hex.
    pub script: String,
}

/// A proprietary record.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ProprietaryRecord {
    /// Namespace identifier, hex.
    pub prefix: String,
    /// Record subtype.
    pub subtype: u8,
    /// Key data, hex.
    pub key: String,
    /// Value data, hex.
    pub value: String,
}

/// Per-input section of `decodepskt`.
#[derive(Clone, Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct DecodePsktInput {
    /// Txid of the full predecessor transaction, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub non_witness_utxo_txid: Option<String>,
    /// The spent output, when carried directly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness_utxo: Option<DecodeTxOut>,
    /// Partial signatures, pubkey hex to signature hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_signatures: Option<BTreeMap<String, String>>,
    /// Sighash flag, raw.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sighash: Option<u32>,
    /// Redeem script, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<String>,
    /// Witness script, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness_script: Option<String>,
    /// BIP-32 derivations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bip32_derivs: Option<Vec<Bip32Deriv>>,
    /// Final scriptSig, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_scriptsig: Option<String>,
    /// Final witness stack, element-wise hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_scriptwitness: Option<Vec<String>>,
    /// RIPEMD160 preimages, hash hex to preimage hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ripemd160_preimages: Option<BTreeMap<String, String>>,
    /// SHA256 preimages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256_preimages: Option<BTreeMap<String, String>>,
    /// HASH160 preimages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash160_preimages: Option<BTreeMap<String, String>>,
    /// HASH256 preimages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash256_preimages: Option<BTreeMap<String, String>>,
    /// Taproot key-path signature, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taproot_key_path_sig: Option<String>,
    /// Taproot script-path signatures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taproot_script_path_sigs: Option<Vec<TaprootScriptPathSig>>,
    /// Taproot leaf scripts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taproot_scripts: Option<Vec<TaprootScript>>,
    /// Taproot BIP-32 derivations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taproot_bip32_derivs: Option<Vec<TaprootBip32Deriv>>,
    /// Taproot internal key, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taproot_internal_key: Option<String>,
    /// Taproot merkle root, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taproot_merkle_root: Option<String>,
    /// Proprietary records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proprietary: Option<Vec<ProprietaryRecord>>,
    /// Unrecognized records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown: Option<BTreeMap<String, String>>,
}

/// Per-output section of `decodepskt`.
#[derive(Clone, Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct DecodePsktOutput {
    /// Redeem script, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<String>,
    /// Witness script, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness_script: Option<String>,
    /// BIP-32 derivations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bip32_derivs: Option<Vec<Bip32Deriv>>,
    /// Taproot internal key, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taproot_internal_key: Option<String>,
    /// Taproot tree leaves, depth-first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taproot_tree: Option<Vec<TaprootTreeLeaf>>,
    /// Taproot BIP-32 derivations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taproot_bip32_derivs: Option<Vec<TaprootBip32Deriv>>,
    /// Proprietary records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proprietary: Option<Vec<ProprietaryRecord>>,
    /// Unrecognized records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown: Option<BTreeMap<String, String>>,
}

/// Renders the full JSON tree of a PSKT.
pub(crate) fn decode_pskt_value(pskt: &Pskt) -> DecodePskt {
    DecodePskt {
        tx: DecodeTx {
            txid: pskt.txid().to_string(),
            version: pskt.unsigned_tx.version,
            locktime: pskt.unsigned_tx.lock_time.0,
            vin: pskt
                .unsigned_tx
                .input
                .iter()
                .map(|txin| DecodeTxIn {
                    txid: txin.previous_output.txid.to_string(),
                    vout: txin.previous_output.vout,
                    sequence: txin.sequence.0,
                })
                .collect(),
            vout: pskt
                .unsigned_tx
                .output
                .iter()
                .map(|txout| DecodeTxOut {
                    value: txout.value,
                    script_pub_key: txout.script_pubkey.as_bytes().to_hex(),
                })
                .collect(),
        },
        version: pskt.version(),
        xpubs: pskt
            .xpubs
            .iter()
            .flat_map(|((fingerprint, path), xpubs)| {
                xpubs.iter().map(move |xpub| GlobalXpub {
                    xpub: xpub.to_string(),
                    master_fingerprint: fingerprint.to_string(),
                    path: path.to_string(),
                })
            })
            .collect(),
        proprietary: proprietary_records(&pskt.proprietary),
        unknown: unknown_records(&pskt.unknown),
        inputs: pskt.inputs.iter().map(decode_input).collect(),
        outputs: pskt.outputs.iter().map(decode_output).collect(),
        fee: pskt.fee().ok(),
    }
}

fn decode_input(input: &Input) -> DecodePsktInput {
    DecodePsktInput {
        non_witness_utxo_txid: input.non_witness_utxo.as_ref().map(|tx| tx.txid().to_string()),
        witness_utxo: input.witness_utxo.as_ref().map(|txout| DecodeTxOut {
            value: txout.value,
            script_pub_key: txout.script_pubkey.as_bytes().to_hex(),
        }),
        partial_signatures: non_empty(
            input
                .partial_sigs
                .iter()
                .map(|(pubkey, sig)| (pubkey.to_string(), sig.to_hex()))
                .collect::<BTreeMap<_, _>>(),
        ),
        sighash: input.sighash_type.map(|ty| ty.to_u32()),
        redeem_script: input
            .redeem_script
            .as_ref()
            .map(|script| script.as_bytes().to_hex()),
        witness_script: input
            .witness_script
            .as_ref()
            .map(|script| script.as_bytes().to_hex()),
        bip32_derivs: non_empty_vec(
            input
                .bip32_derivation
                .iter()
                .map(|(pubkey, (fingerprint, path))| Bip32Deriv {
                    pubkey: pubkey.to_string(),
                    master_fingerprint: fingerprint.to_string(),
                    path: path.to_string(),
                })
                .collect(),
        ),
        final_scriptsig: input
            .final_script_sig
            .as_ref()
            .map(|script| script.as_bytes().to_hex()),
        final_scriptwitness: input.final_script_witness.as_ref().map(|witness| {
            witness
                .to_vec()
                .iter()
                .map(|element| element.to_hex())
                .collect()
        }),
        ripemd160_preimages: non_empty(hex_map(&input.ripemd160_preimages)),
        sha256_preimages: non_empty(hex_map(&input.sha256_preimages)),
        hash160_preimages: non_empty(hex_map(&input.hash160_preimages)),
        hash256_preimages: non_empty(hex_map(&input.hash256_preimages)),
        taproot_key_path_sig: input.tap_key_sig.as_ref().map(|sig| sig.to_hex()),
        taproot_script_path_sigs: non_empty_vec(
            input
                .tap_script_sigs
                .iter()
                .map(|((pubkey, leaf_hash), sig)| TaprootScriptPathSig {
                    pubkey: pubkey.to_string(),
                    leaf_hash: leaf_hash.to_hex(),
                    sig: sig.to_hex(),
                })
                .collect(),
        ),
        taproot_scripts: non_empty_vec(
            input
                .tap_scripts
                .iter()
                .map(|((script, leaf_ver), control_blocks)| TaprootScript {
                    script: script.as_bytes().to_hex(),
                    leaf_ver: *leaf_ver,
                    control_blocks: control_blocks
                        .iter()
                        .map(|control_block| control_block.to_hex())
                        .collect(),
                })
                .collect(),
        ),
        taproot_bip32_derivs: non_empty_vec(taproot_derivs(&input.tap_bip32_derivation)),
        taproot_internal_key: input.tap_internal_key.map(|key| key.to_string()),
        taproot_merkle_root: input.tap_merkle_root.map(|root| root.to_hex()),
        proprietary: non_empty_vec(proprietary_records(&input.proprietary)),
        unknown: non_empty(unknown_records(&input.unknown)),
    }
}

fn decode_output(output: &Output) -> DecodePsktOutput {
    DecodePsktOutput {
        redeem_script: output
            .redeem_script
            .as_ref()
            .map(|script| script.as_bytes().to_hex()),
        witness_script: output
            .witness_script
            .as_ref()
            .map(|script| script.as_bytes().to_hex()),
        bip32_derivs: non_empty_vec(
            output
                .bip32_derivation
                .iter()
                .map(|(pubkey, (fingerprint, path))| Bip32Deriv {
                    pubkey: pubkey.to_string(),
                    master_fingerprint: fingerprint.to_string(),
                    path: path.to_string(),
                })
                .collect(),
        ),
        taproot_internal_key: output.tap_internal_key.map(|key| key.to_string()),
        taproot_tree: output.tap_tree.as_ref().map(|tree| {
            tree.iter()
                .map(|(depth, leaf_ver, script)| TaprootTreeLeaf {
                    depth: *depth,
                    leaf_ver: *leaf_ver,
                    script: script.as_bytes().to_hex(),
                })
                .collect()
        }),
        taproot_bip32_derivs: non_empty_vec(taproot_derivs(&output.tap_bip32_derivation)),
        proprietary: non_empty_vec(proprietary_records(&output.proprietary)),
        unknown: non_empty(unknown_records(&output.unknown)),
    }
}

fn taproot_derivs(
    derivs: &std::collections::BTreeMap<
        bitcoin::XOnlyPublicKey,
        (
            std::collections::BTreeSet<bitcoin::util::taproot::TapLeafHash>,
            bitcoin::util::bip32::KeySource,
        ),
    >,
) -> Vec<TaprootBip32Deriv> {
    derivs
        .iter()
        .map(|(pubkey, (leaves, (fingerprint, path)))| TaprootBip32Deriv {
            pubkey: pubkey.to_string(),
            master_fingerprint: fingerprint.to_string(),
            path: path.to_string(),
            leaf_hashes: leaves.iter().map(|leaf| leaf.to_hex()).collect(),
        })
        .collect()
}

fn proprietary_records(
    proprietary: &std::collections::BTreeMap<crate::raw::ProprietaryKey, Vec<u8>>,
) -> Vec<ProprietaryRecord> {
    proprietary
        .iter()
        .map(|(key, value)| ProprietaryRecord {
            prefix: key.prefix.to_hex(),
            subtype: key.subtype,
            key: key.key.to_hex(),
            value: value.to_hex(),
        })
        .collect()
}

fn unknown_records(
    unknown: &std::collections::BTreeMap<crate::raw::Key, Vec<u8>>,
) -> BTreeMap<String, String> {
    unknown
        .iter()
        .map(|(key, value)| {
            let mut raw_key = vec![key.type_value];
            raw_key.extend_from_slice(&key.key);
            (raw_key.to_hex(), value.to_hex())
        })
        .collect()
}

fn hex_map<H: ToHex + Ord>(map: &std::collections::BTreeMap<H, Vec<u8>>) -> BTreeMap<String, String> {
    map.iter()
        .map(|(hash, preimage)| (hash.to_hex(), preimage.to_hex()))
        .collect()
}

fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

fn non_empty_vec<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}
