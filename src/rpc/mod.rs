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

//! The RPC-shaped surface: every operation of the cooperative workflow
//! over base64-encoded PSKTs, with serde-serializable results and a
//! stable error-code taxonomy.

use std::str::FromStr;

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::hex::{FromHex, ToHex};
use bitcoin::{OutPoint, Transaction, TxOut};
use serde::{Deserialize, Serialize};

mod decode;

pub use decode::{
    Bip32Deriv, DecodePskt, DecodePsktInput, DecodePsktOutput, DecodeTx, DecodeTxIn, DecodeTxOut,
    GlobalXpub, ProprietaryRecord, TaprootBip32Deriv, TaprootScript, TaprootScriptPathSig,
    TaprootTreeLeaf,
};

use crate::analyze::{analyze_pskt as analyze, AnalyzerOptions};
use crate::construct::{self, ConvertError, InputRequest, JoinError};
use crate::finalize::finalize_pskt as finalize;
use crate::global::TxError;
use crate::script::ScriptClass;
use crate::sign::{sign_pskt_input, update_pskt_output, ResolveUtxo, SigningProvider};
use crate::{combine, CombineError, Pskt};

/// Stable code for parameter-shaped failures.
pub const RPC_INVALID_PARAMETER: i32 = -8;
/// Stable code for undecodable payloads.
pub const RPC_DESERIALIZATION_ERROR: i32 = -22;
/// Stable code for transaction-processing failures.
pub const RPC_TRANSACTION_ERROR: i32 = -25;

/// Errors surfaced over RPC. Each variant maps to a stable error code via
/// [`RpcError::code`].
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum RpcError {
    /// PSKT decode failed: {0}
    Deserialization(String),

    /// incompatible PSKTs: {0}
    PsktMismatch(String),

    /// duplicate input outpoint {0}
    InputDuplicated(OutPoint),

    /// invalid parameter: {0}
    InvalidParameter(String),

    /// UTXO for input #{0} is missing
    UtxoMissing(usize),

    /// UTXO information is inconsistent: {0}
    UtxoMismatch(String),

    /// signing failed: {0}
    SigningFailure(String),
}

impl RpcError {
    /// The stable RPC error code of this failure.
    pub fn code(&self) -> i32 {
        match self {
            RpcError::Deserialization(_) => RPC_DESERIALIZATION_ERROR,
            RpcError::PsktMismatch(_)
            | RpcError::InputDuplicated(_)
            | RpcError::InvalidParameter(_) => RPC_INVALID_PARAMETER,
            RpcError::UtxoMissing(_)
            | RpcError::UtxoMismatch(_)
            | RpcError::SigningFailure(_) => RPC_TRANSACTION_ERROR,
        }
    }
}

/// Result of the `finalizepskt` RPC.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FinalizePskt {
    /// The base64 PSKT, present unless an extracted transaction is
    /// returned instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pskt: Option<String>,
    /// Hex of the fully signed network transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
    /// Whether every input ended finalized.
    pub complete: bool,
}

/// Result of the `analyzepskt` RPC.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AnalyzePskt {
    /// Per-input status.
    pub inputs: Vec<AnalyzePsktInput>,
    /// Estimated virtual size of the final signed transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_vsize: Option<u64>,
    /// Estimated fee rate in atomic units per kvB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_feerate: Option<u64>,
    /// Fee paid in atomic units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
    /// Role of the next actor the PSKT needs to go to.
    pub next: String,
    /// Why the PSKT is invalid, when it is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-input status of `analyzepskt`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AnalyzePsktInput {
    /// Whether the spent output is known.
    pub has_utxo: bool,
    /// Whether the input is finalized.
    pub is_final: bool,
    /// What is missing to complete this input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<AnalyzePsktInputMissing>,
    /// Role of the next actor this input needs to go to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// Missing items of one input.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AnalyzePsktInputMissing {
    /// Key ids (hash160) of public keys whose derivation info is missing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<String>>,
    /// Key ids (hash160) of public keys whose signature is missing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Vec<String>>,
    /// Hash160 of the missing redeem script.
    #[serde(rename = "redeemscript", skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<String>,
    /// SHA256 of the missing witness script.
    #[serde(rename = "witnessscript", skip_serializing_if = "Option::is_none")]
    pub witness_script: Option<String>,
}

fn parse_pskt(encoded: &str) -> Result<Pskt, RpcError> {
    Pskt::from_str(encoded).map_err(|err| RpcError::Deserialization(err.to_string()))
}

/// `createpskt`: builds a fresh PSKT over the requested inputs and
/// outputs.
pub fn create_pskt(
    inputs: &[InputRequest],
    outputs: Vec<TxOut>,
    locktime: u32,
    replaceable: bool,
) -> Result<String, RpcError> {
    let pskt = construct::create_pskt(inputs, outputs, locktime, replaceable).map_err(|err| {
        match err {
            TxError::DuplicateInput(outpoint) => RpcError::InputDuplicated(outpoint),
            other => RpcError::InvalidParameter(other.to_string()),
        }
    })?;
    Ok(pskt.to_string())
}

/// `converttopskt`: re-frames a network transaction as a PSKT.
///
/// `is_witness` is the caller's statement about the framing of `tx_hex`;
/// when it contradicts the decoded transaction the call is rejected
/// rather than silently reinterpreted.
pub fn convert_to_pskt(
    tx_hex: &str,
    permit_sig_data: bool,
    is_witness: Option<bool>,
) -> Result<String, RpcError> {
    let bytes = Vec::<u8>::from_hex(tx_hex)
        .map_err(|err| RpcError::Deserialization(err.to_string()))?;
    let tx: Transaction =
        deserialize(&bytes).map_err(|err| RpcError::Deserialization(err.to_string()))?;

    if let Some(false) = is_witness {
        if tx.input.iter().any(|txin| !txin.witness.is_empty()) {
            return Err(RpcError::InvalidParameter(
                "transaction carries witness data but iswitness was false".into(),
            ));
        }
    }

    let pskt = construct::convert_to_pskt(tx, permit_sig_data).map_err(|err| match err {
        ConvertError::HasSignatureData => RpcError::InvalidParameter(err.to_string()),
        ConvertError::Tx(tx_err) => RpcError::InvalidParameter(tx_err.to_string()),
    })?;
    Ok(pskt.to_string())
}

/// `combinepskt`: fuses any number (≥ 1) of PSKTs over the same unsigned
/// transaction.
pub fn combine_pskts(encoded: &[String]) -> Result<String, RpcError> {
    let pskts = encoded
        .iter()
        .map(|text| parse_pskt(text))
        .collect::<Result<Vec<_>, _>>()?;
    let combined = combine(pskts).map_err(|err| match err {
        CombineError::NothingToCombine => RpcError::InvalidParameter(err.to_string()),
        CombineError::TxidMismatch { .. } => RpcError::PsktMismatch(err.to_string()),
    })?;
    Ok(combined.to_string())
}

/// `joinpskts`: concatenates ≥ 2 PSKTs with disjoint inputs and shuffles
/// the result.
pub fn join_pskts(encoded: &[String]) -> Result<String, RpcError> {
    let pskts = encoded
        .iter()
        .map(|text| parse_pskt(text))
        .collect::<Result<Vec<_>, _>>()?;
    let joined = construct::join_pskts(pskts).map_err(|err| match err {
        JoinError::Tx(TxError::DuplicateInput(outpoint)) => RpcError::InputDuplicated(outpoint),
        other => RpcError::InvalidParameter(other.to_string()),
    })?;
    Ok(joined.to_string())
}

/// `finalizepskt`: promotes partial signatures to final script forms and,
/// when complete and `extract` is set, returns the network transaction.
pub fn finalize_pskt(encoded: &str, extract: bool) -> Result<FinalizePskt, RpcError> {
    let mut pskt = parse_pskt(encoded)?;
    let complete = finalize(&mut pskt);

    if complete && extract {
        let tx = pskt.extract_signed_tx();
        return Ok(FinalizePskt {
            pskt: None,
            hex: Some(serialize(&tx).to_hex()),
            complete,
        });
    }
    Ok(FinalizePskt {
        pskt: Some(pskt.to_string()),
        hex: None,
        complete,
    })
}

/// `utxoupdatepskt`: fills witness UTXOs from the resolver and script /
/// derivation metadata from the provider, without signing anything.
pub fn utxo_update_pskt(
    encoded: &str,
    resolver: &dyn ResolveUtxo,
    provider: &dyn SigningProvider,
) -> Result<String, RpcError> {
    let mut pskt = parse_pskt(encoded)?;

    for index in 0..pskt.inputs.len() {
        let outpoint = pskt.unsigned_tx.input[index].previous_output;
        let input = &mut pskt.inputs[index];
        if input.non_witness_utxo.is_none() && input.witness_utxo.is_none() {
            if let Some(utxo) = resolver.resolve_utxo(&outpoint) {
                if is_segwit_output(provider, &utxo.script_pubkey) {
                    input.witness_utxo = Some(utxo);
                }
            }
        }

        // metadata-only pass; inputs that still lack their UTXO or their
        // scripts simply stay as they are
        let _ = sign_pskt_input(
            provider,
            &mut pskt,
            index,
            None,
            bitcoin::EcdsaSighashType::All.into(),
            None,
            false,
        );
    }
    for index in 0..pskt.outputs.len() {
        update_pskt_output(provider, &mut pskt, index)
            .map_err(|err| RpcError::SigningFailure(err.to_string()))?;
    }

    Ok(pskt.to_string())
}

fn is_segwit_output(provider: &dyn SigningProvider, script_pubkey: &bitcoin::Script) -> bool {
    if script_pubkey.is_witness_program() {
        return true;
    }
    if let ScriptClass::ScriptHash(hash) = ScriptClass::from_script(script_pubkey) {
        if let Some(redeem) = provider.redeem_script(&hash) {
            return redeem.is_witness_program();
        }
    }
    false
}

/// `decodepskt`: the full JSON tree of a PSKT.
pub fn decode_pskt(encoded: &str) -> Result<DecodePskt, RpcError> {
    let pskt = parse_pskt(encoded)?;
    Ok(decode::decode_pskt_value(&pskt))
}

/// `analyzepskt`: per-input status, next role and fee/size estimates.
pub fn analyze_pskt(encoded: &str, options: &AnalyzerOptions) -> Result<AnalyzePskt, RpcError> {
    let pskt = parse_pskt(encoded)?;
    let analysis = analyze(&pskt, options);

    Ok(AnalyzePskt {
        inputs: analysis
            .inputs
            .iter()
            .map(|input| {
                let missing_any = !input.missing_pubkeys.is_empty()
                    || !input.missing_sigs.is_empty()
                    || input.missing_redeem_script.is_some()
                    || input.missing_witness_script.is_some();
                AnalyzePsktInput {
                    has_utxo: input.has_utxo,
                    is_final: input.is_final,
                    missing: missing_any.then(|| AnalyzePsktInputMissing {
                        pubkeys: hex_list(&input.missing_pubkeys),
                        signatures: hex_list(&input.missing_sigs),
                        redeem_script: input.missing_redeem_script.map(|hash| hash.to_hex()),
                        witness_script: input.missing_witness_script.map(|hash| hash.to_hex()),
                    }),
                    next: input.next.map(|role| role.to_string()),
                }
            })
            .collect(),
        estimated_vsize: analysis.estimated_vsize.map(|vsize| vsize as u64),
        estimated_feerate: analysis.estimated_feerate,
        fee: analysis.fee,
        next: analysis.next.to_string(),
        error: analysis.error,
    })
}

fn hex_list<H: ToHex>(hashes: &[H]) -> Option<Vec<String>> {
    if hashes.is_empty() {
        return None;
    }
    Some(hashes.iter().map(|hash| hash.to_hex()).collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{Script, Txid};

    fn one_input_pskt() -> String {
        create_pskt(
            &[InputRequest::from(OutPoint::new(Txid::all_zeros(), 0))],
            vec![TxOut {
                value: 9_000,
                script_pubkey: Script::new(),
            }],
            0,
            false,
        )
        .unwrap()
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            RpcError::Deserialization("x".into()).code(),
            RPC_DESERIALIZATION_ERROR
        );
        assert_eq!(
            RpcError::PsktMismatch("x".into()).code(),
            RPC_INVALID_PARAMETER
        );
        assert_eq!(RpcError::UtxoMissing(0).code(), RPC_TRANSACTION_ERROR);
    }

    #[test]
    fn combine_surfaces_mismatch() {
        let a = one_input_pskt();
        let b = create_pskt(
            &[InputRequest::from(OutPoint::new(Txid::all_zeros(), 1))],
            vec![],
            0,
            false,
        )
        .unwrap();
        let err = combine_pskts(&[a, b]).unwrap_err();
        assert!(matches!(err, RpcError::PsktMismatch(_)));
        assert_eq!(err.code(), RPC_INVALID_PARAMETER);
    }

    #[test]
    fn decode_reports_globals_and_sections() {
        let encoded = one_input_pskt();
        let decoded = decode_pskt(&encoded).unwrap();
        assert_eq!(decoded.inputs.len(), 1);
        assert_eq!(decoded.outputs.len(), 1);
        assert_eq!(decoded.version, 0);
        assert_eq!(decoded.fee, None);
        assert_eq!(decoded.tx.vout[0].value, 9_000);

        // the JSON tree serializes without nulls for absent fields
        let json = serde_json::to_value(&decoded).unwrap();
        assert!(json.get("fee").is_none());
    }

    #[test]
    fn analyze_reports_missing_utxo() {
        let encoded = one_input_pskt();
        let analysis = analyze_pskt(&encoded, &AnalyzerOptions::default()).unwrap();
        assert_eq!(analysis.next, "updater");
        assert!(!analysis.inputs[0].has_utxo);
        assert_eq!(analysis.fee, None);
    }

    #[test]
    fn deserialization_failures_carry_their_code() {
        let err = decode_pskt("not base64 at all!").unwrap_err();
        assert_eq!(err.code(), RPC_DESERIALIZATION_ERROR);
    }
}
