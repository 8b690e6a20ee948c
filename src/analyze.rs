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

//! PSKT analyzer: classifies every input's progress, names the role that
//! must act next and, when all spent outputs are known, estimates the
//! final virtual size, fee and fee rate.

use std::collections::BTreeMap;

use bitcoin::{EcdsaSighashType, OutPoint, PubkeyHash, ScriptHash, TxOut, WScriptHash};

use crate::input::UtxoError;
use crate::policy;
use crate::sign::{sign_pskt_input, DummySigningProvider, SignatureData};
use crate::{Pskt, PsktRole};

/// Policy knobs the analyzer computes with. Threaded explicitly; there is
/// no process-wide configuration.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct AnalyzerOptions {
    /// Byte-equivalent charged per signature operation when converting
    /// sigop cost into virtual size.
    pub bytes_per_sigop: u32,
}

impl Default for AnalyzerOptions {
    fn default() -> AnalyzerOptions {
        AnalyzerOptions {
            bytes_per_sigop: policy::DEFAULT_BYTES_PER_SIGOP,
        }
    }
}

/// Analysis of a single input.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct PsktInputAnalysis {
    /// Whether the spent output is known.
    pub has_utxo: bool,
    /// Whether the input carries its terminal signed form.
    pub is_final: bool,
    /// The role that must act on this input next.
    pub next: Option<PsktRole>,
    /// Key ids whose public key is missing.
    pub missing_pubkeys: Vec<PubkeyHash>,
    /// Key ids whose signature is missing.
    pub missing_sigs: Vec<PubkeyHash>,
    /// Hash of the missing redeem script.
    pub missing_redeem_script: Option<ScriptHash>,
    /// Hash of the missing witness script.
    pub missing_witness_script: Option<WScriptHash>,
}

/// Analysis of a whole PSKT.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PsktAnalysis {
    /// Per-input analyses, in input order.
    pub inputs: Vec<PsktInputAnalysis>,
    /// The role that must act on the PSKT next: the minimum of the
    /// per-input next roles.
    pub next: PsktRole,
    /// Estimated virtual size of the fully signed transaction.
    pub estimated_vsize: Option<usize>,
    /// Estimated fee rate in atomic units per 1000 virtual bytes.
    pub estimated_feerate: Option<u64>,
    /// Fee paid, when every spent output is known.
    pub fee: Option<u64>,
    /// Why the PSKT is invalid, when it is.
    pub error: Option<String>,
}

impl PsktAnalysis {
    fn set_invalid(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.next = PsktRole::Creator;
        self.estimated_vsize = None;
        self.estimated_feerate = None;
        self.fee = None;
    }
}

/// Analyzes a PSKT. Never fails: malformed or inconsistent data is
/// reported through the `error` field with estimates cleared, while a
/// merely missing UTXO is ordinary data (`has_utxo` false, that input
/// waits for an updater).
pub fn analyze_pskt(pskt: &Pskt, options: &AnalyzerOptions) -> PsktAnalysis {
    let mut result = PsktAnalysis {
        inputs: Vec::with_capacity(pskt.inputs.len()),
        next: PsktRole::Extractor,
        estimated_vsize: None,
        estimated_feerate: None,
        fee: None,
        error: None,
    };

    // All signing below happens on a scratch copy in metadata-only mode
    // with the provider that knows nothing: it can promote what is
    // already there but never changes the caller's PSKT.
    let mut work = pskt.clone();

    let mut calculate_fee = true;
    let mut input_amount: u64 = 0;
    let mut spent_outputs: BTreeMap<OutPoint, TxOut> = BTreeMap::new();

    for index in 0..work.inputs.len() {
        let mut input_analysis = PsktInputAnalysis::default();

        match work.input_utxo(index) {
            Ok(utxo) => {
                let utxo = utxo.clone();
                if !policy::money_range(utxo.value)
                    || !policy::money_range(input_amount.saturating_add(utxo.value))
                {
                    result.set_invalid(format!(
                        "PSKT is not valid: input {} has an amount outside the money range",
                        index
                    ));
                    result.inputs.push(input_analysis);
                    return result;
                }
                input_amount += utxo.value;

                if utxo.script_pubkey.is_provably_unspendable() {
                    result.set_invalid(format!(
                        "PSKT is not valid: input {} spends an unspendable output",
                        index
                    ));
                    result.inputs.push(input_analysis);
                    return result;
                }

                input_analysis.has_utxo = true;
                spent_outputs.insert(work.unsigned_tx.input[index].previous_output, utxo);

                if work.inputs[index].is_signed() {
                    input_analysis.is_final = true;
                    input_analysis.next = Some(PsktRole::Extractor);
                } else {
                    let mut outdata = SignatureData::default();
                    let complete = sign_pskt_input(
                        &DummySigningProvider,
                        &mut work,
                        index,
                        None,
                        EcdsaSighashType::All.into(),
                        Some(&mut outdata),
                        true,
                    )
                    .unwrap_or(false);

                    input_analysis.missing_pubkeys = outdata.missing_pubkeys;
                    input_analysis.missing_sigs = outdata.missing_sigs;
                    input_analysis.missing_redeem_script = outdata.missing_redeem_script;
                    input_analysis.missing_witness_script = outdata.missing_witness_script;

                    input_analysis.next = Some(if complete {
                        PsktRole::Finalizer
                    } else if input_analysis.missing_pubkeys.is_empty()
                        && input_analysis.missing_redeem_script.is_none()
                        && input_analysis.missing_witness_script.is_none()
                        && !input_analysis.missing_sigs.is_empty()
                    {
                        PsktRole::Signer
                    } else {
                        PsktRole::Updater
                    });
                }
            }
            Err(UtxoError::Missing) => {
                input_analysis.has_utxo = false;
                input_analysis.is_final = false;
                input_analysis.next = Some(PsktRole::Updater);
                calculate_fee = false;
            }
            Err(err) => {
                result.set_invalid(format!(
                    "PSKT is not valid: input {} has inconsistent UTXO information ({})",
                    index, err
                ));
                result.inputs.push(input_analysis);
                return result;
            }
        }

        result.inputs.push(input_analysis);
    }

    for input_analysis in &result.inputs {
        if let Some(next) = input_analysis.next {
            result.next = result.next.min(next);
        }
    }
    assert!(result.next > PsktRole::Creator);

    if !calculate_fee {
        return result;
    }

    let mut output_amount: u64 = 0;
    for txout in &work.unsigned_tx.output {
        if !policy::money_range(txout.value)
            || !policy::money_range(output_amount.saturating_add(txout.value))
        {
            result.set_invalid("PSKT is not valid: output amount outside the money range");
            return result;
        }
        output_amount += txout.value;
    }
    if output_amount > input_amount {
        result.set_invalid("PSKT is not valid: total output amount exceeds total input amount");
        return result;
    }
    let fee = input_amount - output_amount;
    result.fee = Some(fee);

    // Size estimation needs every input promoted to (at least a dummy
    // view of) its final form; inputs that cannot be promoted leave the
    // estimate unavailable while the fee stays reported.
    let mut promoted = true;
    for index in 0..work.inputs.len() {
        if work.inputs[index].is_signed() {
            continue;
        }
        let complete = sign_pskt_input(
            &DummySigningProvider,
            &mut work,
            index,
            None,
            EcdsaSighashType::All.into(),
            None,
            true,
        )
        .unwrap_or(false);
        if !complete {
            promoted = false;
            break;
        }
    }
    if promoted {
        let tx = work.extract_signed_tx();
        let sigop_cost = policy::transaction_sig_op_cost(&tx, &spent_outputs);
        let vsize = policy::virtual_size(tx.weight(), sigop_cost, options.bytes_per_sigop);
        result.estimated_vsize = Some(vsize);
        result.estimated_feerate = Some(policy::fee_rate_per_kvb(fee, vsize));
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::blockdata::opcodes;
    use bitcoin::blockdata::script::Builder;
    use bitcoin::hashes::Hash;
    use bitcoin::{
        PackedLockTime, Script, Sequence, Transaction, TxIn, Txid, Witness,
    };

    fn unsigned_tx() -> Transaction {
        Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 0),
                script_sig: Script::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: 40_000,
                script_pubkey: Script::new_op_return(&[]),
            }],
        }
    }

    #[test]
    fn missing_utxo_waits_for_updater() {
        let pskt = Pskt::from_unsigned_tx(unsigned_tx()).unwrap();
        let analysis = analyze_pskt(&pskt, &AnalyzerOptions::default());
        assert!(!analysis.inputs[0].has_utxo);
        assert_eq!(analysis.next, PsktRole::Updater);
        assert_eq!(analysis.fee, None);
        assert_eq!(analysis.error, None);
    }

    #[test]
    fn unspendable_spent_output_is_invalid() {
        let mut pskt = Pskt::from_unsigned_tx(unsigned_tx()).unwrap();
        pskt.inputs[0].witness_utxo = Some(TxOut {
            value: 50_000,
            script_pubkey: Builder::new()
                .push_opcode(opcodes::all::OP_RETURN)
                .into_script(),
        });
        let analysis = analyze_pskt(&pskt, &AnalyzerOptions::default());
        assert!(analysis.error.is_some());
        assert_eq!(analysis.next, PsktRole::Creator);
        assert_eq!(analysis.fee, None);
    }

    #[test]
    fn amount_out_of_money_range_is_invalid() {
        let mut pskt = Pskt::from_unsigned_tx(unsigned_tx()).unwrap();
        pskt.inputs[0].witness_utxo = Some(TxOut {
            value: policy::MAX_MONEY + 1,
            script_pubkey: Script::new(),
        });
        let analysis = analyze_pskt(&pskt, &AnalyzerOptions::default());
        assert!(analysis.error.is_some());
    }

    #[test]
    fn analyzer_does_not_mutate_the_pskt() {
        let mut pskt = Pskt::from_unsigned_tx(unsigned_tx()).unwrap();
        pskt.inputs[0].witness_utxo = Some(TxOut {
            value: 50_000,
            script_pubkey: Script::new_v0_p2wsh(&Script::new().wscript_hash()),
        });
        let before = pskt.clone();
        let _ = analyze_pskt(&pskt, &AnalyzerOptions::default());
        assert_eq!(pskt, before);
    }
}
