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

//! Consensus money bounds and standardness policy arithmetic used by the
//! analyzer. All knobs are threaded through explicitly; nothing here reads
//! process-wide state.

use std::collections::BTreeMap;

use bitcoin::{OutPoint, Script, Transaction, TxOut};

use crate::script;

/// Atomic units in one coin.
pub const COIN: u64 = 100_000_000;

/// Upper bound of the consensus money range.
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Weight units per virtual byte.
pub const WITNESS_SCALE_FACTOR: usize = 4;

/// Default policy equivalence between signature operations and bytes.
pub const DEFAULT_BYTES_PER_SIGOP: u32 = 20;

/// Whether a single amount lies within the consensus money range.
#[inline]
pub fn money_range(value: u64) -> bool {
    value <= MAX_MONEY
}

/// Virtual transaction size: the standard weight formula, with the sigop
/// cost converted into weight at `bytes_per_sigop` and the larger of the
/// two rounded up to virtual bytes.
pub fn virtual_size(weight: usize, sigop_cost: usize, bytes_per_sigop: u32) -> usize {
    let sigop_weight = sigop_cost * bytes_per_sigop as usize * WITNESS_SCALE_FACTOR;
    (weight.max(sigop_weight) + WITNESS_SCALE_FACTOR - 1) / WITNESS_SCALE_FACTOR
}

/// Fee rate in atomic units per 1000 virtual bytes.
pub fn fee_rate_per_kvb(fee: u64, vsize: usize) -> u64 {
    if vsize == 0 {
        return 0;
    }
    fee.saturating_mul(1000) / vsize as u64
}

/// Total signature-operation cost of a transaction given a view of the
/// outputs it spends: legacy sigops (scriptSigs and outputs) scaled by the
/// witness factor, plus P2SH redeem-script sigops, plus witness-program
/// sigops.
pub fn transaction_sig_op_cost(
    tx: &Transaction,
    spent_outputs: &BTreeMap<OutPoint, TxOut>,
) -> usize {
    let mut cost = 0usize;

    for txin in &tx.input {
        cost += script::sig_op_count(&txin.script_sig, false) * WITNESS_SCALE_FACTOR;
    }
    for txout in &tx.output {
        cost += script::sig_op_count(&txout.script_pubkey, false) * WITNESS_SCALE_FACTOR;
    }

    for txin in &tx.input {
        let spent = match spent_outputs.get(&txin.previous_output) {
            Some(txout) => txout,
            None => continue,
        };

        if spent.script_pubkey.is_p2sh() {
            if let Some(redeem) = script::last_push(&txin.script_sig) {
                let redeem = Script::from(redeem);
                cost += script::sig_op_count(&redeem, true) * WITNESS_SCALE_FACTOR;
                cost += witness_sig_op_count(&redeem, &txin.witness.to_vec());
            }
        } else {
            cost += witness_sig_op_count(&spent.script_pubkey, &txin.witness.to_vec());
        }
    }

    cost
}

/// Sigops executed by a witness program (the program itself, or the one
/// nested inside a P2SH redeem script).
fn witness_sig_op_count(program: &Script, witness: &[Vec<u8>]) -> usize {
    match script::witness_program(program) {
        Some((0, payload)) if payload.len() == 20 => 1,
        Some((0, payload)) if payload.len() == 32 => match witness.last() {
            Some(witness_script) => {
                script::sig_op_count(&Script::from(witness_script.clone()), true)
            }
            None => 0,
        },
        _ => 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn money_bounds() {
        assert!(money_range(0));
        assert!(money_range(MAX_MONEY));
        assert!(!money_range(MAX_MONEY + 1));
    }

    #[test]
    fn vsize_rounds_up_and_respects_sigops() {
        // pure weight: ceil(401 / 4) == 101
        assert_eq!(virtual_size(401, 0, DEFAULT_BYTES_PER_SIGOP), 101);
        // sigop-dominated: 10 sigops * 20 bytes each
        assert_eq!(virtual_size(401, 10, DEFAULT_BYTES_PER_SIGOP), 200);
    }

    #[test]
    fn fee_rate_scaling() {
        assert_eq!(fee_rate_per_kvb(1_000, 250), 4_000);
        assert_eq!(fee_rate_per_kvb(1_000, 0), 0);
    }
}
