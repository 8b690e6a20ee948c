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

//! Finalizer and extractor roles: promotion of complete partial
//! signatures into terminal scriptSig / witness form, and assembly of the
//! broadcast-ready transaction.

use bitcoin::{EcdsaSighashType, Transaction};

use crate::sign::{
    precompute_pskt_data, sign_pskt_input, DummySigningProvider, PrecomputedPsktData,
};
use crate::Pskt;

/// Errors of extracting the network transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ExtractError {
    /// not every input could be finalized; the PSKT is not ready for
    /// extraction
    Incomplete,
}

/// Attempts to finalize a single input: no new signing happens, but
/// partial signatures already present are promoted to a final scriptSig /
/// witness stack when they form a valid satisfaction of the spent script.
/// Finalization is idempotent, an already-final input reports success.
pub fn finalize_pskt_input(pskt: &mut Pskt, index: usize, txdata: &PrecomputedPsktData) -> bool {
    sign_pskt_input(
        &DummySigningProvider,
        pskt,
        index,
        Some(txdata),
        EcdsaSighashType::All.into(),
        None,
        true,
    )
    .unwrap_or(false)
}

/// Runs the finalizer over every input. Returns whether the whole PSKT
/// ended finalized; per-input failures only make the result incomplete,
/// they never abort the remaining inputs.
pub fn finalize_pskt(pskt: &mut Pskt) -> bool {
    let txdata = precompute_pskt_data(pskt);
    let mut complete = true;
    for index in 0..pskt.inputs.len() {
        complete &= finalize_pskt_input(pskt, index, &txdata);
    }
    complete
}

/// Finalizes and, when every input ends finalized, assembles the network
/// transaction: vin scriptSig/witness come from the final fields, every
/// other transaction field from the unsigned template.
pub fn finalize_and_extract(pskt: &mut Pskt) -> Result<Transaction, ExtractError> {
    if !finalize_pskt(pskt) {
        return Err(ExtractError::Incomplete);
    }
    Ok(pskt.extract_signed_tx())
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{
        OutPoint, PackedLockTime, Script, Sequence, TxIn, TxOut, Txid, Witness,
    };

    fn pskt_with_final_input() -> Pskt {
        let tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 0),
                script_sig: Script::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: 1_000,
                script_pubkey: Script::new(),
            }],
        };
        let mut pskt = Pskt::from_unsigned_tx(tx).unwrap();
        pskt.inputs[0].final_script_witness =
            Some(Witness::from_vec(vec![vec![0xAA; 71], vec![0x02; 33]]));
        pskt
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut pskt = pskt_with_final_input();
        assert!(finalize_pskt(&mut pskt));
        let once = pskt.clone();
        assert!(finalize_pskt(&mut pskt));
        assert_eq!(pskt, once);
    }

    #[test]
    fn extract_writes_final_fields_into_vin() {
        let mut pskt = pskt_with_final_input();
        let tx = finalize_and_extract(&mut pskt).unwrap();
        assert_eq!(
            Some(&tx.input[0].witness),
            pskt.inputs[0].final_script_witness.as_ref()
        );
        assert_eq!(tx.output, pskt.unsigned_tx.output);
        assert_eq!(tx.lock_time, pskt.unsigned_tx.lock_time);
    }

    #[test]
    fn extract_refuses_incomplete() {
        let mut pskt = pskt_with_final_input();
        pskt.inputs[0].final_script_witness = None;
        assert_eq!(finalize_and_extract(&mut pskt), Err(ExtractError::Incomplete));
    }
}
