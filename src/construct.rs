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

//! Creator-role operations: building a fresh PSKT from outpoints and
//! outputs, converting an existing network transaction, and joining
//! distinct PSKTs into one.

use bitcoin::{
    OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Witness,
};
use rand::seq::SliceRandom;

use crate::global::TxError;
use crate::{Input, Output, Pskt};

/// Sequence number enabling replace-by-fee signalling.
const SEQUENCE_RBF: Sequence = Sequence(0xffff_fffd);
/// Sequence number disabling RBF while keeping the locktime enforceable.
const SEQUENCE_LOCKTIME_NO_RBF: Sequence = Sequence(0xffff_fffe);

/// One requested transaction input: the outpoint to spend and an
/// optional explicit sequence number.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct InputRequest {
    /// Outpoint to spend.
    pub outpoint: OutPoint,
    /// Explicit sequence; absent picks the locktime/replaceable default.
    pub sequence: Option<Sequence>,
}

impl From<OutPoint> for InputRequest {
    fn from(outpoint: OutPoint) -> InputRequest {
        InputRequest {
            outpoint,
            sequence: None,
        }
    }
}

/// Errors of converting a network transaction into a PSKT.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum ConvertError {
    /// the transaction carries signature data; pass `permit_sig_data` to
    /// discard it
    HasSignatureData,

    /// Transaction structure error (see [`TxError`]).
    #[from]
    #[display(inner)]
    Tx(TxError),
}

/// Errors of joining several PSKTs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum JoinError {
    /// joining needs at least two PSKTs
    NotEnoughPskts,

    /// Duplicate outpoint or malformed input (see [`TxError`]).
    #[from]
    #[display(inner)]
    Tx(TxError),
}

/// Creates a PSKT over a fresh unsigned transaction.
///
/// Input sequence defaults follow the creator's intent: replaceable
/// signals RBF, otherwise a non-zero locktime keeps sequences below the
/// final value so the locktime stays enforceable.
pub fn create_pskt(
    inputs: &[InputRequest],
    outputs: Vec<TxOut>,
    locktime: u32,
    replaceable: bool,
) -> Result<Pskt, TxError> {
    let template = Transaction {
        version: 2,
        lock_time: PackedLockTime(locktime),
        input: vec![],
        output: vec![],
    };
    let mut pskt = Pskt::from_unsigned_tx(template).expect("empty transaction has no inputs");

    let default_sequence = if replaceable {
        SEQUENCE_RBF
    } else if locktime > 0 {
        SEQUENCE_LOCKTIME_NO_RBF
    } else {
        Sequence::MAX
    };

    for request in inputs {
        let txin = TxIn {
            previous_output: request.outpoint,
            script_sig: Script::new(),
            sequence: request.sequence.unwrap_or(default_sequence),
            witness: Witness::default(),
        };
        pskt.add_input(txin, Input::default())?;
    }
    for txout in outputs {
        pskt.add_output(txout, Output::default());
    }

    Ok(pskt)
}

/// Converts a network transaction into a PSKT by discarding its
/// signature data. Refuses to discard silently: when any input carries a
/// scriptSig or witness the caller must opt in with `permit_sig_data`.
pub fn convert_to_pskt(mut tx: Transaction, permit_sig_data: bool) -> Result<Pskt, ConvertError> {
    let has_sig_data = tx
        .input
        .iter()
        .any(|txin| !txin.script_sig.is_empty() || !txin.witness.is_empty());
    if has_sig_data && !permit_sig_data {
        return Err(ConvertError::HasSignatureData);
    }

    for txin in &mut tx.input {
        txin.script_sig = Script::new();
        txin.witness = Witness::default();
    }
    Ok(Pskt::from_unsigned_tx(tx)?)
}

/// Joins several PSKTs with disjoint inputs into one.
///
/// The result's format version is the maximum and its locktime the
/// minimum across the parts; a shared outpoint aborts with
/// [`TxError::DuplicateInput`]. After concatenation the input and output
/// orders are shuffled uniformly so the join does not leak which part
/// contributed which entries.
pub fn join_pskts(pskts: Vec<Pskt>) -> Result<Pskt, JoinError> {
    if pskts.len() < 2 {
        return Err(JoinError::NotEnoughPskts);
    }

    let version = pskts.iter().filter_map(|pskt| pskt.version).max();
    let tx_version = pskts
        .iter()
        .map(|pskt| pskt.unsigned_tx.version)
        .max()
        .expect("at least two pskts");
    let locktime = pskts
        .iter()
        .map(|pskt| pskt.unsigned_tx.lock_time)
        .min()
        .expect("at least two pskts");

    let template = Transaction {
        version: tx_version,
        lock_time: locktime,
        input: vec![],
        output: vec![],
    };
    let mut joined =
        Pskt::from_unsigned_tx(template).expect("empty transaction has no inputs");
    joined.version = version;

    for pskt in pskts {
        for (origin, xpubs) in pskt.xpubs {
            joined.xpubs.entry(origin).or_default().extend(xpubs);
        }
        for (key, value) in pskt.proprietary {
            joined.proprietary.entry(key).or_insert(value);
        }
        for (key, value) in pskt.unknown {
            joined.unknown.entry(key).or_insert(value);
        }
        for (txin, input) in pskt.unsigned_tx.input.into_iter().zip(pskt.inputs) {
            joined.add_input(txin, input)?;
        }
        for (txout, output) in pskt.unsigned_tx.output.into_iter().zip(pskt.outputs) {
            joined.add_output(txout, output);
        }
    }

    shuffle_entries(&mut joined);
    Ok(joined)
}

/// Shuffles inputs and outputs uniformly, keeping the transaction and
/// record vectors parallel.
fn shuffle_entries(pskt: &mut Pskt) {
    let mut rng = rand::thread_rng();

    let mut input_order: Vec<usize> = (0..pskt.inputs.len()).collect();
    input_order.shuffle(&mut rng);
    pskt.unsigned_tx.input = permute(std::mem::take(&mut pskt.unsigned_tx.input), &input_order);
    pskt.inputs = permute(std::mem::take(&mut pskt.inputs), &input_order);

    let mut output_order: Vec<usize> = (0..pskt.outputs.len()).collect();
    output_order.shuffle(&mut rng);
    pskt.unsigned_tx.output = permute(std::mem::take(&mut pskt.unsigned_tx.output), &output_order);
    pskt.outputs = permute(std::mem::take(&mut pskt.outputs), &output_order);
}

fn permute<T>(items: Vec<T>, order: &[usize]) -> Vec<T> {
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    order
        .iter()
        .map(|&index| slots[index].take().expect("permutation indices are unique"))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    fn outpoint(vout: u32) -> OutPoint {
        OutPoint::new(Txid::all_zeros(), vout)
    }

    fn txout(value: u64) -> TxOut {
        TxOut {
            value,
            script_pubkey: Script::new(),
        }
    }

    #[test]
    fn sequence_defaults() {
        let inputs = [InputRequest::from(outpoint(0))];

        let pskt = create_pskt(&inputs, vec![txout(1)], 0, false).unwrap();
        assert_eq!(pskt.unsigned_tx.input[0].sequence, Sequence::MAX);

        let pskt = create_pskt(&inputs, vec![txout(1)], 100, false).unwrap();
        assert_eq!(
            pskt.unsigned_tx.input[0].sequence,
            SEQUENCE_LOCKTIME_NO_RBF
        );
        assert_eq!(pskt.unsigned_tx.lock_time, PackedLockTime(100));

        let pskt = create_pskt(&inputs, vec![txout(1)], 100, true).unwrap();
        assert_eq!(pskt.unsigned_tx.input[0].sequence, SEQUENCE_RBF);

        let explicit = [InputRequest {
            outpoint: outpoint(0),
            sequence: Some(Sequence(42)),
        }];
        let pskt = create_pskt(&explicit, vec![txout(1)], 0, true).unwrap();
        assert_eq!(pskt.unsigned_tx.input[0].sequence, Sequence(42));
    }

    #[test]
    fn create_rejects_duplicate_outpoints() {
        let inputs = [InputRequest::from(outpoint(0)), InputRequest::from(outpoint(0))];
        assert_eq!(
            create_pskt(&inputs, vec![], 0, false),
            Err(TxError::DuplicateInput(outpoint(0)))
        );
    }

    #[test]
    fn convert_requires_permission_to_strip() {
        let tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: outpoint(0),
                script_sig: Script::from(vec![0x51]),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![txout(5)],
        };

        assert_eq!(
            convert_to_pskt(tx.clone(), false),
            Err(ConvertError::HasSignatureData)
        );
        let pskt = convert_to_pskt(tx, true).unwrap();
        assert!(pskt.unsigned_tx.input[0].script_sig.is_empty());
    }

    #[test]
    fn join_refuses_shared_outpoints() {
        let a = create_pskt(&[outpoint(0).into()], vec![txout(1)], 0, false).unwrap();
        let b = create_pskt(&[outpoint(0).into()], vec![txout(2)], 0, false).unwrap();
        assert_eq!(
            join_pskts(vec![a, b]),
            Err(JoinError::Tx(TxError::DuplicateInput(outpoint(0))))
        );
    }

    #[test]
    fn join_concatenates_and_keeps_vectors_parallel() {
        let mut a = create_pskt(&[outpoint(0).into()], vec![txout(1)], 50, false).unwrap();
        a.version = Some(0);
        let b = create_pskt(&[outpoint(1).into(), outpoint(2).into()], vec![txout(2)], 20, false)
            .unwrap();

        let joined = join_pskts(vec![a, b]).unwrap();
        assert_eq!(joined.inputs.len(), 3);
        assert_eq!(joined.unsigned_tx.input.len(), 3);
        assert_eq!(joined.outputs.len(), 2);
        assert_eq!(joined.unsigned_tx.lock_time, PackedLockTime(20));
        assert_eq!(joined.version, Some(0));

        let mut outpoints: Vec<u32> = joined
            .unsigned_tx
            .input
            .iter()
            .map(|txin| txin.previous_output.vout)
            .collect();
        outpoints.sort_unstable();
        assert_eq!(outpoints, vec![0, 1, 2]);
    }

    #[test]
    fn join_needs_two() {
        let a = create_pskt(&[outpoint(0).into()], vec![], 0, false).unwrap();
        assert_eq!(join_pskts(vec![a]), Err(JoinError::NotEnoughPskts));
    }
}
