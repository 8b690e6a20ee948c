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

use bitcoin::util::bip32::{ExtendedPubKey, KeySource};
use bitcoin::{OutPoint, Transaction, TxIn, TxOut, Txid};

use crate::input::{merge_map, UtxoError};
use crate::raw;
use crate::{Input, Output};

/// Errors of constructing a PSKT from an unsigned transaction or of
/// growing it with new inputs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum TxError {
    /// the scriptSig of input #{0} of the unsigned transaction is not
    /// empty
    UnsignedTxHasScriptSigs(usize),

    /// the witness of input #{0} of the unsigned transaction is not empty
    UnsignedTxHasScriptWitnesses(usize),

    /// an input spending outpoint {0} is already present in the PSKT
    DuplicateInput(OutPoint),
}

/// Errors of fusing two PSKTs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum CombineError {
    /// PSKTs fuse only over the same unsigned transaction: this one is
    /// built over {expected} while the other is over {actual}
    TxidMismatch {
        /// Txid of the accumulating PSKT.
        expected: Txid,
        /// Txid of the PSKT being merged in.
        actual: Txid,
    },

    /// no PSKTs were provided to combine
    NothingToCombine,
}

/// Errors happening during fee computation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum FeeError {
    /// Input UTXO information is absent or inconsistent (see
    /// [`UtxoError`]).
    #[from]
    #[display(inner)]
    Utxo(UtxoError),

    /// sum of inputs is less than sum of outputs
    InputsLessThanOutputs,

    /// input amounts overflow the money range
    AmountOverflow,
}

/// A partially signed koyotecoin transaction: the unsigned transaction
/// template plus one metadata record per input and per output, and the
/// global key/value section.
///
/// The per-input and per-output record vectors are parallel to
/// `unsigned_tx.input` / `unsigned_tx.output` at all times; every
/// mutation goes through a method keeping both sides in step.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Pskt {
    /// The unsigned transaction; scriptSigs and witnesses stay empty,
    /// final signatures live in the per-input records.
    pub unsigned_tx: Transaction,

    /// PSKT format version; absent means version 0.
    pub version: Option<u32>,

    /// Extended public keys declared at global scope, grouped by their
    /// key origin.
    pub xpubs: BTreeMap<KeySource, BTreeSet<ExtendedPubKey>>,

    /// Global proprietary key-value pairs.
    pub proprietary: BTreeMap<raw::ProprietaryKey, Vec<u8>>,

    /// Unknown global key-value pairs.
    pub unknown: BTreeMap<raw::Key, Vec<u8>>,

    /// One record per `unsigned_tx.input`.
    pub inputs: Vec<Input>,

    /// One record per `unsigned_tx.output`.
    pub outputs: Vec<Output>,
}

impl Pskt {
    /// Creates a PSKT over an unsigned transaction, allocating one empty
    /// record per input and output.
    ///
    /// Checks that the transaction carries no scriptSig or witness data.
    pub fn from_unsigned_tx(unsigned_tx: Transaction) -> Result<Pskt, TxError> {
        for (index, txin) in unsigned_tx.input.iter().enumerate() {
            check_unsigned_txin(index, txin)?;
        }

        let inputs = vec![Input::default(); unsigned_tx.input.len()];
        let outputs = vec![Output::default(); unsigned_tx.output.len()];

        Ok(Pskt {
            unsigned_tx,
            version: None,
            xpubs: BTreeMap::new(),
            proprietary: BTreeMap::new(),
            unknown: BTreeMap::new(),
            inputs,
            outputs,
        })
    }

    /// PSKT format version, 0 when the optional field is absent.
    #[inline]
    pub fn version(&self) -> u32 {
        self.version.unwrap_or(0)
    }

    /// Transaction ID of the unsigned transaction.
    #[inline]
    pub fn txid(&self) -> Txid {
        self.unsigned_tx.txid()
    }

    /// Appends a new input to both the unsigned transaction and the
    /// record vector. Rejects signed inputs and duplicate outpoints.
    pub fn add_input(&mut self, txin: TxIn, input: Input) -> Result<(), TxError> {
        check_unsigned_txin(self.inputs.len(), &txin)?;
        if self
            .unsigned_tx
            .input
            .iter()
            .any(|existing| existing.previous_output == txin.previous_output)
        {
            return Err(TxError::DuplicateInput(txin.previous_output));
        }
        self.unsigned_tx.input.push(txin);
        self.inputs.push(input);
        Ok(())
    }

    /// Appends a new output to both the unsigned transaction and the
    /// record vector.
    pub fn add_output(&mut self, txout: TxOut, output: Output) {
        self.unsigned_tx.output.push(txout);
        self.outputs.push(output);
    }

    /// Resolves the output spent by input `index`.
    pub fn input_utxo(&self, index: usize) -> Result<&TxOut, UtxoError> {
        self.inputs[index].spent_output(&self.unsigned_tx.input[index])
    }

    /// Fuses `other` into this PSKT.
    ///
    /// Fails with [`CombineError::TxidMismatch`] before touching anything
    /// when the two are not built over the same unsigned transaction.
    /// Per-field rules: set-valued fields union with existing entries
    /// winning, scalar fields fill only when absent.
    pub fn merge(&mut self, other: Pskt) -> Result<(), CombineError> {
        let expected = self.txid();
        let actual = other.txid();
        if expected != actual {
            return Err(CombineError::TxidMismatch { expected, actual });
        }

        if self.version.is_none() {
            self.version = other.version;
        }
        for (origin, xpubs) in other.xpubs {
            self.xpubs.entry(origin).or_default().extend(xpubs);
        }
        merge_map(&mut self.proprietary, other.proprietary);
        merge_map(&mut self.unknown, other.unknown);

        for (mine, theirs) in self.inputs.iter_mut().zip(other.inputs) {
            mine.combine(theirs);
        }
        for (mine, theirs) in self.outputs.iter_mut().zip(other.outputs) {
            mine.combine(theirs);
        }

        Ok(())
    }

    /// The transaction with available final signature data filled in.
    /// Inputs not yet finalized keep empty scriptSig/witness.
    pub fn extract_signed_tx(&self) -> Transaction {
        let mut tx = self.unsigned_tx.clone();
        for (vin, input) in tx.input.iter_mut().zip(&self.inputs) {
            vin.script_sig = input.final_script_sig.clone().unwrap_or_default();
            vin.witness = input.final_script_witness.clone().unwrap_or_default();
        }
        tx
    }

    /// Fee paid by the transaction, computable only when every input's
    /// spent output is known.
    pub fn fee(&self) -> Result<u64, FeeError> {
        let mut input_sum: u128 = 0;
        for index in 0..self.inputs.len() {
            input_sum += self.input_utxo(index)?.value as u128;
        }

        let output_sum: u128 = self
            .unsigned_tx
            .output
            .iter()
            .map(|txout| txout.value as u128)
            .sum();

        if input_sum < output_sum {
            return Err(FeeError::InputsLessThanOutputs);
        }
        u64::try_from(input_sum - output_sum).map_err(|_| FeeError::AmountOverflow)
    }
}

/// Left-fold of [`Pskt::merge`] over any number of PSKTs. Commutative and
/// idempotent for well-formed inputs; any transaction mismatch aborts the
/// whole combine.
pub fn combine(pskts: Vec<Pskt>) -> Result<Pskt, CombineError> {
    let mut iter = pskts.into_iter();
    let mut accumulator = iter.next().ok_or(CombineError::NothingToCombine)?;
    for pskt in iter {
        accumulator.merge(pskt)?;
    }
    Ok(accumulator)
}

fn check_unsigned_txin(index: usize, txin: &TxIn) -> Result<(), TxError> {
    if !txin.script_sig.is_empty() {
        return Err(TxError::UnsignedTxHasScriptSigs(index));
    }
    if !txin.witness.is_empty() {
        return Err(TxError::UnsignedTxHasScriptWitnesses(index));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{PackedLockTime, Script, Sequence, Witness};

    fn unsigned_tx(n_inputs: u32) -> Transaction {
        Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: (0..n_inputs)
                .map(|vout| TxIn {
                    previous_output: OutPoint::new(Txid::all_zeros(), vout),
                    script_sig: Script::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                })
                .collect(),
            output: vec![TxOut {
                value: 10_000,
                script_pubkey: Script::new(),
            }],
        }
    }

    #[test]
    fn construction_allocates_parallel_records() {
        let pskt = Pskt::from_unsigned_tx(unsigned_tx(3)).unwrap();
        assert_eq!(pskt.inputs.len(), 3);
        assert_eq!(pskt.outputs.len(), 1);
        assert_eq!(pskt.version(), 0);
        assert!(pskt.inputs.iter().all(Input::is_null));
    }

    #[test]
    fn construction_rejects_signed_tx() {
        let mut tx = unsigned_tx(1);
        tx.input[0].script_sig = Script::from(vec![0x51]);
        assert_eq!(
            Pskt::from_unsigned_tx(tx),
            Err(TxError::UnsignedTxHasScriptSigs(0))
        );

        let mut tx = unsigned_tx(1);
        tx.input[0].witness = Witness::from_vec(vec![vec![0x01]]);
        assert_eq!(
            Pskt::from_unsigned_tx(tx),
            Err(TxError::UnsignedTxHasScriptWitnesses(0))
        );
    }

    #[test]
    fn add_input_rejects_duplicate_outpoint() {
        let mut pskt = Pskt::from_unsigned_tx(unsigned_tx(1)).unwrap();
        let dup = TxIn {
            previous_output: OutPoint::new(Txid::all_zeros(), 0),
            ..TxIn::default()
        };
        assert_eq!(
            pskt.add_input(dup, Input::default()),
            Err(TxError::DuplicateInput(OutPoint::new(Txid::all_zeros(), 0)))
        );

        let fresh = TxIn {
            previous_output: OutPoint::new(Txid::all_zeros(), 7),
            ..TxIn::default()
        };
        pskt.add_input(fresh, Input::default()).unwrap();
        assert_eq!(pskt.unsigned_tx.input.len(), 2);
        assert_eq!(pskt.inputs.len(), 2);
    }

    #[test]
    fn merge_rejects_foreign_transaction() {
        let mut a = Pskt::from_unsigned_tx(unsigned_tx(1)).unwrap();
        let b = Pskt::from_unsigned_tx(unsigned_tx(2)).unwrap();
        let before = a.clone();
        assert!(matches!(
            a.merge(b),
            Err(CombineError::TxidMismatch { .. })
        ));
        // a failed merge leaves the accumulator untouched
        assert_eq!(a, before);
    }

    #[test]
    fn combine_requires_at_least_one() {
        assert_eq!(combine(vec![]), Err(CombineError::NothingToCombine));
    }

    #[test]
    fn fee_requires_utxo_information() {
        let pskt = Pskt::from_unsigned_tx(unsigned_tx(1)).unwrap();
        assert_eq!(pskt.fee(), Err(FeeError::Utxo(UtxoError::Missing)));
    }
}
