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

//! The signature pipeline: template-directed satisfaction of the spent
//! script out of provider-held keys and material already in the PSKT.

use bitcoin::hashes::{hash160, Hash};
use bitcoin::util::taproot::{LeafVersion, TapLeafHash};
use bitcoin::{PubkeyHash, PublicKey, Script, Witness, XOnlyPublicKey};

use super::creator::{DummySignatureCreator, PrecomputedPsktData, SigVersion, SignatureCreator};
use super::{SignatureData, SigningProvider, TxSignatureCreator};
use crate::input::{PsktSighashType, UtxoError};
use crate::script::{self, ScriptClass};
use crate::Pskt;

/// Errors happening while signing a specific PSKT input.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum SignInputError {
    /// input index {0} exceeds the number of PSKT inputs
    InputOutOfRange(usize),

    /// output index {0} exceeds the number of PSKT outputs
    OutputOutOfRange(usize),

    /// Spent-output resolution failure (see [`UtxoError`]).
    #[from]
    #[display(inner)]
    Utxo(UtxoError),

    /// the input spends a witness UTXO but no witness signature was
    /// produced; signing it in legacy form is unsafe
    WitnessSignatureRequired,
}

/// Error of a whole-PSKT signing operation, wrapping the failed input
/// index.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display("failed to sign input #{input_index}: {error}")]
pub struct SignError {
    /// Signing error originating from a specific transaction input.
    pub error: SignInputError,
    /// Index of the transaction input that has generated the error.
    pub input_index: usize,
}

impl SignError {
    /// Attaches an input index to an input-level error.
    #[inline]
    pub fn with_input_no(error: SignInputError, input_index: usize) -> SignError {
        SignError { error, input_index }
    }
}

/// Gathers every spent output so witness signature hashes can be
/// computed. When any input's UTXO is unresolvable the data comes back in
/// partial mode: taproot signing will not work, ECDSA still will.
pub fn precompute_pskt_data(pskt: &Pskt) -> PrecomputedPsktData {
    let mut spent_outputs = Vec::with_capacity(pskt.inputs.len());
    for (txin, input) in pskt.unsigned_tx.input.iter().zip(&pskt.inputs) {
        match input.spent_output(txin) {
            Ok(txout) => spent_outputs.push(txout.clone()),
            Err(_) => return PrecomputedPsktData::default(),
        }
    }
    PrecomputedPsktData {
        spent_outputs: Some(spent_outputs),
    }
}

/// Signs one PSKT input.
///
/// Resolves the spent output (verifying a `non_witness_utxo` against the
/// outpoint), fills a [`SignatureData`] from the input, drives
/// [`produce_signature`] with either a transaction-bound creator or, when
/// `txdata` is absent, the metadata-only dummy creator, and writes the
/// result back. With `finalize` false the solution is forced to stay in
/// partial form. Returns whether the input's script is fully satisfied.
///
/// When a witness signature was produced the resolved UTXO is copied into
/// `witness_utxo`; a present `non_witness_utxo` is left alone, since only
/// a whole-transaction inspection can tell whether dropping it is safe.
pub fn sign_pskt_input(
    provider: &dyn SigningProvider,
    pskt: &mut Pskt,
    index: usize,
    txdata: Option<&PrecomputedPsktData>,
    sighash_type: PsktSighashType,
    out_sigdata: Option<&mut SignatureData>,
    finalize: bool,
) -> Result<bool, SignInputError> {
    let input = pskt
        .inputs
        .get(index)
        .ok_or(SignInputError::InputOutOfRange(index))?;

    if input.is_signed() {
        return Ok(true);
    }

    let mut sigdata = input.fill_signature_data();

    let txin = &pskt.unsigned_tx.input[index];
    let utxo = input.spent_output(txin)?.clone();
    let require_witness_sig = input.non_witness_utxo.is_none();

    sigdata.witness = false;
    let effective_sighash = input.sighash_type.unwrap_or(sighash_type);
    let complete = match txdata {
        None => produce_signature(
            provider,
            &DummySignatureCreator,
            &utxo.script_pubkey,
            &mut sigdata,
        ),
        Some(txdata) => {
            let creator = TxSignatureCreator::new(
                &pskt.unsigned_tx,
                index,
                utxo.value,
                effective_sighash,
                txdata,
            );
            produce_signature(provider, &creator, &utxo.script_pubkey, &mut sigdata)
        }
    };

    if require_witness_sig && !sigdata.witness {
        return Err(SignInputError::WitnessSignatureRequired);
    }

    if !finalize {
        sigdata.complete = false;
    }

    if let Some(out_sigdata) = out_sigdata {
        out_sigdata.missing_pubkeys = sigdata.missing_pubkeys.clone();
        out_sigdata.missing_sigs = sigdata.missing_sigs.clone();
        out_sigdata.missing_redeem_script = sigdata.missing_redeem_script;
        out_sigdata.missing_witness_script = sigdata.missing_witness_script;
    }

    let witness_produced = sigdata.witness;
    let input = &mut pskt.inputs[index];
    input.from_signature_data(sigdata);
    if witness_produced {
        input.witness_utxo = Some(utxo);
    }

    Ok(complete)
}

/// Fills a PSKT output's metadata from the provider: scripts and key
/// origins are discovered by running the pipeline in metadata-only mode
/// against the output script, so no signature is ever produced.
pub fn update_pskt_output(
    provider: &dyn SigningProvider,
    pskt: &mut Pskt,
    index: usize,
) -> Result<(), SignInputError> {
    let output = pskt
        .outputs
        .get(index)
        .ok_or(SignInputError::OutputOutOfRange(index))?;

    let mut sigdata = output.fill_signature_data();
    let script_pubkey = pskt.unsigned_tx.output[index].script_pubkey.clone();
    produce_signature(provider, &DummySignatureCreator, &script_pubkey, &mut sigdata);
    pskt.outputs[index].from_signature_data(sigdata);
    Ok(())
}

/// Assembles a satisfaction of `script_pubkey` into `sigdata`, using
/// signatures already present there, keys and scripts the provider knows,
/// and fresh signatures from the creator. Returns completeness; partial
/// progress (signatures created, scripts discovered, missing reports) is
/// left in `sigdata` either way.
pub fn produce_signature(
    provider: &dyn SigningProvider,
    creator: &dyn SignatureCreator,
    script_pubkey: &Script,
    sigdata: &mut SignatureData,
) -> bool {
    if sigdata.complete {
        return true;
    }

    let (mut solved, mut result, mut class) =
        sign_step(provider, creator, script_pubkey, SigVersion::Base, sigdata);
    let mut p2sh = false;
    let mut subscript = None;

    if solved && matches!(class, ScriptClass::ScriptHash(_)) {
        let redeem = Script::from(result[0].clone());
        sigdata.redeem_script = Some(redeem.clone());
        let (sub_solved, sub_result, sub_class) =
            sign_step(provider, creator, &redeem, SigVersion::Base, sigdata);
        solved = sub_solved && !matches!(sub_class, ScriptClass::ScriptHash(_));
        result = sub_result;
        class = sub_class;
        subscript = Some(redeem);
        p2sh = true;
    }

    match class {
        ScriptClass::WitnessV0KeyHash(wpkh) if solved => {
            let script_code = script::p2wpkh_script_code(&wpkh);
            let (sub_solved, sub_result, _) = sign_step(
                provider,
                creator,
                &script_code,
                SigVersion::WitnessV0,
                sigdata,
            );
            solved = sub_solved;
            sigdata.script_witness = Witness::from_vec(sub_result);
            sigdata.witness = true;
            result = vec![];
        }
        ScriptClass::WitnessV0ScriptHash(_) if solved => {
            let witness_script = Script::from(result[0].clone());
            sigdata.witness_script = Some(witness_script.clone());
            let (sub_solved, mut stack, sub_class) = sign_step(
                provider,
                creator,
                &witness_script,
                SigVersion::WitnessV0,
                sigdata,
            );
            solved = sub_solved
                && !matches!(
                    sub_class,
                    ScriptClass::ScriptHash(_)
                        | ScriptClass::WitnessV0ScriptHash(_)
                        | ScriptClass::WitnessV0KeyHash(_)
                );
            stack.push(witness_script.to_bytes());
            sigdata.script_witness = Witness::from_vec(stack);
            sigdata.witness = true;
            result = vec![];
        }
        ScriptClass::WitnessV1Taproot(_) if !p2sh => {
            sigdata.witness = true;
            if solved {
                sigdata.script_witness = Witness::from_vec(result);
            }
            result = vec![];
        }
        _ => {}
    }

    if !sigdata.witness {
        sigdata.script_sig = script::push_all(&result);
    }
    if p2sh {
        if let Some(subscript) = subscript {
            result.push(subscript.to_bytes());
            sigdata.script_sig = script::push_all(&result);
        }
    }

    sigdata.complete = solved;
    solved
}

/// One step of template satisfaction: classify the script and collect the
/// stack items solving it. Returns `(solved, items, class)`; for P2SH and
/// P2WSH the items carry the inner script for the caller to recurse into.
fn sign_step(
    provider: &dyn SigningProvider,
    creator: &dyn SignatureCreator,
    script_pubkey: &Script,
    sig_version: SigVersion,
    sigdata: &mut SignatureData,
) -> (bool, Vec<Vec<u8>>, ScriptClass) {
    let class = ScriptClass::from_script(script_pubkey);
    let mut ret = Vec::new();

    let solved = match &class {
        ScriptClass::NonStandard | ScriptClass::NullData | ScriptClass::WitnessUnknown { .. } => {
            false
        }
        ScriptClass::Pubkey(pubkey) => {
            match create_sig(creator, sigdata, provider, *pubkey, script_pubkey, sig_version) {
                Some(sig) => {
                    ret.push(sig);
                    true
                }
                None => false,
            }
        }
        ScriptClass::PubkeyHash(key_id) => match lookup_pubkey(provider, sigdata, key_id) {
            None => {
                sigdata.missing_pubkeys.push(*key_id);
                false
            }
            Some(pubkey) => {
                match create_sig(creator, sigdata, provider, pubkey, script_pubkey, sig_version) {
                    Some(sig) => {
                        ret.push(sig);
                        ret.push(pubkey.to_bytes());
                        true
                    }
                    None => false,
                }
            }
        },
        ScriptClass::ScriptHash(hash) => {
            match sigdata
                .redeem_script
                .clone()
                .or_else(|| provider.redeem_script(hash))
            {
                Some(redeem) => {
                    ret.push(redeem.to_bytes());
                    true
                }
                None => {
                    sigdata.missing_redeem_script = Some(*hash);
                    false
                }
            }
        }
        ScriptClass::Multisig { required, pubkeys } => {
            // workaround for the CHECKMULTISIG consensus bug: an extra
            // null dummy goes first
            ret.push(vec![]);
            for pubkey in pubkeys {
                // every key is tried so sigdata accumulates all
                // signatures and missing reports, not just the first m
                let sig =
                    create_sig(creator, sigdata, provider, *pubkey, script_pubkey, sig_version);
                if let Some(sig) = sig {
                    if ret.len() < required + 1 {
                        ret.push(sig);
                    }
                }
            }
            ret.len() == required + 1
        }
        ScriptClass::WitnessV0KeyHash(wpkh) => {
            ret.push(wpkh.as_hash().into_inner().to_vec());
            true
        }
        ScriptClass::WitnessV0ScriptHash(hash) => {
            match sigdata
                .witness_script
                .clone()
                .or_else(|| provider.witness_script(hash))
            {
                Some(witness_script) => {
                    ret.push(witness_script.to_bytes());
                    true
                }
                None => {
                    sigdata.missing_witness_script = Some(*hash);
                    false
                }
            }
        }
        ScriptClass::WitnessV1Taproot(output_key) => {
            match sign_taproot(provider, creator, *output_key, sigdata) {
                Some(stack) => {
                    ret = stack;
                    true
                }
                None => false,
            }
        }
    };

    (solved, ret, class)
}

/// Satisfies a taproot output: the key path when a signature exists or
/// the provider holds the (tweakable) internal key, otherwise the first
/// solvable single-key leaf with a known control block.
fn sign_taproot(
    provider: &dyn SigningProvider,
    creator: &dyn SignatureCreator,
    output_key: XOnlyPublicKey,
    sigdata: &mut SignatureData,
) -> Option<Vec<Vec<u8>>> {
    if let Some(data) = provider.taproot_spend_data(&output_key) {
        if sigdata.tr_spenddata.internal_key.is_none() {
            sigdata.tr_spenddata.internal_key = data.internal_key;
        }
        if sigdata.tr_spenddata.merkle_root.is_none() {
            sigdata.tr_spenddata.merkle_root = data.merkle_root;
        }
        for (leaf, control_blocks) in data.scripts {
            sigdata
                .tr_spenddata
                .scripts
                .entry(leaf)
                .or_default()
                .extend(control_blocks);
        }
    }

    if let Some(internal_key) = sigdata.tr_spenddata.internal_key {
        if let Some(origin) = provider.taproot_key_origin(&internal_key) {
            sigdata.taproot_misc_pubkeys.insert(internal_key, origin);
        }
    }

    // key path
    let key_path_sig = match &sigdata.taproot_key_path_sig {
        Some(sig) => creator
            .verify_schnorr_sig(sig, &output_key, None)
            .then(|| sig.clone()),
        None => {
            let merkle_root = sigdata.tr_spenddata.merkle_root;
            sigdata
                .tr_spenddata
                .internal_key
                .and_then(|internal_key| {
                    creator.create_schnorr_sig(provider, &internal_key, merkle_root, None)
                })
        }
    };
    if let Some(sig) = key_path_sig {
        sigdata.taproot_key_path_sig = Some(sig.clone());
        return Some(vec![sig]);
    }

    // script path, single-key leaves only
    let leaves = sigdata.tr_spenddata.scripts.clone();
    for ((leaf_script, leaf_ver), control_blocks) in leaves {
        if leaf_ver != LeafVersion::TapScript.to_consensus() {
            continue;
        }
        let leaf_key = match single_key_leaf(&leaf_script) {
            Some(key) => key,
            None => continue,
        };
        let control_block = match control_blocks.iter().next() {
            Some(control_block) => control_block.clone(),
            None => continue,
        };
        if let Some(origin) = provider.taproot_key_origin(&leaf_key) {
            sigdata.taproot_misc_pubkeys.insert(leaf_key, origin);
        }

        let leaf_hash = TapLeafHash::from_script(&leaf_script, LeafVersion::TapScript);
        let sig = match sigdata.taproot_script_sigs.get(&(leaf_key, leaf_hash)) {
            Some(sig) => creator
                .verify_schnorr_sig(sig, &leaf_key, Some(leaf_hash))
                .then(|| sig.clone()),
            None => creator.create_schnorr_sig(provider, &leaf_key, None, Some(leaf_hash)),
        };
        if let Some(sig) = sig {
            sigdata
                .taproot_script_sigs
                .insert((leaf_key, leaf_hash), sig.clone());
            return Some(vec![sig, leaf_script.to_bytes(), control_block]);
        }
    }

    let missing_key = sigdata.tr_spenddata.internal_key.unwrap_or(output_key);
    sigdata.missing_sigs.push(xonly_key_id(&missing_key));
    None
}

/// `<32-byte key> OP_CHECKSIG` leaf scripts are the only tapscript shape
/// the pipeline satisfies itself.
fn single_key_leaf(script: &Script) -> Option<XOnlyPublicKey> {
    let bytes = script.as_bytes();
    if bytes.len() != 34 || bytes[0] != 0x20 || bytes[33] != 0xac {
        return None;
    }
    XOnlyPublicKey::from_slice(&bytes[1..33]).ok()
}

fn xonly_key_id(key: &XOnlyPublicKey) -> PubkeyHash {
    PubkeyHash::from_hash(hash160::Hash::hash(&key.serialize()))
}

fn lookup_pubkey(
    provider: &dyn SigningProvider,
    sigdata: &SignatureData,
    key_id: &PubkeyHash,
) -> Option<PublicKey> {
    if let Some(pubkey) = provider.pubkey(key_id) {
        return Some(pubkey);
    }
    if let Some((pubkey, _)) = sigdata.signatures.get(key_id) {
        return Some(*pubkey);
    }
    if let Some((pubkey, _)) = sigdata.misc_pubkeys.get(key_id) {
        return Some(*pubkey);
    }
    None
}

/// Produces or reuses the ECDSA signature of `pubkey` over `script_code`.
/// Every outcome is recorded in `sigdata`: fresh signatures land in
/// `signatures`, known origins in `misc_pubkeys`, failures in
/// `missing_sigs`. An existing signature the creator cannot verify counts
/// as missing.
fn create_sig(
    creator: &dyn SignatureCreator,
    sigdata: &mut SignatureData,
    provider: &dyn SigningProvider,
    pubkey: PublicKey,
    script_code: &Script,
    sig_version: SigVersion,
) -> Option<Vec<u8>> {
    let key_id = pubkey.pubkey_hash();

    if let Some((_, sig)) = sigdata.signatures.get(&key_id) {
        if creator.verify_ecdsa_sig(sig, &pubkey, script_code, sig_version) {
            return Some(sig.clone());
        }
        sigdata.missing_sigs.push(key_id);
        return None;
    }

    if let Some(origin) = provider.key_origin(&key_id) {
        sigdata.misc_pubkeys.insert(key_id, (pubkey, Some(origin)));
    }

    if let Some(sig) = creator.create_ecdsa_sig(provider, &pubkey, script_code, sig_version) {
        sigdata.signatures.insert(key_id, (pubkey, sig.clone()));
        return Some(sig);
    }

    sigdata.missing_sigs.push(key_id);
    None
}
