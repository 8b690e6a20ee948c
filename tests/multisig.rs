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

//! End-to-end cooperative workflow over a 2-of-3 multisig held in a
//! witness script: create, update, sign in parallel, combine, finalize,
//! extract, with the analyzer checked at every stage.

use bitcoin::blockdata::opcodes::all as opcodes;
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::util::bip32::{DerivationPath, Fingerprint};
use bitcoin::{EcdsaSighashType, OutPoint, PublicKey, Script, Txid, TxOut};

use pskt::analyze::{analyze_pskt, AnalyzerOptions};
use pskt::construct::{create_pskt, InputRequest};
use pskt::finalize::{finalize_and_extract, finalize_pskt};
use pskt::rpc;
use pskt::sign::{precompute_pskt_data, sign_pskt_input, MemorySigningProvider};
use pskt::{combine, CombineError, Pskt, PsktRole};

struct Cosigners {
    secrets: Vec<SecretKey>,
    pubkeys: Vec<PublicKey>,
    witness_script: Script,
}

fn cosigners() -> Cosigners {
    let secp = Secp256k1::new();
    let secrets: Vec<SecretKey> = (1u8..=3)
        .map(|byte| SecretKey::from_slice(&[byte; 32]).unwrap())
        .collect();
    let pubkeys: Vec<PublicKey> = secrets
        .iter()
        .map(|secret| PublicKey::new(bitcoin::secp256k1::PublicKey::from_secret_key(&secp, secret)))
        .collect();

    let mut builder = Builder::new().push_int(2);
    for pubkey in &pubkeys {
        builder = builder.push_key(pubkey);
    }
    let witness_script = builder
        .push_int(3)
        .push_opcode(opcodes::OP_CHECKMULTISIG)
        .into_script();

    Cosigners {
        secrets,
        pubkeys,
        witness_script,
    }
}

fn funding_outpoint() -> OutPoint {
    OutPoint::new(Txid::hash(b"funding"), 0)
}

fn created_pskt(cosigners: &Cosigners) -> Pskt {
    create_pskt(
        &[InputRequest::from(funding_outpoint())],
        vec![TxOut {
            value: 49_000,
            script_pubkey: Script::new_v0_p2wpkh(&cosigners.pubkeys[0].wpubkey_hash().unwrap()),
        }],
        0,
        false,
    )
    .unwrap()
}

fn updated_pskt(cosigners: &Cosigners) -> Pskt {
    let mut pskt = created_pskt(cosigners);
    pskt.inputs[0].witness_utxo = Some(TxOut {
        value: 50_000,
        script_pubkey: cosigners.witness_script.to_v0_p2wsh(),
    });
    pskt.inputs[0].witness_script = Some(cosigners.witness_script.clone());
    for pubkey in &cosigners.pubkeys {
        pskt.inputs[0].bip32_derivation.insert(
            pubkey.inner,
            (Fingerprint::default(), "m".parse::<DerivationPath>().unwrap()),
        );
    }
    pskt
}

fn signer_provider(cosigners: &Cosigners, index: usize) -> MemorySigningProvider {
    let mut provider = MemorySigningProvider::default();
    provider.add_script(cosigners.witness_script.clone());
    provider.add_key(cosigners.pubkeys[index], Some(cosigners.secrets[index]));
    provider
}

fn signed_clone(pskt: &Pskt, cosigners: &Cosigners, index: usize) -> Pskt {
    let mut clone = pskt.clone();
    let txdata = precompute_pskt_data(&clone);
    let complete = sign_pskt_input(
        &signer_provider(cosigners, index),
        &mut clone,
        0,
        Some(&txdata),
        EcdsaSighashType::All.into(),
        None,
        false,
    )
    .unwrap();
    assert!(!complete, "a single signature cannot complete 2-of-3");
    clone
}

#[test]
fn fresh_pskt_waits_for_the_updater() {
    let cosigners = cosigners();
    let pskt = created_pskt(&cosigners);

    let analysis = analyze_pskt(&pskt, &AnalyzerOptions::default());
    assert_eq!(analysis.next, PsktRole::Updater);
    assert!(!analysis.inputs[0].has_utxo);
    assert_eq!(analysis.fee, None);
}

#[test]
fn updated_pskt_names_the_missing_cosigners() {
    let cosigners = cosigners();
    let pskt = updated_pskt(&cosigners);

    let analysis = analyze_pskt(&pskt, &AnalyzerOptions::default());
    assert_eq!(analysis.next, PsktRole::Signer);
    assert!(analysis.inputs[0].has_utxo);
    assert_eq!(analysis.fee, Some(1_000));

    let missing = &analysis.inputs[0].missing_sigs;
    assert_eq!(missing.len(), 3);
    for pubkey in &cosigners.pubkeys {
        assert!(missing.contains(&pubkey.pubkey_hash()));
    }
    assert!(analysis.inputs[0].missing_pubkeys.is_empty());
    assert!(analysis.inputs[0].missing_witness_script.is_none());
}

#[test]
fn parallel_signing_combines_finalizes_and_extracts() {
    let cosigners = cosigners();
    let pskt = updated_pskt(&cosigners);

    // two cosigners work on their own clones, exchanged as base64
    let p1: Pskt = signed_clone(&pskt, &cosigners, 0).to_string().parse().unwrap();
    let p2: Pskt = signed_clone(&pskt, &cosigners, 1).to_string().parse().unwrap();
    assert_eq!(p1.inputs[0].partial_sigs.len(), 1);

    let mut combined = combine(vec![p1, p2]).unwrap();
    assert_eq!(combined.inputs[0].partial_sigs.len(), 2);

    // two signatures satisfy the quorum
    let analysis = analyze_pskt(&combined, &AnalyzerOptions::default());
    assert_eq!(analysis.next, PsktRole::Finalizer);
    assert!(analysis.estimated_vsize.is_some());
    assert_eq!(analysis.fee, Some(1_000));
    let vsize = analysis.estimated_vsize.unwrap();
    assert_eq!(analysis.estimated_feerate, Some(1_000 * 1_000 / vsize as u64));

    assert!(finalize_pskt(&mut combined));
    let after_first = combined.clone();
    assert!(finalize_pskt(&mut combined));
    assert_eq!(combined, after_first, "finalization is idempotent");

    // the promoted witness stack carries the BIP-147 null dummy first and
    // the signatures in witness-script key order
    let witness = after_first.inputs[0].final_script_witness.clone().unwrap();
    let stack = witness.to_vec();
    assert_eq!(stack.len(), 4);
    assert!(stack[0].is_empty());
    assert_eq!(stack[3], cosigners.witness_script.to_bytes());
    assert_eq!(stack[1].last(), Some(&(EcdsaSighashType::All as u8)));
    assert_eq!(stack[2].last(), Some(&(EcdsaSighashType::All as u8)));

    let analysis = analyze_pskt(&combined, &AnalyzerOptions::default());
    assert_eq!(analysis.next, PsktRole::Extractor);
    assert!(analysis.inputs[0].is_final);

    let tx = finalize_and_extract(&mut combined).unwrap();
    assert_eq!(
        Some(&tx.input[0].witness),
        combined.inputs[0].final_script_witness.as_ref()
    );
    assert_eq!(tx.output, combined.unsigned_tx.output);
}

#[test]
fn analyzer_next_role_is_monotone_under_signing() {
    let cosigners = cosigners();
    let options = AnalyzerOptions::default();

    let created = analyze_pskt(&created_pskt(&cosigners), &options).next;
    let updated_pskt_value = updated_pskt(&cosigners);
    let updated = analyze_pskt(&updated_pskt_value, &options).next;
    let one_sig = analyze_pskt(&signed_clone(&updated_pskt_value, &cosigners, 0), &options).next;
    let combined = combine(vec![
        signed_clone(&updated_pskt_value, &cosigners, 0),
        signed_clone(&updated_pskt_value, &cosigners, 1),
    ])
    .unwrap();
    let quorum = analyze_pskt(&combined, &options).next;

    assert!(created <= updated);
    assert!(updated <= one_sig);
    assert!(one_sig <= quorum);
    assert_eq!(quorum, PsktRole::Finalizer);
}

#[test]
fn combining_foreign_pskts_is_a_mismatch() {
    let cosigners = cosigners();
    let mut a = updated_pskt(&cosigners);
    let mut b = updated_pskt(&cosigners);
    b.unsigned_tx.output[0].value = 48_000;

    assert!(matches!(
        a.merge(b),
        Err(CombineError::TxidMismatch { .. })
    ));

    // the same failure surfaces over RPC with its stable code
    let one = updated_pskt(&cosigners).to_string();
    let mut other = updated_pskt(&cosigners);
    other.unsigned_tx.output[0].value = 48_000;
    let err = rpc::combine_pskts(&[one, other.to_string()]).unwrap_err();
    assert!(matches!(err, rpc::RpcError::PsktMismatch(_)));
}

#[test]
fn joining_pskts_sharing_an_outpoint_is_rejected() {
    let cosigners = cosigners();
    let p = created_pskt(&cosigners).to_string();
    let err = rpc::join_pskts(&[p.clone(), p]).unwrap_err();
    assert_eq!(err, rpc::RpcError::InputDuplicated(funding_outpoint()));
    assert_eq!(err.code(), rpc::RPC_INVALID_PARAMETER);
}

#[test]
fn rpc_analysis_renders_the_workflow() {
    let cosigners = cosigners();
    let encoded = updated_pskt(&cosigners).to_string();

    let analysis = rpc::analyze_pskt(&encoded, &AnalyzerOptions::default()).unwrap();
    assert_eq!(analysis.next, "signer");
    let missing = analysis.inputs[0].missing.as_ref().unwrap();
    assert_eq!(missing.signatures.as_ref().unwrap().len(), 3);
    assert!(missing.redeem_script.is_none());

    let finalized = rpc::finalize_pskt(&encoded, true).unwrap();
    assert!(!finalized.complete);
    assert!(finalized.hex.is_none());
    assert!(finalized.pskt.is_some());
}
