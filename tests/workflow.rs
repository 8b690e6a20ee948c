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

//! Laws of the merge algebra and transport-level round-trips, over PSKTs
//! augmented the way independent updaters and signers would.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{OutPoint, PublicKey, Script, Txid, TxOut};

use pskt::construct::{create_pskt, InputRequest};
use pskt::raw;
use pskt::{combine, Deserialize, Pskt, Serialize};

fn base_pskt() -> Pskt {
    create_pskt(
        &[
            InputRequest::from(OutPoint::new(Txid::hash(b"alpha"), 0)),
            InputRequest::from(OutPoint::new(Txid::hash(b"beta"), 1)),
        ],
        vec![TxOut {
            value: 30_000,
            script_pubkey: Script::new(),
        }],
        0,
        false,
    )
    .unwrap()
}

fn test_pubkey(byte: u8) -> PublicKey {
    let secp = Secp256k1::new();
    let secret = bitcoin::secp256k1::SecretKey::from_slice(&[byte; 32]).unwrap();
    PublicKey::new(bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &secret))
}

/// An updater/signer view: UTXO data on input 0, one partial signature,
/// one namespaced proprietary record.
fn augmented(byte: u8) -> Pskt {
    let mut pskt = base_pskt();
    pskt.inputs[0].witness_utxo = Some(TxOut {
        value: 40_000,
        script_pubkey: Script::new(),
    });
    pskt.inputs[0]
        .partial_sigs
        .insert(test_pubkey(byte), vec![byte; 71]);
    pskt.inputs[1].unknown.insert(
        raw::Key {
            type_value: 0xe0 + byte,
            key: vec![byte],
        },
        vec![byte; 3],
    );
    pskt.proprietary.insert(
        raw::ProprietaryKey {
            prefix: b"kyc".to_vec(),
            subtype: byte,
            key: vec![],
        },
        vec![byte],
    );
    pskt
}

#[test]
fn merge_is_commutative() {
    let a = augmented(1);
    let b = augmented(2);

    let mut ab = a.clone();
    ab.merge(b.clone()).unwrap();
    let mut ba = b;
    ba.merge(a).unwrap();

    assert_eq!(ab, ba);
    assert_eq!(ab.inputs[0].partial_sigs.len(), 2);
    assert_eq!(ab.inputs[1].unknown.len(), 2);
    assert_eq!(ab.proprietary.len(), 2);
}

#[test]
fn merge_is_idempotent() {
    let a = augmented(1);
    let mut aa = a.clone();
    aa.merge(a.clone()).unwrap();
    assert_eq!(aa, a);
}

#[test]
fn combine_is_associative() {
    let (a, b, c) = (augmented(1), augmented(2), augmented(3));

    let left = combine(vec![
        combine(vec![a.clone(), b.clone()]).unwrap(),
        c.clone(),
    ])
    .unwrap();
    let flat = combine(vec![a, b, c]).unwrap();

    assert_eq!(left, flat);
}

#[test]
fn first_writer_wins_on_conflicting_scalars() {
    let mut a = augmented(1);
    let mut b = augmented(2);
    a.inputs[0].redeem_script = Some(Script::from(vec![0x51]));
    b.inputs[0].redeem_script = Some(Script::from(vec![0x52]));

    let mut merged = a.clone();
    merged.merge(b).unwrap();
    assert_eq!(merged.inputs[0].redeem_script, a.inputs[0].redeem_script);
}

#[test]
fn merged_pskt_survives_transport() {
    let mut merged = augmented(1);
    merged.merge(augmented(2)).unwrap();

    // raw-byte framing
    let raw_bytes = merged.serialize();
    assert_eq!(Pskt::deserialize(&raw_bytes).unwrap(), merged);

    // base64 framing
    let text = merged.to_string();
    assert_eq!(text.parse::<Pskt>().unwrap(), merged);
}

#[test]
fn global_section_unions_under_merge() {
    use bitcoin::util::bip32::{ChildNumber, DerivationPath, ExtendedPubKey, Fingerprint};
    use std::str::FromStr;

    let xpub_a = ExtendedPubKey::from_str(
        "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8",
    )
    .unwrap();
    let xpub_b = xpub_a
        .ckd_pub(&Secp256k1::new(), ChildNumber::from(0))
        .unwrap();
    let origin = (
        Fingerprint::default(),
        "m".parse::<DerivationPath>().unwrap(),
    );

    let mut a = base_pskt();
    let mut b = base_pskt();
    a.xpubs.entry(origin.clone()).or_default().insert(xpub_a);
    b.xpubs.entry(origin.clone()).or_default().insert(xpub_b);
    a.unknown.insert(raw::Key::from_type(0xe1), vec![1]);
    b.unknown.insert(raw::Key::from_type(0xe2), vec![2]);
    b.version = Some(0);

    let mut merged = a.clone();
    merged.merge(b).unwrap();
    assert_eq!(merged.xpubs[&origin].len(), 2);
    assert_eq!(merged.unknown.len(), 2);
    assert_eq!(merged.version, Some(0));

    // and the enriched global section round-trips on the wire
    let decoded = Pskt::deserialize(&merged.serialize()).unwrap();
    assert_eq!(decoded, merged);
}
