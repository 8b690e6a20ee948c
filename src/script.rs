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

//! Standard output-script templates and the script-level arithmetic the
//! signing pipeline and the analyzer rely on.

use bitcoin::blockdata::opcodes::all as opcodes;
use bitcoin::blockdata::script::{Builder, Instruction};
use bitcoin::hashes::Hash;
use bitcoin::{PubkeyHash, PublicKey, Script, WPubkeyHash, WScriptHash, XOnlyPublicKey};

/// Classification of an output script into the standard templates the
/// signing pipeline knows how to satisfy.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ScriptClass {
    /// No standard template matched.
    NonStandard,
    /// `<pubkey> OP_CHECKSIG`
    Pubkey(PublicKey),
    /// `OP_DUP OP_HASH160 <hash160> OP_EQUALVERIFY OP_CHECKSIG`
    PubkeyHash(PubkeyHash),
    /// `OP_HASH160 <hash160> OP_EQUAL`
    ScriptHash(bitcoin::ScriptHash),
    /// `m <pubkeys...> n OP_CHECKMULTISIG`
    Multisig {
        /// Number of signatures required.
        required: usize,
        /// Candidate public keys in script order.
        pubkeys: Vec<PublicKey>,
    },
    /// `OP_RETURN`-prefixed data carrier.
    NullData,
    /// Witness v0 keyhash program.
    WitnessV0KeyHash(WPubkeyHash),
    /// Witness v0 scripthash program.
    WitnessV0ScriptHash(WScriptHash),
    /// Witness v1 taproot program.
    WitnessV1Taproot(XOnlyPublicKey),
    /// A witness program of a version this library does not know.
    WitnessUnknown {
        /// Witness version (2..=16).
        version: u8,
        /// Program payload.
        program: Vec<u8>,
    },
}

impl ScriptClass {
    /// Classifies an output script, the solver counterpart of the
    /// standard-script templates.
    pub fn from_script(script: &Script) -> ScriptClass {
        let bytes = script.as_bytes();

        if script.is_op_return() {
            return ScriptClass::NullData;
        }
        if script.is_p2sh() {
            return bitcoin::ScriptHash::from_slice(&bytes[2..22])
                .map(ScriptClass::ScriptHash)
                .unwrap_or(ScriptClass::NonStandard);
        }
        if let Some((version, program)) = witness_program(script) {
            return match (version, program.len()) {
                (0, 20) => WPubkeyHash::from_slice(&program)
                    .map(ScriptClass::WitnessV0KeyHash)
                    .unwrap_or(ScriptClass::NonStandard),
                (0, 32) => WScriptHash::from_slice(&program)
                    .map(ScriptClass::WitnessV0ScriptHash)
                    .unwrap_or(ScriptClass::NonStandard),
                (0, _) => ScriptClass::NonStandard,
                (1, 32) => XOnlyPublicKey::from_slice(&program)
                    .map(ScriptClass::WitnessV1Taproot)
                    .unwrap_or(ScriptClass::NonStandard),
                (version, _) => ScriptClass::WitnessUnknown { version, program },
            };
        }
        if script.is_p2pk() {
            return match script.instructions().next() {
                Some(Ok(Instruction::PushBytes(data))) => PublicKey::from_slice(data)
                    .map(ScriptClass::Pubkey)
                    .unwrap_or(ScriptClass::NonStandard),
                _ => ScriptClass::NonStandard,
            };
        }
        if script.is_p2pkh() {
            return PubkeyHash::from_slice(&bytes[3..23])
                .map(ScriptClass::PubkeyHash)
                .unwrap_or(ScriptClass::NonStandard);
        }
        if let Some((required, pubkeys)) = parse_multisig(script) {
            return ScriptClass::Multisig { required, pubkeys };
        }

        ScriptClass::NonStandard
    }
}

/// Splits a witness program into its version and payload, or `None` when
/// the script is not a witness program.
pub fn witness_program(script: &Script) -> Option<(u8, Vec<u8>)> {
    if !script.is_witness_program() {
        return None;
    }
    let bytes = script.as_bytes();
    let version = match bytes[0] {
        0x00 => 0,
        op @ 0x51..=0x60 => op - 0x50,
        _ => return None,
    };
    Some((version, bytes[2..].to_vec()))
}

/// Parses a bare `m-of-n` CHECKMULTISIG script.
fn parse_multisig(script: &Script) -> Option<(usize, Vec<PublicKey>)> {
    let mut instructions = script.instructions();

    let required = small_int(instructions.next()?.ok()?)?;
    let mut pubkeys = Vec::new();
    let total = loop {
        match instructions.next()?.ok()? {
            Instruction::PushBytes(data) => pubkeys.push(PublicKey::from_slice(data).ok()?),
            Instruction::Op(op) => break small_int(Instruction::Op(op))?,
        }
    };
    match instructions.next()?.ok()? {
        Instruction::Op(op) if op == opcodes::OP_CHECKMULTISIG => {}
        _ => return None,
    }
    if instructions.next().is_some() {
        return None;
    }

    if total != pubkeys.len() || required > total || required == 0 {
        return None;
    }
    Some((required, pubkeys))
}

fn small_int(instruction: Instruction) -> Option<usize> {
    match instruction {
        Instruction::Op(op)
            if op.to_u8() >= opcodes::OP_PUSHNUM_1.to_u8()
                && op.to_u8() <= opcodes::OP_PUSHNUM_16.to_u8() =>
        {
            Some((op.to_u8() - opcodes::OP_PUSHNUM_1.to_u8() + 1) as usize)
        }
        _ => None,
    }
}

/// Number of signature operations in a script. With `accurate` the
/// CHECKMULTISIG argument count is taken from the preceding small integer
/// when present, otherwise the historical worst case of 20 is charged.
pub fn sig_op_count(script: &Script, accurate: bool) -> usize {
    let mut count = 0;
    let mut last_opcode = None;
    for instruction in script.instructions() {
        let instruction = match instruction {
            Ok(instruction) => instruction,
            Err(_) => break,
        };
        match instruction {
            Instruction::Op(op) => {
                if op == opcodes::OP_CHECKSIG || op == opcodes::OP_CHECKSIGVERIFY {
                    count += 1;
                } else if op == opcodes::OP_CHECKMULTISIG
                    || op == opcodes::OP_CHECKMULTISIGVERIFY
                {
                    count += match last_opcode.and_then(|prev| small_int(Instruction::Op(prev))) {
                        Some(n) if accurate => n,
                        _ => 20,
                    };
                }
                last_opcode = Some(op);
            }
            Instruction::PushBytes(_) => last_opcode = None,
        }
    }
    count
}

/// The last data push of a scriptSig, i.e. the redeem script of a P2SH
/// spend. `None` when the script ends with anything else.
pub fn last_push(script_sig: &Script) -> Option<Vec<u8>> {
    let mut last = None;
    for instruction in script_sig.instructions() {
        match instruction.ok()? {
            Instruction::PushBytes(data) => last = Some(data.to_vec()),
            Instruction::Op(op) if op.to_u8() <= opcodes::OP_PUSHNUM_16.to_u8() => {}
            Instruction::Op(_) => return None,
        }
    }
    last
}

/// Assembles stack pushes into a scriptSig, small integers as their
/// dedicated opcodes.
pub fn push_all(values: &[Vec<u8>]) -> Script {
    let mut builder = Builder::new();
    for value in values {
        builder = if value.is_empty() {
            builder.push_int(0)
        } else if value.len() == 1 && value[0] >= 1 && value[0] <= 16 {
            builder.push_int(value[0] as i64)
        } else if value.len() == 1 && value[0] == 0x81 {
            builder.push_int(-1)
        } else {
            builder.push_slice(value)
        };
    }
    builder.into_script()
}

/// Script code signed by a P2WPKH input: the corresponding legacy
/// pay-to-pubkey-hash script.
pub fn p2wpkh_script_code(wpkh: &WPubkeyHash) -> Script {
    Script::new_p2pkh(&PubkeyHash::from_hash(wpkh.as_hash()))
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn test_pubkeys(n: usize) -> Vec<PublicKey> {
        let secp = Secp256k1::new();
        (1..=n as u8)
            .map(|i| {
                let sk = SecretKey::from_slice(&[i; 32]).unwrap();
                PublicKey::new(secp256k1::PublicKey::from_secret_key(&secp, &sk))
            })
            .collect()
    }

    fn multisig_script(required: i64, pubkeys: &[PublicKey]) -> Script {
        let mut builder = Builder::new().push_int(required);
        for pk in pubkeys {
            builder = builder.push_key(pk);
        }
        builder
            .push_int(pubkeys.len() as i64)
            .push_opcode(opcodes::OP_CHECKMULTISIG)
            .into_script()
    }

    #[test]
    fn classify_standard_templates() {
        let pubkeys = test_pubkeys(3);

        let p2pkh = Script::new_p2pkh(&pubkeys[0].pubkey_hash());
        assert_eq!(
            ScriptClass::from_script(&p2pkh),
            ScriptClass::PubkeyHash(pubkeys[0].pubkey_hash())
        );

        let multisig = multisig_script(2, &pubkeys);
        assert_eq!(
            ScriptClass::from_script(&multisig),
            ScriptClass::Multisig {
                required: 2,
                pubkeys: pubkeys.clone()
            }
        );

        let p2wsh = multisig.to_v0_p2wsh();
        assert_eq!(
            ScriptClass::from_script(&p2wsh),
            ScriptClass::WitnessV0ScriptHash(multisig.wscript_hash())
        );

        let p2sh = multisig.to_p2sh();
        assert_eq!(
            ScriptClass::from_script(&p2sh),
            ScriptClass::ScriptHash(multisig.script_hash())
        );

        let wpkh = pubkeys[0].wpubkey_hash().unwrap();
        assert_eq!(
            ScriptClass::from_script(&Script::new_v0_p2wpkh(&wpkh)),
            ScriptClass::WitnessV0KeyHash(wpkh)
        );

        assert_eq!(
            ScriptClass::from_script(&Script::new_op_return(b"hello")),
            ScriptClass::NullData
        );
    }

    #[test]
    fn multisig_rejects_malformed() {
        let pubkeys = test_pubkeys(2);
        // 3-of-2 is not satisfiable
        let script = multisig_script(3, &pubkeys);
        assert_eq!(ScriptClass::from_script(&script), ScriptClass::NonStandard);
    }

    #[test]
    fn sigop_counting() {
        let pubkeys = test_pubkeys(3);
        let multisig = multisig_script(2, &pubkeys);
        assert_eq!(sig_op_count(&multisig, true), 3);
        assert_eq!(sig_op_count(&multisig, false), 20);

        let p2pkh = Script::new_p2pkh(&pubkeys[0].pubkey_hash());
        assert_eq!(sig_op_count(&p2pkh, false), 1);
    }

    #[test]
    fn last_push_extracts_redeem_script() {
        let pubkeys = test_pubkeys(2);
        let redeem = multisig_script(2, &pubkeys);
        let script_sig = push_all(&[vec![], vec![0xAA; 71], redeem.to_bytes()]);
        assert_eq!(last_push(&script_sig), Some(redeem.to_bytes()));
    }

    #[test]
    fn push_all_null_dummy() {
        let script = push_all(&[vec![], vec![0xAA; 2]]);
        let mut instructions = script.instructions();
        assert!(matches!(
            instructions.next(),
            Some(Ok(Instruction::PushBytes(&[])))
        ));
    }
}
