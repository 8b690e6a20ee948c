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

// Coding conventions
#![recursion_limit = "256"]

//! Partially signed koyotecoin transaction (PSKT) library.
//!
//! A PSKT is a key/value container for a transaction-in-progress, passed
//! between cooperating roles (creator, updater, signer, finalizer,
//! extractor) as raw bytes or base64 text. This crate provides the wire
//! codec, the data model, the merge algebra fusing independently-augmented
//! PSKTs, the signing pipeline driven by a [`sign::SigningProvider`], the
//! finalizer/extractor producing a broadcast-ready transaction, and the
//! analyzer reporting which role must act next.

#[macro_use]
extern crate amplify;

pub mod analyze;
pub mod construct;
pub mod finalize;
mod global;
mod input;
mod output;
pub mod policy;
pub mod raw;
pub mod roles;
pub mod rpc;
pub mod script;
mod serialize;
pub mod sign;

pub use global::{combine, CombineError, FeeError, Pskt, TxError};
pub use input::{Input, PsktSighashType, UtxoError};
pub use output::Output;
pub use roles::PsktRole;
pub use serialize::{DecodeError, Deserialize, PsktParseError, Serialize};
