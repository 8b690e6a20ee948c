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

//! Cooperative workflow roles.

/// Stages of the cooperative signing workflow, in the order the PSKT
/// travels through them.
///
/// The ordering is total and meaningful: the analyzer computes the role
/// that must act next on each input, and the PSKT-wide next role is the
/// minimum across inputs.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
pub enum PsktRole {
    /// Emits the PSKT over an unsigned transaction template.
    #[display("creator")]
    Creator,

    /// Attaches UTXO, script and key-derivation metadata.
    #[display("updater")]
    Updater,

    /// Produces partial signatures for inputs it holds keys for.
    #[display("signer")]
    Signer,

    /// Promotes complete partial signatures to final script forms.
    #[display("finalizer")]
    Finalizer,

    /// Assembles the broadcast-ready network transaction.
    #[display("extractor")]
    Extractor,
}
