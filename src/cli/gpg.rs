// src/cli/gpg.rs
//! Keyring commands

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum GpgCommands {
    /// Trust the public key in a file
    Trust {
        /// Armored OpenPGP key
        keyfile: PathBuf,
    },

    /// List trusted keys
    List,

    /// Create a signing key
    Create {
        /// Name on the user id
        name: String,

        /// Email on the user id
        email: String,
    },

    /// Export a public key
    Export {
        /// Key fingerprint
        fingerprint: String,

        /// Output file
        file: PathBuf,
    },
}
