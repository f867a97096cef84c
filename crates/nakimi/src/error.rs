//! Vault error taxonomy
//!
//! Every failure is either fatal (retrying the same operation cannot help)
//! or retryable (a user action such as inserting a token may fix it).

use std::path::PathBuf;
use thiserror::Error;

use crate::plugin::DispatchError;

pub type Result<T, E = VaultError> = std::result::Result<T, E>;

/// Vault errors
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("No key pair found at {0} - run 'nakimi init' first")]
    KeyNotFound(PathBuf),

    #[error("Key file {path} is unreadable: {reason}")]
    KeyUnreadable { path: PathBuf, reason: String },

    #[error("Key pair already exists at {0} - use --force to discard it and generate a new one")]
    AlreadyInitialized(PathBuf),

    #[error("Encryption tool unavailable: {0}")]
    ToolUnavailable(String),

    /// Wrong key, corrupted blob and tampered ciphertext all map here.
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("No encrypted store found at {0}")]
    CiphertextNotFound(PathBuf),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cannot write secure storage: {0}")]
    StorageUnwritable(String),

    #[error("A session is already active ({0})")]
    AlreadyActive(String),

    #[error("No active session")]
    NotActive,

    #[error("Hardware token not present: {0}")]
    DeviceNotPresent(String),

    #[error("Hardware token authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Hardware token incompatible: {0}")]
    DeviceIncompatible(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Config(#[from] nakimi_core::ConfigError),
}

impl VaultError {
    /// Conditions that a plain retry of the same operation can never fix
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    /// Conditions that may clear up after user action (token inserted,
    /// PIN re-entered, other session finished)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DeviceNotPresent(_) | Self::AuthenticationFailed(_) | Self::AlreadyActive(_) => {
                true
            }
            Self::Dispatch(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn key_unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::KeyUnreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::StorageUnwritable(format!("{}: {}", context, err))
    }
}
