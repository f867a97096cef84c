//! nakimi - Credential vault with session-scoped plaintext
//!
//! Credentials live in a single age-encrypted store. A session decrypts it
//! once into an owner-only file on RAM-backed storage, hands it to plugins
//! and destroys it when the session ends or the process is signalled.
//!
//! The identity key can optionally be wrapped by a PIV hardware token.

pub mod cleanup;
pub mod crypto;
pub mod error;
pub mod exec;
pub mod keystore;
pub mod keywrap;
pub mod mcp;
pub mod plugin;
pub mod session;
pub mod storage;
pub mod vault;

pub use cleanup::{install_signal_handlers, CleanupRegistry};
pub use crypto::{AgeCli, CiphertextBlob, CryptoBackend, CryptoEngine, NativeAge};
pub use error::{Result, VaultError};
pub use keystore::{KeyMaterialHandle, KeyPair, KeyStore, PrivateMaterial, PublicMaterial};
pub use keywrap::{DeviceStatus, KeyWrapper, SimulatedToken, TokenDevice, YubikeyPiv};
pub use plugin::{CredentialMap, DispatchError, Plugin, PluginRegistry};
pub use session::{Session, SessionManager, SessionState};
pub use storage::{ArtifactKind, Medium, SecureArtifact, SecureStorage};
pub use vault::Vault;
