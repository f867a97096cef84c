//! Vault facade
//!
//! Ties the key store, crypto engine and secure storage of one configured
//! vault together for the operations that do not need a session.

use age::secrecy::SecretString;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

use nakimi_core::Config;

use crate::cleanup::CleanupRegistry;
use crate::crypto::{CiphertextBlob, CryptoEngine};
use crate::error::Result;
use crate::keystore::{KeyPair, KeyStore, PublicMaterial};
use crate::keywrap::KeyWrapper;
use crate::plugin::CredentialMap;
use crate::session::{decrypt_with_stored_identity, SessionManager};
use crate::storage::SecureStorage;

/// One configured vault
pub struct Vault {
    config: Config,
    registry: Arc<CleanupRegistry>,
    keystore: KeyStore,
    crypto: CryptoEngine,
    storage: SecureStorage,
    wrapper: Option<KeyWrapper>,
}

impl Vault {
    pub fn new(config: Config, registry: Arc<CleanupRegistry>) -> Self {
        let wrapper = config
            .hardware
            .enabled
            .then(|| KeyWrapper::from_config(&config, registry.clone()));

        Self {
            keystore: KeyStore::new(&config),
            crypto: CryptoEngine::from_config(&config, registry.clone()),
            storage: SecureStorage::new(&config, registry.clone()),
            wrapper,
            config,
            registry,
        }
    }

    /// Replace the token used for wrapped keys
    pub fn with_key_wrapper(mut self, wrapper: KeyWrapper) -> Self {
        self.wrapper = Some(wrapper);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    pub fn storage(&self) -> &SecureStorage {
        &self.storage
    }

    pub fn crypto(&self) -> &CryptoEngine {
        &self.crypto
    }

    pub fn init(&self, force: bool) -> Result<KeyPair> {
        self.keystore.initialize(force)
    }

    pub fn public_key(&self) -> Result<PublicMaterial> {
        self.keystore.public_material()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<CiphertextBlob> {
        let recipient = self.keystore.public_material()?;
        self.crypto.encrypt(plaintext, &recipient)
    }

    /// Decrypt into memory only; no artifact outlives the call
    pub fn decrypt(&self, blob: &CiphertextBlob, pin: Option<&SecretString>) -> Result<Zeroizing<Vec<u8>>> {
        let id = uuid::Uuid::new_v4().to_string();
        decrypt_with_stored_identity(
            &self.keystore,
            &self.crypto,
            &self.storage,
            self.wrapper.as_ref(),
            blob,
            &id,
            pin,
        )
    }

    pub fn decrypt_file(&self, path: &Path, pin: Option<&SecretString>) -> Result<Zeroizing<Vec<u8>>> {
        let blob = CiphertextBlob::read(path)?;
        self.decrypt(&blob, pin)
    }

    /// Encrypt and atomically replace the credential store
    pub fn store_credentials(&self, credentials: &CredentialMap) -> Result<()> {
        let plaintext = credentials.to_json()?;
        self.encrypt(&plaintext)?.write(&self.config.secrets_file)?;
        info!("Credential store written to {}", self.config.secrets_file.display());
        Ok(())
    }

    /// The current credential map; empty when no store exists yet
    pub fn load_credentials(&self, pin: Option<&SecretString>) -> Result<CredentialMap> {
        if !self.config.secrets_file.exists() {
            return Ok(CredentialMap::new());
        }
        let plaintext = self.decrypt_file(&self.config.secrets_file, pin)?;
        CredentialMap::from_json(&plaintext)
    }

    /// Set one credential field and re-encrypt the store
    pub fn set_field(
        &self,
        namespace: &str,
        field: &str,
        value: Value,
        pin: Option<&SecretString>,
    ) -> Result<()> {
        let mut credentials = self.load_credentials(pin)?;
        credentials.set_field(namespace, field, value);
        self.store_credentials(&credentials)
    }

    /// A session manager over the same components
    pub fn session_manager(&self) -> SessionManager {
        SessionManager::from_config(&self.config, self.registry.clone())
    }

    /// Token wrapper for hardware commands, regardless of the enabled flag
    pub fn key_wrapper(&self) -> KeyWrapper {
        KeyWrapper::from_config(&self.config, self.registry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use crate::keywrap::SimulatedToken;
    use nakimi_core::Backend;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn vault(tmp: &TempDir) -> Vault {
        let ram = tmp.path().join("ram");
        fs::create_dir_all(&ram).unwrap();
        let mut config = Config::for_vault_dir(&tmp.path().join("vault"), Some(&ram));
        config.backend = Backend::Native;
        Vault::new(config, Arc::new(CleanupRegistry::new()))
    }

    #[test]
    fn test_store_and_load_credentials() {
        let tmp = TempDir::new().unwrap();
        let vault = vault(&tmp);
        vault.init(false).unwrap();

        assert!(vault.load_credentials(None).unwrap().is_empty());

        vault
            .set_field("env", "API_KEY", json!("abc123"), None)
            .unwrap();
        vault
            .set_field("gmail", "client_id", json!("id"), None)
            .unwrap();

        let loaded = vault.load_credentials(None).unwrap();
        assert_eq!(loaded.get("env").unwrap()["API_KEY"], json!("abc123"));
        assert_eq!(loaded.get("gmail").unwrap()["client_id"], json!("id"));

        let raw = fs::read(&vault.config().secrets_file).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("abc123"));
        assert_eq!(fs::read_dir(tmp.path().join("ram")).unwrap().count(), 0);
    }

    #[test]
    fn test_decrypt_arbitrary_file() {
        let tmp = TempDir::new().unwrap();
        let vault = vault(&tmp);
        vault.init(false).unwrap();

        let path = tmp.path().join("notes.age");
        vault.encrypt(b"plain notes").unwrap().write(&path).unwrap();
        assert_eq!(
            vault.decrypt_file(&path, None).unwrap().as_slice(),
            b"plain notes"
        );

        assert!(matches!(
            vault.decrypt_file(&tmp.path().join("missing.age"), None),
            Err(VaultError::CiphertextNotFound(_))
        ));
    }

    #[test]
    fn test_wrapped_decrypt_uses_token() {
        let tmp = TempDir::new().unwrap();
        let vault = vault(&tmp);
        vault.init(false).unwrap();
        let blob = vault.encrypt(b"payload").unwrap();

        let token = KeyWrapper::new(Box::new(SimulatedToken::new("9999")));
        token.wrap_key(vault.keystore()).unwrap();
        let vault = vault.with_key_wrapper(token);

        let pin = SecretString::new("9999".to_string());
        assert_eq!(vault.decrypt(&blob, Some(&pin)).unwrap().as_slice(), b"payload");
        assert_eq!(fs::read_dir(tmp.path().join("ram")).unwrap().count(), 0);
    }
}
