//! Session lifecycle
//!
//! ```text
//! Unstarted -> Decrypting -> Active -> Cleaning -> Terminated
//!                  |                                   ^
//!                  +----------- (failure) ------------+
//! ```
//!
//! A session decrypts the credential store once, keeps the plaintext in a
//! single secure artifact and destroys it on `end()`, on drop, or when a
//! termination signal purges the cleanup registry.

use age::secrecy::SecretString;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use nakimi_core::Config;

use crate::cleanup::CleanupRegistry;
use crate::crypto::{CiphertextBlob, CryptoEngine};
use crate::error::{Result, VaultError};
use crate::keystore::{KeyMaterialHandle, KeyStore};
use crate::keywrap::KeyWrapper;
use crate::plugin::CredentialMap;
use crate::storage::{ArtifactKind, SecureArtifact, SecureStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Unstarted,
    Decrypting,
    Active,
    Cleaning,
    Terminated,
}

/// A live decrypted session
#[derive(Debug)]
pub struct Session {
    id: String,
    artifact: SecureArtifact,
    credentials: CredentialMap,
    started_at: DateTime<Utc>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn artifact(&self) -> &SecureArtifact {
        &self.artifact
    }

    /// Where the plaintext lives while the session is active
    pub fn artifact_path(&self) -> &Path {
        self.artifact.path()
    }

    pub fn credentials(&self) -> &CredentialMap {
        &self.credentials
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Decrypt `blob` with the stored identity.
///
/// A wrapped identity is unwrapped through `wrapper`, materialized as an
/// identity artifact for the duration of the decryption only, and destroyed
/// whatever the outcome.
pub(crate) fn decrypt_with_stored_identity(
    keystore: &KeyStore,
    crypto: &CryptoEngine,
    storage: &SecureStorage,
    wrapper: Option<&KeyWrapper>,
    blob: &CiphertextBlob,
    session_id: &str,
    pin: Option<&SecretString>,
) -> Result<Zeroizing<Vec<u8>>> {
    match keystore.resolve_identity()? {
        KeyMaterialHandle::Plain { path } => crypto.decrypt(blob, &path),
        KeyMaterialHandle::Wrapped { path, bytes } => {
            let wrapper = wrapper.ok_or_else(|| {
                VaultError::key_unreadable(
                    path,
                    "key is hardware-wrapped but hardware support is disabled (set NAKIMI_YUBIKEY_ENABLED=true)",
                )
            })?;

            let private = wrapper.unwrap(&bytes, pin)?;
            let mut identity = storage.materialize_kind(
                private.expose().as_bytes(),
                session_id,
                ArtifactKind::Identity,
            )?;
            let result = crypto.decrypt(blob, identity.path());
            identity.destroy()?;
            result
        }
    }
}

/// Drives one session at a time through its lifecycle
pub struct SessionManager {
    secrets_file: std::path::PathBuf,
    keystore: KeyStore,
    crypto: CryptoEngine,
    storage: SecureStorage,
    wrapper: Option<KeyWrapper>,
    state: SessionState,
    session: Option<Session>,
}

impl SessionManager {
    pub fn new(
        config: &Config,
        keystore: KeyStore,
        crypto: CryptoEngine,
        storage: SecureStorage,
    ) -> Self {
        Self {
            secrets_file: config.secrets_file.clone(),
            keystore,
            crypto,
            storage,
            wrapper: None,
            state: SessionState::Unstarted,
            session: None,
        }
    }

    /// Components built from `config`; a YubiKey wrapper when hardware is enabled
    pub fn from_config(config: &Config, registry: Arc<CleanupRegistry>) -> Self {
        let mut manager = Self::new(
            config,
            KeyStore::new(config),
            CryptoEngine::from_config(config, registry.clone()),
            SecureStorage::new(config, registry.clone()),
        );
        if config.hardware.enabled {
            manager.wrapper = Some(KeyWrapper::from_config(config, registry));
        }
        manager
    }

    pub fn with_key_wrapper(mut self, wrapper: KeyWrapper) -> Self {
        self.wrapper = Some(wrapper);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn storage(&self) -> &SecureStorage {
        &self.storage
    }

    pub fn start(&mut self) -> Result<&Session> {
        self.start_with_pin(None)
    }

    /// Decrypt the store into a fresh artifact.
    ///
    /// Fails with `AlreadyActive` while a session is live in this process,
    /// whichever manager started it. On failure the
    /// manager ends up `Terminated` with no artifact left behind; a later
    /// call may try again.
    pub fn start_with_pin(&mut self, pin: Option<&SecretString>) -> Result<&Session> {
        if let Some(session) = &self.session {
            return Err(VaultError::AlreadyActive(session.id.clone()));
        }
        if matches!(self.state, SessionState::Decrypting | SessionState::Cleaning) {
            return Err(VaultError::AlreadyActive(format!("{:?}", self.state)));
        }
        if let Some(live) = self
            .storage
            .registry()
            .live_session(ArtifactKind::Credentials)
        {
            return Err(VaultError::AlreadyActive(live));
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.state = SessionState::Decrypting;
        debug!("Starting session {}", id);

        match self.decrypt_session(&id, pin) {
            Ok(session) => {
                info!(
                    "Session {} active ({} namespace(s))",
                    id,
                    session.credentials.namespaces().count()
                );
                self.state = SessionState::Active;
                Ok(&*self.session.insert(session))
            }
            Err(e) => {
                warn!("Session {} failed to start: {}", id, e);
                self.state = SessionState::Terminated;
                Err(e)
            }
        }
    }

    /// The live session, starting one if needed
    pub fn open(&mut self) -> Result<&Session> {
        if self.session.is_none() {
            self.start()?;
        }
        self.session.as_ref().ok_or(VaultError::NotActive)
    }

    fn decrypt_session(&self, id: &str, pin: Option<&SecretString>) -> Result<Session> {
        let blob = CiphertextBlob::read(&self.secrets_file)?;

        let plaintext = decrypt_with_stored_identity(
            &self.keystore,
            &self.crypto,
            &self.storage,
            self.wrapper.as_ref(),
            &blob,
            id,
            pin,
        )?;

        let credentials = CredentialMap::from_json(&plaintext)?;
        let artifact = self.storage.materialize(&plaintext, id)?;

        Ok(Session {
            id: id.to_string(),
            artifact,
            credentials,
            started_at: Utc::now(),
        })
    }

    /// Destroy the session artifact. Calling it again is a no-op.
    pub fn end(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        self.state = SessionState::Cleaning;
        let result = session.artifact.destroy();
        self.state = SessionState::Terminated;

        let lifetime = Utc::now() - session.started_at;
        info!(
            "Session {} ended after {}s",
            session.id,
            lifetime.num_seconds()
        );
        result
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Err(e) = self.end() {
            warn!("Failed to end session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoBackend, NativeAge};
    use crate::keystore::PublicMaterial;
    use crate::keywrap::SimulatedToken;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        config: Config,
        registry: Arc<CleanupRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let ram = tmp.path().join("ram");
            fs::create_dir(&ram).unwrap();
            let mut config = Config::for_vault_dir(&tmp.path().join("vault"), Some(&ram));
            config.backend = nakimi_core::Backend::Native;
            Self {
                tmp,
                config,
                registry: Arc::new(CleanupRegistry::new()),
            }
        }

        fn ram_dir(&self) -> std::path::PathBuf {
            self.tmp.path().join("ram")
        }

        fn keystore(&self) -> KeyStore {
            KeyStore::new(&self.config)
        }

        fn manager(&self) -> SessionManager {
            SessionManager::from_config(&self.config, self.registry.clone())
        }

        fn store(&self, payload: serde_json::Value) {
            let recipient = self.keystore().public_material().unwrap();
            let blob = NativeAge
                .encrypt(payload.to_string().as_bytes(), &recipient)
                .unwrap();
            blob.write(&self.config.secrets_file).unwrap();
        }

        fn artifacts_on_disk(&self) -> usize {
            fs::read_dir(self.ram_dir()).unwrap().count()
        }
    }

    fn payload() -> serde_json::Value {
        json!({
            "gmail": {
                "client_id": "x.apps.googleusercontent.com",
                "client_secret": "s3cret-value",
                "refresh_token": "1//refresh-token-value-123"
            }
        })
    }

    #[test]
    fn test_start_and_end() {
        let f = Fixture::new();
        f.keystore().initialize(false).unwrap();
        f.store(payload());

        let mut manager = f.manager();
        assert_eq!(manager.state(), SessionState::Unstarted);

        let session = manager.start().unwrap();
        let path = session.artifact_path().to_path_buf();
        assert!(session.credentials().get("gmail").is_some());
        assert_eq!(session.artifact().permissions(), Some(0o600));
        let on_disk: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, payload());
        assert_eq!(manager.state(), SessionState::Active);

        manager.end().unwrap();
        assert_eq!(manager.state(), SessionState::Terminated);
        assert!(!path.exists());
        assert_eq!(f.artifacts_on_disk(), 0);

        manager.end().unwrap();
        assert_eq!(manager.state(), SessionState::Terminated);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let f = Fixture::new();
        f.keystore().initialize(false).unwrap();
        f.store(payload());

        let mut manager = f.manager();
        let first_id = manager.start().unwrap().id().to_string();

        let err = manager.start().unwrap_err();
        assert!(matches!(err, VaultError::AlreadyActive(ref id) if *id == first_id));
        assert_eq!(f.artifacts_on_disk(), 1);

        // open() reuses the live session
        assert_eq!(manager.open().unwrap().id(), first_id);
    }

    #[test]
    fn test_one_session_per_process() {
        let f = Fixture::new();
        f.keystore().initialize(false).unwrap();
        f.store(payload());

        let mut first = f.manager();
        let mut second = f.manager();
        let live = first.start().unwrap().id().to_string();

        let err = second.start().unwrap_err();
        assert!(matches!(err, VaultError::AlreadyActive(ref id) if *id == live));
        assert_eq!(second.state(), SessionState::Unstarted);
        assert_eq!(f.registry.live_paths().len(), 1);

        first.end().unwrap();
        assert!(second.start().is_ok());
    }

    #[test]
    fn test_restart_after_end_gets_new_id() {
        let f = Fixture::new();
        f.keystore().initialize(false).unwrap();
        f.store(payload());

        let mut manager = f.manager();
        let first = manager.start().unwrap().id().to_string();
        manager.end().unwrap();
        let second = manager.start().unwrap().id().to_string();
        assert_ne!(first, second);
        assert_eq!(f.artifacts_on_disk(), 1);
    }

    #[test]
    fn test_failures_leave_no_artifact() {
        let f = Fixture::new();
        let mut manager = f.manager();

        // No key
        assert!(matches!(manager.start(), Err(VaultError::KeyNotFound(_))));
        assert_eq!(manager.state(), SessionState::Terminated);

        // No store
        f.keystore().initialize(false).unwrap();
        assert!(matches!(
            manager.start(),
            Err(VaultError::CiphertextNotFound(_))
        ));

        // Store encrypted to someone else
        let other = TempDir::new().unwrap();
        let stranger = KeyStore::new(&Config::for_vault_dir(other.path(), None));
        let recipient: PublicMaterial = stranger.initialize(false).unwrap().public;
        NativeAge
            .encrypt(b"{}", &recipient)
            .unwrap()
            .write(&f.config.secrets_file)
            .unwrap();
        assert!(matches!(manager.start(), Err(VaultError::DecryptionFailed)));

        // Decrypts, but is not a credential map
        let own = f.keystore().public_material().unwrap();
        NativeAge
            .encrypt(b"[1,2,3]", &own)
            .unwrap()
            .write(&f.config.secrets_file)
            .unwrap();
        assert!(matches!(manager.start(), Err(VaultError::InvalidInput(_))));

        assert_eq!(manager.state(), SessionState::Terminated);
        assert!(manager.session().is_none());
        assert_eq!(f.artifacts_on_disk(), 0);
        assert!(f.registry.live_paths().is_empty());
    }

    #[test]
    fn test_drop_ends_session() {
        let f = Fixture::new();
        f.keystore().initialize(false).unwrap();
        f.store(payload());

        let path = {
            let mut manager = f.manager();
            manager.start().unwrap().artifact_path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_purge_destroys_live_session() {
        let f = Fixture::new();
        f.keystore().initialize(false).unwrap();
        f.store(payload());

        let mut manager = f.manager();
        let path = manager.start().unwrap().artifact_path().to_path_buf();

        assert_eq!(f.registry.purge(), 1);
        assert!(!path.exists());

        // Ending afterwards is still clean
        manager.end().unwrap();
    }

    #[test]
    fn test_wrapped_key_session() {
        let f = Fixture::new();
        f.keystore().initialize(false).unwrap();
        f.store(payload());

        let wrapper = KeyWrapper::new(Box::new(SimulatedToken::new("2468")));
        wrapper.wrap_key(&f.keystore()).unwrap();
        assert!(f.keystore().is_wrapped().unwrap());

        let mut manager = f.manager().with_key_wrapper(wrapper);
        let stored = fs::read(f.keystore().key_file()).unwrap();

        let wrong = SecretString::new("0000".to_string());
        assert!(matches!(
            manager.start_with_pin(Some(&wrong)),
            Err(VaultError::AuthenticationFailed(_))
        ));
        assert_eq!(f.artifacts_on_disk(), 0);
        assert_eq!(fs::read(f.keystore().key_file()).unwrap(), stored);

        let right = SecretString::new("2468".to_string());
        let session = manager.start_with_pin(Some(&right)).unwrap();
        assert!(session.credentials().get("gmail").is_some());

        // Only the credential artifact remains; the identity artifact is gone
        assert_eq!(f.artifacts_on_disk(), 1);
        let name = fs::read_dir(f.ram_dir())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .file_name();
        assert!(name.to_str().unwrap().starts_with("nakimi-secrets-"));
    }

    #[test]
    fn test_wrapped_key_without_hardware_support() {
        let f = Fixture::new();
        f.keystore().initialize(false).unwrap();
        f.store(payload());
        KeyWrapper::new(Box::new(SimulatedToken::new("1")))
            .wrap_key(&f.keystore())
            .unwrap();

        let mut manager = f.manager();
        assert!(matches!(
            manager.start(),
            Err(VaultError::KeyUnreadable { .. })
        ));
    }
}
