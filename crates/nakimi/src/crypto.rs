//! Encryption and decryption of credential payloads
//!
//! Two interchangeable backends implement [`CryptoBackend`]: the external
//! `age` binary and the in-process `age` crate. Both produce standard age
//! ciphertext, so a store written by one can be read by the other.

use std::ffi::OsStr;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use zeroize::Zeroizing;

use nakimi_core::process::locate;
use nakimi_core::{Backend, Config};

use crate::cleanup::CleanupRegistry;
use crate::error::{Result, VaultError};
use crate::exec::{self, ExecError};
use crate::keystore::{parse_identity, PublicMaterial};
use crate::storage::write_atomic;

/// Encrypted payload as produced by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextBlob(Vec<u8>);

impl CiphertextBlob {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Load a blob from disk
    pub fn read(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(bytes) => Ok(Self(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::CiphertextNotFound(path.to_path_buf()))
            }
            Err(e) => Err(VaultError::storage(
                &format!("read {}", path.display()),
                e,
            )),
        }
    }

    /// Atomically replace the blob on disk (owner-only)
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| VaultError::storage("create store directory", e))?;
        }
        write_atomic(path, &self.0, 0o600)
            .map_err(|e| VaultError::storage(&format!("write {}", path.display()), e))
    }
}

/// One implementation of the age primitive
pub trait CryptoBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn encrypt(&self, plaintext: &[u8], recipient: &PublicMaterial) -> Result<CiphertextBlob>;

    /// Decrypt with the identity file at `identity`.
    ///
    /// Every failure that is not a missing tool must surface as the generic
    /// [`VaultError::DecryptionFailed`].
    fn decrypt(&self, blob: &CiphertextBlob, identity: &Path) -> Result<Zeroizing<Vec<u8>>>;
}

/// The external `age` binary
pub struct AgeCli {
    binary: PathBuf,
    timeout: Duration,
    registry: Arc<CleanupRegistry>,
}

impl AgeCli {
    pub fn new(binary: PathBuf, timeout: Duration, registry: Arc<CleanupRegistry>) -> Self {
        Self {
            binary,
            timeout,
            registry,
        }
    }

    fn program(&self) -> Result<PathBuf> {
        locate(&self.binary).ok_or_else(|| {
            VaultError::ToolUnavailable(format!(
                "'{}' not found (install age from https://age-encryption.org or set NAKIMI_BACKEND=native)",
                self.binary.display()
            ))
        })
    }

    fn run(&self, args: &[&OsStr], input: &[u8]) -> Result<exec::ToolOutput> {
        let program = self.program()?;
        exec::run(&program, args, Some(input), Some(self.timeout), &self.registry).map_err(
            |e| match e {
                ExecError::NotFound(p) => {
                    VaultError::ToolUnavailable(format!("'{}' not found", p.display()))
                }
                ExecError::TimedOut(limit) => VaultError::ToolUnavailable(format!(
                    "'{}' timed out after {}s",
                    self.binary.display(),
                    limit.as_secs_f32()
                )),
                ExecError::Io(e) => VaultError::ToolUnavailable(format!(
                    "failed to run '{}': {}",
                    self.binary.display(),
                    e
                )),
            },
        )
    }
}

impl CryptoBackend for AgeCli {
    fn name(&self) -> &'static str {
        "age-cli"
    }

    fn encrypt(&self, plaintext: &[u8], recipient: &PublicMaterial) -> Result<CiphertextBlob> {
        let mut recipients = tempfile::NamedTempFile::new()
            .map_err(|e| VaultError::storage("create recipients file", e))?;
        writeln!(recipients, "{}", recipient)
            .and_then(|_| recipients.flush())
            .map_err(|e| VaultError::storage("write recipients file", e))?;

        let output = self.run(
            &[OsStr::new("-e"), OsStr::new("-R"), recipients.path().as_os_str()],
            plaintext,
        )?;

        if !output.status.success() {
            return Err(VaultError::EncryptionFailed(output.stderr_summary()));
        }
        if output.stdout.is_empty() {
            return Err(VaultError::EncryptionFailed("age produced no output".to_string()));
        }

        Ok(CiphertextBlob(output.stdout.to_vec()))
    }

    fn decrypt(&self, blob: &CiphertextBlob, identity: &Path) -> Result<Zeroizing<Vec<u8>>> {
        let output = self.run(
            &[OsStr::new("-d"), OsStr::new("-i"), identity.as_os_str()],
            blob.as_bytes(),
        )?;

        if !output.status.success() {
            debug!("age exited with {:?}", output.status.code());
            return Err(VaultError::DecryptionFailed);
        }

        Ok(output.stdout)
    }
}

/// The in-process `age` crate
#[derive(Debug, Default)]
pub struct NativeAge;

impl CryptoBackend for NativeAge {
    fn name(&self) -> &'static str {
        "native"
    }

    fn encrypt(&self, plaintext: &[u8], recipient: &PublicMaterial) -> Result<CiphertextBlob> {
        let recipient = age::x25519::Recipient::from_str(recipient.as_str())
            .map_err(|e| VaultError::InvalidInput(format!("invalid recipient: {}", e)))?;

        let recipients: Vec<Box<dyn age::Recipient + Send>> = vec![Box::new(recipient)];
        let encryptor = age::Encryptor::with_recipients(recipients)
            .ok_or_else(|| VaultError::EncryptionFailed("no recipients".to_string()))?;

        let mut out = Vec::new();
        let mut writer = encryptor
            .wrap_output(&mut out)
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;
        writer
            .write_all(plaintext)
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

        Ok(CiphertextBlob(out))
    }

    fn decrypt(&self, blob: &CiphertextBlob, identity: &Path) -> Result<Zeroizing<Vec<u8>>> {
        let text = Zeroizing::new(
            fs::read_to_string(identity).map_err(|e| VaultError::key_unreadable(identity, e))?,
        );
        let identity =
            parse_identity(&text).map_err(|reason| VaultError::key_unreadable(identity, reason))?;

        let decryptor = match age::Decryptor::new(blob.as_bytes()) {
            Ok(age::Decryptor::Recipients(d)) => d,
            Ok(_) => return Err(VaultError::DecryptionFailed),
            Err(e) => {
                debug!("Malformed ciphertext: {}", e);
                return Err(VaultError::DecryptionFailed);
            }
        };

        let mut reader = decryptor
            .decrypt(std::iter::once(&identity as &dyn age::Identity))
            .map_err(|_| VaultError::DecryptionFailed)?;

        let mut plaintext = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut plaintext)
            .map_err(|_| VaultError::DecryptionFailed)?;

        Ok(plaintext)
    }
}

/// Front door for encryption, independent of the backend in use
pub struct CryptoEngine {
    backend: Box<dyn CryptoBackend>,
}

impl CryptoEngine {
    pub fn new(backend: Box<dyn CryptoBackend>) -> Self {
        Self { backend }
    }

    /// Backend selected by `config.backend`
    pub fn from_config(config: &Config, registry: Arc<CleanupRegistry>) -> Self {
        let backend: Box<dyn CryptoBackend> = match config.backend {
            Backend::AgeCli => Box::new(AgeCli::new(
                config.age_bin.clone(),
                config.tool_timeout,
                registry,
            )),
            Backend::Native => Box::new(NativeAge),
        };
        Self::new(backend)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn encrypt(&self, plaintext: &[u8], recipient: &PublicMaterial) -> Result<CiphertextBlob> {
        let blob = self.backend.encrypt(plaintext, recipient)?;
        info!(
            "Encrypted {} bytes with {}",
            plaintext.len(),
            self.backend.name()
        );
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &CiphertextBlob, identity: &Path) -> Result<Zeroizing<Vec<u8>>> {
        if blob.is_empty() {
            return Err(VaultError::InvalidInput("ciphertext is empty".to_string()));
        }
        self.backend.decrypt(blob, identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::tests::fake_tool;
    use crate::keystore::KeyStore;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: KeyStore,
        recipient: PublicMaterial,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = KeyStore::new(&Config::for_vault_dir(tmp.path(), None));
        let recipient = store.initialize(false).unwrap().public;
        Fixture {
            _tmp: tmp,
            store,
            recipient,
        }
    }

    #[test]
    fn test_native_round_trip() {
        let f = fixture();
        let engine = CryptoEngine::new(Box::new(NativeAge));

        let blob = engine.encrypt(br#"{"env":{"A":"1"}}"#, &f.recipient).unwrap();
        assert!(blob.as_bytes().starts_with(b"age-encryption.org/v1"));

        let plain = engine.decrypt(&blob, f.store.key_file()).unwrap();
        assert_eq!(plain.as_slice(), br#"{"env":{"A":"1"}}"#);
    }

    #[test]
    fn test_wrong_key_and_tampering_are_indistinguishable() {
        let f = fixture();
        let other = fixture();
        let engine = CryptoEngine::new(Box::new(NativeAge));
        let blob = engine.encrypt(b"payload", &f.recipient).unwrap();

        let wrong_key = engine.decrypt(&blob, other.store.key_file()).unwrap_err();

        let mut bytes = blob.as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = engine
            .decrypt(&CiphertextBlob::from_bytes(bytes), f.store.key_file())
            .unwrap_err();

        let garbage = engine
            .decrypt(&CiphertextBlob::from_bytes(b"not age".to_vec()), f.store.key_file())
            .unwrap_err();

        for err in [&wrong_key, &tampered, &garbage] {
            assert!(matches!(err, VaultError::DecryptionFailed));
        }
        assert_eq!(wrong_key.to_string(), tampered.to_string());
    }

    #[test]
    fn test_empty_blob_rejected_before_backend() {
        let f = fixture();
        let engine = CryptoEngine::new(Box::new(NativeAge));
        assert!(matches!(
            engine.decrypt(&CiphertextBlob::from_bytes(Vec::new()), f.store.key_file()),
            Err(VaultError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_missing_cli_is_tool_unavailable() {
        let registry = Arc::new(CleanupRegistry::new());
        let cli = AgeCli::new(
            PathBuf::from("/nonexistent/age"),
            Duration::from_secs(1),
            registry,
        );
        let f = fixture();

        assert!(matches!(
            cli.encrypt(b"x", &f.recipient),
            Err(VaultError::ToolUnavailable(_))
        ));
        let blob = CiphertextBlob::from_bytes(b"age".to_vec());
        assert!(matches!(
            cli.decrypt(&blob, f.store.key_file()),
            Err(VaultError::ToolUnavailable(_))
        ));
    }

    #[test]
    fn test_cli_timeout_is_tool_unavailable() {
        let tmp = TempDir::new().unwrap();
        let slow = fake_tool(tmp.path(), "age", "sleep 30");
        let cli = AgeCli::new(slow, Duration::from_millis(200), Arc::new(CleanupRegistry::new()));
        let f = fixture();

        let blob = CiphertextBlob::from_bytes(b"age".to_vec());
        assert!(matches!(
            cli.decrypt(&blob, f.store.key_file()),
            Err(VaultError::ToolUnavailable(_))
        ));
    }

    #[test]
    fn test_cli_failure_is_generic_decryption_failure() {
        let tmp = TempDir::new().unwrap();
        let failing = fake_tool(
            tmp.path(),
            "age",
            "cat >/dev/null; echo 'age: error: no identity matched any of the recipients' >&2; exit 1",
        );
        let cli = AgeCli::new(failing, Duration::from_secs(10), Arc::new(CleanupRegistry::new()));
        let f = fixture();

        let err = cli
            .decrypt(&CiphertextBlob::from_bytes(b"blob".to_vec()), f.store.key_file())
            .unwrap_err();
        assert!(matches!(err, VaultError::DecryptionFailed));
        assert!(!err.to_string().contains("identity"));
    }

    #[test]
    fn test_cli_passes_secrets_on_stdin_only() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("argv");
        let echo = fake_tool(
            tmp.path(),
            "age",
            &format!("echo \"$@\" > {}; cat", log.display()),
        );
        let cli = AgeCli::new(echo, Duration::from_secs(10), Arc::new(CleanupRegistry::new()));
        let f = fixture();

        let out = cli
            .decrypt(&CiphertextBlob::from_bytes(b"s3cr3t-blob".to_vec()), f.store.key_file())
            .unwrap();
        assert_eq!(out.as_slice(), b"s3cr3t-blob");

        let argv = fs::read_to_string(&log).unwrap();
        assert!(argv.starts_with("-d -i "));
        assert!(!argv.contains("s3cr3t"));
    }

    #[test]
    fn test_blob_file_io() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store").join("secrets.json.age");

        assert!(matches!(
            CiphertextBlob::read(&path),
            Err(VaultError::CiphertextNotFound(_))
        ));

        let blob = CiphertextBlob::from_bytes(b"age-encryption.org/v1".to_vec());
        blob.write(&path).unwrap();
        assert_eq!(CiphertextBlob::read(&path).unwrap(), blob);
    }

    #[test]
    fn test_backend_selection() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::for_vault_dir(tmp.path(), None);
        let registry = Arc::new(CleanupRegistry::new());

        assert_eq!(
            CryptoEngine::from_config(&config, registry.clone()).backend_name(),
            "age-cli"
        );
        config.backend = Backend::Native;
        assert_eq!(CryptoEngine::from_config(&config, registry).backend_name(), "native");
    }
}
