//! Key pair lifecycle
//!
//! The private identity lives in `key.txt` (0600), the recipient in
//! `key.txt.pub` (0644). Once hardware wrapping is enabled `key.txt` holds
//! the wrapped form instead, and the plain identity is kept offline in
//! `key.txt.backup`.

use age::secrecy::{ExposeSecret, SecretString};
use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use nakimi_core::Config;

use crate::error::{Result, VaultError};
use crate::storage::write_atomic;

const SECRET_KEY_PREFIX: &str = "AGE-SECRET-KEY-";
const PUBLIC_KEY_COMMENT: &str = "# public key:";
const PRIVATE_MODE: u32 = 0o600;
const PUBLIC_MODE: u32 = 0o644;

/// Recipient string (`age1...`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicMaterial(String);

impl PublicMaterial {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PublicMaterial {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if !s.starts_with("age1") || s.contains(char::is_whitespace) {
            return Err(VaultError::InvalidInput(format!("not an age recipient: {}", s)));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for PublicMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Contents of a plain identity file
pub struct PrivateMaterial(SecretString);

impl PrivateMaterial {
    pub fn new(contents: String) -> Self {
        Self(SecretString::new(contents))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Whether this holds a usable plain identity line
    pub fn is_plain_identity(&self) -> bool {
        is_plain_identity(self.expose().as_bytes())
    }
}

impl fmt::Debug for PrivateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateMaterial([redacted])")
    }
}

/// A freshly generated key pair
#[derive(Debug)]
pub struct KeyPair {
    pub private: PrivateMaterial,
    pub public: PublicMaterial,
    pub wrapped: bool,
}

/// How the stored identity can be used
#[derive(Debug)]
pub enum KeyMaterialHandle {
    /// A plain identity file the encryption tool can read directly
    Plain { path: PathBuf },
    /// Hardware-wrapped identity that must be unwrapped first
    Wrapped { path: PathBuf, bytes: Vec<u8> },
}

/// Owns the key files of one vault
#[derive(Debug, Clone)]
pub struct KeyStore {
    vault_dir: PathBuf,
    key_file: PathBuf,
    pub_file: PathBuf,
    backup_file: PathBuf,
}

impl KeyStore {
    pub fn new(config: &Config) -> Self {
        Self {
            vault_dir: config.vault_dir.clone(),
            key_file: config.key_file.clone(),
            pub_file: config.key_pub_file(),
            backup_file: config.key_backup_file(),
        }
    }

    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    pub fn pub_file(&self) -> &Path {
        &self.pub_file
    }

    pub fn backup_file(&self) -> &Path {
        &self.backup_file
    }

    pub fn is_initialized(&self) -> bool {
        self.key_file.exists()
    }

    /// Generate and persist a fresh identity.
    ///
    /// Refuses to touch an existing key unless `force` is set; forcing also
    /// removes a stale wrapping backup, which would belong to the old key.
    pub fn initialize(&self, force: bool) -> Result<KeyPair> {
        if self.is_initialized() {
            if !force {
                return Err(VaultError::AlreadyInitialized(self.key_file.clone()));
            }
            warn!(
                "Discarding existing key at {}; data encrypted to it becomes unreadable",
                self.key_file.display()
            );
        }

        self.ensure_dirs()?;

        let identity = age::x25519::Identity::generate();
        let public = PublicMaterial(identity.to_public().to_string());
        let secret = identity.to_string();

        let contents = Zeroizing::new(format!(
            "# created: {}\n{} {}\n{}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            PUBLIC_KEY_COMMENT,
            public,
            secret.expose_secret()
        ));

        write_atomic(&self.key_file, contents.as_bytes(), PRIVATE_MODE)
            .map_err(|e| VaultError::storage("write key file", e))?;
        write_atomic(
            &self.pub_file,
            format!("{}\n", public).as_bytes(),
            PUBLIC_MODE,
        )
        .map_err(|e| VaultError::storage("write public key", e))?;

        if force && self.backup_file.exists() {
            fs::remove_file(&self.backup_file)
                .map_err(|e| VaultError::storage("remove stale key backup", e))?;
        }

        info!("Generated key pair at {}", self.key_file.display());

        Ok(KeyPair {
            private: PrivateMaterial::new(contents.to_string()),
            public,
            wrapped: false,
        })
    }

    /// Locate the identity and report whether it is usable directly
    pub fn resolve_identity(&self) -> Result<KeyMaterialHandle> {
        let bytes = self.read_key_file()?;

        if is_plain_identity(&bytes) {
            let bytes = Zeroizing::new(bytes);
            let text = std::str::from_utf8(&bytes)
                .map_err(|_| VaultError::key_unreadable(&self.key_file, "not valid UTF-8"))?;
            parse_identity(text).map_err(|e| VaultError::key_unreadable(&self.key_file, e))?;
            Ok(KeyMaterialHandle::Plain {
                path: self.key_file.clone(),
            })
        } else {
            debug!("Key at {} is wrapped", self.key_file.display());
            Ok(KeyMaterialHandle::Wrapped {
                path: self.key_file.clone(),
                bytes,
            })
        }
    }

    pub fn is_wrapped(&self) -> Result<bool> {
        Ok(matches!(
            self.resolve_identity()?,
            KeyMaterialHandle::Wrapped { .. }
        ))
    }

    /// The plain identity, when the key is not wrapped
    pub fn read_private(&self) -> Result<PrivateMaterial> {
        let bytes = Zeroizing::new(self.read_key_file()?);
        if !is_plain_identity(&bytes) {
            return Err(VaultError::key_unreadable(
                &self.key_file,
                "key is hardware-wrapped",
            ));
        }

        let text = std::str::from_utf8(&bytes)
            .map_err(|_| VaultError::key_unreadable(&self.key_file, "not valid UTF-8"))?;
        Ok(PrivateMaterial::new(text.to_string()))
    }

    /// The recipient for new encryptions
    pub fn public_material(&self) -> Result<PublicMaterial> {
        match fs::read_to_string(&self.pub_file) {
            Ok(content) => return content.parse(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(VaultError::key_unreadable(&self.pub_file, e)),
        }

        // Fall back to the identity itself
        let private = self.read_private()?;
        if let Some(public) = private
            .expose()
            .lines()
            .find_map(|l| l.strip_prefix(PUBLIC_KEY_COMMENT))
        {
            return public.parse();
        }

        let identity = parse_identity(private.expose())
            .map_err(|reason| VaultError::key_unreadable(&self.key_file, reason))?;
        Ok(PublicMaterial(identity.to_public().to_string()))
    }

    /// Replace the plain key with its wrapped form.
    ///
    /// The plain identity is first copied to the backup file and read back;
    /// the key file is only replaced once the backup is verified.
    pub fn store_wrapped(&self, wrapped: &[u8]) -> Result<PathBuf> {
        if wrapped.is_empty() {
            return Err(VaultError::InvalidInput("wrapped key is empty".to_string()));
        }

        let private = self.read_private()?;
        write_atomic(&self.backup_file, private.expose().as_bytes(), PRIVATE_MODE)
            .map_err(|e| VaultError::storage("write key backup", e))?;

        let check = Zeroizing::new(
            fs::read(&self.backup_file).map_err(|e| VaultError::storage("verify key backup", e))?,
        );
        if check.as_slice() != private.expose().as_bytes() {
            return Err(VaultError::StorageUnwritable(format!(
                "key backup at {} does not match the key",
                self.backup_file.display()
            )));
        }

        write_atomic(&self.key_file, wrapped, PRIVATE_MODE)
            .map_err(|e| VaultError::storage("write wrapped key", e))?;

        info!(
            "Key wrapped; plain backup at {}",
            self.backup_file.display()
        );
        Ok(self.backup_file.clone())
    }

    fn read_key_file(&self) -> Result<Vec<u8>> {
        let bytes = match fs::read(&self.key_file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::KeyNotFound(self.key_file.clone()));
            }
            Err(e) => return Err(VaultError::key_unreadable(&self.key_file, e)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(VaultError::key_unreadable(&self.key_file, "file is empty"));
        }

        if let Ok(meta) = fs::metadata(&self.key_file) {
            if meta.permissions().mode() & 0o077 != 0 {
                warn!(
                    "Key file {} is accessible by other users (chmod 600 it)",
                    self.key_file.display()
                );
            }
        }

        Ok(bytes)
    }

    fn ensure_dirs(&self) -> Result<()> {
        let mut dirs = vec![self.vault_dir.as_path()];
        dirs.extend(self.key_file.parent());
        dirs.extend(self.pub_file.parent());

        for dir in dirs {
            if dir.as_os_str().is_empty() || dir.exists() {
                continue;
            }
            private_dir(dir).map_err(|e| VaultError::storage("create vault directory", e))?;
        }
        Ok(())
    }
}

fn private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

/// True when the bytes contain a plain age identity line
pub fn is_plain_identity(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes)
        .map(|text| text.lines().any(|l| l.trim().starts_with(SECRET_KEY_PREFIX)))
        .unwrap_or(false)
}

/// Parse the first identity line of an identity file
pub(crate) fn parse_identity(text: &str) -> std::result::Result<age::x25519::Identity, &'static str> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with(SECRET_KEY_PREFIX))
        .ok_or("no identity line found")?;

    age::x25519::Identity::from_str(line).map_err(|_| "malformed identity")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keystore(tmp: &TempDir) -> KeyStore {
        KeyStore::new(&Config::for_vault_dir(&tmp.path().join("vault"), None))
    }

    #[test]
    fn test_initialize_writes_key_pair() {
        let tmp = TempDir::new().unwrap();
        let store = keystore(&tmp);
        assert!(!store.is_initialized());

        let pair = store.initialize(false).unwrap();
        assert!(!pair.wrapped);
        assert!(pair.public.as_str().starts_with("age1"));
        assert!(pair.private.is_plain_identity());

        let key_mode = fs::metadata(store.key_file()).unwrap().permissions().mode() & 0o777;
        let pub_mode = fs::metadata(store.pub_file()).unwrap().permissions().mode() & 0o777;
        assert_eq!(key_mode, 0o600);
        assert_eq!(pub_mode, 0o644);

        let content = fs::read_to_string(store.key_file()).unwrap();
        assert!(content.starts_with("# created: "));
        assert!(content.contains(&format!("# public key: {}", pair.public)));
        assert_eq!(store.public_material().unwrap(), pair.public);
    }

    #[test]
    fn test_initialize_refuses_existing_key() {
        let tmp = TempDir::new().unwrap();
        let store = keystore(&tmp);
        store.initialize(false).unwrap();
        let before = fs::read(store.key_file()).unwrap();

        let err = store.initialize(false).unwrap_err();
        assert!(matches!(err, VaultError::AlreadyInitialized(_)));
        assert_eq!(fs::read(store.key_file()).unwrap(), before);
    }

    #[test]
    fn test_force_replaces_key_and_stale_backup() {
        let tmp = TempDir::new().unwrap();
        let store = keystore(&tmp);
        let first = store.initialize(false).unwrap();
        fs::write(store.backup_file(), "old backup").unwrap();

        let second = store.initialize(true).unwrap();
        assert_ne!(first.public, second.public);
        assert!(!store.backup_file().exists());
    }

    #[test]
    fn test_resolve_identity() {
        let tmp = TempDir::new().unwrap();
        let store = keystore(&tmp);

        assert!(matches!(
            store.resolve_identity(),
            Err(VaultError::KeyNotFound(_))
        ));

        store.initialize(false).unwrap();
        assert!(matches!(
            store.resolve_identity().unwrap(),
            KeyMaterialHandle::Plain { .. }
        ));

        fs::write(store.key_file(), b"\x01\x02wrapped-blob").unwrap();
        match store.resolve_identity().unwrap() {
            KeyMaterialHandle::Wrapped { bytes, .. } => assert_eq!(bytes, b"\x01\x02wrapped-blob"),
            other => panic!("expected wrapped key, got {:?}", other),
        }
        assert!(store.is_wrapped().unwrap());
    }

    #[test]
    fn test_empty_key_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        let store = keystore(&tmp);
        store.initialize(false).unwrap();
        fs::write(store.key_file(), "\n").unwrap();

        assert!(matches!(
            store.resolve_identity(),
            Err(VaultError::KeyUnreadable { .. })
        ));
    }

    #[test]
    fn test_corrupt_plain_key_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        let store = keystore(&tmp);
        store.initialize(false).unwrap();
        fs::write(
            store.key_file(),
            "# created: 2024-01-01\nAGE-SECRET-KEY-1NOTVALID\n",
        )
        .unwrap();

        match store.resolve_identity() {
            Err(VaultError::KeyUnreadable { path, reason }) => {
                assert_eq!(path, store.key_file());
                assert_eq!(reason, "malformed identity");
            }
            other => panic!("expected unreadable key, got {:?}", other),
        }
    }

    #[test]
    fn test_public_material_without_pub_file() {
        let tmp = TempDir::new().unwrap();
        let store = keystore(&tmp);
        let pair = store.initialize(false).unwrap();
        fs::remove_file(store.pub_file()).unwrap();

        assert_eq!(store.public_material().unwrap(), pair.public);

        // Bare identity without the comment header
        let line = pair
            .private
            .expose()
            .lines()
            .find(|l| l.starts_with(SECRET_KEY_PREFIX))
            .unwrap()
            .to_string();
        fs::write(store.key_file(), line).unwrap();
        assert_eq!(store.public_material().unwrap(), pair.public);
    }

    #[test]
    fn test_store_wrapped_keeps_backup() {
        let tmp = TempDir::new().unwrap();
        let store = keystore(&tmp);
        let pair = store.initialize(false).unwrap();

        let backup = store.store_wrapped(b"wrapped").unwrap();
        assert_eq!(
            fs::read_to_string(&backup).unwrap(),
            pair.private.expose()
        );
        assert_eq!(fs::read(store.key_file()).unwrap(), b"wrapped");
        assert!(store.is_wrapped().unwrap());

        // Cannot wrap twice: the plain key is gone
        assert!(matches!(
            store.store_wrapped(b"again"),
            Err(VaultError::KeyUnreadable { .. })
        ));
    }

    #[test]
    fn test_public_material_rejects_garbage() {
        assert!("age1abc".parse::<PublicMaterial>().is_ok());
        assert!("ssh-ed25519 AAAA".parse::<PublicMaterial>().is_err());
    }

    #[test]
    fn test_private_material_debug_is_redacted() {
        let material = PrivateMaterial::new("AGE-SECRET-KEY-1SECRET".to_string());
        assert!(!format!("{:?}", material).contains("SECRET-KEY"));
    }
}
