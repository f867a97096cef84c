//! Configuration for nakimi
//!
//! Every setting is resolved once at startup, in priority order:
//! 1. Environment variables (`NAKIMI_*`)
//! 2. Config file (`$NAKIMI_CONFIG` or `~/.config/nakimi/config.toml`)
//! 3. Defaults
//!
//! Components receive the resulting `Config` explicitly. Only [`Config::load`]
//! looks at the process environment.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::paths::{expand_tilde, with_appended_suffix, Paths};

pub const ENV_CONFIG: &str = "NAKIMI_CONFIG";
pub const ENV_CONFIG_DIR: &str = "NAKIMI_CONFIG_DIR";
pub const ENV_VAULT_DIR: &str = "NAKIMI_DIR";
pub const ENV_KEY_FILE: &str = "NAKIMI_KEY";
pub const ENV_SECRETS_FILE: &str = "NAKIMI_SECRETS";
pub const ENV_TEMP_DIR: &str = "NAKIMI_TMPDIR";
pub const ENV_BACKEND: &str = "NAKIMI_BACKEND";
pub const ENV_AGE_BIN: &str = "NAKIMI_AGE_BIN";
pub const ENV_TOOL_TIMEOUT: &str = "NAKIMI_TOOL_TIMEOUT";
pub const ENV_YUBIKEY_ENABLED: &str = "NAKIMI_YUBIKEY_ENABLED";
pub const ENV_YUBIKEY_SLOT: &str = "NAKIMI_YUBIKEY_SLOT";
pub const ENV_YUBIKEY_REQUIRE_TOUCH: &str = "NAKIMI_YUBIKEY_REQUIRE_TOUCH";
pub const ENV_YUBIKEY_PIN_PROMPT: &str = "NAKIMI_YUBIKEY_PIN_PROMPT";
pub const ENV_SESSION_FILE: &str = "NAKIMI_SESSION_FILE";

const DEFAULT_KEY_FILE: &str = "key.txt";
const DEFAULT_SECRETS_FILE: &str = "secrets.json.age";
const DEFAULT_AGE_BIN: &str = "age";
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_YUBIKEY_SLOT: &str = "9a";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Which implementation of the encryption primitive to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// The external `age` binary, invoked as a subprocess
    AgeCli,
    /// The in-process `age` crate
    Native,
}

impl FromStr for Backend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "age-cli" | "age" | "cli" => Ok(Self::AgeCli),
            "native" | "rage" => Ok(Self::Native),
            _ => Err(()),
        }
    }
}

/// Values read from the TOML config file. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_bin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yubikey_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yubikey_slot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yubikey_require_touch: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yubikey_pin_prompt: Option<bool>,
}

impl FileConfig {
    /// Read the config file. A missing file yields an empty config.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Write the config file, creating its directory (0700) if needed
    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            create_private_dir(parent).map_err(write_err)?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        fs::write(path, content).map_err(write_err)
    }
}

/// Hardware-token (PIV) key wrapping settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareConfig {
    pub enabled: bool,
    pub slot: String,
    pub require_touch: bool,
    pub pin_prompt: bool,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            slot: DEFAULT_YUBIKEY_SLOT.to_string(),
            require_touch: true,
            pin_prompt: true,
        }
    }
}

/// Fully resolved, immutable configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the key pair and the ciphertext store
    pub vault_dir: PathBuf,
    /// Config file these values were (partly) read from
    pub config_file: PathBuf,
    /// Private identity file
    pub key_file: PathBuf,
    /// Encrypted credential store
    pub secrets_file: PathBuf,
    /// Candidate directories for plaintext artifacts, most preferred first
    pub temp_dirs: Vec<PathBuf>,
    pub backend: Backend,
    /// Name or path of the `age` binary
    pub age_bin: PathBuf,
    /// Upper bound for non-interactive tool invocations
    pub tool_timeout: Duration,
    pub hardware: HardwareConfig,
    /// Plaintext artifact of an enclosing `session start`, if any
    pub session_file: Option<PathBuf>,
}

impl Config {
    /// Resolve configuration from the process environment and config file
    pub fn load() -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        let paths = Paths::new();

        let config_file = config_file_location(&lookup, &paths);
        let file = FileConfig::read(&config_file)?;

        Self::resolve(&lookup, &paths, config_file, file)
    }

    /// Resolve configuration from an arbitrary variable source
    pub fn resolve(
        lookup: &dyn Fn(&str) -> Option<String>,
        paths: &Paths,
        config_file: PathBuf,
        file: FileConfig,
    ) -> Result<Self, ConfigError> {
        let vault_dir = pick_path(lookup(ENV_VAULT_DIR), file.vault_dir.clone())
            .unwrap_or_else(|| paths.vault.clone());

        let key_file = pick_path(lookup(ENV_KEY_FILE), file.key_file.clone())
            .unwrap_or_else(|| vault_dir.join(DEFAULT_KEY_FILE));

        let secrets_file = pick_path(lookup(ENV_SECRETS_FILE), file.secrets_file.clone())
            .unwrap_or_else(|| vault_dir.join(DEFAULT_SECRETS_FILE));

        let temp_dirs = match pick_path(lookup(ENV_TEMP_DIR), file.temp_dir.clone()) {
            Some(dir) => vec![dir],
            None => paths.temp_candidates(),
        };

        let backend = match lookup(ENV_BACKEND).or(file.backend.clone()) {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_BACKEND,
                value,
            })?,
            None => Backend::AgeCli,
        };

        let age_bin = pick_path(lookup(ENV_AGE_BIN), file.age_bin.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_AGE_BIN));

        let timeout_secs = match lookup(ENV_TOOL_TIMEOUT) {
            Some(value) => value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                key: ENV_TOOL_TIMEOUT,
                value,
            })?,
            None => file.tool_timeout_secs.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS),
        };

        let defaults = HardwareConfig::default();
        let hardware = HardwareConfig {
            enabled: pick_bool(lookup(ENV_YUBIKEY_ENABLED), file.yubikey_enabled, defaults.enabled),
            slot: lookup(ENV_YUBIKEY_SLOT)
                .or(file.yubikey_slot.clone())
                .unwrap_or(defaults.slot),
            require_touch: pick_bool(
                lookup(ENV_YUBIKEY_REQUIRE_TOUCH),
                file.yubikey_require_touch,
                defaults.require_touch,
            ),
            pin_prompt: pick_bool(
                lookup(ENV_YUBIKEY_PIN_PROMPT),
                file.yubikey_pin_prompt,
                defaults.pin_prompt,
            ),
        };

        Ok(Self {
            vault_dir,
            config_file,
            key_file,
            secrets_file,
            temp_dirs,
            backend,
            age_bin,
            tool_timeout: Duration::from_secs(timeout_secs),
            hardware,
            session_file: lookup(ENV_SESSION_FILE).map(PathBuf::from),
        })
    }

    /// Default configuration rooted at an explicit vault directory.
    ///
    /// Ignores the environment and any config file; artifacts go to
    /// `temp_dir` when given.
    pub fn for_vault_dir(vault_dir: &Path, temp_dir: Option<&Path>) -> Self {
        let temp_dirs = match temp_dir {
            Some(dir) => vec![dir.to_path_buf()],
            None => Paths::new().temp_candidates(),
        };

        Self {
            vault_dir: vault_dir.to_path_buf(),
            config_file: vault_dir.join("config.toml"),
            key_file: vault_dir.join(DEFAULT_KEY_FILE),
            secrets_file: vault_dir.join(DEFAULT_SECRETS_FILE),
            temp_dirs,
            backend: Backend::AgeCli,
            age_bin: PathBuf::from(DEFAULT_AGE_BIN),
            tool_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
            hardware: HardwareConfig::default(),
            session_file: None,
        }
    }

    /// World-readable recipient file next to the identity
    pub fn key_pub_file(&self) -> PathBuf {
        with_appended_suffix(&self.key_file, ".pub")
    }

    /// Offline copy of the plain identity, written before hardware wrapping
    pub fn key_backup_file(&self) -> PathBuf {
        with_appended_suffix(&self.key_file, ".backup")
    }
}

/// Locate the config file: `$NAKIMI_CONFIG`, else `$NAKIMI_CONFIG_DIR/config.toml`,
/// else the platform config directory.
pub fn config_file_location(lookup: &dyn Fn(&str) -> Option<String>, paths: &Paths) -> PathBuf {
    if let Some(file) = lookup(ENV_CONFIG) {
        return expand_tilde(&file);
    }

    match lookup(ENV_CONFIG_DIR) {
        Some(dir) => expand_tilde(&dir).join("config.toml"),
        None => paths.config_file(),
    }
}

/// Parse a boolean the way the environment variables are documented
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "yes" | "1" | "on"
    )
}

fn pick_path(env: Option<String>, file: Option<String>) -> Option<PathBuf> {
    env.or(file)
        .filter(|v| !v.trim().is_empty())
        .map(|v| expand_tilde(v.trim()))
}

fn pick_bool(env: Option<String>, file: Option<bool>, default: bool) -> bool {
    match env {
        Some(value) => parse_bool(&value),
        None => file.unwrap_or(default),
    }
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
    }

    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}
