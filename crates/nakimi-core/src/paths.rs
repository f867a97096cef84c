//! Standard paths used by nakimi

use std::path::{Path, PathBuf};

/// Default vault location, relative to the home directory
const VAULT_DIR_NAME: &str = ".nakimi";

/// Standard nakimi paths
#[derive(Debug, Clone)]
pub struct Paths {
    /// Vault directory (~/.nakimi)
    pub vault: PathBuf,
    /// Config directory (~/.config/nakimi)
    pub config: PathBuf,
    /// Per-user runtime directory ($XDG_RUNTIME_DIR), if the platform has one
    pub runtime: Option<PathBuf>,
    /// System temp directory (may live on physical storage)
    pub temp: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));

        let config = dirs::config_dir()
            .unwrap_or_else(|| home.join(".config"))
            .join("nakimi");

        Self {
            vault: home.join(VAULT_DIR_NAME),
            config,
            runtime: dirs::runtime_dir(),
            temp: std::env::temp_dir(),
        }
    }

    /// Default config file inside the config directory
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Candidate directories for plaintext artifacts, most preferred first.
    ///
    /// RAM-backed locations come before the system temp directory; the storage
    /// layer probes each one and picks the first that is writable.
    pub fn temp_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        #[cfg(target_os = "linux")]
        candidates.push(PathBuf::from("/dev/shm"));

        #[cfg(target_os = "macos")]
        candidates.push(PathBuf::from("/private/tmp"));

        if let Some(runtime) = &self.runtime {
            candidates.push(runtime.clone());
        }

        if !candidates.contains(&self.temp) {
            candidates.push(self.temp.clone());
        }

        candidates
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }

    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }

    PathBuf::from(path)
}

/// Append a suffix to the full file name (`key.txt` -> `key.txt.pub`)
pub fn with_appended_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}
