//! Secure placement and destruction of plaintext artifacts
//!
//! Artifacts go to the first writable RAM-backed candidate directory; a
//! disk-backed directory is used only when no RAM-backed one is writable,
//! and such artifacts are overwritten before removal. On RAM-backed media
//! the artifact pages are also locked in memory when the memlock limit
//! allows it.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info, warn};

use nakimi_core::process::locate;
use nakimi_core::Config;

use crate::cleanup::CleanupRegistry;
use crate::error::{Result, VaultError};

/// Owner read/write only
pub const ARTIFACT_MODE: u32 = 0o600;

/// Where an artifact physically lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Medium {
    RamBacked,
    PhysicalFallback,
}

impl Medium {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RamBacked => "ram-backed",
            Self::PhysicalFallback => "physical-fallback",
        }
    }
}

/// What an artifact holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    /// Decrypted credential payload of a session
    Credentials,
    /// Unwrapped identity, alive only for the duration of one decryption
    Identity,
}

impl ArtifactKind {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Credentials => "nakimi-secrets-",
            Self::Identity => "nakimi-key-",
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            Self::Credentials => ".json",
            Self::Identity => ".txt",
        }
    }

    fn matches_file_name(name: &str) -> bool {
        [Self::Credentials, Self::Identity]
            .iter()
            .any(|k| name.starts_with(k.prefix()))
    }
}

/// Places plaintext on the safest available medium and destroys it
pub struct SecureStorage {
    candidates: Vec<PathBuf>,
    registry: Arc<CleanupRegistry>,
}

impl SecureStorage {
    pub fn new(config: &Config, registry: Arc<CleanupRegistry>) -> Self {
        Self::with_candidates(config.temp_dirs.clone(), registry)
    }

    pub fn with_candidates(candidates: Vec<PathBuf>, registry: Arc<CleanupRegistry>) -> Self {
        Self {
            candidates,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<CleanupRegistry> {
        &self.registry
    }

    /// Pick the directory new artifacts would go to
    pub fn probe(&self) -> Result<(PathBuf, Medium)> {
        let writable: Vec<(PathBuf, Medium)> = self
            .candidates
            .iter()
            .filter(|dir| is_writable(dir))
            .map(|dir| (dir.clone(), medium_of(dir)))
            .collect();

        if let Some(ram) = writable.iter().find(|(_, m)| *m == Medium::RamBacked) {
            return Ok(ram.clone());
        }

        match writable.into_iter().next() {
            Some(fallback) => {
                warn!(
                    "No RAM-backed storage available, using {} (plaintext will be overwritten on removal)",
                    fallback.0.display()
                );
                Ok(fallback)
            }
            None => Err(VaultError::StorageUnwritable(format!(
                "none of the candidate directories are writable: {}",
                self.candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Write session plaintext to a fresh owner-only artifact
    pub fn materialize(&self, bytes: &[u8], session_id: &str) -> Result<SecureArtifact> {
        self.materialize_kind(bytes, session_id, ArtifactKind::Credentials)
    }

    pub fn materialize_kind(
        &self,
        bytes: &[u8],
        session_id: &str,
        kind: ArtifactKind,
    ) -> Result<SecureArtifact> {
        let (dir, medium) = self.probe()?;

        if self.registry.contains(session_id, kind) {
            return Err(VaultError::AlreadyActive(session_id.to_string()));
        }

        let temp = tempfile::Builder::new()
            .prefix(kind.prefix())
            .suffix(kind.suffix())
            .rand_bytes(12)
            .permissions(fs::Permissions::from_mode(ARTIFACT_MODE))
            .tempfile_in(&dir)
            .map_err(|e| VaultError::storage("create artifact", e))?;

        // Registered while the temp file still removes itself on drop
        if !self
            .registry
            .register(session_id, kind, temp.path().to_path_buf(), medium)
        {
            return Err(VaultError::AlreadyActive(session_id.to_string()));
        }
        let (mut file, path) = match temp.keep() {
            Ok(kept) => kept,
            Err(e) => {
                self.registry.release(session_id, kind);
                return Err(VaultError::storage("create artifact", e.error));
            }
        };

        // From here on the guard removes the file on any failure
        let mut artifact = SecureArtifact {
            path,
            medium,
            session_id: session_id.to_string(),
            kind,
            pinned: None,
            registry: self.registry.clone(),
            destroyed: false,
        };

        fs::set_permissions(&artifact.path, fs::Permissions::from_mode(ARTIFACT_MODE))
            .map_err(|e| VaultError::storage("restrict artifact permissions", e))?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| VaultError::storage("write artifact", e))?;

        if medium == Medium::RamBacked {
            artifact.pinned = PinnedPages::lock(&file, bytes.len());
        }

        debug!(
            "Materialized {:?} artifact {} on {} storage",
            kind,
            artifact.path.display(),
            medium.as_str()
        );
        Ok(artifact)
    }

    /// Destroy an artifact. Destroying twice is a no-op.
    pub fn destroy(&self, artifact: &mut SecureArtifact) -> Result<()> {
        artifact.destroy()
    }

    /// Remove artifacts left behind by processes that died without cleanup.
    ///
    /// Only files with an artifact prefix, owned by the current user and not
    /// registered in this process are touched.
    pub fn sweep_stale(&self) -> Result<Vec<PathBuf>> {
        let live = self.registry.live_paths();
        // SAFETY: getuid has no failure modes
        let uid = unsafe { libc::getuid() };
        let mut removed = Vec::new();

        for dir in &self.candidates {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            let medium = medium_of(dir);

            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !ArtifactKind::matches_file_name(name) {
                    continue;
                }

                let path = entry.path();
                let Ok(meta) = fs::symlink_metadata(&path) else {
                    continue;
                };
                if !meta.is_file() || meta.uid() != uid || live.contains(&path) {
                    continue;
                }

                destroy_path(&path, medium)
                    .map_err(|e| VaultError::storage("remove stale artifact", e))?;
                info!("Removed stale artifact {}", path.display());
                removed.push(path);
            }
        }

        Ok(removed)
    }
}

/// A plaintext file on disk, destroyed when dropped
#[derive(Debug)]
pub struct SecureArtifact {
    path: PathBuf,
    medium: Medium,
    session_id: String,
    kind: ArtifactKind,
    pinned: Option<PinnedPages>,
    registry: Arc<CleanupRegistry>,
    destroyed: bool,
}

impl SecureArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn medium(&self) -> Medium {
        self.medium
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    /// Current permission bits of the file
    pub fn permissions(&self) -> Option<u32> {
        fs::metadata(&self.path)
            .ok()
            .map(|m| m.permissions().mode() & 0o777)
    }

    /// Whether the artifact pages are locked in memory
    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }

        self.pinned = None;
        let claimed = self
            .registry
            .destroy_claimed(&self.session_id, self.kind)
            .map_err(|e| VaultError::storage("destroy artifact", e))?;

        self.destroyed = true;
        if claimed {
            debug!("Destroyed artifact {}", self.path.display());
        } else {
            debug!("Artifact {} was already purged", self.path.display());
        }
        Ok(())
    }
}

impl Drop for SecureArtifact {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("{}", e);
        }
    }
}

/// Remove an artifact file according to its medium. Missing files are fine.
pub(crate) fn destroy_path(path: &Path, medium: Medium) -> std::io::Result<()> {
    if fs::symlink_metadata(path).is_err() {
        return Ok(());
    }

    if medium == Medium::PhysicalFallback && !shred(path) {
        debug!("shred unavailable, overwriting {} in place", path.display());
        match overwrite(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            result => result?,
        }
    }

    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Securely remove a plaintext file the user handed in
pub fn shred_file(path: &Path) -> std::io::Result<()> {
    let medium = path.parent().map(medium_of).unwrap_or(Medium::PhysicalFallback);
    destroy_path(path, medium)
}

fn shred(path: &Path) -> bool {
    let Some(shred) = locate(Path::new("shred")) else {
        return false;
    };

    Command::new(shred)
        .args(["-u", "-z", "-n", "3"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn overwrite(path: &Path) -> std::io::Result<()> {
    let len = fs::metadata(path)?.len();
    let mut file = fs::OpenOptions::new().write(true).open(path)?;
    let zeros = vec![0u8; 4096];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(zeros.len() as u64) as usize;
        file.write_all(&zeros[..chunk])?;
        remaining -= chunk as u64;
    }
    file.sync_all()
}

fn is_writable(dir: &Path) -> bool {
    dir.is_dir()
        && tempfile::Builder::new()
            .prefix(".nakimi-probe-")
            .tempfile_in(dir)
            .is_ok()
}

/// Classify the filesystem holding `dir`
#[cfg(target_os = "linux")]
pub fn medium_of(dir: &Path) -> Medium {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    const TMPFS_MAGIC: u32 = 0x0102_1994;
    const RAMFS_MAGIC: u32 = 0x8584_58f6;

    let Ok(c_path) = CString::new(dir.as_os_str().as_bytes()) else {
        return Medium::PhysicalFallback;
    };

    // SAFETY: statfs only writes into the zeroed struct we own
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(c_path.as_ptr(), &mut stat) } != 0 {
        return Medium::PhysicalFallback;
    }

    match stat.f_type as u32 {
        TMPFS_MAGIC | RAMFS_MAGIC => Medium::RamBacked,
        _ => Medium::PhysicalFallback,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn medium_of(_dir: &Path) -> Medium {
    Medium::PhysicalFallback
}

/// Artifact pages mapped and locked in memory
#[derive(Debug)]
struct PinnedPages {
    addr: *mut libc::c_void,
    len: usize,
}

// SAFETY: the mapping is owned exclusively and only unmapped on drop
unsafe impl Send for PinnedPages {}

impl PinnedPages {
    fn lock(file: &File, len: usize) -> Option<Self> {
        use std::os::unix::io::AsRawFd;

        if len == 0 || len > memlock_limit() {
            debug!("Artifact exceeds memlock limit, not pinning");
            return None;
        }

        // SAFETY: mapping a file we hold open, length within its size
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return None;
        }

        // SAFETY: addr/len describe the mapping created above
        if unsafe { libc::mlock(addr, len) } != 0 {
            debug!("mlock refused, artifact stays unpinned");
            unsafe {
                libc::munmap(addr, len);
            }
            return None;
        }

        Some(Self { addr, len })
    }
}

impl Drop for PinnedPages {
    fn drop(&mut self) {
        // SAFETY: addr/len come from a successful mmap + mlock
        unsafe {
            libc::munlock(self.addr, self.len);
            libc::munmap(self.addr, self.len);
        }
    }
}

fn memlock_limit() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the struct we own
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut limit) } != 0 {
        return 0;
    }
    if limit.rlim_cur == libc::RLIM_INFINITY {
        return usize::MAX;
    }
    usize::try_from(limit.rlim_cur).unwrap_or(usize::MAX)
}

/// Atomically replace `path` with `bytes`, created with `mode`
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut temp = tempfile::Builder::new()
        .prefix(".nakimi-")
        .permissions(fs::Permissions::from_mode(mode))
        .tempfile_in(dir)?;
    temp.as_file().set_permissions(fs::Permissions::from_mode(mode))?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
