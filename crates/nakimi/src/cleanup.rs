//! Process-wide cleanup registry
//!
//! Every live plaintext artifact and every running child tool is recorded
//! here. Artifact guards remove themselves on normal release; a termination
//! signal purges whatever is still registered before the process exits.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, info, warn};

use crate::storage::{destroy_path, ArtifactKind, Medium};

#[derive(Debug, Clone)]
struct LiveArtifact {
    path: PathBuf,
    medium: Medium,
}

/// Registry of live artifacts and child processes
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    artifacts: Mutex<BTreeMap<(String, ArtifactKind), LiveArtifact>>,
    children: Mutex<BTreeSet<u32>>,
    /// Held for the whole of every file destruction
    destroying: Mutex<()>,
    purging: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic elsewhere must not stop cleanup
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry consulted by the signal handler
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<CleanupRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Self::new())).clone()
    }

    pub fn contains(&self, session_id: &str, kind: ArtifactKind) -> bool {
        lock(&self.artifacts).contains_key(&(session_id.to_string(), kind))
    }

    /// Record a live artifact. Returns false if the slot is already taken.
    pub(crate) fn register(
        &self,
        session_id: &str,
        kind: ArtifactKind,
        path: PathBuf,
        medium: Medium,
    ) -> bool {
        let mut artifacts = lock(&self.artifacts);
        let key = (session_id.to_string(), kind);
        if artifacts.contains_key(&key) {
            return false;
        }
        artifacts.insert(key, LiveArtifact { path, medium });
        true
    }

    /// Drop an entry without touching its file. Returns whether it was still registered.
    pub(crate) fn release(&self, session_id: &str, kind: ArtifactKind) -> bool {
        lock(&self.artifacts)
            .remove(&(session_id.to_string(), kind))
            .is_some()
    }

    /// Claim an entry and destroy its file.
    ///
    /// Returns `Ok(false)` when someone else (a purge) claimed it first. A
    /// failed destruction puts the entry back so a purge can retry it.
    pub(crate) fn destroy_claimed(&self, session_id: &str, kind: ArtifactKind) -> std::io::Result<bool> {
        let _serial = lock(&self.destroying);
        let key = (session_id.to_string(), kind);
        let Some(artifact) = lock(&self.artifacts).remove(&key) else {
            return Ok(false);
        };

        match destroy_path(&artifact.path, artifact.medium) {
            Ok(()) => Ok(true),
            Err(e) => {
                lock(&self.artifacts).insert(key, artifact);
                Err(e)
            }
        }
    }

    /// Session id of any live artifact of `kind`
    pub fn live_session(&self, kind: ArtifactKind) -> Option<String> {
        lock(&self.artifacts)
            .keys()
            .find(|(_, k)| *k == kind)
            .map(|(id, _)| id.clone())
    }

    /// Whether a purge has begun; the process is about to exit
    pub fn is_purging(&self) -> bool {
        self.purging.load(Ordering::SeqCst)
    }

    /// Paths of every artifact still registered
    pub fn live_paths(&self) -> Vec<PathBuf> {
        lock(&self.artifacts)
            .values()
            .map(|a| a.path.clone())
            .collect()
    }

    pub fn track_child(&self, pid: u32) {
        lock(&self.children).insert(pid);
    }

    pub fn untrack_child(&self, pid: u32) {
        lock(&self.children).remove(&pid);
    }

    /// Kill tracked children and destroy every registered artifact.
    ///
    /// Returns the number of artifacts destroyed.
    pub fn purge(&self) -> usize {
        self.purging.store(true, Ordering::SeqCst);

        for pid in std::mem::take(&mut *lock(&self.children)) {
            debug!("Killing child process {}", pid);
            let Ok(pid) = libc::pid_t::try_from(pid) else {
                continue;
            };
            // SAFETY: plain syscall on a pid we spawned; failure is harmless
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }

        // Waits out a destruction already in flight on another thread
        let _serial = lock(&self.destroying);
        let artifacts = std::mem::take(&mut *lock(&self.artifacts));
        let mut destroyed = 0;
        for ((session_id, kind), artifact) in artifacts {
            match destroy_path(&artifact.path, artifact.medium) {
                Ok(()) => {
                    debug!("Destroyed {:?} artifact of session {}", kind, session_id);
                    destroyed += 1;
                }
                Err(e) => warn!(
                    "Failed to destroy {}: {}",
                    artifact.path.display(),
                    e
                ),
            }
        }
        destroyed
    }
}

struct TerminationSignals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
    quit: Signal,
}

impl TerminationSignals {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) -> i32 {
        tokio::select! {
            _ = self.interrupt.recv() => libc::SIGINT,
            _ = self.terminate.recv() => libc::SIGTERM,
            _ = self.hangup.recv() => libc::SIGHUP,
            _ = self.quit.recv() => libc::SIGQUIT,
        }
    }
}

/// Route SIGINT, SIGTERM, SIGHUP and SIGQUIT through `registry.purge()`.
///
/// Handlers are registered before this returns; a background thread waits
/// for the first signal, purges, and exits with `128 + signo`. Installing
/// twice is a no-op.
pub fn install_signal_handlers(registry: Arc<CleanupRegistry>) -> std::io::Result<()> {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let mut signals = runtime.block_on(async { TerminationSignals::new() })?;

    std::thread::Builder::new()
        .name("nakimi-signals".to_string())
        .spawn(move || {
            let signo = runtime.block_on(signals.recv());
            info!("Received signal {}, destroying live artifacts", signo);
            let destroyed = registry.purge();
            debug!("Purged {} artifact(s)", destroyed);
            std::process::exit(128 + signo);
        })?;

    let _ = INSTALLED.set(());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_register_is_unique_per_session_and_kind() {
        let registry = CleanupRegistry::new();
        let path = PathBuf::from("/nonexistent/a");

        assert!(registry.register("s1", ArtifactKind::Credentials, path.clone(), Medium::RamBacked));
        assert!(!registry.register("s1", ArtifactKind::Credentials, path.clone(), Medium::RamBacked));
        assert!(registry.register("s1", ArtifactKind::Identity, path.clone(), Medium::RamBacked));
        assert!(registry.register("s2", ArtifactKind::Credentials, path, Medium::RamBacked));

        assert!(registry.release("s1", ArtifactKind::Credentials));
        assert!(!registry.release("s1", ArtifactKind::Credentials));
        assert!(!registry.contains("s1", ArtifactKind::Credentials));
        assert!(registry.contains("s1", ArtifactKind::Identity));
        assert_eq!(
            registry.live_session(ArtifactKind::Identity),
            Some("s1".to_string())
        );
    }

    #[test]
    fn test_destroy_claimed_only_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nakimi-secrets-once.json");
        fs::write(&path, b"{}").unwrap();

        let registry = CleanupRegistry::new();
        registry.register("a", ArtifactKind::Credentials, path.clone(), Medium::PhysicalFallback);

        assert!(registry.destroy_claimed("a", ArtifactKind::Credentials).unwrap());
        assert!(!path.exists());
        assert!(!registry.destroy_claimed("a", ArtifactKind::Credentials).unwrap());
        assert_eq!(registry.purge(), 0);
    }

    #[test]
    fn test_purge_then_claim_finds_nothing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nakimi-secrets-raced.json");
        fs::write(&path, b"{}").unwrap();

        let registry = Arc::new(CleanupRegistry::new());
        registry.register("a", ArtifactKind::Credentials, path.clone(), Medium::PhysicalFallback);
        assert!(!registry.is_purging());

        let purger = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.purge())
        };
        let destroyed = purger.join().unwrap();

        assert_eq!(destroyed, 1);
        assert!(registry.is_purging());
        assert!(!registry.destroy_claimed("a", ArtifactKind::Credentials).unwrap());
        assert!(!path.exists());
        assert!(registry.live_session(ArtifactKind::Credentials).is_none());
    }

    #[test]
    fn test_purge_destroys_registered_files() {
        let tmp = TempDir::new().unwrap();
        let first = tmp.path().join("nakimi-secrets-one.json");
        let second = tmp.path().join("nakimi-key-two.txt");
        fs::write(&first, b"{}").unwrap();
        fs::write(&second, b"AGE-SECRET-KEY-1").unwrap();

        let registry = CleanupRegistry::new();
        registry.register("a", ArtifactKind::Credentials, first.clone(), Medium::RamBacked);
        registry.register("a", ArtifactKind::Identity, second.clone(), Medium::PhysicalFallback);
        // Already gone: purge must not fail on it
        registry.register(
            "b",
            ArtifactKind::Credentials,
            tmp.path().join("missing"),
            Medium::RamBacked,
        );

        assert_eq!(registry.purge(), 3);
        assert!(!first.exists());
        assert!(!second.exists());
        assert!(registry.live_paths().is_empty());

        // Idempotent
        assert_eq!(registry.purge(), 0);
    }

    #[test]
    fn test_install_signal_handlers_twice() {
        let registry = Arc::new(CleanupRegistry::new());
        install_signal_handlers(registry.clone()).unwrap();
        install_signal_handlers(registry).unwrap();
    }
}
