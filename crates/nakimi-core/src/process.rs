//! External tool lookup

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Resolve a tool to an executable path.
///
/// Names containing a path separator are taken as-is and must exist;
/// bare names are searched on `PATH`.
pub fn locate(tool: &Path) -> Option<PathBuf> {
    if tool.components().count() > 1 || tool.is_absolute() {
        return tool.is_file().then(|| tool.to_path_buf());
    }

    which::which(tool).ok()
}

/// Check that a tool exists and answers `--version` successfully
pub fn is_installed(tool: &str) -> bool {
    let Some(path) = locate(Path::new(tool)) else {
        tracing::debug!("{} not found on PATH", tool);
        return false;
    };

    Command::new(path)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
