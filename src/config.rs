//! Server configuration and on-disk state layout.
//!
//! Tapgate keeps a small state directory:
//!
//! ```text
//! <state-dir>/
//!   vapid.json        VAPID keypair (0600)
//!   pairings/         one JSON file per pairing record (0600)
//! ```
//!
//! The directory defaults to the platform config dir and can be overridden
//! with `--state-dir` or `TAPGATE_STATE_DIR` (useful for tests and
//! containers).

use anyhow::{Context, Result};
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Runtime configuration for the tapgate server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address the HTTP listener binds.
    pub bind: SocketAddr,
    /// Directory holding VAPID keys and pairing records.
    pub state_dir: PathBuf,
    /// VAPID contact URI sent to push services (`mailto:` or `https:`).
    pub subject: String,
}

impl ServerConfig {
    /// Path of the persisted VAPID keypair.
    pub fn vapid_path(&self) -> PathBuf {
        self.state_dir.join("vapid.json")
    }
}

/// Resolve the state directory.
///
/// Priority: explicit argument, `TAPGATE_STATE_DIR`, then the platform
/// config dir (`~/.config/tapgate` on Linux). The directory is created
/// with owner-only permissions.
pub fn resolve_state_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
    let dir = if let Some(dir) = explicit {
        dir
    } else if let Ok(dir) = std::env::var("TAPGATE_STATE_DIR") {
        PathBuf::from(dir)
    } else {
        dirs::config_dir()
            .context("Could not determine config directory")?
            .join("tapgate")
    };

    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create state directory {}", dir.display()))?;

    #[cfg(unix)]
    {
        let perms = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(&dir, perms)
            .with_context(|| format!("Failed to set permissions on {}", dir.display()))?;
    }

    Ok(dir)
}

/// Write a file readable only by the owner, creating parent directories.
///
/// Used for everything that contains key material: VAPID keys and pairing
/// records.
pub fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}
