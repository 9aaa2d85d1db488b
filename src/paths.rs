//! Directory layout for jit-launcher.
//!
//! - Config: `~/.config/jit-launcher/` (holds `launcher.toml`)
//! - State:  `~/Library/Application Support/<bundle id>/` on Apple platforms,
//!   `$XDG_STATE_HOME/jit-launcher/` elsewhere (holds the instant-boot marker)
//! - Logs:   `~/Library/Logs/jit-launcher/` or `$XDG_STATE_HOME/jit-launcher/logs/`

use std::path::{Path, PathBuf};
use tracing::info;

#[cfg(target_vendor = "apple")]
const BUNDLE_ID: &str = "org.jit-launcher";
const APP_NAME: &str = "jit-launcher";

const CONFIG_FILE: &str = "launcher.toml";
const SLOT_FILE: &str = "instant_boot_slot";

/// All resolved directories.
#[derive(Debug, Clone)]
pub struct LauncherPaths {
    pub config: PathBuf,
    pub state: PathBuf,
    pub logs: PathBuf,
}

impl LauncherPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create anything; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        Some(Self {
            config: resolve_config_dir(&home),
            state: resolve_state_dir(&home),
            logs: resolve_log_dir(&home),
        })
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.state, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE)
    }

    /// Marker recording which instant-boot slot to resume from.
    pub fn slot_file(&self) -> PathBuf {
        self.state.join(SLOT_FILE)
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_vendor = "apple")]
fn resolve_state_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(target_vendor = "apple"))]
fn resolve_state_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("state").join(APP_NAME)
    }
}

#[cfg(target_vendor = "apple")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_vendor = "apple"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    resolve_state_dir(home).join("logs")
}
