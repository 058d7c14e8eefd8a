//! Application directory structure for qmgr.
//!
//! [`QmgrPaths`] resolves the standard directories; nothing is created until
//! [`QmgrPaths::ensure`] is called.
//!
//! - Config: `~/.config/qmgr/` (XDG), holds `config.toml`
//! - Data:   `~/.local/share/qmgr/` on Linux,
//!   `~/Library/Application Support/org.qmgr.qmgr/` on macOS,
//!   `%APPDATA%\qmgr\` on Windows. Holds `database.toml`.
//! - VMs:    `<data>/vms/`, the working area imported disk and ISO files are
//!   copied into
//! - Logs:   `<data>/logs/` (`~/Library/Logs/qmgr/` on macOS)

use std::path::{Path, PathBuf};

use tracing::debug;

#[cfg(target_os = "macos")]
const BUNDLE_ID: &str = "org.qmgr.qmgr";
const APP_NAME: &str = "qmgr";

pub const CONFIG_FILE: &str = "config.toml";
pub const DATABASE_FILE: &str = "database.toml";

/// All resolved application directory paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QmgrPaths {
    /// Human-editable config directory.
    pub config: PathBuf,
    /// Machine-managed application data root.
    pub data: PathBuf,
    /// Working area for VM disk and ISO files.
    pub vms: PathBuf,
    pub logs: PathBuf,
}

impl QmgrPaths {
    /// Resolve all paths from the user's home directory.
    pub fn resolve() -> Option<Self> {
        let home = home_dir()?;
        Some(Self::under(&home))
    }

    /// Resolve paths relative to an explicit home directory.
    pub fn under(home: &Path) -> Self {
        let data = resolve_data_dir(home);
        Self {
            config: resolve_config_dir(home),
            vms: data.join("vms"),
            logs: resolve_log_dir(home, &data),
            data,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE)
    }

    pub fn database(&self) -> PathBuf {
        self.data.join(DATABASE_FILE)
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.vms, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!(dir = %dir.display(), "ensured directory");
        }

        // Disk images are large and regenerable from bundles.
        #[cfg(target_os = "macos")]
        exclude_from_time_machine(&self.vms);

        Ok(())
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

#[cfg(not(windows))]
fn resolve_config_dir(home: &Path) -> PathBuf {
    match std::env::var_os("XDG_CONFIG_HOME") {
        Some(xdg) if !xdg.is_empty() => PathBuf::from(xdg).join(APP_NAME),
        _ => home.join(".config").join(APP_NAME),
    }
}

#[cfg(windows)]
fn resolve_config_dir(home: &Path) -> PathBuf {
    resolve_data_dir(home)
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(windows)]
fn resolve_data_dir(home: &Path) -> PathBuf {
    match std::env::var_os("APPDATA") {
        Some(appdata) if !appdata.is_empty() => PathBuf::from(appdata).join(APP_NAME),
        _ => home.join("AppData").join("Roaming").join(APP_NAME),
    }
}

#[cfg(not(any(target_os = "macos", windows)))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    match std::env::var_os("XDG_DATA_HOME") {
        Some(xdg) if !xdg.is_empty() => PathBuf::from(xdg).join(APP_NAME),
        _ => home.join(".local").join("share").join(APP_NAME),
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path, _data: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(_home: &Path, data: &Path) -> PathBuf {
    data.join("logs")
}

// ---------------------------------------------------------------------------
// Time Machine exclusion (macOS only)
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
fn exclude_from_time_machine(path: &Path) {
    use std::process::Command;
    use tracing::warn;
    match Command::new("tmutil")
        .args(["addexclusion", &path.to_string_lossy()])
        .output()
    {
        Ok(output) if output.status.success() => {
            debug!(dir = %path.display(), "excluded from Time Machine");
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(dir = %path.display(), stderr = %stderr.trim(), "tmutil addexclusion failed");
        }
        Err(e) => {
            warn!(dir = %path.display(), error = %e, "failed to run tmutil");
        }
    }
}
