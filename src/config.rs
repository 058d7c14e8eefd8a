//! User configuration, read from `config.toml`.
//!
//! Every section is optional and every key falls back to the value of the
//! section's `Default` impl:
//!
//! ```toml
//! [tools]
//! qemu = "/opt/qemu/bin/qemu-system-x86_64"
//! qemu_img = "/opt/qemu/bin/qemu-img"
//!
//! [storage]
//! database = "/srv/qmgr/database.toml"
//! work_dir = "/srv/qmgr/vms"
//!
//! [supervisor]
//! kill_timeout_secs = 5
//!
//! [host]
//! virtualization = "auto"   # "auto", "on" or "off"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{QmgrError, Result};
use crate::paths::QmgrPaths;
use crate::vm::{HostCapabilities, HostPlatform};

pub const QEMU_BINARY: &str = "qemu-system-x86_64";
pub const QEMU_IMG_BINARY: &str = "qemu-img";

/// Root configuration container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QmgrConfig {
    pub tools: ToolsConfig,
    pub storage: StorageConfig,
    pub supervisor: SupervisorConfig,
    pub host: HostConfig,
}

// --- Sections ---

/// Explicit executable locations. Unset entries are looked up on `PATH`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub qemu: Option<PathBuf>,
    pub qemu_img: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file; defaults to `<data dir>/database.toml`.
    pub database: Option<PathBuf>,
    /// Where imported disk and ISO files are copied; defaults to `<data dir>/vms`.
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub kill_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            kill_timeout_secs: 5,
        }
    }
}

impl SupervisorConfig {
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub virtualization: VirtualizationMode,
}

/// Whether to trust the hardware virtualization probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtualizationMode {
    #[default]
    Auto,
    On,
    Off,
}

impl HostConfig {
    /// Host capabilities for this process, probing only in `auto` mode.
    pub fn capabilities(&self) -> HostCapabilities {
        match self.virtualization {
            VirtualizationMode::Auto => HostCapabilities::detect(),
            VirtualizationMode::On => HostCapabilities::new(HostPlatform::current(), true),
            VirtualizationMode::Off => HostCapabilities::new(HostPlatform::current(), false),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl QmgrConfig {
    /// Read `path`. A missing file yields the defaults; a malformed one is an
    /// error.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(QmgrError::io(path, e)),
        };
        let config: Self =
            toml::from_str(&text).map_err(|e| QmgrError::parse(path.display().to_string(), e))?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn database_path(&self, paths: &QmgrPaths) -> PathBuf {
        self.storage
            .database
            .clone()
            .unwrap_or_else(|| paths.database())
    }

    pub fn work_dir(&self, paths: &QmgrPaths) -> PathBuf {
        self.storage
            .work_dir
            .clone()
            .unwrap_or_else(|| paths.vms.clone())
    }
}

// ---------------------------------------------------------------------------
// Tool resolution
// ---------------------------------------------------------------------------

/// Resolved locations of the external executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub qemu: PathBuf,
    pub qemu_img: PathBuf,
}

impl ToolPaths {
    /// Config override, then `PATH`, then the platform's default install
    /// location, then the bare name (so the spawn error names the tool).
    pub fn resolve(tools: &ToolsConfig) -> Self {
        Self {
            qemu: resolve_tool(tools.qemu.as_deref(), QEMU_BINARY),
            qemu_img: resolve_tool(tools.qemu_img.as_deref(), QEMU_IMG_BINARY),
        }
    }
}

fn resolve_tool(configured: Option<&Path>, binary: &str) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    if let Ok(found) = which::which(binary) {
        debug!(tool = binary, path = %found.display(), "found on PATH");
        return found;
    }
    if let Some(installed) = default_install_path(binary).filter(|p| p.is_file()) {
        return installed;
    }
    PathBuf::from(binary)
}

#[cfg(windows)]
fn default_install_path(binary: &str) -> Option<PathBuf> {
    Some(PathBuf::from(r"C:\Program Files\qemu").join(format!("{binary}.exe")))
}

#[cfg(target_os = "macos")]
fn default_install_path(binary: &str) -> Option<PathBuf> {
    Some(PathBuf::from("/opt/homebrew/bin").join(binary))
}

#[cfg(not(any(windows, target_os = "macos")))]
fn default_install_path(binary: &str) -> Option<PathBuf> {
    Some(PathBuf::from("/usr/bin").join(binary))
}
