//! VM definitions and everything that acts on a single VM.
//!
//! Provides the typed [`VmRecord`], the launch compiler that turns a record
//! into QEMU arguments, host capability probing, the process supervisor that
//! owns running QEMU children, disk image helpers and the export/import
//! bundle format.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{QmgrError, Result};

pub mod bundle;
pub mod filesystem;
pub mod host;
pub mod launch;
pub mod lifecycle;

// ---------------------------------------------------------------------------
// Limits and defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_MEMORY_MB: u32 = 4096;
pub const MIN_MEMORY_MB: u32 = 64;
pub const MAX_MEMORY_MB: u32 = 65536;

/// QEMU's generic x86-64 CPU model.
pub const DEFAULT_CPU_MODEL: &str = "qemu64";

/// VNC display `:0` listens on this TCP port.
pub const VNC_BASE_PORT: u16 = 5900;
pub const VNC_MAX_PORT: u16 = 5999;

// ---------------------------------------------------------------------------
// Accelerator
// ---------------------------------------------------------------------------

/// Accelerator backend requested for a VM.
///
/// `Default` means "pick for me": the host's native hardware backend when
/// virtualization is available, otherwise `Tcg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    #[default]
    Default,
    /// Linux kernel virtual machine.
    Kvm,
    /// Windows Hypervisor Platform.
    Whpx,
    /// Intel HAXM (Windows).
    Hax,
    /// macOS Hypervisor.framework.
    Hvf,
    /// Software emulation.
    Tcg,
}

impl Accelerator {
    pub const ALL: [Accelerator; 6] = [
        Accelerator::Default,
        Accelerator::Kvm,
        Accelerator::Whpx,
        Accelerator::Hax,
        Accelerator::Hvf,
        Accelerator::Tcg,
    ];

    /// The value passed to QEMU's `-accel` flag.
    pub fn as_str(self) -> &'static str {
        match self {
            Accelerator::Default => "default",
            Accelerator::Kvm => "kvm",
            Accelerator::Whpx => "whpx",
            Accelerator::Hax => "hax",
            Accelerator::Hvf => "hvf",
            Accelerator::Tcg => "tcg",
        }
    }

    /// True for backends that need hardware virtualization support.
    pub fn is_hardware(self) -> bool {
        matches!(
            self,
            Accelerator::Kvm | Accelerator::Whpx | Accelerator::Hax | Accelerator::Hvf
        )
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Accelerator {
    type Err = QmgrError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Accelerator::ALL
            .into_iter()
            .find(|a| a.as_str() == wanted)
            .ok_or_else(|| {
                QmgrError::validation(format!(
                    "unknown accelerator '{s}' (expected default, kvm, whpx, hax, hvf or tcg)"
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// VmRecord
// ---------------------------------------------------------------------------

/// Desired launch shape of one virtual machine.
///
/// `name` is the identity: it keys the store section and the process
/// registry. Paths are kept as text because they round-trip through the
/// database and sidecar files verbatim; an empty string means "not set".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub disk: String,
    pub iso: String,
    pub memory_mb: u32,
    pub cpu: String,
    pub network: bool,
    pub audio: bool,
    /// Attach `disk` as the primary hard drive.
    pub primary_disk: bool,
    pub vnc: bool,
    pub vnc_port: u16,
    pub vnc_password: bool,
    pub accel_override: bool,
    pub accelerator: Accelerator,
}

impl Default for VmRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            disk: String::new(),
            iso: String::new(),
            memory_mb: DEFAULT_MEMORY_MB,
            cpu: DEFAULT_CPU_MODEL.to_string(),
            network: true,
            audio: false,
            primary_disk: true,
            vnc: false,
            vnc_port: VNC_BASE_PORT,
            vnc_password: false,
            accel_override: false,
            accelerator: Accelerator::Default,
        }
    }
}

impl VmRecord {
    /// A record with every field at its default.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// VNC display index (`port - 5900`).
    pub fn vnc_display(&self) -> u16 {
        self.vnc_port.saturating_sub(VNC_BASE_PORT)
    }

    /// Checks identity and numeric ranges. This is what the store enforces;
    /// a record passing it may still be unlaunchable.
    pub fn validate_fields(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(QmgrError::validation("VM name is required"));
        }
        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&self.memory_mb) {
            return Err(QmgrError::validation(format!(
                "memory must be between {MIN_MEMORY_MB} and {MAX_MEMORY_MB} MB, got {}",
                self.memory_mb
            )));
        }
        if !(VNC_BASE_PORT..=VNC_MAX_PORT).contains(&self.vnc_port) {
            return Err(QmgrError::validation(format!(
                "VNC port must be between {VNC_BASE_PORT} and {VNC_MAX_PORT}, got {}",
                self.vnc_port
            )));
        }
        Ok(())
    }

    /// Full validation applied on create, edit and launch.
    pub fn validate(&self) -> Result<()> {
        self.validate_fields()?;
        if self.primary_disk && self.disk.trim().is_empty() {
            return Err(QmgrError::validation(format!(
                "VM '{}': disk image required for primary HDD",
                self.name
            )));
        }
        Ok(())
    }

    /// Set one field from its textual `key` / `value` form.
    ///
    /// Keys are the database key names (`disk`, `iso`, `mem`, `cpu`, `net`,
    /// `audio`, `hda`, `vnc`, `vnc_port`, `vnc_pass`, `accel_override`,
    /// `accel_type`). The name is not settable here.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "disk" => self.disk = value.trim().to_string(),
            "iso" => self.iso = value.trim().to_string(),
            "mem" | "memory" => self.memory_mb = parse_number(key, value)?,
            "cpu" => self.cpu = value.trim().to_string(),
            "net" | "network" => self.network = parse_flag(key, value)?,
            "audio" => self.audio = parse_flag(key, value)?,
            "hda" => self.primary_disk = parse_flag(key, value)?,
            "vnc" => self.vnc = parse_flag(key, value)?,
            "vnc_port" => self.vnc_port = parse_number(key, value)?,
            "vnc_pass" => self.vnc_password = parse_flag(key, value)?,
            "accel_override" => self.accel_override = parse_flag(key, value)?,
            "accel_type" | "accel" => self.accelerator = value.parse()?,
            other => {
                return Err(QmgrError::validation(format!("unknown field '{other}'")));
            }
        }
        Ok(())
    }

    /// Apply `key=value` assignments, e.g. from the interactive shell.
    pub fn apply_assignments<'a>(
        &mut self,
        assignments: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        for assignment in assignments {
            let (key, value) = assignment.split_once('=').ok_or_else(|| {
                QmgrError::validation(format!("expected key=value, got '{assignment}'"))
            })?;
            self.set_field(key.trim(), value)?;
        }
        Ok(())
    }
}

/// Parse a boolean as written by people and by older databases.
pub fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => Err(QmgrError::validation(format!(
            "{key}: expected a boolean (1/0, on/off), got '{other}'"
        ))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| QmgrError::validation(format!("{key}: expected a number, got '{value}'")))
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use host::{HostCapabilities, HostPlatform, PlatformProfile};
pub use launch::{LaunchCommand, compile, correct_accelerator, resolve_accelerator};
pub use lifecycle::{KillOutcome, ProcessSupervisor, RunState};
