//! VM record → QEMU command line.
//!
//! ## Argument order
//!
//! ```text
//! -accel <backend> -m <mb> [-cpu <model>] [-hda <disk>] [-cdrom <iso>]
//! -boot menu=on -vga std -usb -device usb-tablet -name <name>
//! [-net nic -net user]
//! [-audiodev <audio>,id=snd0 -device ich9-intel-hda -device hda-output,audiodev=snd0]
//! [-vnc :<port - 5900>[,password=on]]
//! -display <display> -monitor stdio
//! ```
//!
//! Every flag is immediately followed by its values. Nothing here touches the
//! filesystem or spawns processes.

use std::path::PathBuf;

use super::host::HostCapabilities;
use super::{Accelerator, VmRecord};
use crate::error::Result;

/// A resolved program plus the arguments to run it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Shell-like rendering for logs and `--dry-run` output.
    pub fn display_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

// ---------------------------------------------------------------------------
// Accelerator policy
// ---------------------------------------------------------------------------

/// Pick the backend for `record` before platform correction.
fn requested_accelerator(record: &VmRecord, host: &HostCapabilities) -> Accelerator {
    if record.accel_override && record.accelerator != Accelerator::Default {
        record.accelerator
    } else {
        host.preferred_accelerator()
    }
}

/// Replace a backend the host platform cannot use.
///
/// A hardware backend from another platform (e.g. `whpx` on Linux) becomes
/// the host's native backend if virtualization is available, else `tcg`.
/// Backends valid on the host pass through unchanged, so applying this twice
/// is the same as applying it once.
pub fn correct_accelerator(accel: Accelerator, host: &HostCapabilities) -> Accelerator {
    if host.profile.supports(accel) {
        accel
    } else {
        host.preferred_accelerator()
    }
}

/// The backend `compile` will emit for `record` on `host`.
pub fn resolve_accelerator(record: &VmRecord, host: &HostCapabilities) -> Accelerator {
    correct_accelerator(requested_accelerator(record, host), host)
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QemuArgs(Vec<String>);

impl QemuArgs {
    fn flag(&mut self, flag: &str) {
        self.0.push(flag.to_string());
    }

    fn pair(&mut self, flag: &str, value: &str) {
        self.0.push(flag.to_string());
        self.0.push(value.to_string());
    }
}

/// Build the QEMU argument vector for `record`.
///
/// Fails with [`QmgrError::Validation`](crate::error::QmgrError::Validation)
/// when the record is not launchable (primary disk enabled without a disk
/// path, blank name, memory or VNC port out of range).
pub fn compile(record: &VmRecord, host: &HostCapabilities) -> Result<Vec<String>> {
    record.validate()?;

    let profile = &host.profile;
    let mut args = QemuArgs::default();

    args.pair("-accel", resolve_accelerator(record, host).as_str());
    args.pair("-m", &record.memory_mb.to_string());

    let cpu = record.cpu.trim();
    if !cpu.is_empty() {
        args.pair("-cpu", cpu);
    }

    if record.primary_disk {
        args.pair("-hda", &record.disk);
    }
    if !record.iso.is_empty() {
        args.pair("-cdrom", &record.iso);
    }

    args.pair("-boot", "menu=on");
    args.pair("-vga", "std");
    args.flag("-usb");
    args.pair("-device", "usb-tablet");
    args.pair("-name", &record.name);

    if record.network {
        args.pair("-net", "nic");
        args.pair("-net", "user");
    }

    if record.audio {
        args.pair("-audiodev", &format!("{},id=snd0", profile.audio_backend));
        args.pair("-device", "ich9-intel-hda");
        args.pair("-device", "hda-output,audiodev=snd0");
    }

    if record.vnc {
        let mut display = format!(":{}", record.vnc_display());
        if record.vnc_password {
            display.push_str(",password=on");
        }
        args.pair("-vnc", &display);
    }

    args.pair("-display", profile.display_backend);
    args.pair("-monitor", "stdio");

    Ok(args.0)
}
