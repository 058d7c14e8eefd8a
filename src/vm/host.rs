//! Host platform table and hardware virtualization probe.
//!
//! The launch compiler never branches on `cfg(target_os)` itself. Instead a
//! [`PlatformProfile`] is selected once at startup and carried, together with
//! the probe result, in [`HostCapabilities`]. Tests build capabilities for any
//! platform without running on it.

use std::fmt;

use tracing::debug;

use super::Accelerator;

/// Operating system family the VM monitor runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostPlatform {
    Linux,
    Windows,
    MacOs,
    Other,
}

impl HostPlatform {
    pub const ALL: [HostPlatform; 4] = [
        HostPlatform::Linux,
        HostPlatform::Windows,
        HostPlatform::MacOs,
        HostPlatform::Other,
    ];

    /// The platform this binary was built for.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => HostPlatform::Linux,
            "windows" => HostPlatform::Windows,
            "macos" => HostPlatform::MacOs,
            _ => HostPlatform::Other,
        }
    }

    pub fn profile(self) -> PlatformProfile {
        match self {
            HostPlatform::Linux => PlatformProfile {
                platform: self,
                hardware_accelerators: &[Accelerator::Kvm],
                native_accelerator: Some(Accelerator::Kvm),
                audio_backend: "pa",
                display_backend: "sdl",
            },
            HostPlatform::Windows => PlatformProfile {
                platform: self,
                hardware_accelerators: &[Accelerator::Whpx, Accelerator::Hax],
                native_accelerator: Some(Accelerator::Whpx),
                audio_backend: "dsound",
                display_backend: "sdl",
            },
            HostPlatform::MacOs => PlatformProfile {
                platform: self,
                hardware_accelerators: &[Accelerator::Hvf],
                native_accelerator: Some(Accelerator::Hvf),
                audio_backend: "coreaudio",
                display_backend: "cocoa",
            },
            HostPlatform::Other => PlatformProfile {
                platform: self,
                hardware_accelerators: &[],
                native_accelerator: None,
                audio_backend: "none",
                display_backend: "sdl",
            },
        }
    }
}

impl fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HostPlatform::Linux => "linux",
            HostPlatform::Windows => "windows",
            HostPlatform::MacOs => "macos",
            HostPlatform::Other => "other",
        })
    }
}

/// Per-platform launch defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformProfile {
    pub platform: HostPlatform,
    /// Hardware backends QEMU supports on this platform.
    pub hardware_accelerators: &'static [Accelerator],
    /// Backend used when virtualization is available and none is requested.
    pub native_accelerator: Option<Accelerator>,
    /// Value for `-audiodev <backend>,id=snd0`.
    pub audio_backend: &'static str,
    /// Value for `-display`.
    pub display_backend: &'static str,
}

impl PlatformProfile {
    /// Whether `accel` can be passed to QEMU on this platform.
    pub fn supports(&self, accel: Accelerator) -> bool {
        accel == Accelerator::Tcg || self.hardware_accelerators.contains(&accel)
    }
}

/// Everything the launch compiler needs to know about the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    pub profile: PlatformProfile,
    /// Hardware virtualization is usable on this host.
    pub virtualization: bool,
}

impl HostCapabilities {
    pub fn new(platform: HostPlatform, virtualization: bool) -> Self {
        Self {
            profile: platform.profile(),
            virtualization,
        }
    }

    /// Probe the running host.
    pub fn detect() -> Self {
        let platform = HostPlatform::current();
        let virtualization = probe_virtualization();
        debug!(%platform, virtualization, "probed host capabilities");
        Self::new(platform, virtualization)
    }

    /// The backend to use when nothing specific is requested.
    pub fn preferred_accelerator(&self) -> Accelerator {
        match self.profile.native_accelerator {
            Some(native) if self.virtualization => native,
            _ => Accelerator::Tcg,
        }
    }
}

// ---------------------------------------------------------------------------
// Virtualization probe
// ---------------------------------------------------------------------------

/// Presence of the KVM device node.
#[cfg(target_os = "linux")]
pub fn probe_virtualization() -> bool {
    std::path::Path::new("/dev/kvm").exists()
}

/// VMX (Intel) or SVM (AMD) CPUID feature bits.
#[cfg(all(windows, target_arch = "x86_64"))]
pub fn probe_virtualization() -> bool {
    let cpuid = raw_cpuid::CpuId::new();
    let vmx = cpuid.get_feature_info().is_some_and(|f| f.has_vmx());
    let svm = cpuid
        .get_extended_processor_and_feature_identifiers()
        .is_some_and(|f| f.has_svm());
    vmx || svm
}

/// `kern.hv_support` reports Hypervisor.framework availability.
#[cfg(target_os = "macos")]
pub fn probe_virtualization() -> bool {
    std::process::Command::new("sysctl")
        .args(["-n", "kern.hv_support"])
        .output()
        .map(|out| out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "1")
        .unwrap_or(false)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    all(windows, target_arch = "x86_64")
)))]
pub fn probe_virtualization() -> bool {
    false
}
