//! Command-line grammar and the command runner shared by the one-shot CLI and
//! the interactive shell.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::error::{OperationReport, Result};
use crate::manager::{DeleteOptions, VmManager};
use crate::store::VmStore;
use crate::vm::filesystem::DEFAULT_DISK_GB;
use crate::vm::lifecycle::ProcessInfo;
use crate::vm::{Accelerator, KillOutcome, RunState, VmRecord, parse_flag};

/// Manage local QEMU virtual machines
#[derive(Parser, Debug)]
#[command(name = "qmgr", version, about = "Manage local QEMU virtual machines")]
pub struct Cli {
    /// Config file (default: <config dir>/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// VM database file (overrides the config)
    #[arg(long, global = true, value_name = "FILE")]
    pub database: Option<PathBuf>,

    /// Log qmgr internals at debug level
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    #[command(flatten)]
    Vm(VmCommand),

    /// Interactive shell; launched VMs stay registered until killed or exit
    Shell,
}

/// Commands available both on the command line and in the shell.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum VmCommand {
    /// List stored VMs and whether they are running
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show one VM definition
    Show {
        name: String,
        #[arg(long)]
        json: bool,
    },

    /// Define a new VM
    Create {
        name: String,
        #[command(flatten)]
        fields: VmFields,
    },

    /// Change fields of an existing VM
    Edit {
        name: String,
        /// Give the VM a new name
        #[arg(long, value_name = "NEW_NAME")]
        rename: Option<String>,
        #[command(flatten)]
        fields: VmFields,
    },

    /// Rename a VM (a running VM keeps running under the new name)
    Rename { old: String, new: String },

    /// Remove a VM definition, killing it first if running
    Delete {
        name: String,
        /// Also delete the disk image file
        #[arg(long)]
        delete_disk: bool,
        /// Also delete the ISO file
        #[arg(long)]
        delete_iso: bool,
    },

    /// Start a VM
    Launch {
        name: String,
        /// Print the QEMU command line instead of running it
        #[arg(long)]
        dry_run: bool,
    },

    /// Create a QCOW2 disk image with qemu-img
    CreateDisk {
        path: PathBuf,
        /// Size in gigabytes (1-1024)
        #[arg(long, default_value_t = DEFAULT_DISK_GB)]
        size: u32,
    },

    /// Export a VM definition and its files into a folder
    Export { name: String, folder: PathBuf },

    /// Import every VM described by the sidecar files in a folder
    Import { folder: PathBuf },
}

/// Field flags for `create` and `edit`. Unset flags leave the field alone.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct VmFields {
    /// Disk image path
    #[arg(long)]
    pub disk: Option<String>,

    /// ISO image attached as CD-ROM ("" to detach)
    #[arg(long)]
    pub iso: Option<String>,

    /// Memory in MB (64-65536)
    #[arg(long = "memory", visible_alias = "mem", value_name = "MB")]
    pub memory_mb: Option<u32>,

    /// QEMU CPU model
    #[arg(long)]
    pub cpu: Option<String>,

    /// User-mode networking (on/off)
    #[arg(long = "net", value_name = "ON|OFF", value_parser = parse_switch)]
    pub network: Option<bool>,

    /// Audio device (on/off)
    #[arg(long, value_name = "ON|OFF", value_parser = parse_switch)]
    pub audio: Option<bool>,

    /// Attach the disk as primary hard drive (on/off)
    #[arg(long = "hda", value_name = "ON|OFF", value_parser = parse_switch)]
    pub primary_disk: Option<bool>,

    /// VNC display (on/off)
    #[arg(long, value_name = "ON|OFF", value_parser = parse_switch)]
    pub vnc: Option<bool>,

    /// VNC port (5900-5999)
    #[arg(long)]
    pub vnc_port: Option<u16>,

    /// Ask QEMU for a VNC password (on/off)
    #[arg(long, value_name = "ON|OFF", value_parser = parse_switch)]
    pub vnc_password: Option<bool>,

    /// Accelerator backend; anything but "default" also turns the override on
    #[arg(long, value_parser = parse_accelerator)]
    pub accel: Option<Accelerator>,

    /// Use the chosen accelerator instead of the host default (on/off)
    #[arg(long, value_name = "ON|OFF", value_parser = parse_switch)]
    pub accel_override: Option<bool>,

    /// Raw database-style assignments, applied last
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub assignments: Vec<String>,
}

fn parse_switch(value: &str) -> std::result::Result<bool, String> {
    parse_flag("value", value).map_err(|e| e.to_string())
}

fn parse_accelerator(value: &str) -> std::result::Result<Accelerator, String> {
    value.parse().map_err(|e: crate::error::QmgrError| e.to_string())
}

impl VmFields {
    /// Write the given flags into `record`.
    pub fn apply(&self, record: &mut VmRecord) -> Result<()> {
        if let Some(disk) = &self.disk {
            record.disk = disk.trim().to_string();
        }
        if let Some(iso) = &self.iso {
            record.iso = iso.trim().to_string();
        }
        if let Some(mb) = self.memory_mb {
            record.memory_mb = mb;
        }
        if let Some(cpu) = &self.cpu {
            record.cpu = cpu.trim().to_string();
        }
        if let Some(on) = self.network {
            record.network = on;
        }
        if let Some(on) = self.audio {
            record.audio = on;
        }
        if let Some(on) = self.primary_disk {
            record.primary_disk = on;
        }
        if let Some(on) = self.vnc {
            record.vnc = on;
        }
        if let Some(port) = self.vnc_port {
            record.vnc_port = port;
        }
        if let Some(on) = self.vnc_password {
            record.vnc_password = on;
        }
        if let Some(accel) = self.accel {
            record.accelerator = accel;
            record.accel_override = accel != Accelerator::Default;
        }
        if let Some(on) = self.accel_override {
            record.accel_override = on;
        }
        record.apply_assignments(self.assignments.iter().map(String::as_str))
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ShowJson<'a> {
    #[serde(flatten)]
    record: &'a VmRecord,
    state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    process: Option<ProcessInfo>,
}

/// Execute `command`, appending human-readable output to `out`.
///
/// `launch` returns as soon as QEMU has been created; callers that want to
/// stay in the foreground wait on the manager afterwards. A batch operation
/// with failures writes its report to `out` and then returns
/// [`QmgrError::PartialFailure`](crate::error::QmgrError::PartialFailure).
pub async fn run<S: VmStore>(
    manager: &mut VmManager<S>,
    command: VmCommand,
    out: &mut Vec<String>,
) -> Result<()> {
    match command {
        VmCommand::List { json } => {
            let summaries = manager.list()?;
            if json {
                out.push(to_json(&summaries));
            } else if summaries.is_empty() {
                out.push("no VMs defined".into());
            } else {
                for vm in summaries {
                    out.push(format!("{:<32} {}", vm.name, vm.state));
                }
            }
        }

        VmCommand::Show { name, json } => {
            let record = manager.get(&name)?;
            let process = manager.process_info(&name);
            let state = if process.is_some() {
                RunState::Running
            } else {
                RunState::NotRunning
            };
            if json {
                out.push(to_json(&ShowJson {
                    record: &record,
                    state,
                    process,
                }));
            } else {
                out.extend(describe(&record));
                match process {
                    Some(info) => out.push(format!(
                        "  {:<16} running (pid {}, since {})",
                        "state",
                        info.pid.map_or_else(|| "?".to_string(), |p| p.to_string()),
                        info.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    )),
                    None => out.push(format!("  {:<16} {}", "state", state)),
                }
            }
        }

        VmCommand::Create { name, fields } => {
            let mut record = VmRecord::named(name.trim());
            fields.apply(&mut record)?;
            manager.create(&record)?;
            out.push(format!("created {}", record.name));
        }

        VmCommand::Edit {
            name,
            rename,
            fields,
        } => {
            let mut record = manager.get(&name)?;
            fields.apply(&mut record)?;
            if let Some(new_name) = rename {
                record.name = new_name.trim().to_string();
            }
            manager.update(&name, &record)?;
            if record.name == name {
                out.push(format!("updated {name}"));
            } else {
                out.push(format!("updated {name} (now {})", record.name));
            }
        }

        VmCommand::Rename { old, new } => {
            let new = new.trim();
            manager.rename(&old, new)?;
            out.push(format!("renamed {old} to {new}"));
        }

        VmCommand::Delete {
            name,
            delete_disk,
            delete_iso,
        } => {
            let options = DeleteOptions {
                disk: delete_disk,
                iso: delete_iso,
            };
            let report = manager.delete(&name, options).await?;
            finish_report(report, out)?;
        }

        VmCommand::Launch { name, dry_run } => {
            if dry_run {
                out.push(manager.launch_plan(&name)?.display_line());
            } else {
                let pid = manager.launch(&name)?;
                match pid {
                    Some(pid) => out.push(format!("launched {name} (pid {pid})")),
                    None => out.push(format!("launched {name}")),
                }
            }
        }

        VmCommand::CreateDisk { path, size } => {
            manager.create_disk(&path, size)?;
            out.push(format!("created {} ({size}G)", path.display()));
        }

        VmCommand::Export { name, folder } => {
            let report = manager.export(&name, &folder)?;
            finish_report(report, out)?;
        }

        VmCommand::Import { folder } => {
            let report = manager.import(&folder)?;
            finish_report(report, out)?;
        }
    }
    Ok(())
}

/// Text form of `kill`, shared by the shell and the foreground launch.
pub fn kill_message(name: &str, outcome: KillOutcome) -> String {
    match outcome {
        KillOutcome::NothingToDo => format!("{name} is not running"),
        KillOutcome::Terminated => format!("killed {name}"),
        KillOutcome::TimedOut => format!("sent kill to {name}; it did not exit in time"),
    }
}

fn describe(record: &VmRecord) -> Vec<String> {
    let flag = |on: bool| if on { "on" } else { "off" };
    let text = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };
    vec![
        record.name.clone(),
        format!("  {:<16} {}", "disk", text(&record.disk)),
        format!("  {:<16} {}", "iso", text(&record.iso)),
        format!("  {:<16} {} MB", "memory", record.memory_mb),
        format!("  {:<16} {}", "cpu", text(&record.cpu)),
        format!("  {:<16} {}", "network", flag(record.network)),
        format!("  {:<16} {}", "audio", flag(record.audio)),
        format!("  {:<16} {}", "primary disk", flag(record.primary_disk)),
        format!(
            "  {:<16} {} (port {}{})",
            "vnc",
            flag(record.vnc),
            record.vnc_port,
            if record.vnc_password { ", password" } else { "" }
        ),
        format!(
            "  {:<16} {}{}",
            "accelerator",
            record.accelerator,
            if record.accel_override { " (override)" } else { "" }
        ),
    ]
}

fn finish_report(report: OperationReport, out: &mut Vec<String>) -> Result<()> {
    for item in &report.completed {
        out.push(format!("ok      {item}"));
    }
    for failure in &report.failures {
        out.push(format!("FAILED  {failure}"));
    }
    report.ensure_complete().map(|_| ())
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("qmgr").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn create_flags_parse_into_fields() {
        let cli = parse(&[
            "create",
            "vm1",
            "--disk",
            "/d/a.qcow2",
            "--mem",
            "2048",
            "--net",
            "off",
            "--accel",
            "kvm",
        ]);
        let Command::Vm(VmCommand::Create { name, fields }) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(name, "vm1");

        let mut record = VmRecord::named(name);
        fields.apply(&mut record).unwrap();
        assert_eq!(record.disk, "/d/a.qcow2");
        assert_eq!(record.memory_mb, 2048);
        assert!(!record.network);
        assert_eq!(record.accelerator, Accelerator::Kvm);
        assert!(record.accel_override);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = parse(&["list", "--json", "--database", "/tmp/db.toml", "--debug"]);
        assert!(cli.debug);
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/db.toml")));
        assert_eq!(cli.command, Command::Vm(VmCommand::List { json: true }));
    }

    #[test]
    fn bad_switch_is_rejected_by_parser() {
        let result = Cli::try_parse_from(["qmgr", "create", "vm1", "--audio", "maybe"]);
        assert!(result.is_err());
        let result = Cli::try_parse_from(["qmgr", "create", "vm1", "--accel", "xen"]);
        assert!(result.is_err());
    }

    #[test]
    fn set_assignments_apply_last() {
        let fields = VmFields {
            memory_mb: Some(1024),
            assignments: vec!["mem=512".into(), "vnc_pass=1".into()],
            ..VmFields::default()
        };
        let mut record = VmRecord::named("vm1");
        fields.apply(&mut record).unwrap();
        assert_eq!(record.memory_mb, 512);
        assert!(record.vnc_password);
    }

    #[test]
    fn default_accel_clears_override() {
        let fields = VmFields {
            accel: Some(Accelerator::Default),
            ..VmFields::default()
        };
        let mut record = VmRecord {
            accel_override: true,
            ..VmRecord::named("vm1")
        };
        fields.apply(&mut record).unwrap();
        assert!(!record.accel_override);
    }

    #[test]
    fn create_disk_defaults_to_ten_gigabytes() {
        let cli = parse(&["create-disk", "/vms/a.qcow2"]);
        assert_eq!(
            cli.command,
            Command::Vm(VmCommand::CreateDisk {
                path: PathBuf::from("/vms/a.qcow2"),
                size: 10,
            })
        );
    }

    #[test]
    fn describe_lists_every_field() {
        let lines = describe(&VmRecord::named("vm1"));
        assert_eq!(lines[0], "vm1");
        assert!(lines.iter().any(|l| l.contains("4096 MB")));
        assert!(lines.iter().any(|l| l.contains("accelerator") && l.contains("default")));
    }
}
