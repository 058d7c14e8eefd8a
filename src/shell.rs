//! Interactive shell.
//!
//! Reads one command per line from stdin. Accepts every CLI subcommand except
//! `shell`, plus `kill <name>`, `status [name]`, `help` and `exit`. VMs
//! launched here stay registered until killed; leaving the shell (`exit`,
//! end of input or Ctrl-C) kills all of them.
//!
//! Lines are split on whitespace, so VM names containing spaces can only be
//! managed from the one-shot CLI.

use std::io::Write;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::cli::{self, VmCommand};
use crate::manager::VmManager;
use crate::store::VmStore;
use crate::vm::RunState;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Output line styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellOutputKind {
    Info,
    Error,
}

#[derive(Parser, Debug)]
#[command(
    name = "qmgr",
    no_binary_name = true,
    disable_help_subcommand = true,
    disable_version_flag = true
)]
struct ShellLine {
    #[command(subcommand)]
    command: ShellCommand,
}

#[derive(Subcommand, Debug)]
enum ShellCommand {
    #[command(flatten)]
    Vm(VmCommand),

    /// Stop a running VM
    Kill { name: String },

    /// Run state of one VM, or of all running VMs
    Status { name: Option<String> },
}

/// Shell state: the manager plus the output produced by the last command.
pub struct Shell<S: VmStore> {
    manager: VmManager<S>,
    output: Vec<(String, ShellOutputKind)>,
    finished: bool,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl<S: VmStore> Shell<S> {
    pub fn new(manager: VmManager<S>) -> Self {
        Self {
            manager,
            output: Vec::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Drain the output of the commands executed so far.
    pub fn take_output(&mut self) -> Vec<(String, ShellOutputKind)> {
        std::mem::take(&mut self.output)
    }

    /// Run the read-eval-print loop on stdin until exit, then kill every
    /// VM started from the shell.
    pub async fn run(mut self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        self.push_info("qmgr shell, type `help` for commands");
        self.flush();

        while !self.finished {
            prompt();
            let next = tokio::select! {
                line = lines.next_line() => line,
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    Ok(None)
                }
            };
            match next {
                Ok(Some(line)) => self.execute(&line).await,
                Ok(None) => {
                    debug!("end of shell input");
                    break;
                }
                Err(e) => {
                    self.push_error(&format!("failed to read input: {e}"));
                    break;
                }
            }
            self.flush();
        }

        self.manager.shutdown().await;
        self.flush();
        info!("shell closed");
    }

    /// Execute one command line.
    pub async fn execute(&mut self, line: &str) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            return;
        }

        match parts[0] {
            "help" | "?" => self.cmd_help(),
            "exit" | "quit" => self.finished = true,
            _ => match ShellLine::try_parse_from(&parts) {
                Ok(parsed) => self.dispatch(parsed.command).await,
                Err(e) => self.push_error(e.to_string().trim_end()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

impl<S: VmStore> Shell<S> {
    async fn dispatch(&mut self, command: ShellCommand) {
        match command {
            ShellCommand::Vm(command) => {
                let mut out = Vec::new();
                let result = cli::run(&mut self.manager, command, &mut out).await;
                for line in out {
                    self.push_info(&line);
                }
                if let Err(e) = result {
                    self.push_error(&format!("error: {e}"));
                }
            }
            ShellCommand::Kill { name } => self.cmd_kill(&name).await,
            ShellCommand::Status { name } => self.cmd_status(name.as_deref()),
        }
    }

    fn cmd_help(&mut self) {
        let lines = [
            ("list", "Show all VMs and their state"),
            ("show <name>", "Show one VM definition"),
            ("create <name> [--disk ..]", "Define a VM (see `create --help`)"),
            ("edit <name> [--rename ..]", "Change a VM (see `edit --help`)"),
            ("rename <old> <new>", "Rename a VM, running or not"),
            ("delete <name>", "Remove a VM [--delete-disk] [--delete-iso]"),
            ("launch <name>", "Start a VM [--dry-run]"),
            ("kill <name>", "Stop a running VM"),
            ("status [name]", "Run state of one VM or all running VMs"),
            ("create-disk <path>", "Create a QCOW2 image [--size GB]"),
            ("export <name> <folder>", "Write a VM bundle"),
            ("import <folder>", "Read every VM bundle in a folder"),
            ("help", "Show this help"),
            ("exit", "Kill running VMs and leave"),
        ];
        self.push_info("Commands:");
        for (cmd, desc) in lines {
            self.push_info(&format!("  {cmd:<28} {desc}"));
        }
    }

    async fn cmd_kill(&mut self, name: &str) {
        match self.manager.kill(name).await {
            Ok(outcome) => self.push_info(&cli::kill_message(name, outcome)),
            Err(e) => self.push_error(&format!("error: {e}")),
        }
    }

    fn cmd_status(&mut self, name: Option<&str>) {
        match name {
            Some(name) => match self.manager.status(name) {
                Ok(state) => self.push_info(&format!("{name}: {state}")),
                Err(e) => self.push_error(&format!("error: {e}")),
            },
            None => match self.manager.list() {
                Ok(summaries) => {
                    let running: Vec<_> = summaries
                        .into_iter()
                        .filter(|vm| vm.state == RunState::Running)
                        .collect();
                    if running.is_empty() {
                        self.push_info("no VMs running");
                    }
                    for vm in running {
                        let pid = vm
                            .process
                            .and_then(|p| p.pid)
                            .map_or_else(|| "?".to_string(), |p| p.to_string());
                        self.push_info(&format!("{}: running (pid {pid})", vm.name));
                    }
                }
                Err(e) => self.push_error(&format!("error: {e}")),
            },
        }
    }

    fn push_info(&mut self, msg: &str) {
        self.output.push((msg.to_string(), ShellOutputKind::Info));
    }

    fn push_error(&mut self, msg: &str) {
        self.output.push((msg.to_string(), ShellOutputKind::Error));
    }

    fn flush(&mut self) {
        for (line, kind) in self.take_output() {
            match kind {
                ShellOutputKind::Info => println!("{line}"),
                ShellOutputKind::Error => eprintln!("{line}"),
            }
        }
    }
}

fn prompt() {
    let mut stdout = std::io::stdout();
    let _ = write!(stdout, "qmgr> ");
    let _ = stdout.flush();
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::config::ToolPaths;
    use crate::store::MemoryStore;
    use crate::vm::{HostCapabilities, HostPlatform, ProcessSupervisor};

    fn shell(qemu: &Path) -> (tempfile::TempDir, Shell<MemoryStore>) {
        let tmp = tempfile::tempdir().unwrap();
        let manager = VmManager::new(
            MemoryStore::new(),
            ProcessSupervisor::default(),
            HostCapabilities::new(HostPlatform::Linux, false),
            ToolPaths {
                qemu: qemu.to_path_buf(),
                qemu_img: PathBuf::from("/nonexistent/qemu-img"),
            },
            tmp.path().join("vms"),
        );
        (tmp, Shell::new(manager))
    }

    fn texts(output: &[(String, ShellOutputKind)]) -> Vec<&str> {
        output.iter().map(|(line, _)| line.as_str()).collect()
    }

    #[tokio::test]
    async fn execute_help() {
        let (_tmp, mut sh) = shell(Path::new("qemu"));
        sh.execute("help").await;
        assert!(sh.take_output().len() > 10);
    }

    #[tokio::test]
    async fn create_then_show() {
        let (_tmp, mut sh) = shell(Path::new("qemu"));
        sh.execute("create vm1 --disk /d/vm1.qcow2 --mem 1024").await;
        sh.execute("show vm1").await;

        let output = sh.take_output();
        assert!(output.iter().all(|(_, kind)| *kind == ShellOutputKind::Info));
        let lines = texts(&output);
        assert_eq!(lines[0], "created vm1");
        assert!(lines.iter().any(|l| l.contains("1024 MB")));
        assert!(lines.iter().any(|l| l.contains("stopped")));
    }

    #[tokio::test]
    async fn errors_do_not_end_the_shell() {
        let (_tmp, mut sh) = shell(Path::new("qemu"));
        sh.execute("show ghost").await;
        sh.execute("frobnicate").await;
        sh.execute("create nodisk").await;

        let output = sh.take_output();
        assert_eq!(output.len(), 3);
        assert!(output.iter().all(|(_, kind)| *kind == ShellOutputKind::Error));
        assert!(output[0].0.contains("no VM named 'ghost'"));
        assert!(!sh.is_finished());
    }

    #[tokio::test]
    async fn dry_run_prints_command_line() {
        let (_tmp, mut sh) = shell(Path::new("/usr/bin/qemu-system-x86_64"));
        sh.execute("create vm1 --disk /d/vm1.qcow2").await;
        sh.execute("launch vm1 --dry-run").await;

        let output = sh.take_output();
        let line = &output.last().unwrap().0;
        assert!(
            line.starts_with("/usr/bin/qemu-system-x86_64 -accel tcg -m 4096"),
            "{line}"
        );
    }

    #[tokio::test]
    async fn status_and_kill_without_processes() {
        let (_tmp, mut sh) = shell(Path::new("qemu"));
        sh.execute("create vm1 --disk /d/vm1.qcow2").await;
        sh.take_output();

        sh.execute("status").await;
        sh.execute("status vm1").await;
        sh.execute("kill vm1").await;
        let output = sh.take_output();
        assert_eq!(
            texts(&output),
            vec!["no VMs running", "vm1: stopped", "vm1 is not running"]
        );
    }

    #[tokio::test]
    async fn exit_finishes() {
        let (_tmp, mut sh) = shell(Path::new("qemu"));
        sh.execute("   ").await;
        assert!(!sh.is_finished());
        sh.execute("exit").await;
        assert!(sh.is_finished());
    }
}
