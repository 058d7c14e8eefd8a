//! qmgr: command-line front end.
//!
//! One-shot subcommands operate on the VM database and exit. `launch` stays in
//! the foreground until QEMU exits; Ctrl-C kills the VM. `shell` keeps
//! launched VMs registered across commands.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

use qmgr::cli::{self, Cli, Command, VmCommand};
use qmgr::config::{QmgrConfig, ToolPaths};
use qmgr::paths::QmgrPaths;
use qmgr::shell::Shell;
use qmgr::store::FileStore;
use qmgr::vm::ProcessSupervisor;
use qmgr::{VmManager, logging};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = QmgrPaths::resolve().context("cannot determine the home directory")?;
    let _log_guard = logging::init(cli.debug, &paths.logs);

    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    let config = QmgrConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    paths
        .ensure()
        .with_context(|| format!("creating {}", paths.data.display()))?;

    let database = cli
        .database
        .clone()
        .unwrap_or_else(|| config.database_path(&paths));
    let manager = VmManager::new(
        FileStore::open(database),
        ProcessSupervisor::new(config.supervisor.kill_timeout()),
        config.host.capabilities(),
        ToolPaths::resolve(&config.tools),
        config.work_dir(&paths),
    );

    match cli.command {
        Command::Shell => {
            Shell::new(manager).run().await;
            Ok(())
        }
        Command::Vm(command) => run_once(manager, command).await,
    }
}

async fn run_once(mut manager: VmManager<FileStore>, command: VmCommand) -> Result<()> {
    let foreground = match &command {
        VmCommand::Launch {
            name,
            dry_run: false,
        } => Some(name.clone()),
        _ => None,
    };

    let mut out = Vec::new();
    let result = cli::run(&mut manager, command, &mut out).await;
    for line in &out {
        println!("{line}");
    }
    result?;

    if let Some(name) = foreground {
        wait_in_foreground(&mut manager, &name).await?;
    }
    Ok(())
}

/// Block until the VM exits, killing it on Ctrl-C.
async fn wait_in_foreground(manager: &mut VmManager<FileStore>, name: &str) -> Result<()> {
    let exited = tokio::select! {
        status = manager.wait(name) => Some(status),
        _ = tokio::signal::ctrl_c() => None,
    };

    match exited {
        Some(status) => {
            let status = status?;
            debug!(vm = name, ?status, "foreground VM finished");
            match status {
                Some(status) if !status.success() => println!("{name} exited with {status}"),
                _ => println!("{name} exited"),
            }
        }
        None => {
            let outcome = manager.kill(name).await?;
            println!("{}", cli::kill_message(name, outcome));
        }
    }
    Ok(())
}
