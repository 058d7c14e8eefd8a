//! The VM manager: validate → store → compile → spawn.
//!
//! [`VmManager`] owns a [`VmStore`], the [`ProcessSupervisor`], the host
//! capabilities and the tool paths. Both front ends drive it; it holds no
//! process-wide state, so tests build one over a [`MemoryStore`] and fake
//! executables.
//!
//! [`MemoryStore`]: crate::store::MemoryStore

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ToolPaths;
use crate::error::{OperationReport, QmgrError, Result};
use crate::store::VmStore;
use crate::vm::filesystem::{self, create_disk_image};
use crate::vm::lifecycle::ProcessInfo;
use crate::vm::{
    HostCapabilities, KillOutcome, LaunchCommand, ProcessSupervisor, RunState, VmRecord, bundle,
    compile,
};

/// Which files `delete` removes along with the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub disk: bool,
    pub iso: bool,
}

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmSummary {
    pub name: String,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,
}

pub struct VmManager<S: VmStore> {
    store: S,
    supervisor: ProcessSupervisor,
    host: HostCapabilities,
    tools: ToolPaths,
    work_dir: PathBuf,
}

impl<S: VmStore> VmManager<S> {
    pub fn new(
        store: S,
        supervisor: ProcessSupervisor,
        host: HostCapabilities,
        tools: ToolPaths,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        let work_dir = work_dir.into();
        debug!(
            platform = %host.profile.platform,
            virtualization = host.virtualization,
            qemu = %tools.qemu.display(),
            work_dir = %work_dir.display(),
            "VM manager ready"
        );
        Self {
            store,
            supervisor,
            host,
            tools,
            work_dir,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn host(&self) -> &HostCapabilities {
        &self.host
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    // --- Records ---

    /// Every stored VM with its run state, sorted by name.
    pub fn list(&mut self) -> Result<Vec<VmSummary>> {
        let names = self.store.list()?;
        Ok(names
            .into_iter()
            .map(|name| {
                let process = self.supervisor.info(&name);
                let state = if process.is_some() {
                    RunState::Running
                } else {
                    RunState::NotRunning
                };
                VmSummary {
                    name,
                    state,
                    process,
                }
            })
            .collect())
    }

    pub fn get(&self, name: &str) -> Result<VmRecord> {
        self.store.get(name)
    }

    /// Store a new VM. Nothing is written if validation fails or the name is
    /// taken.
    pub fn create(&mut self, record: &VmRecord) -> Result<()> {
        record.validate()?;
        if self.store.contains(&record.name)? {
            return Err(QmgrError::AlreadyExists(record.name.clone()));
        }
        self.store.put(record)?;
        info!(vm = %record.name, "created VM");
        Ok(())
    }

    /// Replace the VM stored as `current` with `record`, renaming it when
    /// `record.name` differs.
    pub fn update(&mut self, current: &str, record: &VmRecord) -> Result<()> {
        record.validate()?;
        self.check_name_free(current, &record.name)?;
        self.store.replace(current, record)?;
        self.supervisor.rekey(current, &record.name)?;
        info!(vm = %record.name, "updated VM");
        Ok(())
    }

    /// Rename a VM. A live process follows the record to its new name.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        self.check_name_free(old, new)?;
        self.store.rename(old, new)?;
        self.supervisor.rekey(old, new)?;
        Ok(())
    }

    /// A rename target must not have a live process of its own.
    fn check_name_free(&mut self, old: &str, new: &str) -> Result<()> {
        if old != new && self.supervisor.status(new) == RunState::Running {
            return Err(QmgrError::Conflict(new.to_string()));
        }
        Ok(())
    }

    /// Kill the VM if running, delete the selected files and remove the
    /// record. File failures are reported, the record is removed regardless.
    pub async fn delete(&mut self, name: &str, options: DeleteOptions) -> Result<OperationReport> {
        let record = self.store.get(name)?;

        let outcome = self.supervisor.kill(name).await?;
        if outcome != KillOutcome::NothingToDo {
            debug!(vm = name, ?outcome, "killed VM before delete");
        }

        let mut report = OperationReport::new();
        let selected = [(options.disk, &record.disk), (options.iso, &record.iso)];
        for (_, path) in selected.into_iter().filter(|(wanted, _)| *wanted) {
            if path.trim().is_empty() {
                continue;
            }
            let path = Path::new(path);
            if !path.exists() {
                debug!(path = %path.display(), "file already gone");
                continue;
            }
            match filesystem::remove_file(path) {
                Ok(()) => report.complete(path.display().to_string()),
                Err(e) => {
                    warn!(vm = name, error = %e, "could not delete VM file");
                    report.fail(path.display().to_string(), e);
                }
            }
        }

        self.store.remove(name)?;
        report.complete(name);
        info!(vm = name, failures = report.failures.len(), "deleted VM");
        Ok(report)
    }

    // --- Processes ---

    /// The command `launch` would run, without running it.
    pub fn launch_plan(&self, name: &str) -> Result<LaunchCommand> {
        let record = self.store.get(name)?;
        let args = compile(&record, &self.host)?;
        Ok(LaunchCommand::new(self.tools.qemu.clone(), args))
    }

    /// Start QEMU for `name`. Returns once the process exists.
    pub fn launch(&mut self, name: &str) -> Result<Option<u32>> {
        let command = self.launch_plan(name)?;
        debug!(vm = name, command = %command.display_line(), "launching");
        self.supervisor.start(name, &command)
    }

    pub async fn kill(&mut self, name: &str) -> Result<KillOutcome> {
        self.supervisor.kill(name).await
    }

    /// Run state of a stored VM.
    pub fn status(&mut self, name: &str) -> Result<RunState> {
        if !self.store.contains(name)? {
            return Err(QmgrError::NotFound(name.to_string()));
        }
        Ok(self.supervisor.status(name))
    }

    pub fn process_info(&mut self, name: &str) -> Option<ProcessInfo> {
        self.supervisor.info(name)
    }

    /// Wait for a launched VM to exit on its own.
    pub async fn wait(&mut self, name: &str) -> Result<Option<ExitStatus>> {
        self.supervisor.wait(name).await
    }

    /// Kill every running VM.
    pub async fn shutdown(&mut self) {
        let running = self.supervisor.running();
        if !running.is_empty() {
            info!(count = running.len(), "stopping running VMs");
        }
        self.supervisor.shutdown().await;
    }

    // --- Files ---

    pub fn create_disk(&self, path: &Path, size_gb: u32) -> Result<()> {
        create_disk_image(&self.tools.qemu_img, path, size_gb)
    }

    pub fn export(&self, name: &str, folder: &Path) -> Result<OperationReport> {
        let record = self.store.get(name)?;
        bundle::export(&record, folder)
    }

    pub fn import(&mut self, folder: &Path) -> Result<OperationReport> {
        bundle::import(folder, &mut self.store, &self.work_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::vm::HostPlatform;

    fn manager(qemu: &Path, work_dir: &Path) -> VmManager<MemoryStore> {
        VmManager::new(
            MemoryStore::new(),
            ProcessSupervisor::default(),
            HostCapabilities::new(HostPlatform::Linux, true),
            ToolPaths {
                qemu: qemu.to_path_buf(),
                qemu_img: PathBuf::from("/nonexistent/qemu-img"),
            },
            work_dir,
        )
    }

    /// A stand-in for QEMU that ignores its arguments and keeps running.
    #[cfg(unix)]
    fn fake_qemu(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-qemu");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn vm(name: &str) -> VmRecord {
        VmRecord {
            disk: format!("/vms/{name}.qcow2"),
            ..VmRecord::named(name)
        }
    }

    #[test]
    fn create_rejects_duplicates_and_invalid_records() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = manager(Path::new("qemu"), tmp.path());

        mgr.create(&vm("vm1")).unwrap();
        let changed = VmRecord {
            memory_mb: 512,
            ..vm("vm1")
        };
        assert!(matches!(
            mgr.create(&changed),
            Err(QmgrError::AlreadyExists(_))
        ));
        assert_eq!(mgr.get("vm1").unwrap(), vm("vm1"));

        assert!(matches!(
            mgr.create(&VmRecord::named("no-disk")),
            Err(QmgrError::Validation(_))
        ));
        assert!(!mgr.store().contains("no-disk").unwrap());
    }

    #[test]
    fn update_renames_and_rewrites() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = manager(Path::new("qemu"), tmp.path());
        mgr.create(&vm("a")).unwrap();
        mgr.create(&vm("b")).unwrap();

        let mut edited = mgr.get("a").unwrap();
        edited.name = "b".into();
        assert!(matches!(
            mgr.update("a", &edited),
            Err(QmgrError::AlreadyExists(_))
        ));

        edited.name = "c".into();
        edited.audio = true;
        mgr.update("a", &edited).unwrap();
        assert!(matches!(mgr.get("a"), Err(QmgrError::NotFound(_))));
        assert!(mgr.get("c").unwrap().audio);

        assert!(matches!(
            mgr.update("missing", &vm("missing")),
            Err(QmgrError::NotFound(_))
        ));
    }

    /// Store that fails every write after the first `writes_left`.
    struct LimitedWrites {
        inner: MemoryStore,
        writes_left: usize,
    }

    impl LimitedWrites {
        fn spend(&mut self) -> Result<()> {
            if self.writes_left == 0 {
                return Err(QmgrError::io("database.toml", std::io::Error::other("disk full")));
            }
            self.writes_left -= 1;
            Ok(())
        }
    }

    impl VmStore for LimitedWrites {
        fn list(&self) -> Result<Vec<String>> {
            self.inner.list()
        }

        fn get(&self, name: &str) -> Result<VmRecord> {
            self.inner.get(name)
        }

        fn put(&mut self, record: &VmRecord) -> Result<()> {
            self.spend()?;
            self.inner.put(record)
        }

        fn remove(&mut self, name: &str) -> Result<()> {
            self.spend()?;
            self.inner.remove(name)
        }

        fn replace(&mut self, old: &str, record: &VmRecord) -> Result<()> {
            self.spend()?;
            self.inner.replace(old, record)
        }
    }

    #[test]
    fn update_with_rename_is_one_write() {
        let tmp = tempfile::tempdir().unwrap();
        let mut inner = MemoryStore::new();
        inner.put(&vm("a")).unwrap();
        let mut mgr = VmManager::new(
            LimitedWrites {
                inner,
                writes_left: 1,
            },
            ProcessSupervisor::default(),
            HostCapabilities::new(HostPlatform::Linux, true),
            ToolPaths {
                qemu: PathBuf::from("qemu"),
                qemu_img: PathBuf::from("/nonexistent/qemu-img"),
            },
            tmp.path(),
        );

        let edited = VmRecord {
            memory_mb: 1024,
            ..vm("b")
        };
        mgr.update("a", &edited).unwrap();
        assert_eq!(mgr.store().list().unwrap(), vec!["b".to_string()]);
        assert_eq!(mgr.get("b").unwrap(), edited);

        // Out of writes: the stored state is left exactly as it was.
        assert!(matches!(mgr.update("b", &vm("c")), Err(QmgrError::Io { .. })));
        assert_eq!(mgr.get("b").unwrap(), edited);
    }

    #[test]
    fn launch_without_disk_fails_before_spawning() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = manager(Path::new("/nonexistent/qemu"), tmp.path());
        mgr.store.put(&VmRecord::named("bare")).unwrap();

        assert!(matches!(mgr.launch("bare"), Err(QmgrError::Validation(_))));
        assert_eq!(mgr.status("bare").unwrap(), RunState::NotRunning);
    }

    #[test]
    fn launch_plan_uses_configured_qemu() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = manager(Path::new("/opt/qemu/bin/qemu-system-x86_64"), tmp.path());
        mgr.create(&vm("vm1")).unwrap();

        let plan = mgr.launch_plan("vm1").unwrap();
        assert_eq!(plan.program, PathBuf::from("/opt/qemu/bin/qemu-system-x86_64"));
        assert_eq!(&plan.args[..2], &["-accel".to_string(), "kvm".to_string()]);
    }

    #[test]
    fn spawn_failure_registers_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = manager(Path::new("/nonexistent/qemu"), tmp.path());
        mgr.create(&vm("vm1")).unwrap();

        assert!(matches!(mgr.launch("vm1"), Err(QmgrError::Spawn { .. })));
        assert_eq!(mgr.status("vm1").unwrap(), RunState::NotRunning);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_kill_and_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = manager(&fake_qemu(tmp.path()), tmp.path());
        mgr.create(&vm("vm1")).unwrap();

        mgr.launch("vm1").unwrap();
        assert_eq!(mgr.status("vm1").unwrap(), RunState::Running);
        assert!(matches!(mgr.launch("vm1"), Err(QmgrError::Conflict(_))));

        let listed = mgr.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, RunState::Running);
        assert!(listed[0].process.is_some());

        assert_eq!(mgr.kill("vm1").await.unwrap(), KillOutcome::Terminated);
        assert_eq!(mgr.status("vm1").unwrap(), RunState::NotRunning);
        assert_eq!(mgr.kill("vm1").await.unwrap(), KillOutcome::NothingToDo);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rename_carries_running_process() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = manager(&fake_qemu(tmp.path()), tmp.path());
        mgr.create(&vm("old")).unwrap();
        let pid = mgr.launch("old").unwrap();

        mgr.rename("old", "new").unwrap();
        assert_eq!(mgr.status("new").unwrap(), RunState::Running);
        assert_eq!(mgr.process_info("new").unwrap().pid, pid);
        assert!(matches!(mgr.status("old"), Err(QmgrError::NotFound(_))));

        mgr.shutdown().await;
        assert_eq!(mgr.status("new").unwrap(), RunState::NotRunning);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delete_kills_and_removes_selected_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = manager(&fake_qemu(tmp.path()), tmp.path());
        let disk = tmp.path().join("vm1.qcow2");
        let iso = tmp.path().join("vm1.iso");
        std::fs::write(&disk, b"disk").unwrap();
        std::fs::write(&iso, b"iso").unwrap();
        mgr.create(&VmRecord {
            disk: disk.display().to_string(),
            iso: iso.display().to_string(),
            ..VmRecord::named("vm1")
        })
        .unwrap();
        mgr.launch("vm1").unwrap();

        let report = mgr
            .delete(
                "vm1",
                DeleteOptions {
                    disk: true,
                    iso: false,
                },
            )
            .await
            .unwrap();

        assert!(report.is_complete(), "{report:?}");
        assert!(!disk.exists());
        assert!(iso.exists());
        assert!(mgr.store().list().unwrap().is_empty());
        assert!(mgr.supervisor.running().is_empty());
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = manager(Path::new("qemu"), tmp.path());
        assert!(matches!(
            mgr.delete("ghost", DeleteOptions::default()).await,
            Err(QmgrError::NotFound(_))
        ));
    }

    #[test]
    fn create_disk_validates_size() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(Path::new("qemu"), tmp.path());
        assert!(matches!(
            mgr.create_disk(&tmp.path().join("a.qcow2"), 2000),
            Err(QmgrError::Validation(_))
        ));
        assert!(matches!(
            mgr.create_disk(&tmp.path().join("a.qcow2"), 10),
            Err(QmgrError::Tool { .. })
        ));
    }
}
