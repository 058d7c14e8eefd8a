//! Export and import of VM bundles.
//!
//! A bundle is a folder holding `<name>.toml` sidecar files (the same section
//! format as the database) next to copies of the referenced disk and ISO
//! images. Sidecars store bare file names, so a bundle can be moved between
//! machines; import resolves them against the bundle folder and copies the
//! files into the local working area.
//!
//! Both directions keep going after a bad item and return an
//! [`OperationReport`].

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::VmRecord;
use super::filesystem::{bare_file_name, copy_into};
use crate::error::{OperationReport, QmgrError, Result};
use crate::store::{self, VmSection, VmStore};

/// File name of the sidecar written for `vm_name`.
///
/// Characters that are not valid in file names on every platform become `_`.
pub fn sidecar_file_name(vm_name: &str) -> String {
    let stem: String = vm_name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let stem = stem.trim_start_matches('.');
    if stem.is_empty() {
        "vm.toml".to_string()
    } else {
        format!("{stem}.toml")
    }
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Write `record` into `folder` as a bundle.
///
/// Copies the disk and ISO files (if set) and writes the sidecar. A failed
/// copy is recorded in the report and does not stop the sidecar from being
/// written. Fails outright only if the folder or the sidecar cannot be
/// written.
pub fn export(record: &VmRecord, folder: &Path) -> Result<OperationReport> {
    std::fs::create_dir_all(folder).map_err(|e| QmgrError::io(folder, e))?;

    let mut report = OperationReport::new();
    let mut section = VmSection::from_record(record);
    section.disk = bare_file_name(&record.disk).unwrap_or_default();
    section.iso = bare_file_name(&record.iso).unwrap_or_default();

    let slots = [
        ("disk", &record.disk, &mut section.disk),
        ("iso", &record.iso, &mut section.iso),
    ];
    for (field, path, slot) in slots {
        if path.trim().is_empty() {
            continue;
        }
        match copy_into(Path::new(path), folder) {
            Ok(dest) => {
                // The copy may have been given a new name to avoid an existing file.
                if let Some(name) = dest.file_name() {
                    *slot = name.to_string_lossy().into_owned();
                }
                report.complete(dest.display().to_string());
            }
            Err(e) => {
                warn!(vm = %record.name, field, error = %e, "export copy failed");
                report.fail(path.clone(), e);
            }
        }
    }

    let mut doc = toml::Table::new();
    store::insert_section(&mut doc, &record.name, &section)?;
    let sidecar = folder.join(sidecar_file_name(&record.name));
    store::write_document(&sidecar, &doc)?;
    report.complete(sidecar.display().to_string());

    info!(
        vm = %record.name,
        folder = %folder.display(),
        failures = report.failures.len(),
        "exported VM"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// Sidecar files in `folder`, sorted by path.
fn sidecars(folder: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(folder).map_err(|e| QmgrError::io(folder, e))?;
    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    found.sort();
    Ok(found)
}

/// Copy the bundle file referenced by `value` into `work_dir`.
///
/// Only the file name of `value` is used, so a sidecar cannot point outside
/// its bundle.
fn localize(folder: &Path, work_dir: &Path, value: &str) -> Result<PathBuf> {
    let name = bare_file_name(value)
        .ok_or_else(|| QmgrError::validation(format!("'{value}' has no file name")))?;
    let source = folder.join(name);
    if !source.is_file() {
        return Err(QmgrError::io(
            source,
            std::io::Error::new(std::io::ErrorKind::NotFound, "file not found in bundle"),
        ));
    }
    copy_into(&source, work_dir)
}

/// Import every VM described by the sidecars in `folder` into `store`.
///
/// Referenced disk and ISO files are copied into `work_dir` and the record
/// paths rewritten to the copies. A file that is missing or cannot be copied
/// clears its field and adds one failure; the record is still stored.
/// Records overwrite existing ones with the same name.
pub fn import<S: VmStore + ?Sized>(
    folder: &Path,
    store: &mut S,
    work_dir: &Path,
) -> Result<OperationReport> {
    let files = sidecars(folder)?;
    if files.is_empty() {
        return Err(QmgrError::NotFound(format!(
            "no .toml sidecar in {}",
            folder.display()
        )));
    }
    std::fs::create_dir_all(work_dir).map_err(|e| QmgrError::io(work_dir, e))?;

    let mut report = OperationReport::new();

    for file in files {
        let doc = match store::read_document(&file) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "skipping unreadable sidecar");
                report.fail(file.display().to_string(), e);
                continue;
            }
        };

        for name in store::section_names(&doc) {
            let mut record = match store::record_from_document(&doc, &name) {
                Ok(record) => record,
                Err(e) => {
                    report.fail(name, e);
                    continue;
                }
            };

            for field in ["disk", "iso"] {
                let slot = match field {
                    "disk" => &mut record.disk,
                    _ => &mut record.iso,
                };
                if slot.trim().is_empty() {
                    continue;
                }
                match localize(folder, work_dir, slot) {
                    Ok(local) => {
                        debug!(vm = %name, field, path = %local.display(), "imported file");
                        *slot = local.display().to_string();
                    }
                    Err(e) => {
                        warn!(vm = %name, field, error = %e, "clearing unresolved path");
                        report.fail(format!("{name}: {field} '{slot}'"), e);
                        slot.clear();
                    }
                }
            }

            match store.put(&record) {
                Ok(()) => report.complete(name),
                Err(e) => report.fail(name, e),
            }
        }
    }

    info!(
        folder = %folder.display(),
        imported = report.completed.len(),
        failures = report.failures.len(),
        "import finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record_with_files(dir: &Path) -> VmRecord {
        let disk = dir.join("vm1.qcow2");
        let iso = dir.join("debian.iso");
        std::fs::write(&disk, b"disk").unwrap();
        std::fs::write(&iso, b"iso").unwrap();
        VmRecord {
            disk: disk.display().to_string(),
            iso: iso.display().to_string(),
            memory_mb: 2048,
            ..VmRecord::named("vm1")
        }
    }

    #[test]
    fn sidecar_names_are_file_safe() {
        assert_eq!(sidecar_file_name("vm1"), "vm1.toml");
        assert_eq!(sidecar_file_name("a/b:c"), "a_b_c.toml");
        assert_eq!(sidecar_file_name("..hidden"), "hidden.toml");
        assert_eq!(sidecar_file_name("  "), "vm.toml");
    }

    #[test]
    fn export_copies_files_and_writes_bare_names() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let record = record_with_files(&src);
        let out = tmp.path().join("bundle");

        let report = export(&record, &out).unwrap();
        assert!(report.is_complete(), "{report:?}");
        assert_eq!(report.completed.len(), 3);
        assert_eq!(std::fs::read(out.join("vm1.qcow2")).unwrap(), b"disk");
        assert_eq!(std::fs::read(out.join("debian.iso")).unwrap(), b"iso");

        let doc = store::read_document(&out.join("vm1.toml")).unwrap();
        let stored = store::record_from_document(&doc, "vm1").unwrap();
        assert_eq!(stored.disk, "vm1.qcow2");
        assert_eq!(stored.iso, "debian.iso");
        assert_eq!(stored.memory_mb, 2048);
    }

    #[test]
    fn export_records_failed_copy_and_still_writes_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let record = VmRecord {
            disk: tmp.path().join("missing.qcow2").display().to_string(),
            ..VmRecord::named("vm1")
        };
        let out = tmp.path().join("bundle");

        let report = export(&record, &out).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(out.join("vm1.toml").is_file());
    }

    #[test]
    fn import_without_sidecar_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::new();
        let err = import(tmp.path(), &mut store, &tmp.path().join("work")).unwrap_err();
        assert!(matches!(err, QmgrError::NotFound(_)));
    }

    #[test]
    fn import_with_missing_disk_clears_path_and_reports_once() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = tmp.path().join("bundle");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(
            bundle.join("vm2.toml"),
            "[vm2]\ndisk = \"a.qcow2\"\nmem = 1024\nhda = 1\n",
        )
        .unwrap();

        let mut store = MemoryStore::new();
        let report = import(&bundle, &mut store, &tmp.path().join("work")).unwrap();

        assert_eq!(report.completed, vec!["vm2".to_string()]);
        assert_eq!(report.failures.len(), 1);
        let vm2 = store.get("vm2").unwrap();
        assert_eq!(vm2.disk, "");
        assert_eq!(vm2.memory_mb, 1024);
    }

    #[test]
    fn import_copies_files_into_work_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = tmp.path().join("bundle");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("a.qcow2"), b"disk").unwrap();
        std::fs::write(bundle.join("vm3.toml"), "[vm3]\ndisk = \"/elsewhere/a.qcow2\"\n").unwrap();
        let work = tmp.path().join("work");

        let mut store = MemoryStore::new();
        let report = import(&bundle, &mut store, &work).unwrap();

        assert!(report.is_complete(), "{report:?}");
        let vm3 = store.get("vm3").unwrap();
        assert_eq!(PathBuf::from(&vm3.disk), work.join("a.qcow2"));
        assert_eq!(std::fs::read(work.join("a.qcow2")).unwrap(), b"disk");
    }

    #[test]
    fn import_keeps_existing_file_with_same_name() {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let bundle = tmp.path().join("bundle");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::create_dir_all(&bundle).unwrap();

        let existing_disk = work.join("disk.qcow2");
        std::fs::write(&existing_disk, b"existing vm data").unwrap();
        let mut store = MemoryStore::new();
        store
            .put(&VmRecord {
                disk: existing_disk.display().to_string(),
                ..VmRecord::named("existing")
            })
            .unwrap();

        std::fs::write(bundle.join("disk.qcow2"), b"other").unwrap();
        std::fs::write(bundle.join("other.toml"), "[other]\ndisk = \"disk.qcow2\"\n").unwrap();

        let report = import(&bundle, &mut store, &work).unwrap();
        assert!(report.is_complete(), "{report:?}");

        assert_eq!(std::fs::read(&existing_disk).unwrap(), b"existing vm data");
        assert_eq!(PathBuf::from(store.get("existing").unwrap().disk), existing_disk);
        let other = PathBuf::from(store.get("other").unwrap().disk);
        assert_eq!(other, work.join("disk-1.qcow2"));
        assert_eq!(std::fs::read(&other).unwrap(), b"other");
    }

    #[test]
    fn export_of_two_vms_with_same_disk_name_keeps_both() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("bundle");
        let mut records = Vec::new();
        for name in ["a", "b"] {
            let dir = tmp.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            let disk = dir.join("disk.qcow2");
            std::fs::write(&disk, name.as_bytes()).unwrap();
            records.push(VmRecord {
                disk: disk.display().to_string(),
                ..VmRecord::named(name)
            });
        }

        for record in &records {
            let report = export(record, &out).unwrap();
            assert!(report.is_complete(), "{report:?}");
        }

        let mut store = MemoryStore::new();
        let work = tmp.path().join("work");
        let report = import(&out, &mut store, &work).unwrap();
        assert!(report.is_complete(), "{report:?}");
        for name in ["a", "b"] {
            let disk = store.get(name).unwrap().disk;
            assert_eq!(std::fs::read(&disk).unwrap(), name.as_bytes(), "{name}");
        }

        let doc = store::read_document(&out.join("b.toml")).unwrap();
        assert_eq!(store::record_from_document(&doc, "b").unwrap().disk, "disk-1.qcow2");
    }

    #[test]
    fn import_continues_past_bad_sections_and_files() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = tmp.path().join("bundle");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("a.toml"), "this is = = not toml").unwrap();
        std::fs::write(
            bundle.join("b.toml"),
            "[bad]\nmem = \"lots\"\n\n[good]\nhda = 0\n\n[tiny]\nmem = 1\nhda = 0\n",
        )
        .unwrap();

        let mut store = MemoryStore::new();
        let report = import(&bundle, &mut store, &tmp.path().join("work")).unwrap();

        assert_eq!(report.completed, vec!["good".to_string()]);
        assert_eq!(report.failures.len(), 3);
        assert_eq!(store.list().unwrap(), vec!["good".to_string()]);
    }
}
