//! Persistence of VM records.
//!
//! [`VmStore`] maps VM name → [`VmRecord`]. Two backends:
//!
//! - [`FileStore`]: one TOML document with a table per VM. Keys keep the
//!   classic QMGR names and booleans are written as `1`/`0`:
//!
//!   ```toml
//!   [vm1]
//!   disk = "/vms/vm1.qcow2"
//!   iso = ""
//!   mem = 2048
//!   cpu = "qemu64"
//!   net = 1
//!   audio = 0
//!   hda = 1
//!   vnc = 0
//!   vnc_port = 5900
//!   vnc_pass = 0
//!   accel_override = 0
//!   accel_type = "default"
//!   ```
//!
//!   Absent keys take the values of [`VmSection::default`], which mirrors
//!   [`VmRecord::default`]. Every mutation rewrites the whole file through a
//!   synced temporary file and a rename.
//!
//! - [`MemoryStore`]: a map that lives as long as the process.
//!
//! The same section format is used for export sidecar files.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{QmgrError, Result};
use crate::vm::{Accelerator, VmRecord};

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Name-keyed storage of VM records.
pub trait VmStore {
    /// All VM names, sorted.
    fn list(&self) -> Result<Vec<String>>;

    /// The record stored under `name`; `NotFound` if absent.
    fn get(&self, name: &str) -> Result<VmRecord>;

    /// Insert or overwrite the record under `record.name`.
    fn put(&mut self, record: &VmRecord) -> Result<()>;

    /// Delete the record under `name`; `NotFound` if absent.
    fn remove(&mut self, name: &str) -> Result<()>;

    fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.list()?.iter().any(|n| n == name))
    }

    /// Store `record` in place of the record under `old`. When the names
    /// differ this is a rename and an edit in one step.
    fn replace(&mut self, old: &str, record: &VmRecord) -> Result<()> {
        check_replace(&*self, old, record)?;
        if old != record.name {
            self.remove(old)?;
        }
        self.put(record)
    }

    /// Move the record under `old` to `new`, updating its name.
    fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        if new.trim().is_empty() {
            return Err(QmgrError::validation("new VM name is required"));
        }
        let mut record = self.get(old)?;
        if old == new {
            return Ok(());
        }
        record.name = new.to_string();
        self.replace(old, &record)
    }
}

/// Preconditions of [`VmStore::replace`], checked before anything is written.
fn check_replace<S: VmStore + ?Sized>(store: &S, old: &str, record: &VmRecord) -> Result<()> {
    record.validate_fields()?;
    if !store.contains(old)? {
        return Err(QmgrError::NotFound(old.to_string()));
    }
    if old != record.name && store.contains(&record.name)? {
        return Err(QmgrError::AlreadyExists(record.name.clone()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Section format
// ---------------------------------------------------------------------------

/// On-disk shape of one VM table. The VM name is the table key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSection {
    pub disk: String,
    pub iso: String,
    pub mem: u32,
    pub cpu: String,
    #[serde(with = "int_bool")]
    pub net: bool,
    #[serde(with = "int_bool")]
    pub audio: bool,
    #[serde(with = "int_bool")]
    pub hda: bool,
    #[serde(with = "int_bool")]
    pub vnc: bool,
    pub vnc_port: u16,
    #[serde(with = "int_bool")]
    pub vnc_pass: bool,
    #[serde(with = "int_bool")]
    pub accel_override: bool,
    pub accel_type: Accelerator,
}

impl Default for VmSection {
    fn default() -> Self {
        Self::from_record(&VmRecord::default())
    }
}

impl VmSection {
    pub fn from_record(record: &VmRecord) -> Self {
        Self {
            disk: record.disk.clone(),
            iso: record.iso.clone(),
            mem: record.memory_mb,
            cpu: record.cpu.clone(),
            net: record.network,
            audio: record.audio,
            hda: record.primary_disk,
            vnc: record.vnc,
            vnc_port: record.vnc_port,
            vnc_pass: record.vnc_password,
            accel_override: record.accel_override,
            accel_type: record.accelerator,
        }
    }

    pub fn into_record(self, name: impl Into<String>) -> VmRecord {
        VmRecord {
            name: name.into(),
            disk: self.disk,
            iso: self.iso,
            memory_mb: self.mem,
            cpu: self.cpu,
            network: self.net,
            audio: self.audio,
            primary_disk: self.hda,
            vnc: self.vnc,
            vnc_port: self.vnc_port,
            vnc_password: self.vnc_pass,
            accel_override: self.accel_override,
            accelerator: self.accel_type,
        }
    }
}

/// Booleans stored as `1`/`0`. Reads also accept TOML booleans and the
/// textual forms understood by [`crate::vm::parse_flag`].
mod int_bool {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(i64::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Flag {
            Int(i64),
            Bool(bool),
            Text(String),
        }

        match Flag::deserialize(deserializer)? {
            Flag::Int(n) => Ok(n == 1),
            Flag::Bool(b) => Ok(b),
            Flag::Text(text) => {
                crate::vm::parse_flag("flag", &text).map_err(|e| D::Error::custom(e.to_string()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Document helpers (database and sidecar files)
// ---------------------------------------------------------------------------

/// Parse a section document. A missing file is an empty document.
pub fn read_document(path: &Path) -> Result<toml::Table> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(toml::Table::new()),
        Err(e) => return Err(QmgrError::io(path, e)),
    };
    text.parse::<toml::Table>()
        .map_err(|e| QmgrError::parse(path.display().to_string(), e))
}

/// Names of the VM tables in `doc`, sorted.
pub fn section_names(doc: &toml::Table) -> Vec<String> {
    doc.iter()
        .filter(|(_, value)| value.is_table())
        .map(|(name, _)| name.clone())
        .collect()
}

/// Decode the table `name` of `doc` into a record.
pub fn record_from_document(doc: &toml::Table, name: &str) -> Result<VmRecord> {
    let value = doc
        .get(name)
        .filter(|v| v.is_table())
        .ok_or_else(|| QmgrError::NotFound(name.to_string()))?;
    let section: VmSection = value
        .clone()
        .try_into()
        .map_err(|e| QmgrError::parse(format!("section [{name}]"), e))?;
    Ok(section.into_record(name))
}

/// Encode `section` into `doc` under `name`, replacing any existing table.
pub fn insert_section(doc: &mut toml::Table, name: &str, section: &VmSection) -> Result<()> {
    let value = toml::Value::try_from(section)?;
    doc.insert(name.to_string(), value);
    Ok(())
}

/// Replace `path` with `doc`, synced to disk before returning.
pub fn write_document(path: &Path, doc: &toml::Table) -> Result<()> {
    let text = toml::to_string(doc)?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| QmgrError::io(dir, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "database.toml".to_string());
    let tmp = dir.join(format!(".{file_name}.tmp"));

    {
        let mut file = File::create(&tmp).map_err(|e| QmgrError::io(&tmp, e))?;
        file.write_all(text.as_bytes())
            .map_err(|e| QmgrError::io(&tmp, e))?;
        file.sync_all().map_err(|e| QmgrError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| QmgrError::io(path, e))?;

    // Persist the rename itself.
    #[cfg(unix)]
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }

    debug!(path = %path.display(), bytes = text.len(), "wrote section document");
    Ok(())
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Store backed by a TOML section file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Use the database at `path`. The file is created on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!(path = %path.display(), "using VM database");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<toml::Table> {
        read_document(&self.path)
    }
}

impl VmStore for FileStore {
    fn list(&self) -> Result<Vec<String>> {
        Ok(section_names(&self.load()?))
    }

    fn get(&self, name: &str) -> Result<VmRecord> {
        record_from_document(&self.load()?, name)
    }

    fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.load()?.get(name).is_some_and(toml::Value::is_table))
    }

    fn put(&mut self, record: &VmRecord) -> Result<()> {
        record.validate_fields()?;
        let mut doc = self.load()?;
        insert_section(&mut doc, &record.name, &VmSection::from_record(record))?;
        write_document(&self.path, &doc)?;
        debug!(vm = %record.name, "stored VM");
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        let mut doc = self.load()?;
        if doc.remove(name).is_none() {
            return Err(QmgrError::NotFound(name.to_string()));
        }
        write_document(&self.path, &doc)?;
        debug!(vm = name, "removed VM");
        Ok(())
    }

    /// Single rewrite, so no reader ever sees both or neither name.
    fn replace(&mut self, old: &str, record: &VmRecord) -> Result<()> {
        check_replace(&*self, old, record)?;
        let mut doc = self.load()?;
        doc.remove(old);
        insert_section(&mut doc, &record.name, &VmSection::from_record(record))?;
        write_document(&self.path, &doc)?;
        if old != record.name {
            info!(from = old, to = %record.name, "renamed VM");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Store that keeps records for the lifetime of the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: BTreeMap<String, VmRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VmStore for MemoryStore {
    fn list(&self) -> Result<Vec<String>> {
        Ok(self.records.keys().cloned().collect())
    }

    fn get(&self, name: &str) -> Result<VmRecord> {
        self.records
            .get(name)
            .cloned()
            .ok_or_else(|| QmgrError::NotFound(name.to_string()))
    }

    fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.records.contains_key(name))
    }

    fn put(&mut self, record: &VmRecord) -> Result<()> {
        record.validate_fields()?;
        self.records.insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        self.records
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| QmgrError::NotFound(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
