//! Disk image creation and the file helpers shared by delete, export and
//! import.
//!
//! ## External Requirements
//!
//! - `qemu-img`: resolved by [`crate::config::ToolPaths`]. Images are created
//!   with `qemu-img create -f qcow2 <path> <size>G`.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::error::{QmgrError, Result};

pub const MIN_DISK_GB: u32 = 1;
pub const MAX_DISK_GB: u32 = 1024;
pub const DEFAULT_DISK_GB: u32 = 10;

/// Numbered alternatives tried by [`copy_into`] before giving up.
const MAX_RENAME_ATTEMPTS: u32 = 999;

// ---------------------------------------------------------------------------
// qemu-img argument generation
// ---------------------------------------------------------------------------

/// Arguments for `qemu-img` to create a QCOW2 image of `size_gb` gigabytes.
///
/// ```rust
/// # use std::path::Path;
/// # use qmgr::vm::filesystem::qemu_img_create_args;
/// let args = qemu_img_create_args(Path::new("/vms/a.qcow2"), 20);
/// assert_eq!(args, vec!["create", "-f", "qcow2", "/vms/a.qcow2", "20G"]);
/// ```
pub fn qemu_img_create_args(path: &Path, size_gb: u32) -> Vec<String> {
    vec![
        "create".to_string(),
        "-f".to_string(),
        "qcow2".to_string(),
        path.display().to_string(),
        format!("{size_gb}G"),
    ]
}

/// Create a QCOW2 disk image at `path` using the `qemu-img` binary `tool`.
///
/// Blocks until the tool exits. Fails with [`QmgrError::Tool`] if the tool
/// cannot be started or exits non-zero.
pub fn create_disk_image(tool: &Path, path: &Path, size_gb: u32) -> Result<()> {
    if !(MIN_DISK_GB..=MAX_DISK_GB).contains(&size_gb) {
        return Err(QmgrError::validation(format!(
            "disk size must be between {MIN_DISK_GB} and {MAX_DISK_GB} GB, got {size_gb}"
        )));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| QmgrError::io(parent, e))?;
    }

    let tool_name = tool.display().to_string();
    let output = Command::new(tool)
        .args(qemu_img_create_args(path, size_gb))
        .output()
        .map_err(|e| QmgrError::Tool {
            tool: tool_name.clone(),
            message: format!("could not start: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(QmgrError::Tool {
            tool: tool_name,
            message: format!("exit {}: {}", output.status, stderr.trim()),
        });
    }

    info!(path = %path.display(), size_gb, "created QCOW2 disk image");
    Ok(())
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

/// The final component of `path` as text, or `None` for paths like `..`.
pub fn bare_file_name(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Whether two paths name the same file.
///
/// Compares canonical forms when both exist, literal paths otherwise.
pub fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Copy `source` into `dir` and return the path of the copy.
///
/// Existing files are never overwritten: when the name is taken the copy
/// gets the first free `<stem>-<n>.<ext>` name instead. Copying a file onto
/// itself is a no-op.
pub fn copy_into(source: &Path, dir: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| QmgrError::validation(format!("{} has no file name", source.display())))?;
    let preferred = dir.join(name);

    if same_file(source, &preferred) {
        debug!(path = %preferred.display(), "source and destination coincide, skipping copy");
        return Ok(preferred);
    }

    let mut input = File::open(source).map_err(|e| QmgrError::io(source, e))?;
    let (dest, mut output) = create_unused(dir, Path::new(name))?;
    if let Err(e) = std::io::copy(&mut input, &mut output) {
        drop(output);
        let _ = std::fs::remove_file(&dest);
        return Err(QmgrError::io(&dest, e));
    }
    if let Ok(metadata) = input.metadata() {
        let _ = output.set_permissions(metadata.permissions());
    }

    if dest != preferred {
        info!(
            from = %source.display(),
            to = %dest.display(),
            "destination name taken, copied under a new name"
        );
    } else {
        debug!(from = %source.display(), to = %dest.display(), "copied file");
    }
    Ok(dest)
}

/// Create a new file in `dir` named `name`, or `<stem>-<n>.<ext>` for the
/// first `n` not already taken. `create_new` makes the check and the create
/// a single step.
fn create_unused(dir: &Path, name: &Path) -> Result<(PathBuf, File)> {
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for n in 0..=MAX_RENAME_ATTEMPTS {
        let candidate = if n == 0 {
            dir.join(name)
        } else {
            dir.join(format!("{stem}-{n}{ext}"))
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(QmgrError::io(candidate, e)),
        }
    }
    Err(QmgrError::Conflict(format!(
        "no free file name for {} in {}",
        name.display(),
        dir.display()
    )))
}

/// Delete `path`, reporting the path on failure.
pub fn remove_file(path: &Path) -> Result<()> {
    std::fs::remove_file(path).map_err(|e| QmgrError::io(path, e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_args_format() {
        let args = qemu_img_create_args(Path::new("/vms/disk.qcow2"), 10);
        assert_eq!(args, vec!["create", "-f", "qcow2", "/vms/disk.qcow2", "10G"]);
    }

    #[test]
    fn size_out_of_range_is_rejected_before_running_tool() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sub").join("a.qcow2");
        let tool = Path::new("/nonexistent/qemu-img");

        assert!(matches!(
            create_disk_image(tool, &path, 0),
            Err(QmgrError::Validation(_))
        ));
        assert!(matches!(
            create_disk_image(tool, &path, 1025),
            Err(QmgrError::Validation(_))
        ));
        assert!(!path.parent().unwrap().exists());
    }

    #[test]
    fn missing_tool_is_tool_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.qcow2");
        let err = create_disk_image(Path::new("/nonexistent/qemu-img"), &path, 10).unwrap_err();
        assert!(matches!(err, QmgrError::Tool { .. }), "got {err:?}");
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_tool_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.qcow2");
        let err = create_disk_image(Path::new("false"), &path, 10).unwrap_err();
        assert!(matches!(err, QmgrError::Tool { .. }), "got {err:?}");
    }

    #[cfg(unix)]
    #[test]
    fn zero_exit_succeeds_and_creates_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("a.qcow2");
        create_disk_image(Path::new("true"), &path, 10).unwrap();
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn bare_file_name_strips_directories() {
        assert_eq!(bare_file_name("/d/a.qcow2").as_deref(), Some("a.qcow2"));
        assert_eq!(bare_file_name("a.iso").as_deref(), Some("a.iso"));
        assert_eq!(bare_file_name("../../etc/x.img").as_deref(), Some("x.img"));
        assert_eq!(bare_file_name(".."), None);
        assert_eq!(bare_file_name(""), None);
    }

    #[test]
    fn copy_into_copies_and_skips_self_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let src_dir = tmp.path().join("src");
        let dest_dir = tmp.path().join("dest");
        std::fs::create_dir_all(&src_dir).unwrap();
        std::fs::create_dir_all(&dest_dir).unwrap();
        let src = src_dir.join("a.qcow2");
        std::fs::write(&src, b"disk").unwrap();

        let copied = copy_into(&src, &dest_dir).unwrap();
        assert_eq!(copied, dest_dir.join("a.qcow2"));
        assert_eq!(std::fs::read(&copied).unwrap(), b"disk");

        let again = copy_into(&copied, &dest_dir).unwrap();
        assert_eq!(again, copied);
        assert_eq!(std::fs::read(&again).unwrap(), b"disk");
    }

    #[test]
    fn copy_into_never_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let src_dir = tmp.path().join("src");
        let dest_dir = tmp.path().join("dest");
        std::fs::create_dir_all(&src_dir).unwrap();
        std::fs::create_dir_all(&dest_dir).unwrap();
        let src = src_dir.join("disk.qcow2");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(dest_dir.join("disk.qcow2"), b"existing").unwrap();
        std::fs::write(dest_dir.join("disk-1.qcow2"), b"existing too").unwrap();

        let copied = copy_into(&src, &dest_dir).unwrap();
        assert_eq!(copied, dest_dir.join("disk-2.qcow2"));
        assert_eq!(std::fs::read(&copied).unwrap(), b"new");
        assert_eq!(std::fs::read(dest_dir.join("disk.qcow2")).unwrap(), b"existing");
        assert_eq!(std::fs::read(dest_dir.join("disk-1.qcow2")).unwrap(), b"existing too");
    }

    #[test]
    fn copy_missing_source_reports_path() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("gone.iso");
        let dest = tmp.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        match copy_into(&missing, &dest) {
            Err(QmgrError::Io { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}
