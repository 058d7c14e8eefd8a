//! qmgr: define, launch and move local QEMU virtual machines.
//!
//! The library is layered leaf-first:
//!
//! - [`vm`]: the typed VM record, launch compiler, host profile, process
//!   supervisor, disk image helpers and export/import bundles
//! - [`store`]: persistence of VM records
//! - [`manager`]: the control flow tying them together
//! - [`cli`] and [`shell`]: the front ends used by the `qmgr` binary
//!
//! [`config`], [`paths`] and [`logging`] provide the ambient setup.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod paths;
pub mod shell;
pub mod store;
pub mod vm;

pub use error::{OperationReport, QmgrError, Result};
pub use manager::{DeleteOptions, VmManager};
pub use store::{FileStore, MemoryStore, VmStore};
pub use vm::VmRecord;
