//! Flash storage for the zonal gateway.
//!
//! [`storage`] defines the device abstraction the update engine writes
//! through, with an in-memory backend for tests and simulation. [`file`]
//! adds a file-backed device so staged containers survive a daemon restart.
//! [`bank`] holds the dual-bank layout, bank health bookkeeping and the
//! boot marker the bootloader reads to decide which bank to start.
//! [`staging`] maps update target identifiers to their staging regions in
//! the shared flash address space.

pub mod bank;
pub mod file;
pub mod staging;
pub mod storage;

pub use bank::{
    BankId, BankLayout, BankStatus, BootMarker, DEFAULT_BANK_A_BASE, DEFAULT_BANK_B_BASE,
    DEFAULT_BANK_SIZE, DEFAULT_MARKER_ADDRESS,
};
pub use file::FileStorage;
pub use staging::{StagingMap, StagingRegion, STAGING_REGION_SIZE};
pub use storage::{MemStorage, Storage, StorageError, ERASED_BYTE};
