//! Storage device abstraction.
//!
//! All flash access in the update engine goes through [`Storage`] so the
//! same code drives real hardware, a backing file or the in-memory device
//! used in tests. Addresses are absolute within one flat device address
//! space; callers carve it up via [`crate::bank::BankLayout`] and
//! [`crate::staging::StagingMap`].

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;

/// Byte value of erased flash.
pub const ERASED_BYTE: u8 = 0xFF;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage device not ready")]
    NotReady,

    #[error("range {address:#010X}+{size} exceeds device capacity {capacity:#010X}")]
    OutOfBounds { address: u32, size: u32, capacity: u32 },

    #[error("write at {address:#010X} failed")]
    WriteFailed { address: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A flat, byte-addressable flash device.
///
/// `erase` returns the range to [`ERASED_BYTE`]; `write` assumes the range
/// was erased first, matching how NOR flash behaves. Implementations must
/// be safe to share across threads.
pub trait Storage: Send + Sync {
    /// Erases `size` bytes starting at `address`.
    fn erase(&self, address: u32, size: u32) -> Result<(), StorageError>;

    /// Writes `data` starting at `address`.
    fn write(&self, address: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Fills `buf` from `address`.
    fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Whether the device is currently accepting commands.
    fn is_ready(&self) -> bool;

    /// Total device size in bytes.
    fn capacity(&self) -> u32;
}

fn check_bounds(address: u32, len: usize, capacity: u32) -> Result<(), StorageError> {
    let size = u32::try_from(len).map_err(|_| StorageError::OutOfBounds {
        address,
        size: u32::MAX,
        capacity,
    })?;
    let end = address.checked_add(size).ok_or(StorageError::OutOfBounds {
        address,
        size,
        capacity,
    })?;
    if end > capacity {
        return Err(StorageError::OutOfBounds {
            address,
            size,
            capacity,
        });
    }
    Ok(())
}

/// In-memory storage device for tests and host-side simulation.
///
/// Starts fully erased. The fault knobs make failure paths scriptable:
/// `set_ready(false)` turns the device away, `fail_next_writes(n)` makes
/// the next `n` writes report [`StorageError::WriteFailed`].
pub struct MemStorage {
    cells: RwLock<Vec<u8>>,
    ready: AtomicBool,
    write_failures: AtomicUsize,
}

impl MemStorage {
    pub fn new(capacity: u32) -> Self {
        Self {
            cells: RwLock::new(vec![ERASED_BYTE; capacity as usize]),
            ready: AtomicBool::new(true),
            write_failures: AtomicUsize::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Makes the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.write_failures.store(count, Ordering::SeqCst);
    }

    /// Copies out the current device contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.cells.read().clone()
    }

    fn take_write_failure(&self) -> bool {
        self.write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Storage for MemStorage {
    fn erase(&self, address: u32, size: u32) -> Result<(), StorageError> {
        if !self.is_ready() {
            return Err(StorageError::NotReady);
        }
        let mut cells = self.cells.write();
        let capacity = cells.len() as u32;
        check_bounds(address, size as usize, capacity)?;
        cells[address as usize..(address + size) as usize].fill(ERASED_BYTE);
        Ok(())
    }

    fn write(&self, address: u32, data: &[u8]) -> Result<(), StorageError> {
        if !self.is_ready() {
            return Err(StorageError::NotReady);
        }
        if self.take_write_failure() {
            return Err(StorageError::WriteFailed { address });
        }
        let mut cells = self.cells.write();
        let capacity = cells.len() as u32;
        check_bounds(address, data.len(), capacity)?;
        cells[address as usize..address as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        if !self.is_ready() {
            return Err(StorageError::NotReady);
        }
        let cells = self.cells.read();
        let capacity = cells.len() as u32;
        check_bounds(address, buf.len(), capacity)?;
        buf.copy_from_slice(&cells[address as usize..address as usize + buf.len()]);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn capacity(&self) -> u32 {
        self.cells.read().len() as u32
    }
}
