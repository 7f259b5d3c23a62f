//! File-backed storage device.
//!
//! Backs the daemon's flash address space with a regular file so staged
//! containers and the boot marker survive restarts. A freshly created
//! backing file is erased to match the in-memory device.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::info;

use crate::storage::{Storage, StorageError, ERASED_BYTE};

const ERASE_CHUNK: usize = 4096;

pub struct FileStorage {
    file: Mutex<File>,
    capacity: u32,
}

impl FileStorage {
    /// Opens (or creates) the backing file at `path` with the given
    /// capacity. A new or wrongly sized file is resized and fully erased.
    pub fn open(path: &Path, capacity: u32) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let storage = Self {
            file: Mutex::new(file),
            capacity,
        };
        let current_len = storage.file.lock().metadata()?.len();
        if current_len != u64::from(capacity) {
            info!(
                path = %path.display(),
                capacity,
                "initializing flash backing file"
            );
            storage.file.lock().set_len(u64::from(capacity))?;
            storage.erase(0, capacity)?;
        }
        Ok(storage)
    }

    fn check_bounds(&self, address: u32, len: usize) -> Result<(), StorageError> {
        let size = len as u64;
        if u64::from(address) + size > u64::from(self.capacity) {
            return Err(StorageError::OutOfBounds {
                address,
                size: len.try_into().unwrap_or(u32::MAX),
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn erase(&self, address: u32, size: u32) -> Result<(), StorageError> {
        self.check_bounds(address, size as usize)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(u64::from(address)))?;
        let chunk = [ERASED_BYTE; ERASE_CHUNK];
        let mut remaining = size as usize;
        while remaining > 0 {
            let n = remaining.min(ERASE_CHUNK);
            file.write_all(&chunk[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    fn write(&self, address: u32, data: &[u8]) -> Result<(), StorageError> {
        self.check_bounds(address, data.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(u64::from(address)))?;
        file.write_all(data)?;
        Ok(())
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_bounds(address, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(u64::from(address)))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }
}
