//! Storage-backed container validation.
//!
//! Staged containers live in flash, not in memory, so validation streams
//! through [`Storage`] in fixed-size chunks instead of slurping the whole
//! container. One CRC digest runs across all chunks; re-seeding per chunk
//! would only ever hash the last one.

use tracing::debug;
use zgw_flash::{Storage, StorageError};

use crate::container::{
    ContainerHeader, PackageError, PackageResult, TargetEntry, TargetMetadata, CONTAINER_CRC,
    CONTAINER_HEADER_LEN, CRC_COVERAGE_OFFSET, METADATA_LEN,
};

/// Read granularity for checksum streaming.
const CHECKSUM_CHUNK: usize = 4096;

/// Computes the container CRC-32 over a storage region.
pub fn crc_region(storage: &dyn Storage, address: u32, size: u32) -> Result<u32, StorageError> {
    let mut digest = CONTAINER_CRC.digest();
    let mut chunk = [0u8; CHECKSUM_CHUNK];
    let mut offset = 0u32;
    while offset < size {
        let n = ((size - offset) as usize).min(CHECKSUM_CHUNK);
        storage.read(address + offset, &mut chunk[..n])?;
        digest.update(&chunk[..n]);
        offset += n as u32;
    }
    Ok(digest.finalize())
}

/// Validates one staged container at a fixed base address.
pub struct ContainerValidator<'a> {
    storage: &'a dyn Storage,
    base: u32,
}

impl<'a> ContainerValidator<'a> {
    pub fn new(storage: &'a dyn Storage, base: u32) -> Self {
        Self { storage, base }
    }

    /// Reads and structurally validates the container header.
    pub fn parse_header(&self) -> PackageResult<ContainerHeader> {
        let mut buf = [0u8; CONTAINER_HEADER_LEN];
        self.storage.read(self.base, &mut buf)?;
        ContainerHeader::parse(&buf)
    }

    /// Looks up `target_id` in the table and reads its metadata block.
    pub fn find_target_metadata(
        &self,
        header: &ContainerHeader,
        target_id: u16,
    ) -> PackageResult<(TargetEntry, TargetMetadata)> {
        let entry = header
            .find_entry(target_id)
            .copied()
            .ok_or(PackageError::TargetNotFound { target_id })?;
        let mut buf = [0u8; METADATA_LEN];
        self.storage.read(self.base + entry.offset, &mut buf)?;
        let metadata = TargetMetadata::parse(&buf, &entry)?;
        Ok((entry, metadata))
    }

    /// Streams the covered bytes and compares against the stored CRC.
    pub fn validate_checksum(&self, header: &ContainerHeader) -> PackageResult<()> {
        let computed = crc_region(
            self.storage,
            self.base + CRC_COVERAGE_OFFSET as u32,
            header.total_size - CRC_COVERAGE_OFFSET as u32,
        )?;
        if computed != header.crc32 {
            return Err(PackageError::ChecksumMismatch {
                stored: header.crc32,
                computed,
            });
        }
        debug!(
            container_id = header.container_id,
            crc32 = format_args!("{:#010X}", header.crc32),
            "container checksum verified"
        );
        Ok(())
    }

    /// Verifies the firmware payload of one target against the CRC in its
    /// metadata block.
    pub fn validate_firmware(
        &self,
        entry: &TargetEntry,
        metadata: &TargetMetadata,
    ) -> PackageResult<()> {
        let computed = crc_region(
            self.storage,
            self.base + entry.firmware_offset(),
            metadata.fw_size,
        )?;
        if computed != metadata.fw_crc32 {
            return Err(PackageError::FirmwareChecksumMismatch {
                target_id: entry.target_id,
                expected: metadata.fw_crc32,
                computed,
            });
        }
        Ok(())
    }

    /// Full validation chain for one target: header, container checksum,
    /// metadata lookup.
    pub fn validate_target(
        &self,
        target_id: u16,
    ) -> PackageResult<(ContainerHeader, TargetEntry, TargetMetadata)> {
        let header = self.parse_header()?;
        self.validate_checksum(&header)?;
        let (entry, metadata) = self.find_target_metadata(&header, target_id)?;
        Ok((header, entry, metadata))
    }
}
