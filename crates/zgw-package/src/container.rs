//! Firmware container binary format.
//!
//! A container bundles firmware for up to four update targets behind one
//! fixed-size header. The first table entry names the routing target: the
//! device the container should be delivered to, which may then distribute
//! the remaining entries further downstream.
//!
//! # Wire format
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  Container header (192 bytes)        │  offset 0
//! ├──────────────────────────────────────┤
//! │  Target slice 0:                     │  entry[0].offset
//! │    metadata (128 bytes)              │
//! │    firmware (entry.total_size - 128) │
//! ├──────────────────────────────────────┤
//! │  Target slice 1..                    │
//! └──────────────────────────────────────┘
//! ```
//!
//! Header layout:
//!
//! ```text
//! 0x00  magic            u32  "ZONE"
//! 0x04  format version   u32  0x00010000
//! 0x08  container id     u32
//! 0x0C  total size       u32  header + all target slices
//! 0x10  CRC-32           u32  over bytes [0x14, total size)
//! 0x14  created at       u32  unix seconds
//! 0x18  name             32 bytes, null-padded
//! 0x38  target count     u32  1..=4
//! 0x3C  target table     4 x 32 bytes, unused entries zeroed
//! 0xBC  reserved         4 bytes
//! ```
//!
//! Target entry layout (32 bytes):
//!
//! ```text
//! 0x00  target id        u16
//! 0x02  reserved         u16
//! 0x04  offset           u32  absolute within the container
//! 0x08  total size       u32  metadata + firmware
//! 0x0C  metadata size    u32  always 128 in this format
//! 0x10  version          u32  0x00MMmmpp
//! 0x14  CRC-32           u32  over the whole target slice
//! 0x18  priority         u8   lower installs first
//! 0x19  reserved         7 bytes
//! ```
//!
//! Target metadata layout (128 bytes):
//!
//! ```text
//! 0x00  magic            u32  "ECUM"
//! 0x04  target id        u16
//! 0x06  hw revision      u16
//! 0x08  fw version       u32  0x00MMmmpp
//! 0x0C  fw size          u32
//! 0x10  fw CRC-32        u32  over the firmware payload only
//! 0x14  build time       u32  unix seconds
//! 0x18  version string   16 bytes, null-padded
//! 0x28  dependency count u32  0..=4
//! 0x2C  dependencies     4 x 8 bytes {id u16, reserved u16, min version u32}
//! 0x4C  reserved         52 bytes
//! ```
//!
//! All integers are big-endian. The CRC-32 is the reflected 0xEDB88320
//! polynomial (the ISO HDLC variant).

use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;
use zgw_flash::StorageError;

use crate::version::Version;

// ── Layout constants ───────────────────────────────────────────────────────

/// Container magic, "ZONE" as big-endian bytes.
pub const CONTAINER_MAGIC: u32 = 0x5A4F_4E45;
/// The one format revision this implementation understands.
pub const CONTAINER_FORMAT_VERSION: u32 = 0x0001_0000;
/// Fixed header size.
pub const CONTAINER_HEADER_LEN: usize = 192;
/// First byte covered by the container checksum (everything after the
/// stored CRC field).
pub const CRC_COVERAGE_OFFSET: usize = 0x14;
/// Offset of the container name within the header.
pub const CONTAINER_NAME_OFFSET: usize = 0x18;
/// Max length of the null-padded container name.
pub const CONTAINER_NAME_LEN: usize = 32;
/// Offset of the target table within the header.
pub const TARGET_TABLE_OFFSET: usize = 0x3C;
/// Upper bound on targets per container.
pub const MAX_TARGETS: usize = 4;
/// Size of one target table entry.
pub const TARGET_ENTRY_LEN: usize = 32;

/// Metadata magic, "ECUM" as big-endian bytes.
pub const METADATA_MAGIC: u32 = 0x4543_554D;
/// Fixed metadata block size.
pub const METADATA_LEN: usize = 128;
/// Max length of the null-padded metadata version string.
pub const VERSION_STRING_LEN: usize = 16;
/// Upper bound on dependencies per target.
pub const MAX_DEPENDENCIES: usize = 4;
/// Size of one encoded dependency.
pub const DEPENDENCY_LEN: usize = 8;

/// Hard ceiling on `total_size`; anything larger is rejected before any
/// region lookup happens.
pub const MAX_CONTAINER_SIZE: u32 = 32 * 1024 * 1024;

/// CRC-32 algorithm shared by the container header, target entries and
/// firmware payloads.
pub const CONTAINER_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("container too small: {got} bytes (minimum {need})")]
    TooSmall { need: usize, got: usize },

    #[error("bad container magic {got:#010X}")]
    BadMagic { got: u32 },

    #[error("unsupported container format {got:#010X}")]
    UnsupportedFormat { got: u32 },

    #[error("container declares no targets")]
    NoTargets,

    #[error("container declares {got} targets (maximum {MAX_TARGETS})")]
    TooManyTargets { got: u32 },

    #[error("container size {size} out of range")]
    SizeOutOfRange { size: u32 },

    #[error("target entry {index} does not fit the container")]
    EntryOutOfBounds { index: usize },

    #[error("container declares {declared} bytes but entries account for {accounted}")]
    SizeMismatch { declared: u32, accounted: u32 },

    #[error("bad metadata magic {got:#010X} for target {target_id:#06X}")]
    BadMetadataMagic { target_id: u16, got: u32 },

    #[error("metadata names target {got:#06X}, entry names {expected:#06X}")]
    MetadataTargetMismatch { expected: u16, got: u16 },

    #[error("metadata declares {got} dependencies (maximum {MAX_DEPENDENCIES})")]
    TooManyDependencies { got: u32 },

    #[error("no entry for target {target_id:#06X}")]
    TargetNotFound { target_id: u16 },

    #[error("container checksum mismatch: stored {stored:#010X}, computed {computed:#010X}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("firmware checksum mismatch for target {target_id:#06X}: expected {expected:#010X}, computed {computed:#010X}")]
    FirmwareChecksumMismatch {
        target_id: u16,
        expected: u32,
        computed: u32,
    },

    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type PackageResult<T> = Result<T, PackageError>;

// ── Header ─────────────────────────────────────────────────────────────────

/// Parsed container header, including the populated part of the target
/// table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub container_id: u32,
    /// Header plus every target slice.
    pub total_size: u32,
    /// Stored CRC-32 over `[CRC_COVERAGE_OFFSET, total_size)`.
    pub crc32: u32,
    pub created_at: u32,
    pub name: String,
    pub targets: Vec<TargetEntry>,
}

impl ContainerHeader {
    /// Parses and validates a header from the first 192 container bytes.
    ///
    /// Structural checks happen here: magic, format revision, target
    /// count, size plausibility and that every table entry fits inside the
    /// declared container. The checksum is not verified; that needs the
    /// full container and lives in the validator.
    pub fn parse(buf: &[u8]) -> PackageResult<Self> {
        if buf.len() < CONTAINER_HEADER_LEN {
            return Err(PackageError::TooSmall {
                need: CONTAINER_HEADER_LEN,
                got: buf.len(),
            });
        }
        let magic = read_u32(buf, 0x00);
        if magic != CONTAINER_MAGIC {
            return Err(PackageError::BadMagic { got: magic });
        }
        let format = read_u32(buf, 0x04);
        if format != CONTAINER_FORMAT_VERSION {
            return Err(PackageError::UnsupportedFormat { got: format });
        }
        let container_id = read_u32(buf, 0x08);
        let total_size = read_u32(buf, 0x0C);
        if total_size < CONTAINER_HEADER_LEN as u32 || total_size > MAX_CONTAINER_SIZE {
            return Err(PackageError::SizeOutOfRange { size: total_size });
        }
        let crc32 = read_u32(buf, 0x10);
        let created_at = read_u32(buf, 0x14);
        let name = read_padded_string(
            &buf[CONTAINER_NAME_OFFSET..CONTAINER_NAME_OFFSET + CONTAINER_NAME_LEN],
            "container name",
        )?;
        let target_count = read_u32(buf, 0x38);
        if target_count == 0 {
            return Err(PackageError::NoTargets);
        }
        if target_count as usize > MAX_TARGETS {
            return Err(PackageError::TooManyTargets { got: target_count });
        }

        let mut targets = Vec::with_capacity(target_count as usize);
        let mut accounted = CONTAINER_HEADER_LEN as u64;
        for index in 0..target_count as usize {
            let offset = TARGET_TABLE_OFFSET + index * TARGET_ENTRY_LEN;
            let entry = TargetEntry::parse(&buf[offset..offset + TARGET_ENTRY_LEN]);
            entry.check_bounds(index, total_size)?;
            accounted += u64::from(entry.total_size);
            targets.push(entry);
        }
        // Slices must account for the container exactly; a gap or overlap
        // means the table and the declared size disagree.
        if accounted != u64::from(total_size) {
            return Err(PackageError::SizeMismatch {
                declared: total_size,
                accounted: accounted.min(u64::from(u32::MAX)) as u32,
            });
        }

        Ok(Self {
            container_id,
            total_size,
            crc32,
            created_at,
            name,
            targets,
        })
    }

    /// Serializes the header. The stored CRC field is written as-is; the
    /// builder fills it in after hashing the assembled container.
    pub fn to_bytes(&self) -> [u8; CONTAINER_HEADER_LEN] {
        let mut out = [0u8; CONTAINER_HEADER_LEN];
        write_u32(&mut out, 0x00, CONTAINER_MAGIC);
        write_u32(&mut out, 0x04, CONTAINER_FORMAT_VERSION);
        write_u32(&mut out, 0x08, self.container_id);
        write_u32(&mut out, 0x0C, self.total_size);
        write_u32(&mut out, 0x10, self.crc32);
        write_u32(&mut out, 0x14, self.created_at);
        pad_into(
            &mut out[CONTAINER_NAME_OFFSET..CONTAINER_NAME_OFFSET + CONTAINER_NAME_LEN],
            self.name.as_bytes(),
        );
        write_u32(&mut out, 0x38, self.targets.len() as u32);
        for (index, entry) in self.targets.iter().take(MAX_TARGETS).enumerate() {
            let offset = TARGET_TABLE_OFFSET + index * TARGET_ENTRY_LEN;
            entry.write(&mut out[offset..offset + TARGET_ENTRY_LEN]);
        }
        out
    }

    /// The routing target: the device this container should be delivered
    /// to, by convention the first table entry.
    pub fn routing_target(&self) -> &TargetEntry {
        // parse() rejects empty tables, so the table is never empty here.
        &self.targets[0]
    }

    /// Table entry for `target_id`, if present.
    pub fn find_entry(&self, target_id: u16) -> Option<&TargetEntry> {
        self.targets.iter().find(|e| e.target_id == target_id)
    }
}

// ── Target entry ───────────────────────────────────────────────────────────

/// One row of the header's target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetEntry {
    pub target_id: u16,
    /// Absolute offset of this target's slice within the container.
    pub offset: u32,
    /// Metadata plus firmware.
    pub total_size: u32,
    pub metadata_size: u32,
    pub version: Version,
    /// CRC-32 over the whole target slice.
    pub crc32: u32,
    /// Install ordering hint; lower installs first.
    pub priority: u8,
}

impl TargetEntry {
    fn parse(buf: &[u8]) -> Self {
        Self {
            target_id: read_u16(buf, 0x00),
            offset: read_u32(buf, 0x04),
            total_size: read_u32(buf, 0x08),
            metadata_size: read_u32(buf, 0x0C),
            version: Version::from(read_u32(buf, 0x10)),
            crc32: read_u32(buf, 0x14),
            priority: buf[0x18],
        }
    }

    fn write(&self, out: &mut [u8]) {
        write_u16(out, 0x00, self.target_id);
        write_u32(out, 0x04, self.offset);
        write_u32(out, 0x08, self.total_size);
        write_u32(out, 0x0C, self.metadata_size);
        write_u32(out, 0x10, u32::from(self.version));
        write_u32(out, 0x14, self.crc32);
        out[0x18] = self.priority;
    }

    fn check_bounds(&self, index: usize, container_size: u32) -> PackageResult<()> {
        let end = self
            .offset
            .checked_add(self.total_size)
            .ok_or(PackageError::EntryOutOfBounds { index })?;
        let fits = self.offset >= CONTAINER_HEADER_LEN as u32
            && end <= container_size
            && self.metadata_size == METADATA_LEN as u32
            && self.total_size >= self.metadata_size;
        if !fits {
            return Err(PackageError::EntryOutOfBounds { index });
        }
        Ok(())
    }

    /// Absolute offset of the firmware payload within the container.
    pub fn firmware_offset(&self) -> u32 {
        self.offset + self.metadata_size
    }

    /// Size of the firmware payload.
    pub fn firmware_size(&self) -> u32 {
        self.total_size - self.metadata_size
    }
}

// ── Target metadata ────────────────────────────────────────────────────────

/// Per-target metadata block stored at the front of each target slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMetadata {
    pub target_id: u16,
    pub hw_revision: u16,
    pub fw_version: Version,
    pub fw_size: u32,
    /// CRC-32 over the firmware payload only.
    pub fw_crc32: u32,
    pub build_time: u32,
    pub version_string: String,
    pub dependencies: Vec<DependencyEdge>,
}

impl TargetMetadata {
    /// Parses a metadata block and checks it against the table entry it
    /// belongs to.
    pub fn parse(buf: &[u8], entry: &TargetEntry) -> PackageResult<Self> {
        if buf.len() < METADATA_LEN {
            return Err(PackageError::TooSmall {
                need: METADATA_LEN,
                got: buf.len(),
            });
        }
        let magic = read_u32(buf, 0x00);
        if magic != METADATA_MAGIC {
            return Err(PackageError::BadMetadataMagic {
                target_id: entry.target_id,
                got: magic,
            });
        }
        let target_id = read_u16(buf, 0x04);
        if target_id != entry.target_id {
            return Err(PackageError::MetadataTargetMismatch {
                expected: entry.target_id,
                got: target_id,
            });
        }
        let hw_revision = read_u16(buf, 0x06);
        let fw_version = Version::from(read_u32(buf, 0x08));
        let fw_size = read_u32(buf, 0x0C);
        let fw_crc32 = read_u32(buf, 0x10);
        let build_time = read_u32(buf, 0x14);
        let version_string =
            read_padded_string(&buf[0x18..0x18 + VERSION_STRING_LEN], "version string")?;
        let dep_count = read_u32(buf, 0x28);
        if dep_count as usize > MAX_DEPENDENCIES {
            return Err(PackageError::TooManyDependencies { got: dep_count });
        }
        let mut dependencies = Vec::with_capacity(dep_count as usize);
        for index in 0..dep_count as usize {
            let offset = 0x2C + index * DEPENDENCY_LEN;
            dependencies.push(DependencyEdge {
                target_id: read_u16(buf, offset),
                min_version: Version::from(read_u32(buf, offset + 4)),
            });
        }
        Ok(Self {
            target_id,
            hw_revision,
            fw_version,
            fw_size,
            fw_crc32,
            build_time,
            version_string,
            dependencies,
        })
    }

    pub fn to_bytes(&self) -> [u8; METADATA_LEN] {
        let mut out = [0u8; METADATA_LEN];
        write_u32(&mut out, 0x00, METADATA_MAGIC);
        write_u16(&mut out, 0x04, self.target_id);
        write_u16(&mut out, 0x06, self.hw_revision);
        write_u32(&mut out, 0x08, u32::from(self.fw_version));
        write_u32(&mut out, 0x0C, self.fw_size);
        write_u32(&mut out, 0x10, self.fw_crc32);
        write_u32(&mut out, 0x14, self.build_time);
        pad_into(
            &mut out[0x18..0x18 + VERSION_STRING_LEN],
            self.version_string.as_bytes(),
        );
        write_u32(&mut out, 0x28, self.dependencies.len() as u32);
        for (index, dep) in self.dependencies.iter().take(MAX_DEPENDENCIES).enumerate() {
            let offset = 0x2C + index * DEPENDENCY_LEN;
            write_u16(&mut out, offset, dep.target_id);
            write_u32(&mut out, offset + 4, u32::from(dep.min_version));
        }
        out
    }
}

/// A dependency on another device's installed firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyEdge {
    pub target_id: u16,
    pub min_version: Version,
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn write_u16(out: &mut [u8], offset: usize, value: u16) {
    out[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_u32(out: &mut [u8], offset: usize, value: u32) {
    out[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Null-pad (or truncate) `src` into the fixed-width field `out`.
fn pad_into(out: &mut [u8], src: &[u8]) {
    let n = src.len().min(out.len());
    out[..n].copy_from_slice(&src[..n]);
    out[n..].fill(0);
}

/// Read a null-padded fixed-width field as a UTF-8 string.
fn read_padded_string(field: &[u8], name: &'static str) -> PackageResult<String> {
    let trimmed: Vec<u8> = field.iter().take_while(|&&b| b != 0).copied().collect();
    String::from_utf8(trimmed).map_err(|_| PackageError::InvalidUtf8 { field: name })
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_entry() -> TargetEntry {
        TargetEntry {
            target_id: 0x0202,
            offset: CONTAINER_HEADER_LEN as u32,
            total_size: METADATA_LEN as u32 + 256,
            metadata_size: METADATA_LEN as u32,
            version: Version::new(2, 1, 0),
            crc32: 0xAABB_CCDD,
            priority: 1,
        }
    }

    fn sample_header() -> ContainerHeader {
        ContainerHeader {
            container_id: 42,
            total_size: CONTAINER_HEADER_LEN as u32 + METADATA_LEN as u32 + 256,
            crc32: 0x1122_3344,
            created_at: 1_700_000_000,
            name: "zone-update".to_string(),
            targets: vec![sample_entry()],
        }
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"ZONE");
        assert_eq!(ContainerHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn short_buffer_rejected() {
        let err = ContainerHeader::parse(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, PackageError::TooSmall { need, got }
            if need == CONTAINER_HEADER_LEN && got == 64));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = sample_header().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            ContainerHeader::parse(&bytes),
            Err(PackageError::BadMagic { .. })
        ));
    }

    #[test]
    fn unknown_format_rejected() {
        let mut bytes = sample_header().to_bytes();
        bytes[0x04..0x08].copy_from_slice(&0x0002_0000u32.to_be_bytes());
        assert!(matches!(
            ContainerHeader::parse(&bytes),
            Err(PackageError::UnsupportedFormat { got: 0x0002_0000 })
        ));
    }

    #[test]
    fn zero_targets_rejected() {
        let mut bytes = sample_header().to_bytes();
        bytes[0x38..0x3C].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            ContainerHeader::parse(&bytes),
            Err(PackageError::NoTargets)
        ));
    }

    #[test]
    fn too_many_targets_rejected() {
        let mut bytes = sample_header().to_bytes();
        bytes[0x38..0x3C].copy_from_slice(&5u32.to_be_bytes());
        assert!(matches!(
            ContainerHeader::parse(&bytes),
            Err(PackageError::TooManyTargets { got: 5 })
        ));
    }

    #[test]
    fn oversized_container_rejected() {
        let mut bytes = sample_header().to_bytes();
        bytes[0x0C..0x10].copy_from_slice(&(MAX_CONTAINER_SIZE + 1).to_be_bytes());
        assert!(matches!(
            ContainerHeader::parse(&bytes),
            Err(PackageError::SizeOutOfRange { .. })
        ));
    }

    #[test]
    fn entry_past_container_end_rejected() {
        let mut header = sample_header();
        header.targets[0].total_size += 1;
        let bytes = header.to_bytes();
        assert!(matches!(
            ContainerHeader::parse(&bytes),
            Err(PackageError::EntryOutOfBounds { index: 0 })
        ));
    }

    #[test]
    fn entry_overlapping_header_rejected() {
        let mut header = sample_header();
        header.targets[0].offset = 100;
        let bytes = header.to_bytes();
        assert!(matches!(
            ContainerHeader::parse(&bytes),
            Err(PackageError::EntryOutOfBounds { index: 0 })
        ));
    }

    #[test]
    fn unaccounted_bytes_rejected() {
        // Entry shrinks by one byte; bounds still hold but the declared
        // total no longer matches the table.
        let mut header = sample_header();
        header.targets[0].total_size -= 1;
        let bytes = header.to_bytes();
        assert!(matches!(
            ContainerHeader::parse(&bytes),
            Err(PackageError::SizeMismatch {
                declared: 576,
                accounted: 575,
            })
        ));
    }

    #[test]
    fn routing_target_is_first_entry() {
        let mut header = sample_header();
        header.targets.push(TargetEntry {
            target_id: 0x0203,
            offset: header.targets[0].offset + header.targets[0].total_size,
            ..sample_entry()
        });
        header.total_size += header.targets[1].total_size;
        assert_eq!(header.routing_target().target_id, 0x0202);
        assert_eq!(header.find_entry(0x0203).unwrap().target_id, 0x0203);
        assert!(header.find_entry(0x0299).is_none());
    }

    #[test]
    fn entry_firmware_window() {
        let entry = sample_entry();
        assert_eq!(entry.firmware_offset(), 192 + 128);
        assert_eq!(entry.firmware_size(), 256);
    }

    #[test]
    fn metadata_round_trip() {
        let entry = sample_entry();
        let metadata = TargetMetadata {
            target_id: 0x0202,
            hw_revision: 0x0100,
            fw_version: Version::new(2, 1, 0),
            fw_size: 256,
            fw_crc32: 0xDEAD_BEEF,
            build_time: 1_699_999_000,
            version_string: "2.1.0-rc1".to_string(),
            dependencies: vec![DependencyEdge {
                target_id: 0x0201,
                min_version: Version::new(1, 4, 0),
            }],
        };
        let bytes = metadata.to_bytes();
        assert_eq!(&bytes[0..4], b"ECUM");
        assert_eq!(TargetMetadata::parse(&bytes, &entry).unwrap(), metadata);
    }

    #[test]
    fn metadata_magic_checked() {
        let entry = sample_entry();
        let bytes = [0u8; METADATA_LEN];
        assert!(matches!(
            TargetMetadata::parse(&bytes, &entry),
            Err(PackageError::BadMetadataMagic { target_id: 0x0202, .. })
        ));
    }

    #[test]
    fn metadata_target_must_match_entry() {
        let entry = sample_entry();
        let metadata = TargetMetadata {
            target_id: 0x0203,
            hw_revision: 0,
            fw_version: Version::default(),
            fw_size: 0,
            fw_crc32: 0,
            build_time: 0,
            version_string: String::new(),
            dependencies: Vec::new(),
        };
        assert!(matches!(
            TargetMetadata::parse(&metadata.to_bytes(), &entry),
            Err(PackageError::MetadataTargetMismatch {
                expected: 0x0202,
                got: 0x0203,
            })
        ));
    }

    #[test]
    fn long_names_truncate_into_the_field() {
        let mut header = sample_header();
        header.name = "x".repeat(CONTAINER_NAME_LEN + 10);
        let parsed = ContainerHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed.name.len(), CONTAINER_NAME_LEN);
    }
}
