//! Container assembly for tooling and tests.
//!
//! The builder lays target slices back-to-back behind the header, fills
//! in every offset, size and CRC, and finally patches the container
//! checksum into the header. Table order is preserved: the first target
//! added becomes the routing target.

use crate::container::{
    ContainerHeader, DependencyEdge, PackageError, PackageResult, TargetEntry, TargetMetadata,
    CONTAINER_CRC, CONTAINER_HEADER_LEN, CRC_COVERAGE_OFFSET, MAX_CONTAINER_SIZE,
    MAX_DEPENDENCIES, MAX_TARGETS, METADATA_LEN,
};
use crate::version::Version;

/// Everything needed to place one target into a container.
#[derive(Debug, Clone, Default)]
pub struct TargetSpec {
    pub target_id: u16,
    pub hw_revision: u16,
    pub version: Version,
    pub version_string: String,
    pub priority: u8,
    pub build_time: u32,
    pub dependencies: Vec<DependencyEdge>,
    pub firmware: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    container_id: u32,
    name: String,
    created_at: u32,
    targets: Vec<TargetSpec>,
}

impl ContainerBuilder {
    pub fn new(container_id: u32, name: &str) -> Self {
        Self {
            container_id,
            name: name.to_string(),
            created_at: 0,
            targets: Vec::new(),
        }
    }

    pub fn created_at(mut self, unix_seconds: u32) -> Self {
        self.created_at = unix_seconds;
        self
    }

    /// Appends one target. The first target added is the routing target.
    pub fn add_target(mut self, spec: TargetSpec) -> Self {
        self.targets.push(spec);
        self
    }

    /// Assembles the container bytes.
    pub fn build(self) -> PackageResult<Vec<u8>> {
        if self.targets.is_empty() {
            return Err(PackageError::NoTargets);
        }
        if self.targets.len() > MAX_TARGETS {
            return Err(PackageError::TooManyTargets {
                got: self.targets.len() as u32,
            });
        }

        let mut entries = Vec::with_capacity(self.targets.len());
        let mut slices: Vec<u8> = Vec::new();
        let mut offset = CONTAINER_HEADER_LEN as u32;

        for spec in &self.targets {
            if spec.dependencies.len() > MAX_DEPENDENCIES {
                return Err(PackageError::TooManyDependencies {
                    got: spec.dependencies.len() as u32,
                });
            }
            let metadata = TargetMetadata {
                target_id: spec.target_id,
                hw_revision: spec.hw_revision,
                fw_version: spec.version,
                fw_size: spec.firmware.len() as u32,
                fw_crc32: CONTAINER_CRC.checksum(&spec.firmware),
                build_time: spec.build_time,
                version_string: spec.version_string.clone(),
                dependencies: spec.dependencies.clone(),
            };
            let mut slice = Vec::with_capacity(METADATA_LEN + spec.firmware.len());
            slice.extend_from_slice(&metadata.to_bytes());
            slice.extend_from_slice(&spec.firmware);

            entries.push(TargetEntry {
                target_id: spec.target_id,
                offset,
                total_size: slice.len() as u32,
                metadata_size: METADATA_LEN as u32,
                version: spec.version,
                crc32: CONTAINER_CRC.checksum(&slice),
                priority: spec.priority,
            });
            offset += slice.len() as u32;
            slices.extend_from_slice(&slice);
        }

        let total_size = CONTAINER_HEADER_LEN as u32 + slices.len() as u32;
        if total_size > MAX_CONTAINER_SIZE {
            return Err(PackageError::SizeOutOfRange { size: total_size });
        }

        let header = ContainerHeader {
            container_id: self.container_id,
            total_size,
            crc32: 0,
            created_at: self.created_at,
            name: self.name,
            targets: entries,
        };

        let mut container = Vec::with_capacity(total_size as usize);
        container.extend_from_slice(&header.to_bytes());
        container.extend_from_slice(&slices);

        let crc = CONTAINER_CRC.checksum(&container[CRC_COVERAGE_OFFSET..]);
        container[0x10..0x14].copy_from_slice(&crc.to_be_bytes());
        Ok(container)
    }
}
