//! Staging regions: where downloaded containers land before installation.
//!
//! Every update target, the gateway itself included, owns one region of
//! the shared flash address space. The download engine resolves the region
//! from the container's routing target and refuses containers that do not
//! fit.

use tracing::debug;

/// Default size of one staging region.
pub const STAGING_REGION_SIZE: u32 = 0x0040_0000;

/// Staging slot for one update target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingRegion {
    /// Update target identifier, matching container metadata.
    pub target_id: u16,
    /// First byte of the region in the device address space.
    pub base: u32,
    /// Region size in bytes.
    pub capacity: u32,
}

impl StagingRegion {
    pub fn fits(&self, size: u32) -> bool {
        size <= self.capacity
    }
}

/// Lookup table from update target identifier to staging region.
#[derive(Debug, Clone, Default)]
pub struct StagingMap {
    regions: Vec<StagingRegion>,
}

impl StagingMap {
    pub fn new(regions: Vec<StagingRegion>) -> Self {
        Self { regions }
    }

    /// The default vehicle map: the gateway in the first region, the three
    /// zone controllers behind it.
    pub fn vehicle_default() -> Self {
        Self::new(vec![
            StagingRegion {
                target_id: 0x0201,
                base: 0x0000_0000,
                capacity: STAGING_REGION_SIZE,
            },
            StagingRegion {
                target_id: 0x0202,
                base: 0x0040_0000,
                capacity: STAGING_REGION_SIZE,
            },
            StagingRegion {
                target_id: 0x0203,
                base: 0x0080_0000,
                capacity: STAGING_REGION_SIZE,
            },
            StagingRegion {
                target_id: 0x0204,
                base: 0x00C0_0000,
                capacity: STAGING_REGION_SIZE,
            },
        ])
    }

    pub fn insert(&mut self, region: StagingRegion) {
        debug!(
            target_id = format_args!("{:#06X}", region.target_id),
            base = format_args!("{:#010X}", region.base),
            capacity = region.capacity,
            "registered staging region"
        );
        self.regions.push(region);
    }

    /// Region for `target_id`, if one is configured.
    pub fn region(&self, target_id: u16) -> Option<&StagingRegion> {
        self.regions.iter().find(|r| r.target_id == target_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StagingRegion> {
        self.regions.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
