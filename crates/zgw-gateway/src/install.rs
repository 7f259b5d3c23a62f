//! Installation orchestration for staged firmware containers.
//!
//! Three outcomes exist for a container that survived download and
//! validation: install it into the gateway's own inactive bank, hand it to
//! the zone router for a downstream device, or walk the whole target table
//! and distribute every zone target in one pass. The self-install path
//! writes only the inactive bank and the marker sector; the active bank is
//! resolved once up front and never appears on the write side.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};
use zgw_flash::{BankId, BankLayout, BankStatus, BootMarker, Storage, StorageError};
use zgw_package::{
    crc_region, ContainerHeader, ContainerValidator, DependencyEdge, PackageError, TargetEntry,
    Version,
};

/// Copy granularity for staging-to-bank transfers.
const COPY_CHUNK: usize = 4096;

/// Rejection raised by a [`ZoneRouter`] implementation.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ForwardError(pub String);

/// Failures while installing or distributing a staged container.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("firmware for target {target_id:#06X} is {size} bytes, bank holds {capacity}")]
    FirmwareTooLarge {
        target_id: u16,
        size: u32,
        capacity: u32,
    },

    #[error("bank verify failed: expected CRC {expected:#010X}, computed {computed:#010X}")]
    VerifyFailed { expected: u32, computed: u32 },

    #[error("device {device_id:#06X} is not in the inventory")]
    DeviceMissing { device_id: u16 },

    #[error("device {device_id:#06X} reports unparseable version `{reported}`")]
    BadInventoryVersion { device_id: u16, reported: String },

    #[error("device {device_id:#06X} runs {installed}, dependency needs at least {minimum}")]
    DependencyNotSatisfied {
        device_id: u16,
        minimum: Version,
        installed: Version,
    },

    #[error("handoff for target {target_id:#06X} failed")]
    ForwardFailed {
        target_id: u16,
        #[source]
        source: ForwardError,
    },

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Hands a staged firmware slice to the transport that delivers it to a
/// downstream zone ECU.
#[cfg_attr(test, mockall::automock)]
pub trait ZoneRouter: Send + Sync {
    fn forward(&self, target_id: u16, staging_address: u32, size: u32) -> Result<(), ForwardError>;
}

/// Reports the firmware version currently installed on a device.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceInventory: Send + Sync {
    fn get_version(&self, device_id: u16) -> Option<String>;
}

/// Inventory backed by a fixed table, built from the zone configuration.
pub struct StaticInventory {
    versions: std::collections::HashMap<u16, String>,
}

impl StaticInventory {
    pub fn from_entries(entries: impl IntoIterator<Item = (u16, String)>) -> Self {
        Self {
            versions: entries.into_iter().collect(),
        }
    }
}

impl DeviceInventory for StaticInventory {
    fn get_version(&self, device_id: u16) -> Option<String> {
        self.versions.get(&device_id).cloned()
    }
}

/// Outcome of distributing one target table entry.
#[derive(Debug)]
pub struct TargetOutcome {
    pub target_id: u16,
    pub result: Result<(), InstallError>,
}

/// Per-target outcomes of a distribution pass, in table order.
#[derive(Debug, Default)]
pub struct DistributionReport {
    pub outcomes: Vec<TargetOutcome>,
}

impl DistributionReport {
    /// True when every distributed target succeeded. An empty pass counts
    /// as success; there was nothing to fail.
    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }
}

/// Executes the post-download branch of the update flow.
pub struct Installer {
    staging: Arc<dyn Storage>,
    program: Arc<dyn Storage>,
    layout: BankLayout,
    status: RwLock<BankStatus>,
    own_target_id: u16,
    router: Arc<dyn ZoneRouter>,
    inventory: Arc<dyn DeviceInventory>,
}

impl Installer {
    pub fn new(
        staging: Arc<dyn Storage>,
        program: Arc<dyn Storage>,
        layout: BankLayout,
        own_target_id: u16,
        router: Arc<dyn ZoneRouter>,
        inventory: Arc<dyn DeviceInventory>,
    ) -> Self {
        Self {
            staging,
            program,
            layout,
            status: RwLock::new(BankStatus::initial()),
            own_target_id,
            router,
            inventory,
        }
    }

    /// Current bank bookkeeping, as reported through diagnostics.
    pub fn bank_status(&self) -> BankStatus {
        *self.status.read()
    }

    /// Replace the bank bookkeeping, e.g. after recovering a persisted
    /// boot marker at startup.
    pub fn set_bank_status(&self, status: BankStatus) {
        *self.status.write() = status;
    }

    /// Install the gateway's own slice of a staged container into the
    /// inactive bank and persist the boot-switch marker.
    ///
    /// The active bank is read out of the bookkeeping exactly once and only
    /// its counterpart is erased, written and verified. Every failure path
    /// returns before the marker is persisted, so a half-written bank is
    /// never bootable.
    pub fn install_self(
        &self,
        header: &ContainerHeader,
        staging_base: u32,
    ) -> Result<(), InstallError> {
        let validator = ContainerValidator::new(&*self.staging, staging_base);
        let (entry, metadata) = validator.find_target_metadata(header, self.own_target_id)?;

        let target_bank = self.status.read().active.other();
        let bank_base = self.layout.base(target_bank);
        if metadata.fw_size > self.layout.bank_size {
            return Err(InstallError::FirmwareTooLarge {
                target_id: self.own_target_id,
                size: metadata.fw_size,
                capacity: self.layout.bank_size,
            });
        }

        info!(
            bank = %target_bank,
            size = metadata.fw_size,
            version = %metadata.fw_version,
            "Installing gateway firmware into inactive bank"
        );

        self.program.erase(bank_base, metadata.fw_size)?;

        let source = staging_base + entry.firmware_offset();
        let mut chunk = [0u8; COPY_CHUNK];
        let mut copied = 0u32;
        while copied < metadata.fw_size {
            let n = ((metadata.fw_size - copied) as usize).min(COPY_CHUNK);
            self.staging.read(source + copied, &mut chunk[..n])?;
            self.program.write(bank_base + copied, &chunk[..n])?;
            copied += n as u32;
        }

        let computed = crc_region(&*self.program, bank_base, metadata.fw_size)?;
        if computed != metadata.fw_crc32 {
            return Err(InstallError::VerifyFailed {
                expected: metadata.fw_crc32,
                computed,
            });
        }

        let marker = BootMarker {
            target_bank,
            firmware_version: metadata.fw_version.into(),
            firmware_crc: metadata.fw_crc32,
        };
        marker.persist(&*self.program, &self.layout)?;

        {
            let mut status = self.status.write();
            match target_bank {
                BankId::A => status.a_healthy = true,
                BankId::B => status.b_healthy = true,
            }
            status.pending_switch = true;
        }

        info!(bank = %target_bank, "Gateway firmware verified; bank switch pending next reboot");
        Ok(())
    }

    /// Hand a staged firmware region to the zone router.
    pub fn forward(
        &self,
        target_id: u16,
        staging_address: u32,
        size: u32,
    ) -> Result<(), InstallError> {
        debug!(
            target = format!("{:#06X}", target_id),
            address = format!("{:#010X}", staging_address),
            size,
            "Handing staged firmware to zone router"
        );
        self.router
            .forward(target_id, staging_address, size)
            .map_err(|source| InstallError::ForwardFailed { target_id, source })
    }

    /// Distribute every zone target of a staged container, in table order.
    ///
    /// The gateway's own entry is skipped; each remaining target has its
    /// metadata read and its declared dependencies checked against the
    /// inventory before the slice is handed to the router. One failing
    /// target aborts that target only, never the pass.
    pub fn distribute_all(
        &self,
        header: &ContainerHeader,
        staging_base: u32,
    ) -> DistributionReport {
        let validator = ContainerValidator::new(&*self.staging, staging_base);
        let mut outcomes = Vec::new();

        for entry in &header.targets {
            if entry.target_id == self.own_target_id {
                debug!(
                    target = format!("{:#06X}", entry.target_id),
                    "Distribution skips the gateway's own entry"
                );
                continue;
            }
            let result = self.distribute_one(&validator, header, entry, staging_base);
            match &result {
                Ok(()) => info!(
                    target = format!("{:#06X}", entry.target_id),
                    "Zone target distributed"
                ),
                Err(err) => warn!(
                    target = format!("{:#06X}", entry.target_id),
                    error = %err,
                    "Zone target not distributed"
                ),
            }
            outcomes.push(TargetOutcome {
                target_id: entry.target_id,
                result,
            });
        }

        DistributionReport { outcomes }
    }

    fn distribute_one(
        &self,
        validator: &ContainerValidator<'_>,
        header: &ContainerHeader,
        entry: &TargetEntry,
        staging_base: u32,
    ) -> Result<(), InstallError> {
        let (entry, metadata) = validator.find_target_metadata(header, entry.target_id)?;
        for dependency in &metadata.dependencies {
            self.check_dependency(dependency)?;
        }
        self.forward(entry.target_id, staging_base + entry.offset, entry.total_size)
    }

    fn check_dependency(&self, dependency: &DependencyEdge) -> Result<(), InstallError> {
        let reported = self
            .inventory
            .get_version(dependency.target_id)
            .ok_or(InstallError::DeviceMissing {
                device_id: dependency.target_id,
            })?;
        let installed: Version =
            reported
                .parse()
                .map_err(|_| InstallError::BadInventoryVersion {
                    device_id: dependency.target_id,
                    reported: reported.clone(),
                })?;
        if !installed.satisfies_min(dependency.min_version) {
            return Err(InstallError::DependencyNotSatisfied {
                device_id: dependency.target_id,
                minimum: dependency.min_version,
                installed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use mockall::Sequence;
    use pretty_assertions::assert_eq;
    use zgw_flash::MemStorage;
    use zgw_package::{ContainerBuilder, TargetSpec};

    use super::*;

    const GATEWAY: u16 = 0x0201;
    const ZONE_FL: u16 = 0x0202;
    const ZONE_FR: u16 = 0x0203;

    fn tiny_layout() -> BankLayout {
        BankLayout {
            a_base: 0x1_0000,
            b_base: 0x2_0000,
            bank_size: 0x1_0000,
            marker_address: 0x3_0000,
        }
    }

    fn stage(container: &[u8]) -> Arc<MemStorage> {
        let staging = Arc::new(MemStorage::new(0x1_0000));
        staging.erase(0, container.len() as u32).unwrap();
        staging.write(0, container).unwrap();
        staging
    }

    fn self_container(firmware: &[u8]) -> Vec<u8> {
        ContainerBuilder::new(7, "gateway-update")
            .add_target(TargetSpec {
                target_id: GATEWAY,
                version: Version::new(2, 0, 0),
                version_string: "2.0.0".to_string(),
                firmware: firmware.to_vec(),
                ..TargetSpec::default()
            })
            .build()
            .unwrap()
    }

    fn installer_with(
        staging: Arc<MemStorage>,
        program: Arc<MemStorage>,
        router: MockZoneRouter,
        inventory: MockDeviceInventory,
    ) -> Installer {
        Installer::new(
            staging,
            program,
            tiny_layout(),
            GATEWAY,
            Arc::new(router),
            Arc::new(inventory),
        )
    }

    fn quiet_mocks() -> (MockZoneRouter, MockDeviceInventory) {
        (MockZoneRouter::new(), MockDeviceInventory::new())
    }

    #[test]
    fn self_install_writes_only_the_inactive_bank() {
        let firmware: Vec<u8> = (0u32..600).map(|i| (i % 251) as u8).collect();
        let container = self_container(&firmware);
        let header = ContainerHeader::parse(&container).unwrap();

        let staging = stage(&container);
        let program = Arc::new(MemStorage::new(0x4_0000));
        let layout = tiny_layout();

        // Give the active bank recognizable content first.
        program.erase(layout.a_base, 16).unwrap();
        program.write(layout.a_base, b"ACTIVE-BANK-DATA").unwrap();
        let active_before = {
            let snapshot = program.snapshot();
            snapshot[layout.a_base as usize..(layout.a_base + 16) as usize].to_vec()
        };

        let (router, inventory) = quiet_mocks();
        let installer = installer_with(staging, Arc::clone(&program), router, inventory);

        installer.install_self(&header, 0).unwrap();

        let snapshot = program.snapshot();
        let bank_b = &snapshot[layout.b_base as usize..(layout.b_base as usize + firmware.len())];
        assert_eq!(bank_b, firmware.as_slice());
        assert_eq!(
            &snapshot[layout.a_base as usize..(layout.a_base + 16) as usize],
            active_before.as_slice()
        );

        let marker = BootMarker::load(&*program, &layout).unwrap().unwrap();
        assert_eq!(marker.target_bank, BankId::B);
        assert_eq!(marker.firmware_version, u32::from(Version::new(2, 0, 0)));

        let status = installer.bank_status();
        assert_eq!(status.active, BankId::A);
        assert!(status.b_healthy);
        assert!(status.pending_switch);
    }

    #[test]
    fn corrupted_staging_fails_verify_and_leaves_no_marker() {
        let firmware = vec![0x5A; 300];
        let container = self_container(&firmware);
        let header = ContainerHeader::parse(&container).unwrap();

        let staging = stage(&container);
        // Flip one firmware byte after staging; the bank copy will hash
        // differently from the metadata's declared CRC.
        let fw_offset = header.routing_target().firmware_offset();
        staging.write(fw_offset, &[0xA5]).unwrap();

        let program = Arc::new(MemStorage::new(0x4_0000));
        let (router, inventory) = quiet_mocks();
        let installer = installer_with(staging, Arc::clone(&program), router, inventory);

        let err = installer.install_self(&header, 0).unwrap_err();
        assert!(matches!(err, InstallError::VerifyFailed { .. }));

        assert!(BootMarker::load(&*program, &tiny_layout()).unwrap().is_none());
        assert!(!installer.bank_status().pending_switch);
    }

    #[test]
    fn oversized_firmware_is_rejected_before_erase() {
        let firmware = vec![0u8; 0x1_0000 + 1];
        let container = ContainerBuilder::new(8, "too-big")
            .add_target(TargetSpec {
                target_id: GATEWAY,
                firmware,
                ..TargetSpec::default()
            })
            .build()
            .unwrap();
        let header = ContainerHeader::parse(&container).unwrap();

        let staging = Arc::new(MemStorage::new(0x2_0000));
        staging.erase(0, container.len() as u32).unwrap();
        staging.write(0, &container).unwrap();

        let program = Arc::new(MemStorage::new(0x4_0000));
        let (router, inventory) = quiet_mocks();
        let installer = installer_with(staging, Arc::clone(&program), router, inventory);

        let err = installer.install_self(&header, 0).unwrap_err();
        assert!(matches!(
            err,
            InstallError::FirmwareTooLarge {
                target_id: GATEWAY,
                capacity: 0x1_0000,
                ..
            }
        ));
        // Bank B untouched: still fully erased.
        let snapshot = program.snapshot();
        assert!(snapshot[0x2_0000..0x2_0010]
            .iter()
            .all(|&b| b == zgw_flash::ERASED_BYTE));
    }

    #[test]
    fn forward_maps_router_rejections() {
        let (mut router, inventory) = quiet_mocks();
        router
            .expect_forward()
            .with(eq(ZONE_FL), eq(0x40_0000u32), eq(2048u32))
            .times(1)
            .returning(|_, _, _| Err(ForwardError("zone offline".to_string())));

        let staging = Arc::new(MemStorage::new(0x100));
        let program = Arc::new(MemStorage::new(0x4_0000));
        let installer = installer_with(staging, program, router, inventory);

        let err = installer.forward(ZONE_FL, 0x40_0000, 2048).unwrap_err();
        assert!(matches!(
            err,
            InstallError::ForwardFailed {
                target_id: ZONE_FL,
                ..
            }
        ));
    }

    fn two_zone_container() -> Vec<u8> {
        ContainerBuilder::new(9, "zone-pair")
            .add_target(TargetSpec {
                target_id: ZONE_FL,
                firmware: vec![0x11; 256],
                ..TargetSpec::default()
            })
            .add_target(TargetSpec {
                target_id: ZONE_FR,
                firmware: vec![0x22; 128],
                dependencies: vec![DependencyEdge {
                    target_id: ZONE_FL,
                    min_version: Version::new(2, 0, 0),
                }],
                ..TargetSpec::default()
            })
            .build()
            .unwrap()
    }

    #[test]
    fn distribution_walks_targets_in_table_order() {
        let container = two_zone_container();
        let header = ContainerHeader::parse(&container).unwrap();
        let staging = stage(&container);

        let mut sequence = Sequence::new();
        let mut router = MockZoneRouter::new();
        let fl = *header.find_entry(ZONE_FL).unwrap();
        let fr = *header.find_entry(ZONE_FR).unwrap();
        router
            .expect_forward()
            .with(eq(ZONE_FL), eq(fl.offset), eq(fl.total_size))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _| Ok(()));
        router
            .expect_forward()
            .with(eq(ZONE_FR), eq(fr.offset), eq(fr.total_size))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _| Ok(()));

        let mut inventory = MockDeviceInventory::new();
        inventory
            .expect_get_version()
            .with(eq(ZONE_FL))
            .returning(|_| Some("2.1.0".to_string()));

        let program = Arc::new(MemStorage::new(0x4_0000));
        let installer = installer_with(staging, program, router, inventory);

        let report = installer.distribute_all(&header, 0);
        assert!(report.all_ok());
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].target_id, ZONE_FL);
        assert_eq!(report.outcomes[1].target_id, ZONE_FR);
    }

    #[test]
    fn unsatisfied_dependency_skips_only_that_target() {
        let container = two_zone_container();
        let header = ContainerHeader::parse(&container).unwrap();
        let staging = stage(&container);

        let mut router = MockZoneRouter::new();
        // Only the front-left target may reach the router.
        router
            .expect_forward()
            .with(eq(ZONE_FL), eq(192u32), eq(128 + 256u32))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut inventory = MockDeviceInventory::new();
        inventory
            .expect_get_version()
            .with(eq(ZONE_FL))
            .returning(|_| Some("1.4.0".to_string()));

        let program = Arc::new(MemStorage::new(0x4_0000));
        let installer = installer_with(staging, program, router, inventory);

        let report = installer.distribute_all(&header, 0);
        assert!(!report.all_ok());
        assert_eq!(report.failed(), 1);
        assert!(matches!(
            report.outcomes[1].result,
            Err(InstallError::DependencyNotSatisfied {
                device_id: ZONE_FL,
                ..
            })
        ));
    }

    #[test]
    fn missing_inventory_device_blocks_the_dependent_target() {
        let container = two_zone_container();
        let header = ContainerHeader::parse(&container).unwrap();
        let staging = stage(&container);

        let mut router = MockZoneRouter::new();
        router
            .expect_forward()
            .with(eq(ZONE_FL), eq(192u32), eq(128 + 256u32))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut inventory = MockDeviceInventory::new();
        inventory
            .expect_get_version()
            .with(eq(ZONE_FL))
            .returning(|_| None);

        let program = Arc::new(MemStorage::new(0x4_0000));
        let installer = installer_with(staging, program, router, inventory);

        let report = installer.distribute_all(&header, 0);
        assert!(matches!(
            report.outcomes[1].result,
            Err(InstallError::DeviceMissing {
                device_id: ZONE_FL
            })
        ));
    }

    #[test]
    fn static_inventory_reports_configured_versions() {
        let inventory = StaticInventory::from_entries([
            (ZONE_FL, "1.2.3".to_string()),
            (ZONE_FR, "0.9.0".to_string()),
        ]);
        assert_eq!(inventory.get_version(ZONE_FL).as_deref(), Some("1.2.3"));
        assert_eq!(inventory.get_version(0x0299), None);
    }
}
