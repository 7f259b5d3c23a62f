//! Firmware download sessions (UDS 0x34 / 0x36 / 0x37).
//!
//! One download runs at a time. RequestDownload opens the session,
//! TransferData blocks stream the container into a staging region, and
//! RequestTransferExit validates the staged bytes and branches into
//! installation or handoff. The staging region is not chosen by the tester:
//! the first transfer block must carry the complete container header, and
//! the header's routing target picks the region.
//!
//! Rejections come in two severities. Sequencing rejections (wrong block
//! counter, download while one is active, oversized chunk) leave the
//! session exactly as it was, so the tester can retry. Integrity and
//! storage failures park the session in an error phase that answers
//! every further 0x34/0x36/0x37 negatively until an explicit reset.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use zgw_flash::{StagingMap, Storage};
use zgw_package::container::{CONTAINER_HEADER_LEN, MAX_CONTAINER_SIZE};
use zgw_package::{ContainerHeader, ContainerValidator};
use zgw_uds::{negative_response, positive_response, service_id, NegativeResponseCode};

use crate::install::Installer;

/// Advertised maxNumberOfBlockLength: service id + block counter + data.
pub const MAX_BLOCK_LENGTH: u16 = 256;
/// lengthFormatIdentifier for the RequestDownload response.
pub const LENGTH_FORMAT_ID: u8 = 0x20;
/// Largest data chunk one TransferData block may carry.
pub const MAX_BLOCK_DATA: usize = MAX_BLOCK_LENGTH as usize - 2;
/// Block counters run 1..=255 and wrap back to 1, never 0.
pub const FIRST_BLOCK: u8 = 1;

fn next_block(counter: u8) -> u8 {
    match counter.wrapping_add(1) {
        0 => FIRST_BLOCK,
        next => next,
    }
}

/// Where a session is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    /// Opened by 0x34; no block accepted yet, staging region unknown.
    Requested,
    /// Header parsed, region resolved, blocks streaming.
    Transferring,
    /// A failure poisoned the session; only an explicit reset recovers.
    Error,
}

/// State of the single in-flight download.
#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub phase: DownloadPhase,
    /// Memory address from the request, recorded for diagnostics only;
    /// staging placement comes from the container header.
    pub requested_address: u32,
    /// Transfer size declared by 0x34.
    pub total_size: u32,
    pub received: u32,
    /// Base of the resolved staging region, valid once transferring.
    pub staging_base: u32,
    pub expected_block: u8,
    pub header: Option<ContainerHeader>,
    /// Routing target from the container header, resolved at block 1.
    pub target_id: Option<u16>,
}

/// A fully transferred, checksum-valid container awaiting distribution.
#[derive(Debug, Clone)]
pub struct StagedContainer {
    pub header: ContainerHeader,
    pub base: u32,
}

/// Serves the download service trio against staging flash.
pub struct DownloadEngine {
    staging: Arc<dyn Storage>,
    staging_map: StagingMap,
    own_target_id: u16,
    session: RwLock<Option<DownloadSession>>,
    staged: RwLock<Option<StagedContainer>>,
}

impl DownloadEngine {
    pub fn new(staging: Arc<dyn Storage>, staging_map: StagingMap, own_target_id: u16) -> Self {
        Self {
            staging,
            staging_map,
            own_target_id,
            session: RwLock::new(None),
            staged: RwLock::new(None),
        }
    }

    /// Snapshot of the in-flight session, if any.
    pub fn session(&self) -> Option<DownloadSession> {
        self.session.read().clone()
    }

    /// The last completed container, if one is staged.
    pub fn staged(&self) -> Option<StagedContainer> {
        self.staged.read().clone()
    }

    /// Drop the session (errored or not) and the staged container.
    pub fn reset(&self) {
        let had_session = self.session.write().take().is_some();
        let had_staged = self.staged.write().take().is_some();
        if had_session || had_staged {
            info!(had_session, had_staged, "Download state reset");
        }
    }

    /// Re-read the staged container from flash and check it end to end.
    /// `None` when nothing is staged.
    pub fn verify_staged(&self) -> Option<bool> {
        let staged = self.staged.read().clone()?;
        let validator = ContainerValidator::new(&*self.staging, staged.base);
        let result = validator
            .parse_header()
            .and_then(|header| validator.validate_checksum(&header));
        match result {
            Ok(()) => Some(true),
            Err(err) => {
                warn!(error = %err, "Staged container failed re-validation");
                Some(false)
            }
        }
    }

    /// UDS 0x34: open a download session.
    ///
    /// `data` is the service payload: data format identifier, then the
    /// address-and-length format identifier whose nibbles give the size and
    /// address byte counts, then the address and size in that order.
    pub fn handle_request_download(&self, data: &[u8]) -> Vec<u8> {
        if data.len() < 2 {
            return negative_response(
                service_id::REQUEST_DOWNLOAD,
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
            );
        }

        // One session at a time; an errored one still occupies the slot
        // until it is explicitly reset.
        if self.session.read().is_some() {
            debug!("Download denied: session already open");
            return negative_response(
                service_id::REQUEST_DOWNLOAD,
                NegativeResponseCode::ConditionsNotCorrect,
            );
        }

        if !self.staging.is_ready() {
            debug!("Download denied: staging storage not ready");
            return negative_response(
                service_id::REQUEST_DOWNLOAD,
                NegativeResponseCode::ConditionsNotCorrect,
            );
        }

        let _data_format = data[0];
        let addr_len_format = data[1];
        let memory_size_len = ((addr_len_format >> 4) & 0x0F) as usize;
        let memory_addr_len = (addr_len_format & 0x0F) as usize;

        let expected_len = 2 + memory_addr_len + memory_size_len;
        if data.len() < expected_len {
            return negative_response(
                service_id::REQUEST_DOWNLOAD,
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
            );
        }

        let addr_end = 2 + memory_addr_len;
        let mut memory_address: u32 = 0;
        for byte in &data[2..addr_end] {
            memory_address = (memory_address << 8) | *byte as u32;
        }

        let mut memory_size: u32 = 0;
        for byte in &data[addr_end..addr_end + memory_size_len] {
            memory_size = (memory_size << 8) | *byte as u32;
        }

        if memory_size == 0 || memory_size > MAX_CONTAINER_SIZE {
            debug!(size = memory_size, "Download denied: size out of range");
            return negative_response(
                service_id::REQUEST_DOWNLOAD,
                NegativeResponseCode::UploadDownloadNotAccepted,
            );
        }

        info!(
            address = format!("0x{:08X}", memory_address),
            size = memory_size,
            "RequestDownload: session opened"
        );

        *self.session.write() = Some(DownloadSession {
            phase: DownloadPhase::Requested,
            requested_address: memory_address,
            total_size: memory_size,
            received: 0,
            staging_base: 0,
            expected_block: FIRST_BLOCK,
            header: None,
            target_id: None,
        });

        positive_response(
            service_id::REQUEST_DOWNLOAD,
            &[
                LENGTH_FORMAT_ID,
                (MAX_BLOCK_LENGTH >> 8) as u8,
                (MAX_BLOCK_LENGTH & 0xFF) as u8,
            ],
        )
    }

    /// UDS 0x36: stream one block into the staging region.
    pub fn handle_transfer_data(&self, data: &[u8]) -> Vec<u8> {
        let mut guard = self.session.write();
        let session = match guard.as_mut() {
            Some(session) => session,
            None => {
                debug!("TransferData denied: no download session");
                return negative_response(
                    service_id::TRANSFER_DATA,
                    NegativeResponseCode::RequestSequenceError,
                );
            }
        };

        if session.phase == DownloadPhase::Error {
            debug!("TransferData denied: session in error state");
            return negative_response(
                service_id::TRANSFER_DATA,
                NegativeResponseCode::RequestSequenceError,
            );
        }

        if data.len() < 2 {
            return negative_response(
                service_id::TRANSFER_DATA,
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
            );
        }

        let block = data[0];
        let chunk = &data[1..];

        if chunk.len() > MAX_BLOCK_DATA {
            debug!(
                bytes = chunk.len(),
                "TransferData denied: chunk exceeds advertised block length"
            );
            return negative_response(
                service_id::TRANSFER_DATA,
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
            );
        }

        if block != session.expected_block {
            debug!(
                expected = session.expected_block,
                received = block,
                "TransferData: wrong block sequence counter"
            );
            return negative_response(
                service_id::TRANSFER_DATA,
                NegativeResponseCode::WrongBlockSequenceCounter,
            );
        }

        if session.header.is_none() {
            // Block 1: the chunk must open with the complete container
            // header so the staging region can be resolved before any
            // byte lands in flash.
            if let Some(response) = self.accept_first_block(session, chunk) {
                return response;
            }
        } else {
            if session.received + chunk.len() as u32 > session.total_size {
                debug!(
                    received = session.received,
                    incoming = chunk.len(),
                    declared = session.total_size,
                    "TransferData denied: data past declared size"
                );
                return negative_response(
                    service_id::TRANSFER_DATA,
                    NegativeResponseCode::TransferDataSuspended,
                );
            }
            let address = session.staging_base + session.received;
            if let Err(err) = self.staging.write(address, chunk) {
                warn!(error = %err, "TransferData: staging write failed");
                session.phase = DownloadPhase::Error;
                return negative_response(
                    service_id::TRANSFER_DATA,
                    NegativeResponseCode::GeneralProgrammingFailure,
                );
            }
            session.received += chunk.len() as u32;
        }

        session.expected_block = next_block(session.expected_block);

        debug!(
            block,
            bytes = chunk.len(),
            received = session.received,
            total = session.total_size,
            "TransferData: block accepted"
        );

        positive_response(service_id::TRANSFER_DATA, &[block])
    }

    /// Block-1 handling: parse the header, resolve the region, erase it
    /// and land the first chunk. Returns the negative response on any
    /// rejection, `None` once the chunk is accepted.
    fn accept_first_block(&self, session: &mut DownloadSession, chunk: &[u8]) -> Option<Vec<u8>> {
        if chunk.len() < CONTAINER_HEADER_LEN {
            debug!(
                bytes = chunk.len(),
                "TransferData denied: first block shorter than the container header"
            );
            return Some(negative_response(
                service_id::TRANSFER_DATA,
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
            ));
        }

        let header = match ContainerHeader::parse(&chunk[..CONTAINER_HEADER_LEN]) {
            Ok(header) => header,
            Err(err) => {
                warn!(error = %err, "TransferData: container header rejected");
                session.phase = DownloadPhase::Error;
                return Some(negative_response(
                    service_id::TRANSFER_DATA,
                    NegativeResponseCode::GeneralProgrammingFailure,
                ));
            }
        };

        let target_id = header.routing_target().target_id;
        let region = match self.staging_map.region(target_id) {
            Some(region) => region,
            None => {
                debug!(
                    target = format!("0x{:04X}", target_id),
                    "TransferData denied: no staging region for routing target"
                );
                return Some(negative_response(
                    service_id::TRANSFER_DATA,
                    NegativeResponseCode::RequestOutOfRange,
                ));
            }
        };

        if !region.fits(header.total_size) || !region.fits(session.total_size) {
            debug!(
                target = format!("0x{:04X}", target_id),
                container = header.total_size,
                declared = session.total_size,
                capacity = region.capacity,
                "TransferData denied: container exceeds staging region"
            );
            return Some(negative_response(
                service_id::TRANSFER_DATA,
                NegativeResponseCode::RequestOutOfRange,
            ));
        }

        if let Err(err) = self.staging.erase(region.base, header.total_size) {
            warn!(error = %err, "TransferData: staging erase failed");
            session.phase = DownloadPhase::Error;
            return Some(negative_response(
                service_id::TRANSFER_DATA,
                NegativeResponseCode::GeneralProgrammingFailure,
            ));
        }
        if let Err(err) = self.staging.write(region.base, chunk) {
            warn!(error = %err, "TransferData: staging write failed");
            session.phase = DownloadPhase::Error;
            return Some(negative_response(
                service_id::TRANSFER_DATA,
                NegativeResponseCode::GeneralProgrammingFailure,
            ));
        }

        info!(
            target = format!("0x{:04X}", target_id),
            base = format!("0x{:08X}", region.base),
            container = header.container_id,
            size = header.total_size,
            "TransferData: container header accepted, staging started"
        );

        session.staging_base = region.base;
        session.received = chunk.len() as u32;
        session.target_id = Some(target_id);
        session.header = Some(header);
        session.phase = DownloadPhase::Transferring;
        None
    }

    /// UDS 0x37: close the session, validate the staged container and
    /// branch into self-install or downstream handoff.
    ///
    /// The session slot is freed on every branch outcome; a failed install
    /// answers negatively but does not block the next download. The
    /// container stays staged for later verification or distribution.
    pub fn handle_request_transfer_exit(&self, _data: &[u8], installer: &Installer) -> Vec<u8> {
        let mut guard = self.session.write();
        let session = match guard.as_mut() {
            Some(session) => session,
            None => {
                debug!("TransferExit denied: no download session");
                return negative_response(
                    service_id::REQUEST_TRANSFER_EXIT,
                    NegativeResponseCode::RequestSequenceError,
                );
            }
        };

        if session.phase == DownloadPhase::Error {
            debug!("TransferExit denied: session in error state");
            return negative_response(
                service_id::REQUEST_TRANSFER_EXIT,
                NegativeResponseCode::RequestSequenceError,
            );
        }

        if session.received != session.total_size {
            warn!(
                received = session.received,
                declared = session.total_size,
                "TransferExit: transfer incomplete"
            );
            session.phase = DownloadPhase::Error;
            return negative_response(
                service_id::REQUEST_TRANSFER_EXIT,
                NegativeResponseCode::GeneralProgrammingFailure,
            );
        }

        let (header, base, target_id) = match (session.header.clone(), session.target_id) {
            (Some(header), Some(target_id)) => (header, session.staging_base, target_id),
            // Unreachable while total_size > 0, but a session without a
            // header has nothing to validate or install.
            _ => {
                session.phase = DownloadPhase::Error;
                return negative_response(
                    service_id::REQUEST_TRANSFER_EXIT,
                    NegativeResponseCode::RequestSequenceError,
                );
            }
        };

        let validator = ContainerValidator::new(&*self.staging, base);
        if let Err(err) = validator.validate_checksum(&header) {
            warn!(error = %err, "TransferExit: staged container failed validation");
            session.phase = DownloadPhase::Error;
            return negative_response(
                service_id::REQUEST_TRANSFER_EXIT,
                NegativeResponseCode::GeneralProgrammingFailure,
            );
        }

        // Commit point: the slot frees regardless of how the branch goes.
        *guard = None;
        drop(guard);

        *self.staged.write() = Some(StagedContainer {
            header: header.clone(),
            base,
        });

        let outcome = if target_id == self.own_target_id {
            info!(
                container = header.container_id,
                "TransferExit: container targets this gateway, installing"
            );
            installer.install_self(&header, base)
        } else {
            info!(
                target = format!("0x{:04X}", target_id),
                "TransferExit: container targets a zone device, handing off"
            );
            installer.forward(target_id, base, header.total_size)
        };

        match outcome {
            Ok(()) => positive_response(service_id::REQUEST_TRANSFER_EXIT, &[]),
            Err(err) => {
                warn!(error = %err, "TransferExit: branch failed");
                negative_response(
                    service_id::REQUEST_TRANSFER_EXIT,
                    NegativeResponseCode::GeneralProgrammingFailure,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use zgw_flash::{BankLayout, MemStorage, StagingRegion};
    use zgw_package::{ContainerBuilder, TargetSpec, Version};

    use crate::install::{MockDeviceInventory, MockZoneRouter};

    use super::*;

    const GATEWAY: u16 = 0x0201;
    const ZONE_FL: u16 = 0x0202;
    const ZONE_TINY: u16 = 0x0208;

    const GATEWAY_BASE: u32 = 0x0000_0000;
    const ZONE_BASE: u32 = 0x0002_0000;
    const TINY_BASE: u32 = 0x0003_F000;

    fn test_map() -> StagingMap {
        StagingMap::new(vec![
            StagingRegion {
                target_id: GATEWAY,
                base: GATEWAY_BASE,
                capacity: 0x2_0000,
            },
            StagingRegion {
                target_id: ZONE_FL,
                base: ZONE_BASE,
                capacity: 0x2_0000,
            },
            StagingRegion {
                target_id: ZONE_TINY,
                base: TINY_BASE,
                capacity: 0x200,
            },
        ])
    }

    fn engine() -> (DownloadEngine, Arc<MemStorage>) {
        let staging = Arc::new(MemStorage::new(0x4_0000));
        let engine = DownloadEngine::new(Arc::clone(&staging) as Arc<dyn Storage>, test_map(), GATEWAY);
        (engine, staging)
    }

    fn installer(staging: &Arc<MemStorage>, router: MockZoneRouter) -> Installer {
        Installer::new(
            Arc::clone(staging) as Arc<dyn Storage>,
            Arc::new(MemStorage::new(0x4_0000)),
            BankLayout {
                a_base: 0x1_0000,
                b_base: 0x2_0000,
                bank_size: 0x1_0000,
                marker_address: 0x3_0000,
            },
            GATEWAY,
            Arc::new(router),
            Arc::new(MockDeviceInventory::new()),
        )
    }

    fn container_for(target_id: u16, firmware_len: usize) -> Vec<u8> {
        ContainerBuilder::new(0x1001, "test-container")
            .add_target(TargetSpec {
                target_id,
                version: Version::new(1, 1, 0),
                version_string: "1.1.0".to_string(),
                firmware: vec![0x42; firmware_len],
                ..TargetSpec::default()
            })
            .build()
            .unwrap()
    }

    fn rd_request(size: u32) -> Vec<u8> {
        // Data format 0x00, then ALFID 0x44: 4 size bytes, 4 address bytes.
        let mut data = vec![0x00, 0x44];
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&size.to_be_bytes());
        data
    }

    fn td_request(block: u8, chunk: &[u8]) -> Vec<u8> {
        let mut data = vec![block];
        data.extend_from_slice(chunk);
        data
    }

    /// Stream `container` through 0x36 in max-size chunks, asserting each
    /// block's positive echo. Returns after the last block.
    fn stream(engine: &DownloadEngine, container: &[u8]) {
        let mut counter = FIRST_BLOCK;
        for chunk in container.chunks(MAX_BLOCK_DATA) {
            assert_ne!(counter, 0, "block counter must never be zero");
            let response = engine.handle_transfer_data(&td_request(counter, chunk));
            assert_eq!(response, vec![0x76, counter]);
            counter = next_block(counter);
        }
    }

    fn open_session(engine: &DownloadEngine, size: u32) {
        let response = engine.handle_request_download(&rd_request(size));
        assert_eq!(response, vec![0x74, 0x20, 0x01, 0x00]);
    }

    // =========================================================================
    // RequestDownload
    // =========================================================================

    #[test]
    fn request_download_advertises_fixed_block_length() {
        let (engine, _staging) = engine();
        let response = engine.handle_request_download(&rd_request(4096));
        // 0x20 length format, then 256 big-endian.
        assert_eq!(response, vec![0x74, 0x20, 0x01, 0x00]);
        let session = engine.session().unwrap();
        assert_eq!(session.phase, DownloadPhase::Requested);
        assert_eq!(session.total_size, 4096);
        assert_eq!(session.expected_block, FIRST_BLOCK);
    }

    #[test]
    fn second_download_is_denied_without_touching_the_first() {
        let (engine, _staging) = engine();
        open_session(&engine, 4096);
        let response = engine.handle_request_download(&rd_request(8192));
        assert_eq!(response, vec![0x7F, 0x34, 0x22]);
        // The open session is untouched.
        assert_eq!(engine.session().unwrap().total_size, 4096);
    }

    #[test]
    fn truncated_download_requests_are_rejected() {
        let (engine, _staging) = engine();
        assert_eq!(
            engine.handle_request_download(&[0x00]),
            vec![0x7F, 0x34, 0x13]
        );
        // ALFID promises more bytes than the request carries.
        assert_eq!(
            engine.handle_request_download(&[0x00, 0x44, 0x00, 0x00]),
            vec![0x7F, 0x34, 0x13]
        );
        assert!(engine.session().is_none());
    }

    #[test]
    fn zero_and_oversized_downloads_are_not_accepted() {
        let (engine, _staging) = engine();
        assert_eq!(
            engine.handle_request_download(&rd_request(0)),
            vec![0x7F, 0x34, 0x70]
        );
        assert_eq!(
            engine.handle_request_download(&rd_request(MAX_CONTAINER_SIZE + 1)),
            vec![0x7F, 0x34, 0x70]
        );
        assert!(engine.session().is_none());
    }

    #[test]
    fn download_requires_ready_storage() {
        let (engine, staging) = engine();
        staging.set_ready(false);
        assert_eq!(
            engine.handle_request_download(&rd_request(4096)),
            vec![0x7F, 0x34, 0x22]
        );
    }

    #[test]
    fn narrow_alfid_widths_parse() {
        let (engine, _staging) = engine();
        // 2 size bytes, 1 address byte.
        let response = engine.handle_request_download(&[0x00, 0x21, 0x00, 0x10, 0x00]);
        assert_eq!(response, vec![0x74, 0x20, 0x01, 0x00]);
        assert_eq!(engine.session().unwrap().total_size, 0x1000);
    }

    // =========================================================================
    // TransferData
    // =========================================================================

    #[test]
    fn transfer_without_session_is_a_sequence_error() {
        let (engine, _staging) = engine();
        let response = engine.handle_transfer_data(&td_request(1, &[0x00]));
        assert_eq!(response, vec![0x7F, 0x36, 0x24]);
    }

    #[test]
    fn first_block_must_hold_the_container_header() {
        let (engine, _staging) = engine();
        let container = container_for(GATEWAY, 600);
        open_session(&engine, container.len() as u32);

        let response = engine.handle_transfer_data(&td_request(1, &container[..100]));
        assert_eq!(response, vec![0x7F, 0x36, 0x13]);

        // Not poisoned: the full first block is still welcome.
        let session = engine.session().unwrap();
        assert_eq!(session.phase, DownloadPhase::Requested);
        assert_eq!(session.expected_block, 1);
        let response = engine.handle_transfer_data(&td_request(1, &container[..MAX_BLOCK_DATA]));
        assert_eq!(response, vec![0x76, 0x01]);
    }

    #[test]
    fn corrupt_header_poisons_the_session() {
        let (engine, _staging) = engine();
        let mut container = container_for(GATEWAY, 600);
        container[0] = b'X';
        open_session(&engine, container.len() as u32);

        let response = engine.handle_transfer_data(&td_request(1, &container[..MAX_BLOCK_DATA]));
        assert_eq!(response, vec![0x7F, 0x36, 0x72]);
        assert_eq!(engine.session().unwrap().phase, DownloadPhase::Error);

        // Errored sessions answer 0x24 on 0x36 and 0x22 on 0x34.
        assert_eq!(
            engine.handle_transfer_data(&td_request(2, &[0x00])),
            vec![0x7F, 0x36, 0x24]
        );
        assert_eq!(
            engine.handle_request_download(&rd_request(4096)),
            vec![0x7F, 0x34, 0x22]
        );

        // Only the explicit reset clears the slot.
        engine.reset();
        assert!(engine.session().is_none());
        open_session(&engine, 4096);
    }

    #[test]
    fn unknown_routing_target_is_out_of_range() {
        let (engine, _staging) = engine();
        let container = container_for(0x0299, 600);
        open_session(&engine, container.len() as u32);

        let response = engine.handle_transfer_data(&td_request(1, &container[..MAX_BLOCK_DATA]));
        assert_eq!(response, vec![0x7F, 0x36, 0x31]);

        // Recoverable: a corrected container may replay block 1.
        let session = engine.session().unwrap();
        assert_eq!(session.phase, DownloadPhase::Requested);
        assert_eq!(session.expected_block, 1);
    }

    #[test]
    fn container_exceeding_its_region_is_out_of_range() {
        let (engine, _staging) = engine();
        // ZONE_TINY's region holds 0x200 bytes; this container is larger.
        let container = container_for(ZONE_TINY, 600);
        open_session(&engine, container.len() as u32);
        let response = engine.handle_transfer_data(&td_request(1, &container[..MAX_BLOCK_DATA]));
        assert_eq!(response, vec![0x7F, 0x36, 0x31]);
    }

    #[test]
    fn wrong_block_counter_leaves_the_session_untouched() {
        let (engine, _staging) = engine();
        let container = container_for(GATEWAY, 600);
        open_session(&engine, container.len() as u32);

        let first = &container[..MAX_BLOCK_DATA];
        assert_eq!(
            engine.handle_transfer_data(&td_request(1, first)),
            vec![0x76, 0x01]
        );

        // Replaying block 1 is a counter mismatch, nothing more.
        let response = engine.handle_transfer_data(&td_request(1, first));
        assert_eq!(response, vec![0x7F, 0x36, 0x73]);
        let session = engine.session().unwrap();
        assert_eq!(session.phase, DownloadPhase::Transferring);
        assert_eq!(session.expected_block, 2);
        assert_eq!(session.received, MAX_BLOCK_DATA as u32);

        // The expected block still goes through.
        let second = &container[MAX_BLOCK_DATA..(2 * MAX_BLOCK_DATA).min(container.len())];
        assert_eq!(
            engine.handle_transfer_data(&td_request(2, second)),
            vec![0x76, 0x02]
        );
    }

    #[test]
    fn oversized_chunks_are_rejected() {
        let (engine, _staging) = engine();
        let container = container_for(GATEWAY, 600);
        open_session(&engine, container.len() as u32);
        let response =
            engine.handle_transfer_data(&td_request(1, &vec![0u8; MAX_BLOCK_DATA + 1]));
        assert_eq!(response, vec![0x7F, 0x36, 0x13]);
        assert_eq!(engine.session().unwrap().phase, DownloadPhase::Requested);
    }

    #[test]
    fn data_past_the_declared_size_suspends() {
        let (engine, _staging) = engine();
        let container = container_for(GATEWAY, 600);
        open_session(&engine, container.len() as u32);
        stream(&engine, &container);

        let session = engine.session().unwrap();
        let response =
            engine.handle_transfer_data(&td_request(session.expected_block, &[0xEE, 0xEE]));
        assert_eq!(response, vec![0x7F, 0x36, 0x71]);
        // Not poisoned; the finished transfer can still exit.
        assert_eq!(engine.session().unwrap().phase, DownloadPhase::Transferring);
    }

    #[test]
    fn staging_write_failure_poisons_the_session() {
        let (engine, staging) = engine();
        let container = container_for(GATEWAY, 600);
        open_session(&engine, container.len() as u32);
        staging.fail_next_writes(1);

        let response = engine.handle_transfer_data(&td_request(1, &container[..MAX_BLOCK_DATA]));
        assert_eq!(response, vec![0x7F, 0x36, 0x72]);
        assert_eq!(engine.session().unwrap().phase, DownloadPhase::Error);
    }

    #[test]
    fn block_counter_wraps_to_one_after_255() {
        let (engine, _staging) = engine();
        // Long enough for more than 255 blocks of 254 bytes.
        let container = container_for(GATEWAY, 65_000);
        open_session(&engine, container.len() as u32);
        stream(&engine, &container);

        let session = engine.session().unwrap();
        assert_eq!(session.received, container.len() as u32);
        // 258 blocks: counters 1..=255, then 1, 2, 3; next expected is 4.
        assert_eq!(session.expected_block, 4);
    }

    // =========================================================================
    // RequestTransferExit
    // =========================================================================

    #[test]
    fn exit_without_session_is_a_sequence_error() {
        let (engine, staging) = engine();
        let installer = installer(&staging, MockZoneRouter::new());
        let response = engine.handle_request_transfer_exit(&[], &installer);
        assert_eq!(response, vec![0x7F, 0x37, 0x24]);
    }

    #[test]
    fn incomplete_transfer_fails_exit_and_poisons() {
        let (engine, staging) = engine();
        let installer = installer(&staging, MockZoneRouter::new());
        let container = container_for(GATEWAY, 600);
        open_session(&engine, container.len() as u32);
        assert_eq!(
            engine.handle_transfer_data(&td_request(1, &container[..MAX_BLOCK_DATA])),
            vec![0x76, 0x01]
        );

        let response = engine.handle_request_transfer_exit(&[], &installer);
        assert_eq!(response, vec![0x7F, 0x37, 0x72]);
        assert_eq!(engine.session().unwrap().phase, DownloadPhase::Error);

        // Errored sessions answer 0x24 on further exits.
        let response = engine.handle_request_transfer_exit(&[], &installer);
        assert_eq!(response, vec![0x7F, 0x37, 0x24]);
    }

    #[test]
    fn corrupted_container_fails_exit_validation() {
        let (engine, staging) = engine();
        let installer = installer(&staging, MockZoneRouter::new());
        let mut container = container_for(GATEWAY, 600);
        // Flip a firmware byte; the header still parses, the container
        // checksum no longer holds.
        let len = container.len();
        container[len - 1] ^= 0xFF;
        open_session(&engine, container.len() as u32);
        stream(&engine, &container);

        let response = engine.handle_request_transfer_exit(&[], &installer);
        assert_eq!(response, vec![0x7F, 0x37, 0x72]);
        assert_eq!(engine.session().unwrap().phase, DownloadPhase::Error);
        assert!(engine.staged().is_none());
    }

    #[test]
    fn exit_installs_into_the_gateway_bank() {
        let (engine, staging) = engine();
        let installer = installer(&staging, MockZoneRouter::new());
        let container = container_for(GATEWAY, 600);
        open_session(&engine, container.len() as u32);
        stream(&engine, &container);

        let response = engine.handle_request_transfer_exit(&[], &installer);
        assert_eq!(response, vec![0x77]);
        assert!(engine.session().is_none());
        assert!(installer.bank_status().pending_switch);

        let staged = engine.staged().unwrap();
        assert_eq!(staged.base, GATEWAY_BASE);
        assert_eq!(staged.header.routing_target().target_id, GATEWAY);
    }

    #[test]
    fn exit_hands_zone_containers_to_the_router() {
        let (engine, staging) = engine();
        let container = container_for(ZONE_FL, 600);

        let mut router = MockZoneRouter::new();
        let total = container.len() as u32;
        router
            .expect_forward()
            .withf(move |target, base, size| {
                *target == ZONE_FL && *base == ZONE_BASE && *size == total
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let installer = installer(&staging, router);

        open_session(&engine, container.len() as u32);
        stream(&engine, &container);

        let response = engine.handle_request_transfer_exit(&[], &installer);
        assert_eq!(response, vec![0x77]);
        assert!(engine.session().is_none());
        assert_eq!(engine.staged().unwrap().base, ZONE_BASE);
        // The gateway's own banks stay out of the handoff path.
        assert!(!installer.bank_status().pending_switch);
    }

    #[test]
    fn failed_handoff_still_frees_the_session() {
        let (engine, staging) = engine();
        let container = container_for(ZONE_FL, 600);

        let mut router = MockZoneRouter::new();
        router
            .expect_forward()
            .times(1)
            .returning(|_, _, _| Err(crate::install::ForwardError("link down".to_string())));
        let installer = installer(&staging, router);

        open_session(&engine, container.len() as u32);
        stream(&engine, &container);

        let response = engine.handle_request_transfer_exit(&[], &installer);
        assert_eq!(response, vec![0x7F, 0x37, 0x72]);
        // The slot is free: a new download starts immediately.
        assert!(engine.session().is_none());
        open_session(&engine, 4096);
        // The container stays staged for a later retry.
        assert!(engine.staged().is_some());
    }

    #[test]
    fn verify_staged_tracks_flash_contents() {
        let (engine, staging) = engine();
        assert_eq!(engine.verify_staged(), None);

        let installer = installer(&staging, MockZoneRouter::new());
        let container = container_for(GATEWAY, 600);
        open_session(&engine, container.len() as u32);
        stream(&engine, &container);
        engine.handle_request_transfer_exit(&[], &installer);

        assert_eq!(engine.verify_staged(), Some(true));
        // Bit rot in the staged firmware shows up on the next verify.
        staging.write(GATEWAY_BASE + 400, &[0x00]).unwrap();
        assert_eq!(engine.verify_staged(), Some(false));
    }

    #[test]
    fn reset_clears_session_and_staged_container() {
        let (engine, staging) = engine();
        let installer = installer(&staging, MockZoneRouter::new());
        let container = container_for(GATEWAY, 600);
        open_session(&engine, container.len() as u32);
        stream(&engine, &container);
        engine.handle_request_transfer_exit(&[], &installer);
        assert!(engine.staged().is_some());

        engine.reset();
        assert!(engine.session().is_none());
        assert!(engine.staged().is_none());
    }
}
