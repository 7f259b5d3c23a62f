//! UDS service-layer value types shared across the zonal gateway.
//!
//! The gateway speaks a UDS-style diagnostic dialect: requests carry a one-byte
//! service id followed by service data; positive responses echo the service id
//! plus 0x40; negative responses are `{0x7F, rejected service id, NRC}`. This
//! crate holds the identifiers, the [`NegativeResponseCode`] taxonomy and the
//! request/response value types; no transport or session logic.

pub mod nrc;
pub mod response;

pub use nrc::NegativeResponseCode;
pub use response::{ResponseError, ServiceRequest, ServiceResponse};

/// Offset added to a service id to form its positive-response id.
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// UDS service identifiers handled or produced by the gateway.
pub mod service_id {
    /// ReadDataByIdentifier
    pub const READ_DATA_BY_ID: u8 = 0x22;
    /// RoutineControl
    pub const ROUTINE_CONTROL: u8 = 0x31;
    /// RequestDownload
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    /// TransferData
    pub const TRANSFER_DATA: u8 = 0x36;
    /// RequestTransferExit
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    /// Negative response marker
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// RoutineControl sub-functions. The gateway only honors start.
pub mod routine_sub_function {
    pub const START_ROUTINE: u8 = 0x01;
    pub const STOP_ROUTINE: u8 = 0x02;
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// RoutineControl routine identifiers exposed by the gateway.
pub mod routine_id {
    /// Re-parse and checksum the staged firmware container.
    pub const VERIFY_STAGED_CONTAINER: u16 = 0xF005;
    /// Clear the download session (error state included) and the staged container.
    pub const RESET_DOWNLOAD_SESSION: u16 = 0xF00F;
    /// Hand every zone target of the staged container to the router.
    pub const DISTRIBUTE_ZONE_TARGETS: u16 = 0xF010;
}

/// Data identifiers served by ReadDataByIdentifier.
///
/// The identification DIDs are the ISO 14229-1 Annex C values; 0xF1F0 is
/// gateway-specific.
pub mod did {
    /// Vehicle Identification Number
    pub const VIN: u16 = 0xF190;
    /// ECU hardware number
    pub const ECU_HARDWARE_NUMBER: u16 = 0xF191;
    /// ECU serial number
    pub const ECU_SERIAL_NUMBER: u16 = 0xF18C;
    /// ECU software version
    pub const ECU_SOFTWARE_VERSION: u16 = 0xF195;
    /// System name
    pub const SYSTEM_NAME: u16 = 0xF197;
    /// Flash bank status: active bank, per-bank health, pending switch flag.
    pub const FLASH_BANK_STATUS: u16 = 0xF1F0;
}

/// Build a positive response: service id + 0x40, then the response data.
pub fn positive_response(service_id: u8, data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(1 + data.len());
    response.push(service_id.wrapping_add(POSITIVE_RESPONSE_OFFSET));
    response.extend_from_slice(data);
    response
}

/// Build a negative response: `{0x7F, rejected service id, NRC}`.
pub fn negative_response(rejected_sid: u8, nrc: NegativeResponseCode) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, rejected_sid, nrc.into()]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn positive_response_offsets_service_id() {
        let response = positive_response(service_id::REQUEST_DOWNLOAD, &[0x20, 0x01, 0x00]);
        assert_eq!(response, vec![0x74, 0x20, 0x01, 0x00]);
    }

    #[test]
    fn negative_response_shape() {
        let response = negative_response(
            service_id::TRANSFER_DATA,
            NegativeResponseCode::WrongBlockSequenceCounter,
        );
        assert_eq!(response, vec![0x7F, 0x36, 0x73]);
    }
}
