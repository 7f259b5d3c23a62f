//! Diagnostic service dispatch.
//!
//! One flat table maps service ids to handlers; everything a handler needs
//! hangs off the [`Gateway`]. ReadDataByIdentifier and RoutineControl are
//! implemented here, the download trio delegates to the
//! [`DownloadEngine`](crate::download::DownloadEngine).
//!
//! Every request gets exactly one response; unknown services and malformed
//! payloads answer negatively rather than being dropped.

use tracing::debug;
use zgw_uds::{
    did, negative_response, positive_response, routine_id, routine_sub_function, service_id,
    NegativeResponseCode, ServiceRequest,
};

use crate::gateway::Gateway;

/// Routine status byte: completed, result positive.
const ROUTINE_OK: u8 = 0x00;
/// Routine status byte: completed, result negative.
const ROUTINE_FAILED: u8 = 0x01;

type Handler = fn(&Gateway, &ServiceRequest<'_>) -> Vec<u8>;

const SERVICE_TABLE: &[(u8, Handler)] = &[
    (service_id::READ_DATA_BY_ID, read_data_by_identifier),
    (service_id::ROUTINE_CONTROL, routine_control),
    (service_id::REQUEST_DOWNLOAD, request_download),
    (service_id::TRANSFER_DATA, transfer_data),
    (service_id::REQUEST_TRANSFER_EXIT, request_transfer_exit),
];

/// Routes one raw UDS request to its handler and returns the raw response.
pub fn dispatch(gateway: &Gateway, uds: &[u8]) -> Vec<u8> {
    let request = match ServiceRequest::parse(uds) {
        Ok(request) => request,
        Err(_) => {
            debug!("Rejecting empty diagnostic payload");
            return negative_response(0x00, NegativeResponseCode::IncorrectMessageLengthOrFormat);
        }
    };

    match SERVICE_TABLE
        .iter()
        .find(|(sid, _)| *sid == request.service_id)
    {
        Some((_, handler)) => handler(gateway, &request),
        None => {
            debug!(
                service = format!("0x{:02X}", request.service_id),
                "Service not supported"
            );
            negative_response(
                request.service_id,
                NegativeResponseCode::ServiceNotSupported,
            )
        }
    }
}

/// UDS 0x22: one identifier per request, echoed back in front of the value.
fn read_data_by_identifier(gateway: &Gateway, request: &ServiceRequest<'_>) -> Vec<u8> {
    if request.data.len() != 2 {
        return negative_response(
            service_id::READ_DATA_BY_ID,
            NegativeResponseCode::IncorrectMessageLengthOrFormat,
        );
    }

    let identifier = u16::from_be_bytes([request.data[0], request.data[1]]);
    let identity = gateway.identity();
    let value: Vec<u8> = match identifier {
        did::VIN => identity.vin.as_bytes().to_vec(),
        did::ECU_HARDWARE_NUMBER => identity.hardware_number.as_bytes().to_vec(),
        did::ECU_SERIAL_NUMBER => identity.serial_number.as_bytes().to_vec(),
        did::ECU_SOFTWARE_VERSION => identity.software_version.as_bytes().to_vec(),
        did::SYSTEM_NAME => identity.system_name.as_bytes().to_vec(),
        did::FLASH_BANK_STATUS => gateway.installer().bank_status().to_bytes().to_vec(),
        _ => {
            debug!(
                did = format!("0x{:04X}", identifier),
                "ReadDataByIdentifier: unknown identifier"
            );
            return negative_response(
                service_id::READ_DATA_BY_ID,
                NegativeResponseCode::RequestOutOfRange,
            );
        }
    };

    let mut data = Vec::with_capacity(2 + value.len());
    data.extend_from_slice(&identifier.to_be_bytes());
    data.extend_from_slice(&value);
    positive_response(service_id::READ_DATA_BY_ID, &data)
}

/// UDS 0x31: start-only routines for the update workflow.
///
/// A routine that runs to completion answers positively and carries its
/// verdict in the status byte; negative responses are reserved for requests
/// the gateway cannot act on at all.
fn routine_control(gateway: &Gateway, request: &ServiceRequest<'_>) -> Vec<u8> {
    if request.data.len() < 3 {
        return negative_response(
            service_id::ROUTINE_CONTROL,
            NegativeResponseCode::IncorrectMessageLengthOrFormat,
        );
    }

    let sub_function = request.data[0];
    let routine = u16::from_be_bytes([request.data[1], request.data[2]]);

    if sub_function != routine_sub_function::START_ROUTINE {
        debug!(
            sub_function = format!("0x{:02X}", sub_function),
            "RoutineControl: only start is supported"
        );
        return negative_response(
            service_id::ROUTINE_CONTROL,
            NegativeResponseCode::SubFunctionNotSupported,
        );
    }

    let status = match routine {
        routine_id::VERIFY_STAGED_CONTAINER => match gateway.download().verify_staged() {
            Some(true) => ROUTINE_OK,
            Some(false) => ROUTINE_FAILED,
            None => {
                debug!("Verify routine: nothing staged");
                return negative_response(
                    service_id::ROUTINE_CONTROL,
                    NegativeResponseCode::ConditionsNotCorrect,
                );
            }
        },
        routine_id::RESET_DOWNLOAD_SESSION => {
            gateway.download().reset();
            ROUTINE_OK
        }
        routine_id::DISTRIBUTE_ZONE_TARGETS => match gateway.download().staged() {
            Some(staged) => {
                let report = gateway.installer().distribute_all(&staged.header, staged.base);
                if report.all_ok() {
                    ROUTINE_OK
                } else {
                    ROUTINE_FAILED
                }
            }
            None => {
                debug!("Distribute routine: nothing staged");
                return negative_response(
                    service_id::ROUTINE_CONTROL,
                    NegativeResponseCode::ConditionsNotCorrect,
                );
            }
        },
        _ => {
            debug!(
                routine = format!("0x{:04X}", routine),
                "RoutineControl: unknown routine"
            );
            return negative_response(
                service_id::ROUTINE_CONTROL,
                NegativeResponseCode::RequestOutOfRange,
            );
        }
    };

    positive_response(
        service_id::ROUTINE_CONTROL,
        &[sub_function, request.data[1], request.data[2], status],
    )
}

fn request_download(gateway: &Gateway, request: &ServiceRequest<'_>) -> Vec<u8> {
    gateway.download().handle_request_download(request.data)
}

fn transfer_data(gateway: &Gateway, request: &ServiceRequest<'_>) -> Vec<u8> {
    gateway.download().handle_transfer_data(request.data)
}

fn request_transfer_exit(gateway: &Gateway, request: &ServiceRequest<'_>) -> Vec<u8> {
    gateway
        .download()
        .handle_request_transfer_exit(request.data, gateway.installer())
}
