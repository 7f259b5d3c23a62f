//! Decoded request/response value types at the UDS payload level.
//!
//! A request is the raw UDS byte slice split into service id + data; a
//! response is either positive (echoed id + data) or negative (rejected id +
//! NRC). Both live for one dispatch round and carry no addressing; the
//! transport layer owns source/target addresses.

use thiserror::Error;

use crate::{service_id, NegativeResponseCode, POSITIVE_RESPONSE_OFFSET};

/// Failures decoding a UDS payload into a request or response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("empty UDS payload")]
    Empty,

    #[error("negative response truncated ({got} bytes, need 3)")]
    TruncatedNegative { got: usize },

    #[error("response id 0x{got:02X} does not answer service 0x{requested:02X}")]
    ServiceMismatch { requested: u8, got: u8 },
}

/// A decoded inbound service request, borrowed from the transport payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRequest<'a> {
    pub service_id: u8,
    pub data: &'a [u8],
}

impl<'a> ServiceRequest<'a> {
    /// Split raw UDS bytes into service id and service data.
    pub fn parse(uds: &'a [u8]) -> Result<Self, ResponseError> {
        let (&service_id, data) = uds.split_first().ok_or(ResponseError::Empty)?;
        Ok(Self { service_id, data })
    }
}

/// A decoded service response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceResponse {
    Positive {
        /// The service id of the original request (without the 0x40 offset).
        service_id: u8,
        data: Vec<u8>,
    },
    Negative {
        /// The rejected service id.
        service_id: u8,
        nrc: NegativeResponseCode,
    },
}

impl ServiceResponse {
    /// Decode the response to a request with service id `requested`.
    pub fn parse(requested: u8, uds: &[u8]) -> Result<Self, ResponseError> {
        let (&first, rest) = uds.split_first().ok_or(ResponseError::Empty)?;

        if first == service_id::NEGATIVE_RESPONSE {
            if rest.len() < 2 {
                return Err(ResponseError::TruncatedNegative { got: uds.len() });
            }
            if rest[0] != requested {
                return Err(ResponseError::ServiceMismatch {
                    requested,
                    got: rest[0],
                });
            }
            return Ok(Self::Negative {
                service_id: rest[0],
                nrc: rest[1].into(),
            });
        }

        if first == requested.wrapping_add(POSITIVE_RESPONSE_OFFSET) {
            return Ok(Self::Positive {
                service_id: requested,
                data: rest.to_vec(),
            });
        }

        Err(ResponseError::ServiceMismatch {
            requested,
            got: first,
        })
    }

    /// Serialize back to raw UDS bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Positive { service_id, data } => crate::positive_response(*service_id, data),
            Self::Negative { service_id, nrc } => crate::negative_response(*service_id, *nrc),
        }
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Positive { .. })
    }

    /// The NRC, when negative.
    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            Self::Positive { .. } => None,
            Self::Negative { nrc, .. } => Some(*nrc),
        }
    }

    /// True when this is the "response pending" placeholder the server sends
    /// while a long-running request is still in flight.
    pub fn is_pending(&self) -> bool {
        self.nrc() == Some(NegativeResponseCode::ResponsePending)
    }
}
