//! Wire format: header parsing and the three payload types.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Protocol version carried in the first header byte.
pub const PROTOCOL_VERSION: u8 = 0x02;
/// Bitwise inverse of [`PROTOCOL_VERSION`], carried in the second header byte.
pub const INVERSE_PROTOCOL_VERSION: u8 = 0xFD;
/// Fixed size of the frame header.
pub const HEADER_LEN: usize = 8;
/// Upper bound on a single frame payload. Anything larger is a protocol
/// violation and poisons the link.
pub const MAX_PAYLOAD_LEN: u32 = 4096;

/// Routing activation request payload length (source address, activation
/// type, reserved, OEM-specific).
pub const ROUTING_ACTIVATION_REQUEST_LEN: usize = 11;
/// Routing activation response payload length (client address, entity
/// address, response code, reserved, OEM-specific).
pub const ROUTING_ACTIVATION_RESPONSE_LEN: usize = 13;
/// A diagnostic message carries two addresses plus at least one UDS byte.
pub const DIAGNOSTIC_MIN_LEN: usize = 5;

/// Routing activation response codes.
pub mod activation_code {
    /// Activation accepted; the link may carry diagnostic traffic.
    pub const SUCCESS: u8 = 0x10;
    /// The source address is not known to the entity.
    pub const DENIED_UNKNOWN_SOURCE_ADDRESS: u8 = 0x00;
    /// All concurrent links are in use.
    pub const DENIED_ALL_SOCKETS_TAKEN: u8 = 0x01;
    /// The activation type is not supported.
    pub const DENIED_UNSUPPORTED_TYPE: u8 = 0x06;
}

/// Default activation type requested by initiators.
pub const ACTIVATION_TYPE_DEFAULT: u8 = 0x00;

/// Everything that can go wrong while decoding a frame.
///
/// All of these are protocol violations: the peer sent bytes that can never
/// become a valid frame, so the link transitions to its error state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unsupported protocol version {version:#04X} (inverse {inverse:#04X})")]
    UnsupportedVersion { version: u8, inverse: u8 },
    #[error("unknown payload type {0:#06X}")]
    UnknownMessageType(u16),
    #[error("payload length {0} exceeds maximum {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge(u32),
    #[error("{kind:?} payload too short: need {need} bytes, got {got}")]
    ShortPayload {
        kind: MessageKind,
        need: usize,
        got: usize,
    },
}

/// Payload type discriminator from the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    RoutingActivationRequest = 0x0005,
    RoutingActivationResponse = 0x0006,
    Diagnostic = 0x8001,
}

impl TryFrom<u16> for MessageKind {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0005 => Ok(Self::RoutingActivationRequest),
            0x0006 => Ok(Self::RoutingActivationResponse),
            0x8001 => Ok(Self::Diagnostic),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    pub payload_length: u32,
}

impl Header {
    /// Tries to decode a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` when fewer than [`HEADER_LEN`] bytes are
    /// available, `Err` when the bytes present can never form a valid
    /// header.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, WireError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut cursor = &buf[..HEADER_LEN];
        let version = cursor.get_u8();
        let inverse = cursor.get_u8();
        if version != PROTOCOL_VERSION || inverse != INVERSE_PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion { version, inverse });
        }
        let kind = MessageKind::try_from(cursor.get_u16())?;
        let payload_length = cursor.get_u32();
        if payload_length > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge(payload_length));
        }
        Ok(Some(Self {
            kind,
            payload_length,
        }))
    }

    fn write(kind: MessageKind, payload_length: u32, out: &mut Vec<u8>) {
        out.put_u8(PROTOCOL_VERSION);
        out.put_u8(INVERSE_PROTOCOL_VERSION);
        out.put_u16(kind as u16);
        out.put_u32(payload_length);
    }
}

/// Routing activation request sent by an initiator right after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingActivationRequest {
    /// Logical address of the requesting tester or gateway.
    pub source_address: u16,
    pub activation_type: u8,
}

impl RoutingActivationRequest {
    pub fn new(source_address: u16) -> Self {
        Self {
            source_address,
            activation_type: ACTIVATION_TYPE_DEFAULT,
        }
    }

    fn parse(mut payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < ROUTING_ACTIVATION_REQUEST_LEN {
            return Err(WireError::ShortPayload {
                kind: MessageKind::RoutingActivationRequest,
                need: ROUTING_ACTIVATION_REQUEST_LEN,
                got: payload.len(),
            });
        }
        let source_address = payload.get_u16();
        let activation_type = payload.get_u8();
        Ok(Self {
            source_address,
            activation_type,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.put_u16(self.source_address);
        out.put_u8(self.activation_type);
        out.put_u32(0); // reserved
        out.put_u32(0); // OEM-specific
    }
}

/// Routing activation response sent by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingActivationResponse {
    /// Logical address of the client being answered.
    pub client_address: u16,
    /// Logical address of the responding entity.
    pub entity_address: u16,
    pub code: u8,
}

impl RoutingActivationResponse {
    pub fn success(client_address: u16, entity_address: u16) -> Self {
        Self {
            client_address,
            entity_address,
            code: activation_code::SUCCESS,
        }
    }

    pub fn denied(client_address: u16, entity_address: u16, code: u8) -> Self {
        Self {
            client_address,
            entity_address,
            code,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == activation_code::SUCCESS
    }

    fn parse(mut payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < ROUTING_ACTIVATION_RESPONSE_LEN {
            return Err(WireError::ShortPayload {
                kind: MessageKind::RoutingActivationResponse,
                need: ROUTING_ACTIVATION_RESPONSE_LEN,
                got: payload.len(),
            });
        }
        let client_address = payload.get_u16();
        let entity_address = payload.get_u16();
        let code = payload.get_u8();
        Ok(Self {
            client_address,
            entity_address,
            code,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.put_u16(self.client_address);
        out.put_u16(self.entity_address);
        out.put_u8(self.code);
        out.put_u32(0); // reserved
        out.put_u32(0); // OEM-specific
    }
}

/// Diagnostic message: source and target logical addresses plus raw UDS
/// service bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMessage {
    pub source_address: u16,
    pub target_address: u16,
    pub uds: Vec<u8>,
}

impl DiagnosticMessage {
    pub fn new(source_address: u16, target_address: u16, uds: Vec<u8>) -> Self {
        Self {
            source_address,
            target_address,
            uds,
        }
    }

    fn parse(mut payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < DIAGNOSTIC_MIN_LEN {
            return Err(WireError::ShortPayload {
                kind: MessageKind::Diagnostic,
                need: DIAGNOSTIC_MIN_LEN,
                got: payload.len(),
            });
        }
        let source_address = payload.get_u16();
        let target_address = payload.get_u16();
        Ok(Self {
            source_address,
            target_address,
            uds: payload.to_vec(),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.put_u16(self.source_address);
        out.put_u16(self.target_address);
        out.extend_from_slice(&self.uds);
    }
}

/// A fully decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RoutingActivationRequest(RoutingActivationRequest),
    RoutingActivationResponse(RoutingActivationResponse),
    Diagnostic(DiagnosticMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::RoutingActivationRequest(_) => MessageKind::RoutingActivationRequest,
            Self::RoutingActivationResponse(_) => MessageKind::RoutingActivationResponse,
            Self::Diagnostic(_) => MessageKind::Diagnostic,
        }
    }

    /// Decodes a payload of the given kind. `payload` must already have the
    /// length announced in the header.
    pub fn parse(kind: MessageKind, payload: &[u8]) -> Result<Self, WireError> {
        match kind {
            MessageKind::RoutingActivationRequest => {
                RoutingActivationRequest::parse(payload).map(Self::RoutingActivationRequest)
            }
            MessageKind::RoutingActivationResponse => {
                RoutingActivationResponse::parse(payload).map(Self::RoutingActivationResponse)
            }
            MessageKind::Diagnostic => DiagnosticMessage::parse(payload).map(Self::Diagnostic),
        }
    }

    fn payload_length(&self) -> usize {
        match self {
            Self::RoutingActivationRequest(_) => ROUTING_ACTIVATION_REQUEST_LEN,
            Self::RoutingActivationResponse(_) => ROUTING_ACTIVATION_RESPONSE_LEN,
            Self::Diagnostic(message) => 4 + message.uds.len(),
        }
    }

    /// Serializes the complete frame, header included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload_length = self.payload_length();
        let mut out = Vec::with_capacity(HEADER_LEN + payload_length);
        Header::write(self.kind(), payload_length as u32, &mut out);
        match self {
            Self::RoutingActivationRequest(message) => message.write(&mut out),
            Self::RoutingActivationResponse(message) => message.write(&mut out),
            Self::Diagnostic(message) => message.write(&mut out),
        }
        out
    }
}
