//! Per-connection link state machine.
//!
//! A [`Link`] owns no socket. The surrounding runtime feeds it
//! [`LinkEvent`]s (connection established, bytes arrived, connection lost)
//! and the link answers with fully decoded [`Message`]s. Sending works the
//! same way in reverse: [`Link::encode_send`] checks the activation gate and
//! hands back the frame bytes for the runtime to write.

use std::fmt;
use tracing::{debug, warn};

use crate::message::{Header, Message, MessageKind, WireError, HEADER_LEN};

/// Which side of the connection this link plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Accepts connections and answers routing activation requests.
    Listener,
    /// Dials out and performs the activation handshake.
    Initiator,
}

/// Link lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created but not yet opened.
    Idle,
    /// Listener waiting for an inbound connection.
    Listening,
    /// Initiator waiting for its dial to complete.
    Connecting,
    /// Transport is up, activation handshake not yet finished.
    Connected,
    /// Activation succeeded; diagnostic traffic may flow.
    Authenticated,
    /// The transport failed or the peer violated the protocol.
    Error,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Transport-level events fed into [`Link::handle_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The connection is established (accept completed or dial succeeded).
    Connected,
    /// Bytes arrived from the peer. Arbitrary fragmentation is fine.
    Data(Vec<u8>),
    /// The peer closed the connection in an orderly way.
    Closed,
    /// The transport failed.
    Failed,
}

impl LinkEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Data(_) => "data",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("link is {state}, not connected")]
    NotConnected { state: LinkState },
    #[error("diagnostic messages require an activated link")]
    NotActivated,
    #[error("event `{event}` is invalid in state {state}")]
    InvalidTransition {
        state: LinkState,
        event: &'static str,
    },
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// One logical connection: role, lifecycle state and the receive buffer
/// that reassembles frames out of the byte stream.
#[derive(Debug)]
pub struct Link {
    role: LinkRole,
    state: LinkState,
    local_address: u16,
    peer_address: Option<u16>,
    buffer: Vec<u8>,
}

impl Link {
    /// Creates a listener-side link in [`LinkState::Idle`].
    pub fn listener(local_address: u16) -> Self {
        Self::new(LinkRole::Listener, local_address)
    }

    /// Creates an initiator-side link in [`LinkState::Idle`].
    pub fn initiator(local_address: u16) -> Self {
        Self::new(LinkRole::Initiator, local_address)
    }

    fn new(role: LinkRole, local_address: u16) -> Self {
        Self {
            role,
            state: LinkState::Idle,
            local_address,
            peer_address: None,
            buffer: Vec::new(),
        }
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn local_address(&self) -> u16 {
        self.local_address
    }

    /// Logical address of the peer, known once activation completes.
    pub fn peer_address(&self) -> Option<u16> {
        self.peer_address
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == LinkState::Authenticated
    }

    /// Moves an idle link into its waiting state: [`LinkState::Listening`]
    /// for listeners, [`LinkState::Connecting`] for initiators.
    pub fn open(&mut self) -> Result<(), LinkError> {
        if self.state != LinkState::Idle {
            return Err(LinkError::InvalidTransition {
                state: self.state,
                event: "open",
            });
        }
        self.state = match self.role {
            LinkRole::Listener => LinkState::Listening,
            LinkRole::Initiator => LinkState::Connecting,
        };
        Ok(())
    }

    /// Marks the activation handshake as complete and records the peer's
    /// logical address. Called by the owner once it has validated a routing
    /// activation exchange.
    pub fn promote(&mut self, peer_address: u16) -> Result<(), LinkError> {
        if self.state != LinkState::Connected {
            return Err(LinkError::InvalidTransition {
                state: self.state,
                event: "promote",
            });
        }
        self.peer_address = Some(peer_address);
        self.state = LinkState::Authenticated;
        Ok(())
    }

    /// Feeds one transport event through the state machine and returns any
    /// frames that became complete.
    ///
    /// Protocol violations (bad version, unknown payload type, oversized
    /// payload) poison the link: it transitions to [`LinkState::Error`] and
    /// the error is returned so the owner can drop the connection.
    pub fn handle_event(&mut self, event: LinkEvent) -> Result<Vec<Message>, LinkError> {
        match event {
            LinkEvent::Connected => {
                if !matches!(self.state, LinkState::Listening | LinkState::Connecting) {
                    return Err(LinkError::InvalidTransition {
                        state: self.state,
                        event: event.name(),
                    });
                }
                self.state = LinkState::Connected;
                Ok(Vec::new())
            }
            LinkEvent::Data(bytes) => {
                if !matches!(self.state, LinkState::Connected | LinkState::Authenticated) {
                    return Err(LinkError::InvalidTransition {
                        state: self.state,
                        event: "data",
                    });
                }
                self.buffer.extend_from_slice(&bytes);
                self.drain_frames()
            }
            LinkEvent::Closed => {
                debug!(state = %self.state, "link closed by peer");
                self.state = LinkState::Idle;
                self.peer_address = None;
                self.buffer.clear();
                Ok(Vec::new())
            }
            LinkEvent::Failed => {
                warn!(state = %self.state, "link transport failed");
                self.state = LinkState::Error;
                self.peer_address = None;
                self.buffer.clear();
                Ok(Vec::new())
            }
        }
    }

    /// Checks the send gate and serializes `message` for the wire.
    ///
    /// Routing activation messages may be sent as soon as the transport is
    /// up; diagnostic messages only once the link is authenticated.
    pub fn encode_send(&self, message: &Message) -> Result<Vec<u8>, LinkError> {
        match self.state {
            LinkState::Connected => {
                if message.kind() == MessageKind::Diagnostic {
                    return Err(LinkError::NotActivated);
                }
            }
            LinkState::Authenticated => {}
            state => return Err(LinkError::NotConnected { state }),
        }
        Ok(message.to_bytes())
    }

    /// Pulls every complete frame off the front of the receive buffer.
    fn drain_frames(&mut self) -> Result<Vec<Message>, LinkError> {
        let mut messages = Vec::new();
        loop {
            let header = match Header::parse(&self.buffer) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(err) => {
                    self.state = LinkState::Error;
                    self.buffer.clear();
                    return Err(err.into());
                }
            };
            let frame_len = HEADER_LEN + header.payload_length as usize;
            if self.buffer.len() < frame_len {
                break;
            }
            let message = match Message::parse(header.kind, &self.buffer[HEADER_LEN..frame_len]) {
                Ok(message) => message,
                Err(err) => {
                    self.state = LinkState::Error;
                    self.buffer.clear();
                    return Err(err.into());
                }
            };
            // Consumed bytes leave the buffer before the gate check so a
            // dropped message cannot wedge the stream.
            self.buffer.drain(..frame_len);
            if message.kind() == MessageKind::Diagnostic && self.state != LinkState::Authenticated {
                warn!(
                    state = %self.state,
                    local_address = format_args!("{:#06X}", self.local_address),
                    "dropping diagnostic message on unactivated link"
                );
                continue;
            }
            messages.push(message);
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        activation_code, DiagnosticMessage, RoutingActivationRequest, RoutingActivationResponse,
    };
    use pretty_assertions::assert_eq;

    fn connected_listener() -> Link {
        let mut link = Link::listener(0x0201);
        link.open().unwrap();
        link.handle_event(LinkEvent::Connected).unwrap();
        link
    }

    fn authenticated_listener() -> Link {
        let mut link = connected_listener();
        link.promote(0x0E80).unwrap();
        link
    }

    fn diagnostic_frame() -> Vec<u8> {
        Message::Diagnostic(DiagnosticMessage::new(0x0E80, 0x0201, vec![0x22, 0xF1, 0x90]))
            .to_bytes()
    }

    #[test]
    fn listener_walks_idle_listening_connected() {
        let mut link = Link::listener(0x0201);
        assert_eq!(link.state(), LinkState::Idle);
        link.open().unwrap();
        assert_eq!(link.state(), LinkState::Listening);
        link.handle_event(LinkEvent::Connected).unwrap();
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn initiator_walks_idle_connecting_connected() {
        let mut link = Link::initiator(0x0E80);
        link.open().unwrap();
        assert_eq!(link.state(), LinkState::Connecting);
        link.handle_event(LinkEvent::Connected).unwrap();
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn connected_event_is_invalid_when_idle() {
        let mut link = Link::listener(0x0201);
        let err = link.handle_event(LinkEvent::Connected).unwrap_err();
        assert_eq!(
            err,
            LinkError::InvalidTransition {
                state: LinkState::Idle,
                event: "connected",
            }
        );
    }

    #[test]
    fn byte_by_byte_fragmentation_reassembles_one_frame() {
        let mut link = authenticated_listener();
        let frame = diagnostic_frame();

        for &byte in &frame[..frame.len() - 1] {
            let messages = link.handle_event(LinkEvent::Data(vec![byte])).unwrap();
            assert!(messages.is_empty());
        }
        let messages = link
            .handle_event(LinkEvent::Data(vec![frame[frame.len() - 1]]))
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            Message::Diagnostic(DiagnosticMessage::new(0x0E80, 0x0201, vec![0x22, 0xF1, 0x90]))
        );
    }

    #[test]
    fn two_frames_in_one_chunk_yield_two_messages() {
        let mut link = authenticated_listener();
        let mut bytes = diagnostic_frame();
        bytes.extend_from_slice(&diagnostic_frame());

        let messages = link.handle_event(LinkEvent::Data(bytes)).unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn consumed_frames_leave_the_buffer() {
        let mut link = authenticated_listener();
        let frame = diagnostic_frame();
        let mut bytes = frame.clone();
        // Trailing partial frame stays buffered.
        bytes.extend_from_slice(&frame[..3]);

        let messages = link.handle_event(LinkEvent::Data(bytes)).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(link.buffer.len(), 3);

        let messages = link.handle_event(LinkEvent::Data(frame[3..].to_vec())).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(link.buffer.is_empty());
    }

    #[test]
    fn diagnostic_before_activation_is_dropped() {
        let mut link = connected_listener();
        let messages = link.handle_event(LinkEvent::Data(diagnostic_frame())).unwrap();
        assert!(messages.is_empty());
        // Dropped, not deferred: the bytes are gone.
        assert!(link.buffer.is_empty());
    }

    #[test]
    fn activation_request_passes_before_activation() {
        let mut link = connected_listener();
        let frame =
            Message::RoutingActivationRequest(RoutingActivationRequest::new(0x0E80)).to_bytes();
        let messages = link.handle_event(LinkEvent::Data(frame)).unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn promote_records_peer_and_opens_the_gate() {
        let mut link = connected_listener();
        link.promote(0x0E80).unwrap();
        assert_eq!(link.state(), LinkState::Authenticated);
        assert_eq!(link.peer_address(), Some(0x0E80));

        let messages = link.handle_event(LinkEvent::Data(diagnostic_frame())).unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn promote_requires_connected() {
        let mut link = Link::listener(0x0201);
        assert!(matches!(
            link.promote(0x0E80),
            Err(LinkError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn send_gate_blocks_diagnostics_until_authenticated() {
        let mut link = Link::initiator(0x0E80);
        let diag = Message::Diagnostic(DiagnosticMessage::new(0x0E80, 0x0201, vec![0x22]));

        assert_eq!(
            link.encode_send(&diag),
            Err(LinkError::NotConnected {
                state: LinkState::Idle
            })
        );

        link.open().unwrap();
        link.handle_event(LinkEvent::Connected).unwrap();
        assert_eq!(link.encode_send(&diag), Err(LinkError::NotActivated));

        // The handshake itself is allowed while merely connected.
        let activation =
            Message::RoutingActivationRequest(RoutingActivationRequest::new(0x0E80));
        assert!(link.encode_send(&activation).is_ok());

        link.promote(0x0201).unwrap();
        let bytes = link.encode_send(&diag).unwrap();
        assert_eq!(bytes, diag.to_bytes());
    }

    #[test]
    fn listener_can_answer_activation_while_connected() {
        let link = connected_listener();
        let response = Message::RoutingActivationResponse(RoutingActivationResponse::success(
            0x0E80, 0x0201,
        ));
        assert!(link.encode_send(&response).is_ok());
    }

    #[test]
    fn closed_returns_to_idle_and_clears_state() {
        let mut link = authenticated_listener();
        link.handle_event(LinkEvent::Data(diagnostic_frame()[..4].to_vec()))
            .unwrap();

        link.handle_event(LinkEvent::Closed).unwrap();
        assert_eq!(link.state(), LinkState::Idle);
        assert_eq!(link.peer_address(), None);
        assert!(link.buffer.is_empty());
    }

    #[test]
    fn failed_poisons_the_link() {
        let mut link = authenticated_listener();
        link.handle_event(LinkEvent::Failed).unwrap();
        assert_eq!(link.state(), LinkState::Error);

        let err = link
            .handle_event(LinkEvent::Data(diagnostic_frame()))
            .unwrap_err();
        assert_eq!(
            err,
            LinkError::InvalidTransition {
                state: LinkState::Error,
                event: "data",
            }
        );
    }

    #[test]
    fn protocol_violation_poisons_the_link() {
        let mut link = authenticated_listener();
        let err = link
            .handle_event(LinkEvent::Data(vec![0xFF; 16]))
            .unwrap_err();
        assert!(matches!(err, LinkError::Wire(WireError::UnsupportedVersion { .. })));
        assert_eq!(link.state(), LinkState::Error);
    }

    #[test]
    fn denied_activation_code_is_carried_through() {
        let mut link = Link::initiator(0x0E80);
        link.open().unwrap();
        link.handle_event(LinkEvent::Connected).unwrap();

        let frame = Message::RoutingActivationResponse(RoutingActivationResponse::denied(
            0x0E80,
            0x0201,
            activation_code::DENIED_UNKNOWN_SOURCE_ADDRESS,
        ))
        .to_bytes();
        let messages = link.handle_event(LinkEvent::Data(frame)).unwrap();
        match &messages[0] {
            Message::RoutingActivationResponse(response) => assert!(!response.is_success()),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
