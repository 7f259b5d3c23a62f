//! Tester-side connection helper.
//!
//! Wraps a TCP stream around an initiator [`Link`]: the link state machine
//! does the framing and the activation gate, this wrapper does the socket
//! I/O and the request/response pairing the commands need.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use zgw_doip::{DiagnosticMessage, Link, LinkEvent, Message, RoutingActivationRequest};
use zgw_uds::ServiceResponse;

/// How long to wait for one response frame. Response-pending answers
/// restart the clock.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TesterLink {
    stream: TcpStream,
    link: Link,
    target: u16,
    /// Frames decoded but not yet consumed.
    pending: VecDeque<Message>,
}

impl TesterLink {
    /// Connects to the gateway and performs routing activation.
    pub async fn connect(endpoint: &str, source: u16, target: u16) -> Result<Self> {
        let stream = TcpStream::connect(endpoint)
            .await
            .with_context(|| format!("failed to connect to {endpoint}"))?;
        let _ = stream.set_nodelay(true);

        let mut link = Link::initiator(source);
        link.open()?;
        link.handle_event(LinkEvent::Connected)?;

        let mut tester = Self {
            stream,
            link,
            target,
            pending: VecDeque::new(),
        };
        tester.activate().await?;
        Ok(tester)
    }

    async fn activate(&mut self) -> Result<()> {
        let request = Message::RoutingActivationRequest(RoutingActivationRequest::new(
            self.link.local_address(),
        ));
        self.send(&request).await?;

        match self.receive().await? {
            Message::RoutingActivationResponse(response) if response.is_success() => {
                self.link.promote(response.entity_address)?;
                debug!(
                    entity = format!("{:#06X}", response.entity_address),
                    "routing activation accepted"
                );
                Ok(())
            }
            Message::RoutingActivationResponse(response) => {
                bail!("routing activation denied (code {:#04X})", response.code)
            }
            other => bail!(
                "expected a routing activation response, got {:?}",
                other.kind()
            ),
        }
    }

    /// Issues one UDS request and waits for the matching response.
    pub async fn request(&mut self, uds: Vec<u8>) -> Result<ServiceResponse> {
        let service_id = *uds.first().context("empty UDS request")?;
        let message = Message::Diagnostic(DiagnosticMessage::new(
            self.link.local_address(),
            self.target,
            uds,
        ));
        self.send(&message).await?;

        loop {
            let response = match self.receive().await? {
                Message::Diagnostic(diag) => ServiceResponse::parse(service_id, &diag.uds)?,
                other => bail!("expected a diagnostic response, got {:?}", other.kind()),
            };
            if response.is_pending() {
                debug!(
                    service = format!("{service_id:#04X}"),
                    "response pending, waiting"
                );
                continue;
            }
            return Ok(response);
        }
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        let bytes = self.link.encode_send(message)?;
        self.stream
            .write_all(&bytes)
            .await
            .context("socket write failed")?;
        Ok(())
    }

    /// Reads from the socket until the link yields one complete frame.
    async fn receive(&mut self) -> Result<Message> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(message);
            }
            let n = timeout(RESPONSE_TIMEOUT, self.stream.read(&mut buf))
                .await
                .context("timed out waiting for the gateway")?
                .context("socket read failed")?;
            if n == 0 {
                let _ = self.link.handle_event(LinkEvent::Closed);
                bail!("connection closed by the gateway");
            }
            let messages = self.link.handle_event(LinkEvent::Data(buf[..n].to_vec()))?;
            self.pending.extend(messages);
        }
    }
}
