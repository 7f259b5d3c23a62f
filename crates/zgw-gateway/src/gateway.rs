//! The gateway: connection bookkeeping and event-to-effect processing.
//!
//! [`Gateway`] owns the diagnostic server state (download engine, installer,
//! identity), the table of open links and the outbound client pool. It
//! performs no I/O: the runtime registers connections, feeds
//! [`LinkEvent`]s in and applies the returned [`Effect`]s to its sockets.
//!
//! Inbound links serve diagnostic requests once their routing activation
//! handshake is done. Client links are dialed for one outbound request
//! each: dial, activate, send, deliver the response to the parked
//! [`ClientContext`](crate::client::ClientContext), close.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use zgw_doip::message::{activation_code, ACTIVATION_TYPE_DEFAULT};
use zgw_doip::{
    DiagnosticMessage, Link, LinkEvent, Message, RoutingActivationRequest,
    RoutingActivationResponse,
};
use zgw_flash::Storage;
use zgw_uds::ServiceResponse;

use crate::client::{ClientCallback, ClientContext, ClientError, ClientPool, ContextId};
use crate::config::{GatewayConfig, IdentityConfig};
use crate::download::DownloadEngine;
use crate::install::{DeviceInventory, Installer, ZoneRouter};
use crate::services;

/// Runtime handle for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// What a connection is for.
#[derive(Debug, Clone, Copy)]
enum LinkPurpose {
    /// Accepted connection served by the diagnostic dispatch table.
    Inbound,
    /// Dialed connection carrying one client context's request.
    Client(ContextId),
}

struct LinkSlot {
    link: Link,
    purpose: LinkPurpose,
}

/// I/O the runtime must perform after an event was processed.
#[derive(Debug, PartialEq, Eq)]
pub enum Effect {
    /// Write bytes to the connection behind `link`.
    Send { link: LinkId, bytes: Vec<u8> },
    /// Close the connection and forget the link.
    Close { link: LinkId },
    /// Dial `endpoint` and feed the resulting connection's events to `link`.
    Connect { link: LinkId, endpoint: String },
}

/// Callback invocations and diagnostic dispatches collected while the link
/// table is locked; both run arbitrary code and must not hold the lock.
#[derive(Default)]
struct Deferred {
    completions: Vec<(ClientContext, Result<ServiceResponse, ClientError>)>,
    /// Requester address plus raw UDS request, answered via dispatch.
    dispatches: Vec<(u16, Vec<u8>)>,
}

pub struct Gateway {
    identity: IdentityConfig,
    logical_address: u16,
    /// Zone logical address to dial endpoint.
    endpoints: HashMap<u16, String>,
    download: DownloadEngine,
    installer: Installer,
    clients: ClientPool,
    links: RwLock<HashMap<LinkId, LinkSlot>>,
    next_link: AtomicU64,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        staging: Arc<dyn Storage>,
        program: Arc<dyn Storage>,
        router: Arc<dyn ZoneRouter>,
        inventory: Arc<dyn DeviceInventory>,
    ) -> Self {
        let logical_address = config.network.logical_address;
        let download = DownloadEngine::new(
            Arc::clone(&staging),
            config.staging_map(),
            logical_address,
        );
        let installer = Installer::new(
            staging,
            program,
            config.bank_layout(),
            logical_address,
            router,
            inventory,
        );
        let endpoints = config
            .zones
            .iter()
            .map(|zone| (zone.address, zone.endpoint.clone()))
            .collect();

        Self {
            identity: config.identity,
            logical_address,
            endpoints,
            download,
            installer,
            clients: ClientPool::new(config.update.client_pool_size),
            links: RwLock::new(HashMap::new()),
            next_link: AtomicU64::new(0),
        }
    }

    pub fn identity(&self) -> &IdentityConfig {
        &self.identity
    }

    pub fn logical_address(&self) -> u16 {
        self.logical_address
    }

    pub fn download(&self) -> &DownloadEngine {
        &self.download
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    pub fn open_links(&self) -> usize {
        self.links.read().len()
    }

    fn allocate_id(&self) -> LinkId {
        LinkId(self.next_link.fetch_add(1, Ordering::Relaxed))
    }

    /// Register an accepted inbound connection. The returned id keys every
    /// future event for it; the runtime feeds [`LinkEvent::Connected`]
    /// next.
    pub fn accept_link(&self) -> LinkId {
        let id = self.allocate_id();
        let mut link = Link::listener(self.logical_address);
        // A freshly created link always accepts open().
        let opened = link.open();
        debug_assert!(opened.is_ok());

        self.links.write().insert(
            id,
            LinkSlot {
                link,
                purpose: LinkPurpose::Inbound,
            },
        );
        debug!(%id, "inbound link registered");
        id
    }

    /// Issue one UDS request to a zone ECU.
    ///
    /// Every outcome reaches `callback`, including refusals decided here
    /// before any byte moves. On acceptance the returned effect dials the
    /// zone's endpoint; the rest of the exchange is driven by events on
    /// the new link.
    pub fn client_request(
        &self,
        target_address: u16,
        request: Vec<u8>,
        callback: ClientCallback,
    ) -> Vec<Effect> {
        let endpoint = match self.endpoints.get(&target_address) {
            Some(endpoint) => endpoint.clone(),
            None => {
                debug!(
                    target = format!("{:#06X}", target_address),
                    "client request for unknown target"
                );
                callback(Err(ClientError::UnknownTarget(target_address)));
                return Vec::new();
            }
        };

        let context = ClientContext::new(target_address, request, callback);
        let context_id = match self.clients.acquire(context) {
            Ok(context_id) => context_id,
            Err(context) => {
                warn!(
                    capacity = self.clients.capacity(),
                    "client pool exhausted, refusing request"
                );
                context.complete(Err(ClientError::PoolExhausted {
                    capacity: self.clients.capacity(),
                }));
                return Vec::new();
            }
        };

        let id = self.allocate_id();
        let mut link = Link::initiator(self.logical_address);
        let opened = link.open();
        debug_assert!(opened.is_ok());
        self.links.write().insert(
            id,
            LinkSlot {
                link,
                purpose: LinkPurpose::Client(context_id),
            },
        );

        info!(
            %id,
            context = %context_id,
            target = format!("{:#06X}", target_address),
            endpoint = %endpoint,
            "dialing zone for client request"
        );
        vec![Effect::Connect { link: id, endpoint }]
    }

    /// Feed one transport event through the owning link and return the I/O
    /// to perform. Events for unknown links are ignored.
    pub fn handle_event(&self, id: LinkId, event: LinkEvent) -> Vec<Effect> {
        let mut deferred = Deferred::default();
        let mut effects = self.process_event(id, event, &mut deferred);

        // Callbacks and dispatch run arbitrary code, including follow-up
        // client requests; the link table is unlocked here.
        for (context, result) in deferred.completions {
            context.complete(result);
        }
        for (requester, uds) in deferred.dispatches {
            let response = services::dispatch(self, &uds);
            effects.extend(self.send_diagnostic(id, requester, response));
        }
        effects
    }

    fn process_event(&self, id: LinkId, event: LinkEvent, deferred: &mut Deferred) -> Vec<Effect> {
        let mut links = self.links.write();
        let slot = match links.get_mut(&id) {
            Some(slot) => slot,
            None => {
                debug!(%id, "event for unknown link ignored");
                return Vec::new();
            }
        };
        let purpose = slot.purpose;
        let is_terminal = matches!(event, LinkEvent::Closed | LinkEvent::Failed);
        let is_connect = matches!(event, LinkEvent::Connected);

        let messages = match slot.link.handle_event(event) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(%id, error = %err, "link error, dropping connection");
                links.remove(&id);
                self.abort_client(purpose, ClientError::Link(err), deferred);
                return vec![Effect::Close { link: id }];
            }
        };

        if is_terminal {
            // The transport is already gone; forget the link and fail any
            // parked context. No close effect needed.
            links.remove(&id);
            self.abort_client(purpose, ClientError::Disconnected, deferred);
            return Vec::new();
        }

        let mut effects = Vec::new();

        if is_connect {
            // A completed dial starts the activation handshake; inbound
            // links wait for the peer to request activation.
            if let LinkPurpose::Client(_) = purpose {
                let request = Message::RoutingActivationRequest(RoutingActivationRequest::new(
                    self.logical_address,
                ));
                match slot.link.encode_send(&request) {
                    Ok(bytes) => {
                        debug!(%id, "requesting routing activation");
                        effects.push(Effect::Send { link: id, bytes });
                    }
                    Err(err) => {
                        warn!(%id, error = %err, "cannot start activation handshake");
                        links.remove(&id);
                        self.abort_client(purpose, ClientError::Link(err), deferred);
                        return vec![Effect::Close { link: id }];
                    }
                }
            }
            return effects;
        }

        let mut drop_link = false;
        for message in messages {
            if drop_link {
                break;
            }
            match message {
                Message::RoutingActivationRequest(request) => match purpose {
                    LinkPurpose::Inbound => {
                        drop_link = !self.activate_inbound(id, slot, request, &mut effects);
                    }
                    LinkPurpose::Client(_) => {
                        warn!(%id, "peer requested activation on a link we dialed");
                        drop_link = true;
                    }
                },
                Message::RoutingActivationResponse(response) => match purpose {
                    LinkPurpose::Client(context_id) => {
                        drop_link = !self.finish_client_activation(
                            id, slot, context_id, response, &mut effects, deferred,
                        );
                    }
                    LinkPurpose::Inbound => {
                        warn!(%id, "unexpected activation response on inbound link");
                        drop_link = true;
                    }
                },
                Message::Diagnostic(diag) => match purpose {
                    LinkPurpose::Inbound => {
                        if diag.target_address != self.logical_address {
                            debug!(
                                %id,
                                target = format!("{:#06X}", diag.target_address),
                                "diagnostic for another entity dropped"
                            );
                            continue;
                        }
                        deferred.dispatches.push((diag.source_address, diag.uds));
                    }
                    LinkPurpose::Client(context_id) => {
                        drop_link =
                            !self.finish_client_request(id, context_id, diag, deferred);
                    }
                },
            }
        }

        if drop_link {
            links.remove(&id);
            effects.push(Effect::Close { link: id });
        }
        effects
    }

    /// Answer an inbound routing activation request. Returns `false` when
    /// the link should be dropped.
    fn activate_inbound(
        &self,
        id: LinkId,
        slot: &mut LinkSlot,
        request: RoutingActivationRequest,
        effects: &mut Vec<Effect>,
    ) -> bool {
        if request.activation_type != ACTIVATION_TYPE_DEFAULT {
            info!(
                %id,
                activation_type = format!("0x{:02X}", request.activation_type),
                "denying activation: unsupported activation type"
            );
            let denial = Message::RoutingActivationResponse(RoutingActivationResponse::denied(
                request.source_address,
                self.logical_address,
                activation_code::DENIED_UNSUPPORTED_TYPE,
            ));
            if let Ok(bytes) = slot.link.encode_send(&denial) {
                effects.push(Effect::Send { link: id, bytes });
            }
            return false;
        }

        let response = Message::RoutingActivationResponse(RoutingActivationResponse::success(
            request.source_address,
            self.logical_address,
        ));
        let bytes = match slot.link.encode_send(&response) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%id, error = %err, "cannot answer activation request");
                return false;
            }
        };
        if let Err(err) = slot.link.promote(request.source_address) {
            warn!(%id, error = %err, "activation bookkeeping failed");
            return false;
        }

        info!(
            %id,
            peer = format!("{:#06X}", request.source_address),
            "routing activation accepted"
        );
        effects.push(Effect::Send { link: id, bytes });
        true
    }

    /// Handle the zone's answer to our activation request. On success the
    /// parked request goes out; returns `false` when the link should be
    /// dropped.
    fn finish_client_activation(
        &self,
        id: LinkId,
        slot: &mut LinkSlot,
        context_id: ContextId,
        response: RoutingActivationResponse,
        effects: &mut Vec<Effect>,
        deferred: &mut Deferred,
    ) -> bool {
        if !response.is_success() {
            info!(
                %id,
                code = format!("{:#04X}", response.code),
                "zone refused routing activation"
            );
            self.abort_client(
                LinkPurpose::Client(context_id),
                ClientError::ActivationRefused {
                    code: response.code,
                },
                deferred,
            );
            return false;
        }

        if let Err(err) = slot.link.promote(response.entity_address) {
            warn!(%id, error = %err, "client activation bookkeeping failed");
            self.abort_client(LinkPurpose::Client(context_id), ClientError::Link(err), deferred);
            return false;
        }

        let (target, request) = match self.clients.pending_request(context_id) {
            Some(pending) => pending,
            None => {
                warn!(%id, context = %context_id, "activation finished for a vanished context");
                return false;
            }
        };

        let message = Message::Diagnostic(DiagnosticMessage::new(
            self.logical_address,
            target,
            request,
        ));
        match slot.link.encode_send(&message) {
            Ok(bytes) => {
                debug!(%id, context = %context_id, "link activated, sending client request");
                effects.push(Effect::Send { link: id, bytes });
                true
            }
            Err(err) => {
                warn!(%id, error = %err, "cannot send client request");
                self.abort_client(LinkPurpose::Client(context_id), ClientError::Link(err), deferred);
                false
            }
        }
    }

    /// Decode the zone's diagnostic answer for a parked context. Returns
    /// `false` once the exchange is over and the link should be dropped; a
    /// response-pending placeholder keeps both alive.
    fn finish_client_request(
        &self,
        id: LinkId,
        context_id: ContextId,
        diag: DiagnosticMessage,
        deferred: &mut Deferred,
    ) -> bool {
        let request = match self.clients.pending_request(context_id) {
            Some((_, request)) => request,
            None => {
                warn!(%id, context = %context_id, "response for a vanished context");
                return false;
            }
        };
        let service = request.first().copied().unwrap_or(0);

        match ServiceResponse::parse(service, &diag.uds) {
            Ok(response) if response.is_pending() => {
                debug!(%id, context = %context_id, "zone answered response-pending, waiting");
                true
            }
            Ok(response) => {
                if let Some(context) = self.clients.take(context_id) {
                    deferred.completions.push((context, Ok(response)));
                }
                false
            }
            Err(err) => {
                warn!(%id, error = %err, "undecodable response from zone");
                self.abort_client(
                    LinkPurpose::Client(context_id),
                    ClientError::BadResponse(err),
                    deferred,
                );
                false
            }
        }
    }

    fn abort_client(&self, purpose: LinkPurpose, error: ClientError, deferred: &mut Deferred) {
        if let LinkPurpose::Client(context_id) = purpose {
            if let Some(context) = self.clients.take(context_id) {
                deferred.completions.push((context, Err(error)));
            }
        }
    }

    /// Encode a diagnostic response for the requester on `id`. The link may
    /// have vanished while the response was computed; nothing to send then.
    fn send_diagnostic(&self, id: LinkId, target: u16, uds: Vec<u8>) -> Option<Effect> {
        let links = self.links.read();
        let slot = links.get(&id)?;
        let message = Message::Diagnostic(DiagnosticMessage::new(
            self.logical_address,
            target,
            uds,
        ));
        match slot.link.encode_send(&message) {
            Ok(bytes) => Some(Effect::Send { link: id, bytes }),
            Err(err) => {
                warn!(%id, error = %err, "cannot send diagnostic response");
                None
            }
        }
    }
}
