//! Host-driven API: EdgeCore encodes outbound calls and turns inbound envelopes into events.
//!
//! One `EdgeCore` per edge connection. It does no I/O: the host writes every
//! `Event::Send` frame to the connection and feeds every received envelope
//! to `on_message`. Hosts sharing a core between a send path and a receive
//! path wrap it in a mutex.

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::correlator::{Correlator, CorrelatorError};
use crate::dispatch::{DispatchMode, Dispatcher, Inbound};
use crate::error::Error;
use crate::integrity::Verifiers;
use crate::protocol::{error_reply, port_open_reply, InboundRequest, Method, Request};
use crate::response::{RemoteError, Response};
use crate::rlp::Value;
use crate::session::{PendingOpen, SessionError, SessionEvent, TunnelEngine};
use crate::ticket::{TicketManager, TicketParams};
use crate::wire::{encode_frame, Envelope, MAX_FRAME_LEN};

/// Default largest tunnel payload per `portsend` frame.
pub const DEFAULT_SEND_CHUNK_SIZE: usize = 16 * 1024;

/// Room left in a frame for the envelope, method token and ref around `portsend` data.
const PORT_SEND_OVERHEAD: usize = 64;

/// Largest tunnel payload that still fits one frame.
pub const MAX_SEND_CHUNK_SIZE: usize = MAX_FRAME_LEN - PORT_SEND_OVERHEAD;

/// Mode requested for locally opened ports.
const PORT_MODE: &str = "rw";

fn default_send_chunk_size() -> usize {
    DEFAULT_SEND_CHUNK_SIZE
}

/// Protocol settings for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    #[serde(default)]
    pub dispatch_mode: DispatchMode,
    /// Ports servers may open towards this device. Empty allows all.
    #[serde(default)]
    pub published_ports: Vec<u64>,
    #[serde(default = "default_send_chunk_size")]
    pub send_chunk_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::default(),
            published_ports: Vec::new(),
            send_chunk_size: default_send_chunk_size(),
        }
    }
}

impl CoreConfig {
    pub fn is_published(&self, port: u64) -> bool {
        self.published_ports.is_empty() || self.published_ports.contains(&port)
    }

    /// Configured chunk size, clamped to what fits a frame. Zero means the default.
    pub fn chunk_size(&self) -> usize {
        match self.send_chunk_size {
            0 => DEFAULT_SEND_CHUNK_SIZE,
            n => n.min(MAX_SEND_CHUNK_SIZE),
        }
    }
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Write this frame to the connection.
    Send(Vec<u8>),
    /// An outbound request finished, successfully or not.
    Resolved {
        request_id: u64,
        result: Result<Response, Error>,
    },
    Session(SessionEvent),
    /// A server request we could not honour. The server was sent an error reply.
    InboundRejected { request_id: u64, error: Error },
}

/// Main coordinator for one edge connection.
#[derive(Debug)]
pub struct EdgeCore {
    config: CoreConfig,
    dispatcher: Dispatcher,
    correlator: Correlator,
    tunnels: TunnelEngine,
    tickets: Option<TicketManager>,
    verifiers: Verifiers,
    next_request_id: u64,
}

impl EdgeCore {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(config.dispatch_mode),
            config,
            correlator: Correlator::new(),
            tunnels: TunnelEngine::new(),
            tickets: None,
            verifiers: Verifiers::default(),
            next_request_id: 1,
        }
    }

    pub fn with_verifiers(mut self, verifiers: Verifiers) -> Self {
        self.verifiers = verifiers;
        self
    }

    pub fn with_ticket_manager(mut self, tickets: TicketManager) -> Self {
        self.tickets = Some(tickets);
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn tunnels(&self) -> &TunnelEngine {
        &self.tunnels
    }

    pub fn tickets(&self) -> Option<&TicketManager> {
        self.tickets.as_ref()
    }

    /// Requests sent and not yet resolved.
    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    /// Frame `request` under `request_id` and bind its decoder.
    fn register(&mut self, request_id: u64, request: &Request) -> Result<Vec<u8>, Error> {
        let frame = encode_frame(&Envelope::new(request_id, request.to_value()))?;
        let method = request.method();
        self.correlator
            .register(request_id, method, method.decoder())?;
        debug!(request_id, %method, "request registered");
        Ok(frame)
    }

    /// Encode a request the server does not answer. Nothing is registered.
    pub fn cast(&mut self, request: &Request) -> Result<Vec<u8>, Error> {
        let request_id = self.next_id();
        let frame = encode_frame(&Envelope::new(request_id, request.to_value()))?;
        debug!(request_id, method = %request.method(), "request sent without reply");
        Ok(frame)
    }

    /// Encode an outbound request and wait for its reply. Returns its request id and frame.
    ///
    /// Send-only methods may be called too, for servers that acknowledge them;
    /// a caller that stops waiting should `cancel` the id.
    pub fn call(&mut self, request: &Request) -> Result<(u64, Vec<u8>), Error> {
        let request_id = self.next_id();
        let frame = self.register(request_id, request)?;
        Ok((request_id, frame))
    }

    /// Ask the server to open `port` on `device_id`. The session stays pending until answered.
    pub fn open_port(
        &mut self,
        port: u64,
        device_id: Vec<u8>,
    ) -> Result<(PendingOpen, Vec<u8>), Error> {
        let request_id = self.next_id();
        let (handle, request) = self.tunnels.open(request_id, port, device_id, PORT_MODE);
        match self.register(request_id, &request) {
            Ok(frame) => Ok((handle, frame)),
            Err(e) => {
                self.tunnels.fail_open(request_id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Frames carrying `data` on an open tunnel, split at the configured chunk size.
    pub fn send_data(&mut self, ref_id: u64, data: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        let size = self.config.chunk_size();
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(size).collect()
        };
        let mut frames = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let request = self.tunnels.send(ref_id, chunk)?;
            frames.push(self.cast(&request)?);
        }
        if let Some(tickets) = self.tickets.as_mut() {
            tickets.record_bytes(data.len() as u64);
        }
        Ok(frames)
    }

    pub fn close_port(&mut self, ref_id: u64) -> Result<Vec<u8>, Error> {
        let request = self.tunnels.close(ref_id)?;
        self.cast(&request)
    }

    /// Drop the registration for `request_id`, e.g. after a caller timeout.
    /// A pending port open fails with it. Empty if the id is not outstanding.
    pub fn cancel(&mut self, request_id: u64) -> Vec<Event> {
        let registration = match self.correlator.take(request_id) {
            Ok(registration) => registration,
            Err(_) => return Vec::new(),
        };
        debug!(request_id, method = %registration.method, "request cancelled");
        let mut events = Vec::new();
        if registration.method == Method::PortOpen {
            events.extend(
                self.tunnels
                    .fail_open(request_id, "cancelled")
                    .map(Event::Session),
            );
        }
        events.push(Event::Resolved {
            request_id,
            result: Err(Error::Cancelled),
        });
        events
    }

    /// Sign the current usage counters and frame the ticket request.
    pub fn submit_ticket(&mut self, params: &TicketParams) -> Result<(u64, Vec<u8>), Error> {
        let tickets = self.tickets.as_mut().ok_or(Error::NoTicketManager)?;
        let ticket = tickets.build_ticket(params)?;
        info!(
            total_connections = ticket.total_connections,
            total_bytes = ticket.total_bytes,
            block_number = ticket.block_number,
            "submitting ticket"
        );
        self.call(&ticket.to_request())
    }

    /// Process one received envelope (frame body without its length prefix).
    ///
    /// Fails when the envelope cannot be classified or answers no outstanding
    /// request; the envelope is then discarded.
    pub fn on_message(&mut self, envelope: &[u8]) -> Result<Vec<Event>, Error> {
        match self.dispatcher.dispatch(envelope)? {
            Inbound::Response {
                request_id,
                method,
                payload,
            } => self.on_response(request_id, method, &payload),
            Inbound::Error { request_id, error } => self.on_remote_error(request_id, error),
            Inbound::Request {
                request_id,
                request,
            } => Ok(self.on_inbound_request(request_id, request)),
        }
    }

    fn on_response(
        &mut self,
        request_id: u64,
        method: Method,
        payload: &Value,
    ) -> Result<Vec<Event>, Error> {
        let registration = match self.correlator.take(request_id) {
            Ok(registration) => registration,
            // Servers that acknowledge send-only requests.
            Err(CorrelatorError::HandlerNotFound(_)) if !method.expects_reply() => {
                debug!(request_id, %method, "ignoring acknowledgement");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        if registration.method != method {
            debug!(request_id, requested = %registration.method, replied = %method, "reply names a different method");
        }
        let mut result = (registration.decoder)(payload, &self.verifiers);
        let mut events = Vec::new();
        let mut rejected = None;
        match &result {
            Ok(Response::PortOpen {
                open,
                result: verdict,
            }) => match self.tunnels.on_open_response(request_id, open, verdict) {
                Ok(event) => {
                    if matches!(event, SessionEvent::Opened { .. }) {
                        self.record_connection();
                    }
                    events.push(Event::Session(event));
                }
                // Sent through `call` rather than `open_port`: nothing to track.
                Err(SessionError::UnknownPending(_)) => {}
                Err(e) => rejected = Some(e),
            },
            Ok(Response::Ticket(outcome)) => {
                if let Some(tickets) = self.tickets.as_mut() {
                    tickets.apply(outcome);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(request_id, method = %registration.method, error = %e, "response rejected");
                if registration.method == Method::PortOpen {
                    events.extend(
                        self.tunnels
                            .fail_open(request_id, &e.to_string())
                            .map(Event::Session),
                    );
                }
            }
        }
        if let Some(e) = rejected {
            warn!(request_id, error = %e, "port open reply rejected");
            result = Err(e.into());
        }
        events.push(Event::Resolved { request_id, result });
        Ok(events)
    }

    fn on_remote_error(
        &mut self,
        request_id: u64,
        error: RemoteError,
    ) -> Result<Vec<Event>, Error> {
        let registration = self.correlator.take(request_id)?;
        warn!(request_id, method = %registration.method, message = %error.message, "server returned error");
        let mut events = Vec::new();
        if registration.method == Method::PortOpen {
            events.extend(
                self.tunnels
                    .fail_open(request_id, &error.message)
                    .map(Event::Session),
            );
        }
        events.push(Event::Resolved {
            request_id,
            result: Err(Error::Remote {
                method: error.method,
                message: error.message,
            }),
        });
        Ok(events)
    }

    fn on_inbound_request(&mut self, request_id: u64, request: InboundRequest) -> Vec<Event> {
        let method = request.method();
        if let InboundRequest::PortOpen(open) = &request {
            if !self.config.is_published(open.port) {
                warn!(request_id, port = open.port, "refusing port open for unpublished port");
                let mut events = Vec::new();
                if let Some(frame) = self.reply(request_id, error_reply(method, "port not published")) {
                    events.push(Event::Send(frame));
                }
                return events;
            }
        }
        let session_events = match self.tunnels.handle_inbound(&request) {
            Ok(events) => events,
            Err(e) => {
                warn!(request_id, %method, error = %e, "inbound request rejected");
                let mut events = Vec::new();
                if let Some(frame) = self.reply(request_id, error_reply(method, &e.to_string())) {
                    events.push(Event::Send(frame));
                }
                events.push(Event::InboundRejected {
                    request_id,
                    error: e.into(),
                });
                return events;
            }
        };
        let mut events = Vec::new();
        match &request {
            InboundRequest::PortOpen(open) => {
                self.record_connection();
                if let Some(frame) = self.reply(request_id, port_open_reply(open.ref_id)) {
                    events.push(Event::Send(frame));
                }
            }
            InboundRequest::PortSend(send) => {
                if let Some(tickets) = self.tickets.as_mut() {
                    tickets.record_bytes(send.data.len() as u64);
                }
            }
            InboundRequest::PortClose(_) | InboundRequest::Goodbye(_) => {}
        }
        events.extend(session_events.into_iter().map(Event::Session));
        events
    }

    fn reply(&self, request_id: u64, payload: Value) -> Option<Vec<u8>> {
        encode_frame(&Envelope::new(request_id, payload)).ok()
    }

    fn record_connection(&mut self) {
        if let Some(tickets) = self.tickets.as_mut() {
            tickets.record_connection();
        }
    }

    /// The connection is gone: close every session and fail every outstanding request.
    pub fn on_connection_closed(&mut self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .tunnels
            .teardown()
            .into_iter()
            .map(Event::Session)
            .collect();
        let failed = self.correlator.fail_all();
        info!(
            sessions = events.len(),
            requests = failed.len(),
            "connection closed"
        );
        events.extend(failed.into_iter().map(|(request_id, _)| Event::Resolved {
            request_id,
            result: Err(Error::ConnectionClosed),
        }));
        events
    }
}

impl Default for EdgeCore {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}
