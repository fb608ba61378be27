//! Tunnel sessions multiplexed over one edge connection, keyed by `ref`.
//!
//! A locally requested open stays pending (keyed by the request id it was
//! sent under) until the server answers. A `ref` is valid from a successful
//! open until the matching close; traffic on any other ref is an error and
//! never creates state.

use std::collections::{BTreeMap, HashMap};

use tracing::info;

use crate::protocol::{InboundRequest, PortOpen, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Open,
    Closed,
}

/// Who asked for the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Returned by `open`: identifies the session until the server assigns a ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingOpen {
    pub request_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingSession {
    port: u64,
    device_id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenSession {
    port: u64,
    device_id: Vec<u8>,
    origin: Origin,
}

/// Status transitions reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened {
        ref_id: u64,
        port: u64,
        device_id: Vec<u8>,
        origin: Origin,
    },
    OpenFailed {
        request_id: u64,
        port: u64,
        reason: String,
    },
    Data {
        ref_id: u64,
        data: Vec<u8>,
    },
    Closed {
        ref_id: u64,
    },
    /// Follows one `Closed` per session the goodbye tore down.
    Goodbye {
        reason: String,
    },
}

#[derive(Debug, Default)]
pub struct TunnelEngine {
    pending: HashMap<u64, PendingSession>,
    // Ordered so teardown reports refs deterministically.
    open: BTreeMap<u64, OpenSession>,
}

impl TunnelEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local open sent as request `request_id`; returns the request to send.
    pub fn open(
        &mut self,
        request_id: u64,
        port: u64,
        device_id: Vec<u8>,
        mode: &str,
    ) -> (PendingOpen, Request) {
        let request = Request::PortOpen {
            device_id: device_id.clone(),
            port,
            mode: mode.to_string(),
        };
        self.pending
            .insert(request_id, PendingSession { port, device_id });
        (PendingOpen { request_id }, request)
    }

    /// Server answered our open.
    pub fn on_open_response(
        &mut self,
        request_id: u64,
        reply: &PortOpen,
        result: &str,
    ) -> Result<SessionEvent, SessionError> {
        let pending = self
            .pending
            .remove(&request_id)
            .ok_or(SessionError::UnknownPending(request_id))?;
        if !reply.ok {
            info!(request_id, port = pending.port, result, "port open refused");
            return Ok(SessionEvent::OpenFailed {
                request_id,
                port: pending.port,
                reason: result.to_string(),
            });
        }
        self.insert_open(
            reply.ref_id,
            OpenSession {
                port: pending.port,
                device_id: pending.device_id,
                origin: Origin::Local,
            },
        )
    }

    /// Our open failed before any reply shape could be read (error
    /// envelope or undecodable reply). None if nothing was pending.
    pub fn fail_open(&mut self, request_id: u64, reason: &str) -> Option<SessionEvent> {
        let pending = self.pending.remove(&request_id)?;
        info!(request_id, port = pending.port, reason, "port open failed");
        Some(SessionEvent::OpenFailed {
            request_id,
            port: pending.port,
            reason: reason.to_string(),
        })
    }

    /// Apply a server-originated control request.
    pub fn handle_inbound(
        &mut self,
        request: &InboundRequest,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        match request {
            InboundRequest::PortOpen(p) => {
                let event = self.insert_open(
                    p.ref_id,
                    OpenSession {
                        port: p.port,
                        device_id: p.device_id.clone(),
                        origin: Origin::Remote,
                    },
                )?;
                Ok(vec![event])
            }
            InboundRequest::PortSend(p) => {
                if !self.open.contains_key(&p.ref_id) {
                    return Err(SessionError::UnknownRef(p.ref_id));
                }
                Ok(vec![SessionEvent::Data {
                    ref_id: p.ref_id,
                    data: p.data.clone(),
                }])
            }
            InboundRequest::PortClose(p) => {
                self.remove_open(p.ref_id)?;
                info!(ref_id = p.ref_id, "tunnel closed by server");
                Ok(vec![SessionEvent::Closed { ref_id: p.ref_id }])
            }
            InboundRequest::Goodbye(g) => {
                let mut events = self.close_all();
                info!(reason = %g.reason, closed = events.len(), "server said goodbye");
                events.push(SessionEvent::Goodbye {
                    reason: g.reason.clone(),
                });
                Ok(events)
            }
        }
    }

    /// Request carrying `data` on an open ref.
    pub fn send(&self, ref_id: u64, data: &[u8]) -> Result<Request, SessionError> {
        if !self.open.contains_key(&ref_id) {
            return Err(SessionError::UnknownRef(ref_id));
        }
        Ok(Request::PortSend {
            ref_id,
            data: data.to_vec(),
        })
    }

    /// Close an open ref locally; returns the request to send.
    pub fn close(&mut self, ref_id: u64) -> Result<Request, SessionError> {
        self.remove_open(ref_id)?;
        info!(ref_id, "tunnel closed");
        Ok(Request::PortClose { ref_id })
    }

    /// Connection is gone: fail every pending open and close every open ref.
    pub fn teardown(&mut self) -> Vec<SessionEvent> {
        let mut pending: Vec<_> = self.pending.drain().collect();
        pending.sort_by_key(|(request_id, _)| *request_id);
        let mut events: Vec<SessionEvent> = pending
            .into_iter()
            .map(|(request_id, p)| SessionEvent::OpenFailed {
                request_id,
                port: p.port,
                reason: "connection closed".to_string(),
            })
            .collect();
        events.extend(self.close_all());
        events
    }

    pub fn state(&self, ref_id: u64) -> SessionState {
        if self.open.contains_key(&ref_id) {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    pub fn pending_state(&self, handle: PendingOpen) -> Option<SessionState> {
        self.pending
            .contains_key(&handle.request_id)
            .then_some(SessionState::Pending)
    }

    pub fn open_refs(&self) -> Vec<u64> {
        self.open.keys().copied().collect()
    }

    fn insert_open(&mut self, ref_id: u64, session: OpenSession) -> Result<SessionEvent, SessionError> {
        if self.open.contains_key(&ref_id) {
            return Err(SessionError::DuplicateRef(ref_id));
        }
        info!(ref_id, port = session.port, origin = ?session.origin, "tunnel open");
        let event = SessionEvent::Opened {
            ref_id,
            port: session.port,
            device_id: session.device_id.clone(),
            origin: session.origin,
        };
        self.open.insert(ref_id, session);
        Ok(event)
    }

    fn remove_open(&mut self, ref_id: u64) -> Result<OpenSession, SessionError> {
        self.open
            .remove(&ref_id)
            .ok_or(SessionError::UnknownRef(ref_id))
    }

    fn close_all(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.open)
            .into_keys()
            .map(|ref_id| SessionEvent::Closed { ref_id })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("unknown or closed ref {0}")]
    UnknownRef(u64),
    #[error("ref {0} is already open")]
    DuplicateRef(u64),
    #[error("no pending port open for request {0}")]
    UnknownPending(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Goodbye, PortClose, PortSend};

    fn accepted(ref_id: u64) -> PortOpen {
        PortOpen {
            ref_id,
            port: 0,
            device_id: vec![],
            ok: true,
        }
    }

    fn inbound_send(ref_id: u64, data: &[u8]) -> InboundRequest {
        InboundRequest::PortSend(PortSend {
            ref_id,
            data: data.to_vec(),
            ok: true,
        })
    }

    fn inbound_close(ref_id: u64) -> InboundRequest {
        InboundRequest::PortClose(PortClose { ref_id, ok: true })
    }

    fn inbound_open(ref_id: u64, port: u64) -> InboundRequest {
        InboundRequest::PortOpen(PortOpen {
            ref_id,
            port,
            device_id: vec![1; 20],
            ok: true,
        })
    }

    #[test]
    fn open_send_close_lifecycle() {
        let mut engine = TunnelEngine::new();
        let (handle, request) = engine.open(1, 22, vec![9; 20], "rw");
        assert_eq!(request.method(), crate::protocol::Method::PortOpen);
        assert_eq!(engine.pending_state(handle), Some(SessionState::Pending));

        let event = engine.on_open_response(1, &accepted(7), "ok").unwrap();
        assert!(matches!(event, SessionEvent::Opened { ref_id: 7, port: 22, .. }));
        assert_eq!(engine.state(7), SessionState::Open);
        assert_eq!(engine.pending_state(handle), None);

        let events = engine.handle_inbound(&inbound_send(7, b"hi")).unwrap();
        assert_eq!(
            events,
            vec![SessionEvent::Data {
                ref_id: 7,
                data: b"hi".to_vec()
            }]
        );

        let events = engine.handle_inbound(&inbound_close(7)).unwrap();
        assert_eq!(events, vec![SessionEvent::Closed { ref_id: 7 }]);
        assert_eq!(engine.state(7), SessionState::Closed);

        assert_eq!(
            engine.handle_inbound(&inbound_send(7, b"late")),
            Err(SessionError::UnknownRef(7))
        );
    }

    #[test]
    fn server_opened_tunnel_is_open() {
        let mut engine = TunnelEngine::new();
        let events = engine.handle_inbound(&inbound_open(7, 80)).unwrap();
        assert!(matches!(
            events[0],
            SessionEvent::Opened {
                ref_id: 7,
                origin: Origin::Remote,
                ..
            }
        ));
        assert!(engine.send(7, b"x").is_ok());
        assert_eq!(
            engine.handle_inbound(&inbound_open(7, 80)),
            Err(SessionError::DuplicateRef(7))
        );
    }

    #[test]
    fn refused_open_allocates_nothing() {
        let mut engine = TunnelEngine::new();
        engine.open(3, 22, vec![], "rw");
        let mut refused = accepted(5);
        refused.ok = false;
        let event = engine.on_open_response(3, &refused, "port closed").unwrap();
        assert_eq!(
            event,
            SessionEvent::OpenFailed {
                request_id: 3,
                port: 22,
                reason: "port closed".into()
            }
        );
        assert_eq!(engine.state(5), SessionState::Closed);
        assert!(engine.open_refs().is_empty());
        assert_eq!(
            engine.on_open_response(3, &accepted(5), "ok"),
            Err(SessionError::UnknownPending(3))
        );
    }

    #[test]
    fn unknown_ref_is_an_error() {
        let mut engine = TunnelEngine::new();
        assert_eq!(engine.send(4, b"x"), Err(SessionError::UnknownRef(4)));
        assert_eq!(engine.close(4), Err(SessionError::UnknownRef(4)));
        assert_eq!(
            engine.handle_inbound(&inbound_close(4)),
            Err(SessionError::UnknownRef(4))
        );
    }

    #[test]
    fn local_close_emits_port_close() {
        let mut engine = TunnelEngine::new();
        engine.handle_inbound(&inbound_open(2, 80)).unwrap();
        assert_eq!(engine.close(2), Ok(Request::PortClose { ref_id: 2 }));
        assert_eq!(engine.send(2, b"x"), Err(SessionError::UnknownRef(2)));
    }

    #[test]
    fn goodbye_closes_every_open_session() {
        let mut engine = TunnelEngine::new();
        engine.handle_inbound(&inbound_open(9, 80)).unwrap();
        engine.handle_inbound(&inbound_open(3, 81)).unwrap();
        let events = engine
            .handle_inbound(&InboundRequest::Goodbye(Goodbye {
                reason: "ticket expected".into(),
            }))
            .unwrap();
        assert_eq!(
            events,
            vec![
                SessionEvent::Closed { ref_id: 3 },
                SessionEvent::Closed { ref_id: 9 },
                SessionEvent::Goodbye {
                    reason: "ticket expected".into()
                },
            ]
        );
        assert!(engine.open_refs().is_empty());
    }

    #[test]
    fn teardown_fails_pending_and_closes_open() {
        let mut engine = TunnelEngine::new();
        engine.open(11, 22, vec![], "rw");
        engine.handle_inbound(&inbound_open(5, 80)).unwrap();
        let events = engine.teardown();
        assert_eq!(
            events,
            vec![
                SessionEvent::OpenFailed {
                    request_id: 11,
                    port: 22,
                    reason: "connection closed".into()
                },
                SessionEvent::Closed { ref_id: 5 },
            ]
        );
        assert!(engine.teardown().is_empty());
    }

    #[test]
    fn fail_open_only_for_pending() {
        let mut engine = TunnelEngine::new();
        engine.open(1, 22, vec![], "rw");
        assert!(engine.fail_open(1, "denied").is_some());
        assert!(engine.fail_open(1, "denied").is_none());
    }
}
