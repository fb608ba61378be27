//! Classify inbound envelopes as response, error or server request.
//!
//! Structural dispatch (the default) decodes the envelope and reads the
//! outer tag and the exact method token. The legacy marker mode classifies
//! by searching the raw frame for method tokens, as older clients did.
//! Older clients tried markers in table order, so `getblock` shadowed
//! `getblock2`. This mode corrects that and tries markers longest first;
//! it is not byte-exact with those clients. Tunnel data that happens to
//! contain another method's token can still be misclassified. Such frames
//! are rejected with `MarkerMismatch` rather than decoded as the wrong shape.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::{read_method, InboundRequest, Method, ERROR_TAG, RESPONSE_TAG};
use crate::response::RemoteError;
use crate::rlp::{DecodeError, Fields, Value};
use crate::wire::Envelope;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    Structural,
    LegacyMarker,
}

impl std::str::FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "structural" => Ok(DispatchMode::Structural),
            "legacy_marker" => Ok(DispatchMode::LegacyMarker),
            other => Err(format!("unknown dispatch mode {:?}", other)),
        }
    }
}

/// A classified inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Reply to one of our requests. `method` is informational; the
    /// correlator decodes with the decoder registered for `request_id`.
    Response {
        request_id: u64,
        method: Method,
        payload: Value,
    },
    Error {
        request_id: u64,
        error: RemoteError,
    },
    Request {
        request_id: u64,
        request: InboundRequest,
    },
}

impl Inbound {
    pub fn request_id(&self) -> u64 {
        match self {
            Inbound::Response { request_id, .. }
            | Inbound::Error { request_id, .. }
            | Inbound::Request { request_id, .. } => *request_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Dispatcher {
    mode: DispatchMode,
}

impl Dispatcher {
    pub fn new(mode: DispatchMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Classify one envelope (frame body without the length prefix).
    pub fn dispatch(&self, raw: &[u8]) -> Result<Inbound, DispatchError> {
        let envelope = Envelope::decode(raw)?;
        let inbound = match self.mode {
            DispatchMode::Structural => structural(envelope)?,
            DispatchMode::LegacyMarker => legacy(raw, envelope)?,
        };
        debug!(
            request_id = inbound.request_id(),
            mode = ?self.mode,
            "dispatched envelope"
        );
        Ok(inbound)
    }
}

fn structural(envelope: Envelope) -> Result<Inbound, DispatchError> {
    let Envelope {
        request_id,
        payload,
    } = envelope;
    let head = match payload.as_list().and_then(|items| items.first()) {
        Some(Value::Bytes(head)) => head.as_slice(),
        _ => return Err(DispatchError::HandlerNotFound),
    };
    if head == RESPONSE_TAG.as_bytes() {
        let method = response_method(&payload).map_err(|_| DispatchError::HandlerNotFound)?;
        return Ok(Inbound::Response {
            request_id,
            method,
            payload,
        });
    }
    if head == ERROR_TAG.as_bytes() {
        let error = RemoteError::from_payload(&payload)?;
        return Ok(Inbound::Error { request_id, error });
    }
    match Method::from_token(head) {
        Some(method) if method.is_inbound() => Ok(Inbound::Request {
            request_id,
            request: InboundRequest::from_value(&payload)?,
        }),
        _ => Err(DispatchError::HandlerNotFound),
    }
}

fn response_method(payload: &Value) -> Result<Method, DecodeError> {
    let mut f = Fields::new(payload, "payload")?;
    f.token("tag", RESPONSE_TAG)?;
    read_method(&mut f)
}

/// Methods in marker precedence: longest token first, ties in table order.
fn markers(inbound_only: bool) -> Vec<Method> {
    let mut methods: Vec<Method> = Method::ALL
        .into_iter()
        .filter(|m| !inbound_only || m.is_inbound())
        .collect();
    methods.sort_by_key(|m| std::cmp::Reverse(m.token().len()));
    methods
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// First marker found in `raw`, by precedence.
pub fn find_marker(raw: &[u8], inbound_only: bool) -> Option<Method> {
    markers(inbound_only)
        .into_iter()
        .find(|m| contains(raw, m.token().as_bytes()))
}

fn legacy(raw: &[u8], envelope: Envelope) -> Result<Inbound, DispatchError> {
    let request_id = envelope.request_id;
    if contains(raw, RESPONSE_TAG.as_bytes()) {
        let marker = find_marker(raw, false).ok_or(DispatchError::HandlerNotFound)?;
        if let Ok(method) = response_method(&envelope.payload) {
            if method != marker {
                warn!(%marker, %method, request_id, "marker disagrees with response method");
            }
        }
        return Ok(Inbound::Response {
            request_id,
            method: marker,
            payload: envelope.payload,
        });
    }
    if contains(raw, ERROR_TAG.as_bytes()) {
        let error = RemoteError::from_payload(&envelope.payload)?;
        return Ok(Inbound::Error { request_id, error });
    }
    let marker = find_marker(raw, true).ok_or(DispatchError::HandlerNotFound)?;
    let request = InboundRequest::from_value(&envelope.payload)?;
    if request.method() != marker {
        warn!(%marker, method = %request.method(), request_id, "marker disagrees with request method");
        return Err(DispatchError::MarkerMismatch {
            marker,
            method: request.method(),
        });
    }
    Ok(Inbound::Request {
        request_id,
        request,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("couldn't find handler for response")]
    HandlerNotFound,
    #[error("malformed envelope: {0}")]
    Malformed(#[from] DecodeError),
    #[error("marker {marker} disagrees with method {method}")]
    MarkerMismatch { marker: Method, method: Method },
}
