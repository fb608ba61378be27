//! Usage tickets: signed accounting records that keep an edge server relaying.
//!
//! The device submits cumulative connection and byte counters signed over a
//! fixed pre-image. The server answers `thanks!` (accepted), `too_old` (the
//! referenced block is stale) or `too_low` (it has seen more usage than the
//! ticket claims). Retrying is the caller's decision; the manager only keeps
//! the counters and the ticket it last submitted.

use tracing::{info, warn};

use crate::identity::{Address, SignError, Signer};
use crate::protocol::{Request, TICKET_THANKS, TICKET_TOO_LOW, TICKET_TOO_OLD};
use crate::response::response_body;
use crate::rlp::{DecodeError, Fields, Value};

/// Tag of the object returned by `getobject`.
const TICKET_OBJECT_TAG: &str = "ticket";
const WORD: usize = 32;

/// Why the server refused a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketRejection {
    TooOld,
    TooLow,
}

/// Proof of usage entitlement. Replaced wholesale, never patched in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTicket {
    pub server_id: Address,
    pub fleet_addr: Address,
    pub total_connections: u64,
    pub total_bytes: u64,
    pub local_addr: Vec<u8>,
    pub device_sig: Vec<u8>,
    pub server_sig: Vec<u8>,
    pub block_hash: Vec<u8>,
    pub block_number: i64,
    pub error: Option<TicketRejection>,
}

fn word(bytes: &[u8]) -> [u8; WORD] {
    let mut out = [0u8; WORD];
    let n = bytes.len().min(WORD);
    out[WORD - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    out
}

impl DeviceTicket {
    /// All fields zero: the state after the server acknowledged usage.
    pub fn is_void(&self) -> bool {
        *self == DeviceTicket::default()
    }

    /// Bytes the device signs: 32-byte words of block hash, fleet address,
    /// total connections and total bytes, then the raw local address.
    pub fn preimage(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 * WORD + self.local_addr.len());
        out.extend_from_slice(&word(&self.block_hash));
        out.extend_from_slice(&word(self.fleet_addr.as_bytes()));
        out.extend_from_slice(&word(&self.total_connections.to_be_bytes()));
        out.extend_from_slice(&word(&self.total_bytes.to_be_bytes()));
        out.extend_from_slice(&self.local_addr);
        out
    }

    /// The `ticket` request submitting this ticket.
    pub fn to_request(&self) -> Request {
        Request::Ticket {
            block_number: u64::try_from(self.block_number).unwrap_or_default(),
            fleet_addr: self.fleet_addr.as_bytes().to_vec(),
            total_connections: self.total_connections,
            total_bytes: self.total_bytes,
            local_addr: self.local_addr.clone(),
            device_sig: self.device_sig.clone(),
        }
    }

    /// Encode as the server-side ticket object served by `getobject`.
    pub fn to_object(&self) -> Value {
        Value::List(vec![
            Value::string(TICKET_OBJECT_TAG),
            Value::Bytes(self.server_id.as_bytes().to_vec()),
            Value::uint(u64::try_from(self.block_number).unwrap_or_default()),
            Value::Bytes(self.fleet_addr.as_bytes().to_vec()),
            Value::uint(self.total_connections),
            Value::uint(self.total_bytes),
            Value::Bytes(self.local_addr.clone()),
            Value::Bytes(self.device_sig.clone()),
            Value::Bytes(self.server_sig.clone()),
        ])
    }

    /// Decode the ticket object returned by `getobject`.
    pub fn from_object(mut f: Fields<'_>) -> Result<Self, DecodeError> {
        f.token("tag", TICKET_OBJECT_TAG)?;
        let ticket = DeviceTicket {
            server_id: address(&mut f, "server_id")?,
            block_number: f.int("peak_block")?,
            fleet_addr: address(&mut f, "fleet_addr")?,
            total_connections: f.uint("total_connections")?,
            total_bytes: f.uint("total_bytes")?,
            local_addr: f.bytes("local_addr")?.to_vec(),
            device_sig: f.bytes("device_sig")?.to_vec(),
            server_sig: f.bytes("server_sig")?.to_vec(),
            block_hash: Vec::new(),
            error: None,
        };
        f.finish()?;
        Ok(ticket)
    }
}

fn address(f: &mut Fields<'_>, name: &str) -> Result<Address, DecodeError> {
    let raw = f.bytes(name)?;
    Address::from_slice(raw).ok_or_else(|| DecodeError::Kind {
        path: f.child_path(name),
        expected: "20-byte address",
    })
}

/// Server verdict on a submitted ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketOutcome {
    /// `thanks!`: usage acknowledged.
    Accepted { paid_bytes: Option<u64> },
    /// `too_old`: resubmit against a more recent block, counters unchanged.
    TooOld { min_block: Option<u64> },
    /// `too_low`: the server has recorded at least these totals.
    TooLow {
        block_hash: Vec<u8>,
        total_connections: u64,
        total_bytes: u64,
        local_addr: Vec<u8>,
        device_sig: Vec<u8>,
    },
}

impl TicketOutcome {
    /// Parse the body of a `ticket` response (after tag and method).
    pub fn from_body(mut f: Fields<'_>) -> Result<Self, TicketError> {
        let verdict = f.bytes("verdict")?;
        let outcome = if verdict == TICKET_THANKS.as_bytes() {
            let paid_bytes = optional_uint(&mut f, "paid_bytes")?;
            TicketOutcome::Accepted { paid_bytes }
        } else if verdict == TICKET_TOO_OLD.as_bytes() {
            let min_block = optional_uint(&mut f, "min_block")?;
            TicketOutcome::TooOld { min_block }
        } else if verdict == TICKET_TOO_LOW.as_bytes() {
            TicketOutcome::TooLow {
                block_hash: f.bytes("block_hash")?.to_vec(),
                total_connections: f.uint("total_connections")?,
                total_bytes: f.uint("total_bytes")?,
                local_addr: f.bytes("local_addr")?.to_vec(),
                device_sig: f.bytes("device_sig")?.to_vec(),
            }
        } else {
            return Err(TicketError::Unrecognized(
                String::from_utf8_lossy(verdict).into_owned(),
            ));
        };
        f.finish()?;
        Ok(outcome)
    }

    /// Body values after tag and method, inverse of `from_body`.
    pub fn to_body(&self) -> Vec<Value> {
        match self {
            TicketOutcome::Accepted { paid_bytes } => {
                let mut items = vec![Value::string(TICKET_THANKS)];
                items.extend(paid_bytes.map(Value::uint));
                items
            }
            TicketOutcome::TooOld { min_block } => {
                let mut items = vec![Value::string(TICKET_TOO_OLD)];
                items.extend(min_block.map(Value::uint));
                items
            }
            TicketOutcome::TooLow {
                block_hash,
                total_connections,
                total_bytes,
                local_addr,
                device_sig,
            } => vec![
                Value::string(TICKET_TOO_LOW),
                Value::Bytes(block_hash.clone()),
                Value::uint(*total_connections),
                Value::uint(*total_bytes),
                Value::Bytes(local_addr.clone()),
                Value::Bytes(device_sig.clone()),
            ],
        }
    }

    /// Ticket view of the reply: void when accepted, otherwise carrying the
    /// server's claim and the rejection reason.
    pub fn ticket(&self) -> DeviceTicket {
        match self {
            TicketOutcome::Accepted { .. } => DeviceTicket::default(),
            TicketOutcome::TooOld { min_block } => DeviceTicket {
                block_number: min_block
                    .and_then(|b| i64::try_from(b).ok())
                    .unwrap_or_default(),
                error: Some(TicketRejection::TooOld),
                ..DeviceTicket::default()
            },
            TicketOutcome::TooLow {
                block_hash,
                total_connections,
                total_bytes,
                local_addr,
                device_sig,
            } => DeviceTicket {
                block_hash: block_hash.clone(),
                total_connections: *total_connections,
                total_bytes: *total_bytes,
                local_addr: local_addr.clone(),
                device_sig: device_sig.clone(),
                error: Some(TicketRejection::TooLow),
                ..DeviceTicket::default()
            },
        }
    }
}

fn optional_uint(f: &mut Fields<'_>, name: &str) -> Result<Option<u64>, DecodeError> {
    if f.remaining() == 0 {
        return Ok(None);
    }
    f.uint(name).map(Some)
}

/// What a new ticket is issued against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketParams {
    pub server_id: Address,
    pub block_number: u64,
    pub block_hash: Vec<u8>,
    pub local_addr: Vec<u8>,
}

/// Keeps usage counters and the last submitted ticket for one edge server.
pub struct TicketManager {
    signer: Box<dyn Signer>,
    fleet_addr: Address,
    total_connections: u64,
    total_bytes: u64,
    held: Option<DeviceTicket>,
}

impl TicketManager {
    pub fn new(signer: Box<dyn Signer>, fleet_addr: Address) -> Self {
        Self {
            signer,
            fleet_addr,
            total_connections: 0,
            total_bytes: 0,
            held: None,
        }
    }

    pub fn fleet_addr(&self) -> Address {
        self.fleet_addr
    }

    pub fn record_connection(&mut self) {
        self.total_connections = self.total_connections.saturating_add(1);
    }

    pub fn record_bytes(&mut self, n: u64) {
        self.total_bytes = self.total_bytes.saturating_add(n);
    }

    /// (total_connections, total_bytes)
    pub fn counters(&self) -> (u64, u64) {
        (self.total_connections, self.total_bytes)
    }

    /// Ticket submitted and not yet acknowledged.
    pub fn held(&self) -> Option<&DeviceTicket> {
        self.held.as_ref()
    }

    /// Sign a ticket for the current counters. Supersedes any held ticket.
    pub fn build_ticket(&mut self, params: &TicketParams) -> Result<DeviceTicket, TicketError> {
        if params.block_hash.len() != WORD {
            return Err(TicketError::InvalidParams("block hash must be 32 bytes"));
        }
        let block_number = i64::try_from(params.block_number)
            .map_err(|_| TicketError::InvalidParams("block number out of range"))?;
        let mut ticket = DeviceTicket {
            server_id: params.server_id,
            fleet_addr: self.fleet_addr,
            total_connections: self.total_connections,
            total_bytes: self.total_bytes,
            local_addr: params.local_addr.clone(),
            block_hash: params.block_hash.clone(),
            block_number,
            ..DeviceTicket::default()
        };
        ticket.device_sig = self.signer.sign(&ticket.preimage())?;
        self.held = Some(ticket.clone());
        Ok(ticket)
    }

    /// Interpret a full `["response", "ticket", ...]` payload.
    pub fn interpret_reply(payload: &Value) -> Result<TicketOutcome, TicketError> {
        let (_, body) = response_body(payload)?;
        TicketOutcome::from_body(body)
    }

    /// Fold a verdict into the counters.
    pub fn apply(&mut self, outcome: &TicketOutcome) {
        match outcome {
            TicketOutcome::Accepted { paid_bytes } => {
                info!(?paid_bytes, "ticket accepted");
                self.total_connections = 0;
                self.total_bytes = 0;
                self.held = None;
            }
            TicketOutcome::TooOld { min_block } => {
                warn!(?min_block, "ticket block too old");
            }
            TicketOutcome::TooLow {
                total_connections,
                total_bytes,
                ..
            } => {
                warn!(
                    server_connections = total_connections,
                    server_bytes = total_bytes,
                    local_connections = self.total_connections,
                    local_bytes = self.total_bytes,
                    "ticket counters too low"
                );
                self.total_connections = self.total_connections.max(*total_connections);
                self.total_bytes = self.total_bytes.max(*total_bytes);
            }
        }
    }
}

impl std::fmt::Debug for TicketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketManager")
            .field("fleet_addr", &self.fleet_addr)
            .field("total_connections", &self.total_connections)
            .field("total_bytes", &self.total_bytes)
            .field("held", &self.held)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TicketError {
    #[error("failed to parse ticket: unrecognized reply {0:?}")]
    Unrecognized(String),
    #[error("failed to parse ticket: {0}")]
    Malformed(#[from] DecodeError),
    #[error("invalid ticket parameters: {0}")]
    InvalidParams(&'static str),
    #[error(transparent)]
    Sign(#[from] SignError),
}
