//! Diode edge protocol engine.
//! Host-driven: no I/O; host passes received envelopes and writes the frames it gets back.

pub mod rlp;
pub mod wire;
pub mod protocol;
pub mod response;
pub mod dispatch;

pub use dispatch::{DispatchError, DispatchMode, Dispatcher, Inbound};
pub use protocol::{InboundRequest, Method, Request};
pub use response::{DecodeFn, RemoteError, Response};
pub use rlp::{DecodeError, Value};
pub use wire::{decode_frame, encode_frame, Envelope, FrameDecodeError, FrameEncodeError};
pub use crate::core::{CoreConfig, EdgeCore, Event};
pub use error::Error;
pub use identity::{Address, SignError, Signer};
pub use session::{SessionEvent, TunnelEngine};
pub use ticket::{DeviceTicket, TicketManager, TicketOutcome, TicketParams};

// Verification and state: proofs, headers, tickets, tunnels, correlation.
pub mod integrity;
pub mod identity;
pub mod header;
pub mod merkle;
pub mod ticket;
pub mod session;
pub mod correlator;
pub mod error;
pub mod core;
