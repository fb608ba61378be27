//! Crate-level error aggregating every module's failure type.

use crate::correlator::CorrelatorError;
use crate::dispatch::DispatchError;
use crate::header::ProtocolMismatch;
use crate::identity::SignError;
use crate::merkle::ProofError;
use crate::rlp::DecodeError;
use crate::session::SessionError;
use crate::ticket::TicketError;
use crate::wire::FrameEncodeError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Frame(#[from] FrameEncodeError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Proof(#[from] ProofError),
    #[error(transparent)]
    Ticket(#[from] TicketError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Correlation(#[from] CorrelatorError),
    #[error(transparent)]
    ProtocolMismatch(#[from] ProtocolMismatch),
    #[error(transparent)]
    Sign(#[from] SignError),
    /// The server answered with an error envelope.
    #[error("{method}: {message}")]
    Remote { method: String, message: String },
    #[error("connection closed")]
    ConnectionClosed,
    /// The caller gave up waiting and cancelled the request.
    #[error("request cancelled")]
    Cancelled,
    #[error("ticket manager not configured")]
    NoTicketManager,
}

pub type Result<T> = std::result::Result<T, Error>;
