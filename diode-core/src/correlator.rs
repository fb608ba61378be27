//! Match responses to outstanding requests by request id.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::error::Error;
use crate::integrity::Verifiers;
use crate::protocol::Method;
use crate::response::{DecodeFn, Response};
use crate::rlp::Value;

/// Recently consumed ids remembered to reject duplicate replies.
const CONSUMED_HISTORY: usize = 1024;

/// Decoder bound to one outstanding request.
#[derive(Clone, Copy)]
pub struct Registration {
    pub method: Method,
    pub decoder: DecodeFn,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<u64, Registration>,
    consumed: VecDeque<u64>,
    consumed_set: HashSet<u64>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `decoder` to `request_id` when the request is sent.
    pub fn register(
        &mut self,
        request_id: u64,
        method: Method,
        decoder: DecodeFn,
    ) -> Result<(), CorrelatorError> {
        if self.pending.contains_key(&request_id) {
            return Err(CorrelatorError::DuplicateId(request_id));
        }
        self.pending
            .insert(request_id, Registration { method, decoder });
        Ok(())
    }

    /// Remove and return the registration for `request_id`. Each id can be taken once.
    pub fn take(&mut self, request_id: u64) -> Result<Registration, CorrelatorError> {
        match self.pending.remove(&request_id) {
            Some(registration) => {
                self.mark_consumed(request_id);
                Ok(registration)
            }
            None if self.consumed_set.contains(&request_id) => {
                Err(CorrelatorError::AlreadyResolved(request_id))
            }
            None => Err(CorrelatorError::HandlerNotFound(request_id)),
        }
    }

    /// Decode `payload` with the decoder registered for `request_id`.
    pub fn resolve(
        &mut self,
        request_id: u64,
        payload: &Value,
        verifiers: &Verifiers,
    ) -> Result<Response, Error> {
        let registration = self.take(request_id)?;
        debug!(request_id, method = %registration.method, "resolving response");
        (registration.decoder)(payload, verifiers)
    }

    /// Drop every outstanding request, returning them in id order.
    pub fn fail_all(&mut self) -> Vec<(u64, Method)> {
        let mut failed: Vec<(u64, Method)> = self
            .pending
            .drain()
            .map(|(id, registration)| (id, registration.method))
            .collect();
        failed.sort_by_key(|(id, _)| *id);
        for (id, _) in &failed {
            self.mark_consumed(*id);
        }
        failed
    }

    pub fn is_pending(&self, request_id: u64) -> bool {
        self.pending.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn mark_consumed(&mut self, request_id: u64) {
        if !self.consumed_set.insert(request_id) {
            return;
        }
        self.consumed.push_back(request_id);
        if self.consumed.len() > CONSUMED_HISTORY {
            if let Some(oldest) = self.consumed.pop_front() {
                self.consumed_set.remove(&oldest);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelatorError {
    #[error("couldn't find handler for response {0}")]
    HandlerNotFound(u64),
    #[error("request {0} already resolved")]
    AlreadyResolved(u64),
    #[error("request id {0} already registered")]
    DuplicateId(u64),
}
