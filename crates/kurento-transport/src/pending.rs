//! Tracking of in-flight requests awaiting their reply.
//!
//! Each request id maps to a single-use [`oneshot`] sender. The reader loop
//! removes the entry and delivers outside the lock; a second reply for the same id
//! finds nothing and is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::codec::Response;
use crate::errors::{Result, TransportError};

#[derive(Debug, Default)]
struct Table {
    calls: HashMap<u64, oneshot::Sender<Response>>,
    closed: bool,
}

/// Correlation id → delivery point for each outstanding request.
#[derive(Debug, Default)]
pub struct PendingCalls {
    table: Mutex<Table>,
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delivery point for `id`.
    ///
    /// Fails with [`TransportError::ConnectionClosed`] once [`close`](Self::close)
    /// has run.
    pub fn register(&self, id: u64) -> Result<oneshot::Receiver<Response>> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock();
        if table.closed {
            return Err(TransportError::ConnectionClosed);
        }
        if table.calls.insert(id, tx).is_some() {
            warn!(id, "replaced an outstanding call with the same id");
        }
        Ok(rx)
    }

    /// Deliver a reply to its caller, removing the entry.
    ///
    /// Returns `false` if no caller was waiting for this id (already answered,
    /// abandoned, or never sent).
    pub fn complete(&self, response: Response) -> bool {
        let id = response.id;
        let Some(tx) = self.table.lock().calls.remove(&id) else {
            return false;
        };
        if tx.send(response).is_err() {
            debug!(id, "caller stopped waiting before the reply arrived");
        }
        true
    }

    /// Forget a call without delivering anything.
    pub fn remove(&self, id: u64) -> bool {
        self.table.lock().calls.remove(&id).is_some()
    }

    /// Whether `id` is still outstanding.
    pub fn contains(&self, id: u64) -> bool {
        self.table.lock().calls.contains_key(&id)
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.table.lock().calls.len()
    }

    /// Whether no calls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse new registrations and release every waiter.
    ///
    /// Dropping the senders makes each pending [`ReplyHandle`] resolve to
    /// [`TransportError::ConnectionClosed`]. Returns how many were released.
    pub fn close(&self) -> usize {
        let drained = {
            let mut table = self.table.lock();
            table.closed = true;
            std::mem::take(&mut table.calls)
        };
        drained.len()
    }
}

/// Read-only handle to the future reply of one request.
///
/// Dropping the handle abandons the call; a reply arriving later is dropped.
#[derive(Debug)]
pub struct ReplyHandle {
    id: u64,
    method: String,
    rx: oneshot::Receiver<Response>,
    table: Arc<PendingCalls>,
}

impl ReplyHandle {
    pub(crate) fn new(
        id: u64,
        method: String,
        rx: oneshot::Receiver<Response>,
        table: Arc<PendingCalls>,
    ) -> Self {
        Self {
            id,
            method,
            rx,
            table,
        }
    }

    /// Correlation id of the request.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Method of the request.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the reply.
    ///
    /// Resolves to the [`Response`] (which may carry a
    /// [`RemoteError`](crate::RemoteError)), to
    /// [`TransportError::ConnectionClosed`] if the connection closes first, or to
    /// [`TransportError::Timeout`] once `timeout` elapses.
    pub async fn await_reply(mut self, timeout: Option<Duration>) -> Result<Response> {
        let outcome = match timeout {
            None => (&mut self.rx).await,
            Some(limit) => match tokio::time::timeout(limit, &mut self.rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let _ = self.table.remove(self.id);
                    // The reply may have landed between the deadline and the removal.
                    if let Ok(response) = self.rx.try_recv() {
                        return Ok(response);
                    }
                    debug!(id = self.id, method = %self.method, "reply deadline passed");
                    return Err(TransportError::Timeout {
                        id: self.id,
                        method: self.method.clone(),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            },
        };
        outcome.map_err(|_| TransportError::ConnectionClosed)
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        let _ = self.table.remove(self.id);
    }
}
