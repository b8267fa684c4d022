//! The connection façade: dial, send, subscribe, close.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{self, CallResult, Envelope, SubscriptionKey};
use crate::config::ConnectionConfig;
use crate::delivery::DeliveryPool;
use crate::errors::{Result, TransportError};
use crate::pending::{PendingCalls, ReplyHandle};
use crate::reader;
use crate::session::SessionState;
use crate::subscriptions::{Subscription, SubscriptionTable};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSource = SplitStream<WsStream>;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting requests and subscriptions.
    Open,
    /// Shutdown has begun; nothing new is accepted.
    Closing,
    /// Reader stopped, waiters released, socket closed.
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

struct Writer {
    sink: SplitSink<WsStream, Message>,
    next_id: u64,
}

/// State shared between the façade and the reader loop.
pub(crate) struct Shared {
    pub(crate) config: ConnectionConfig,
    pub(crate) endpoint: String,
    writer: tokio::sync::Mutex<Writer>,
    pub(crate) session: SessionState,
    pub(crate) pending: Arc<PendingCalls>,
    pub(crate) subscriptions: SubscriptionTable,
    pub(crate) deliveries: DeliveryPool,
    state: AtomicU8,
    pub(crate) shutdown: CancellationToken,
    closed: CancellationToken,
    close_cause: parking_lot::Mutex<Option<String>>,
    dropped_frames: AtomicU64,
}

impl Shared {
    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `Open → Closing` and signal every task. Later calls are no-ops.
    pub(crate) fn begin_close(&self, cause: Option<String>) {
        if self
            .state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        match &cause {
            Some(cause) => warn!(endpoint = %self.endpoint, cause = %cause, "connection closing"),
            None => info!(endpoint = %self.endpoint, "connection closing"),
        }
        *self.close_cause.lock() = cause;
        self.shutdown.cancel();
    }

    /// Release every waiter, wait out parked deliveries, close the socket and
    /// mark the connection closed. Run once, by the reader loop as it exits.
    pub(crate) async fn finish(&self) {
        self.begin_close(None);

        let released = self.pending.close();
        let terminated = self.subscriptions.close();
        self.deliveries.drain().await;

        let close_timeout = self.config.close_timeout();
        let flushed = tokio::time::timeout(close_timeout, async {
            let mut writer = self.writer.lock().await;
            writer.sink.close().await
        })
        .await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "close frame not delivered"),
            Err(_) => debug!(?close_timeout, "timed out flushing close frame"),
        }

        self.state.store(2, Ordering::Release);
        self.closed.cancel();
        info!(
            endpoint = %self.endpoint,
            released,
            terminated,
            "connection closed"
        );
    }

    pub(crate) fn record_drop(&self) {
        let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }
}

/// Initiates close when the last [`Connection`] clone goes away.
struct CloseOnDrop(Arc<Shared>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.begin_close(None);
    }
}

/// A live JSON-RPC connection to a media server.
///
/// Cheap to clone; every clone drives the same socket. The connection closes when
/// [`close`](Self::close) is called, when the reader hits an error, or when the
/// last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    _guard: Arc<CloseOnDrop>,
}

impl Connection {
    /// Dial `address` (e.g. `ws://127.0.0.1:8888`) with default settings.
    pub async fn open(address: &str) -> Result<Self> {
        Self::open_with(ConnectionConfig::with_url(address)).await
    }

    /// Dial using an explicit configuration.
    pub async fn open_with(config: ConnectionConfig) -> Result<Self> {
        let endpoint = config.endpoint();
        let connect_err = |reason: String| TransportError::Connect {
            url: endpoint.clone(),
            reason,
        };

        config.validate().map_err(|e| connect_err(e.to_string()))?;

        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| connect_err(e.to_string()))?;
        let origin = HeaderValue::from_str(&config.origin)
            .map_err(|e| connect_err(format!("invalid origin: {e}")))?;
        let _ = request.headers_mut().insert(ORIGIN, origin);

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_message_size);

        let connect_timeout = config.connect_timeout();
        let (ws, _) = tokio::time::timeout(
            connect_timeout,
            connect_async_with_config(request, Some(ws_config), false),
        )
        .await
        .map_err(|_| connect_err(format!("timed out after {}ms", config.connect_timeout_ms)))?
        .map_err(|e| connect_err(e.to_string()))?;

        let (sink, source) = ws.split();
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared {
            endpoint: endpoint.clone(),
            writer: tokio::sync::Mutex::new(Writer { sink, next_id: 0 }),
            session: SessionState::new(),
            pending: Arc::new(PendingCalls::new()),
            subscriptions: SubscriptionTable::new(config.subscription_buffer),
            deliveries: DeliveryPool::new(config.max_inflight_deliveries, shutdown.clone()),
            state: AtomicU8::new(0),
            shutdown,
            closed: CancellationToken::new(),
            close_cause: parking_lot::Mutex::new(None),
            dropped_frames: AtomicU64::new(0),
            config,
        });

        let _reader = tokio::spawn(reader::run(Arc::clone(&shared), source));
        info!(endpoint = %endpoint, "connected");

        Ok(Self {
            _guard: Arc::new(CloseOnDrop(Arc::clone(&shared))),
            shared,
        })
    }

    /// Send a request and return a handle to its future reply.
    ///
    /// The id and session token are stamped under the writer lock, so requests
    /// hit the wire in call order with the token current at write time.
    pub async fn send(&self, method: impl Into<String>, params: Value) -> Result<ReplyHandle> {
        let method = method.into();
        let shared = &self.shared;
        if shared.state() != ConnectionState::Open {
            return Err(TransportError::ConnectionClosed);
        }

        let mut writer = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => return Err(TransportError::ConnectionClosed),
            writer = shared.writer.lock() => writer,
        };

        writer.next_id += 1;
        let id = writer.next_id;
        let envelope = Envelope::new(id, method.clone(), params).with_session(shared.session.current());

        let rx = shared.pending.register(id)?;
        // Dropping the handle on any early return below removes the pending entry.
        let handle = ReplyHandle::new(id, method, rx, Arc::clone(&shared.pending));

        let text = codec::encode(&envelope)?;
        trace!(id, frame = %text, "-> frame");

        let written = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => Err(TransportError::ConnectionClosed),
            sent = writer.sink.send(Message::Text(text.into())) => sent.map_err(|e| TransportError::Send {
                method: envelope.method.clone(),
                reason: e.to_string(),
            }),
        };
        drop(writer);
        written?;

        debug!(id, method = handle.method(), "request sent");
        Ok(handle)
    }

    /// Send a request, wait for the reply using the configured reply timeout,
    /// and turn a server error into [`TransportError::Remote`].
    pub async fn call(&self, method: impl Into<String>, params: Value) -> Result<CallResult> {
        let handle = self.send(method, params).await?;
        let response = handle
            .await_reply(self.shared.config.reply_timeout())
            .await?;
        Ok(response.into_result()?)
    }

    /// Subscribe to `event_type` notifications from `source_id`.
    ///
    /// Replaces (and terminates) any existing subscription for the same pair.
    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Result<Subscription> {
        if self.shared.state() != ConnectionState::Open {
            return Err(TransportError::ConnectionClosed);
        }
        let key = SubscriptionKey::new(event_type, source_id);
        debug!(%key, "subscribing");
        self.shared.subscriptions.subscribe(key)
    }

    /// Remove the subscription for the pair and terminate its sequence.
    /// Unknown pairs are ignored.
    pub fn unsubscribe(&self, event_type: &str, source_id: &str) {
        let key = SubscriptionKey::new(event_type, source_id);
        if self.shared.subscriptions.unsubscribe(&key) {
            debug!(%key, "unsubscribed");
        }
    }

    /// Shut the connection down and wait until it is fully closed.
    ///
    /// Idempotent, and safe to call from any task.
    pub async fn close(&self) {
        self.shared.begin_close(None);
        self.shared.closed.cancelled().await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// The session token the server assigned, if any.
    pub fn session_id(&self) -> Option<String> {
        self.shared.session.current()
    }

    /// Why the connection closed, when it closed because of an error.
    pub fn close_cause(&self) -> Option<String> {
        self.shared.close_cause.lock().clone()
    }

    /// The dialed endpoint.
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// The configuration this connection was opened with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Requests still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.len()
    }

    /// Notifications parked for slow subscribers.
    pub fn inflight_deliveries(&self) -> usize {
        self.shared.deliveries.in_flight()
    }

    /// Inbound frames that matched no caller or subscriber.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}
