//! # kurento-transport
//!
//! JSON-RPC 2.0 over WebSocket client transport for Kurento-style media servers.
//!
//! One [`Connection`] multiplexes many in-flight requests and many event
//! subscriptions over a single socket:
//!
//! - **Codec**: [`codec::encode`] / [`codec::decode`] map envelopes to text frames
//!   and classify inbound frames as correlated replies or notifications
//! - **Pending calls**: [`PendingCalls`] correlates replies to callers by id;
//!   [`ReplyHandle`] is the caller's side
//! - **Subscriptions**: [`SubscriptionTable`] routes `onEvent` notifications by
//!   `(event type, source id)` to [`Subscription`] sequences
//! - **Session**: [`SessionState`] tracks the server-assigned session token and
//!   stamps it onto outgoing requests
//! - **Config**: [`ConnectionConfig`] layered from defaults, a JSON file and
//!   `KURENTO_*` environment variables via `figment`
//! - **Errors**: [`TransportError`] / [`RemoteError`] via `thiserror`

#![deny(unsafe_code)]

pub mod codec;
pub mod config;
pub mod connection;
mod delivery;
pub mod errors;
pub mod logging;
pub mod pending;
mod reader;
pub mod session;
pub mod subscriptions;

pub use codec::{CallResult, Envelope, Notification, Reply, Response, SubscriptionKey, Unroutable};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionState};
pub use errors::{ConfigError, RemoteError, Result, TransportError};
pub use pending::{PendingCalls, ReplyHandle};
pub use session::SessionState;
pub use subscriptions::{Subscription, SubscriptionTable};
