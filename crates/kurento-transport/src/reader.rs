//! The reader loop: one task per connection that decodes inbound frames and
//! routes them to waiting callers or subscribers.

use std::sync::Arc;

use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, instrument, trace, warn};

use crate::codec::{self, Notification, Reply};
use crate::connection::{Shared, WsSource};
use crate::delivery::Outcome;

/// Read until shutdown or a fatal read/decode error, then finalize the connection.
#[instrument(skip_all, fields(endpoint = %shared.endpoint))]
pub(crate) async fn run(shared: Arc<Shared>, mut source: WsSource) {
    loop {
        let next = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            next = source.next() => next,
        };

        let outcome = match next {
            None => Err("socket closed by peer".to_owned()),
            Some(Err(e)) => Err(format!("read failed: {e}")),
            Some(Ok(Message::Text(text))) => dispatch(&shared, text.as_bytes()).await,
            Some(Ok(Message::Binary(bytes))) => dispatch(&shared, bytes.as_ref()).await,
            Some(Ok(Message::Close(frame))) => Err(match frame {
                Some(frame) => format!(
                    "peer sent close ({}): {}",
                    u16::from(frame.code),
                    frame.reason.as_str()
                ),
                None => "peer sent close".to_owned(),
            }),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => Ok(()),
        };

        if let Err(cause) = outcome {
            shared.begin_close(Some(cause));
            break;
        }
    }

    drop(source);
    shared.finish().await;
}

/// Decode one frame, track the session token, and route it.
///
/// A decode failure is returned as the close cause: once one frame is unreadable
/// the stream cannot be trusted. Well-formed frames that match nothing are dropped.
async fn dispatch(shared: &Shared, bytes: &[u8]) -> Result<(), String> {
    trace!(frame = %String::from_utf8_lossy(bytes), "<- frame");
    let reply = codec::decode(bytes).map_err(|e| e.to_string())?;

    if let Some(token) = reply.session_id() {
        let _ = shared.session.observe(token);
    }

    match reply {
        Reply::Correlated(response) => {
            let id = response.id;
            if shared.pending.complete(response) {
                debug!(id, "reply delivered");
            } else {
                shared.record_drop();
                debug!(id, "dropped reply: no caller waiting for this id");
            }
        }
        Reply::Notification(notification) => route_notification(shared, notification).await,
        Reply::Unroutable(frame) => {
            shared.record_drop();
            match frame.error {
                Some(error) => warn!(%error, "dropped error reply without a usable id"),
                None => debug!("dropped frame with neither id nor method"),
            }
        }
    }
    Ok(())
}

async fn route_notification(shared: &Shared, notification: Notification) {
    let target = if notification.is_event() {
        notification
            .key
            .as_ref()
            .and_then(|key| shared.subscriptions.target(key))
    } else {
        None
    };

    let Some(target) = target else {
        shared.record_drop();
        debug!(
            method = %notification.method,
            key = ?notification.key,
            "dropped notification: no subscriber"
        );
        return;
    };

    let key = target.key.clone();
    match shared
        .deliveries
        .deliver(&shared.subscriptions, target, notification)
        .await
    {
        Outcome::Buffered | Outcome::Deferred => trace!(%key, "notification routed"),
        Outcome::Dropped => {
            shared.record_drop();
            debug!(%key, "dropped notification: subscriber gone or shutting down");
        }
    }
}
