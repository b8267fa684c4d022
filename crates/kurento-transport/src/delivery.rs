//! Bounded, ordered handoff of notifications to slow subscribers.
//!
//! The reader first tries a non-blocking send into the subscriber's buffer. When
//! the buffer is full the notification is parked in a tracked task that waits
//! for the previous parked delivery of the same subscription (so order holds),
//! then for buffer space, unsubscribe, or connection shutdown.
//!
//! At most `limit` notifications are parked at once. When the limit is reached
//! [`DeliveryPool::deliver`] waits for a slot, which pauses the reader loop until
//! a consumer drains or shutdown begins.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::codec::Notification;
use crate::subscriptions::{DeliveryTarget, SubscriptionTable};

/// What happened to a notification handed to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Placed directly in the subscriber's buffer.
    Buffered,
    /// Parked in a delivery task.
    Deferred,
    /// Not delivered: the subscriber is gone or the connection is shutting down.
    Dropped,
}

pub(crate) struct DeliveryPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl DeliveryPool {
    pub(crate) fn new(limit: usize, shutdown: CancellationToken) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit.max(1))),
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// Hand `notification` to the subscriber described by `target`.
    pub(crate) async fn deliver(
        &self,
        table: &SubscriptionTable,
        target: DeliveryTarget,
        notification: Notification,
    ) -> Outcome {
        let DeliveryTarget {
            key,
            generation,
            tx,
            cancel,
            backlog,
        } = target;
        let backlog = backlog.filter(|handle| !handle.is_finished());

        let notification = if backlog.is_none() {
            match tx.try_send(notification) {
                Ok(()) => return Outcome::Buffered,
                Err(TrySendError::Closed(_)) => {
                    table.discard(&key, generation);
                    return Outcome::Dropped;
                }
                Err(TrySendError::Full(notification)) => notification,
            }
        } else {
            notification
        };

        let permit = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Outcome::Dropped,
            () = cancel.cancelled() => return Outcome::Dropped,
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Outcome::Dropped,
            },
        };

        debug!(%key, parked = self.in_flight() + 1, "subscriber buffer full, parking notification");
        let shutdown = self.shutdown.clone();
        let task_key = key.clone();
        let handle = self.tracker.spawn(async move {
            let _permit = permit;
            if let Some(previous) = backlog {
                let _ = previous.await;
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {}
                () = cancel.cancelled() => {}
                sent = tx.send(notification) => {
                    if sent.is_err() {
                        debug!(key = %task_key, "subscriber dropped before parked delivery");
                    }
                }
            }
        });
        table.set_backlog(&key, generation, handle);
        Outcome::Deferred
    }

    /// Parked deliveries still running.
    pub(crate) fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work and wait for every parked delivery to finish.
    pub(crate) async fn drain(&self) {
        let _ = self.tracker.close();
        self.tracker.wait().await;
    }
}
