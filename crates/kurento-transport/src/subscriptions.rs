//! Event subscriptions keyed by `(event type, source id)`.
//!
//! Each key has at most one live [`Subscription`]. Subscribing again replaces
//! (and terminates) the previous one. Entries carry a [`CancellationToken`] so
//! termination is observed by the consumer immediately, even with notifications
//! still buffered. Dropping a [`Subscription`] removes its entry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{Notification, SubscriptionKey};
use crate::errors::{Result, TransportError};

struct Entry {
    tx: mpsc::Sender<Notification>,
    cancel: CancellationToken,
    /// Last deferred delivery for this key; the next one waits on it.
    backlog: Option<JoinHandle<()>>,
    generation: u64,
}

#[derive(Default)]
struct Table {
    entries: HashMap<SubscriptionKey, Entry>,
    closed: bool,
    next_generation: u64,
}

impl Table {
    /// Remove the entry for `key` if it still belongs to `generation`.
    fn remove_generation(&mut self, key: &SubscriptionKey, generation: u64) -> Option<Entry> {
        if self
            .entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            self.entries.remove(key)
        } else {
            None
        }
    }
}

/// Everything the reader needs to deliver to one subscriber off the lock.
pub(crate) struct DeliveryTarget {
    pub(crate) key: SubscriptionKey,
    pub(crate) generation: u64,
    pub(crate) tx: mpsc::Sender<Notification>,
    pub(crate) cancel: CancellationToken,
    pub(crate) backlog: Option<JoinHandle<()>>,
}

/// `(event type, source id)` → subscriber.
pub struct SubscriptionTable {
    table: Arc<Mutex<Table>>,
    buffer: usize,
}

impl SubscriptionTable {
    /// Create an empty table whose subscribers buffer up to `buffer` notifications.
    pub fn new(buffer: usize) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            buffer: buffer.max(1),
        }
    }

    /// Create or replace the subscription for `key`.
    pub fn subscribe(&self, key: SubscriptionKey) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let cancel = CancellationToken::new();
        let (generation, replaced) = {
            let mut table = self.table.lock();
            if table.closed {
                return Err(TransportError::ConnectionClosed);
            }
            table.next_generation += 1;
            let generation = table.next_generation;
            let replaced = table.entries.insert(
                key.clone(),
                Entry {
                    tx,
                    cancel: cancel.clone(),
                    backlog: None,
                    generation,
                },
            );
            (generation, replaced)
        };
        if let Some(old) = replaced {
            debug!(%key, "replacing existing subscription");
            old.cancel.cancel();
        }
        Ok(Subscription {
            key,
            rx,
            cancel,
            generation,
            table: Arc::downgrade(&self.table),
        })
    }

    /// Remove the subscription for `key` and terminate its sequence.
    ///
    /// Returns `false` if there was nothing to remove.
    pub fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        let removed = self.table.lock().entries.remove(key);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether `key` has a live subscriber.
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.table.lock().entries.contains_key(key)
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Whether there are no live subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse new subscriptions and terminate every existing one.
    pub fn close(&self) -> usize {
        let drained = {
            let mut table = self.table.lock();
            table.closed = true;
            std::mem::take(&mut table.entries)
        };
        for entry in drained.values() {
            entry.cancel.cancel();
        }
        drained.len()
    }

    /// Take what is needed to deliver to `key`, including its pending backlog.
    pub(crate) fn target(&self, key: &SubscriptionKey) -> Option<DeliveryTarget> {
        let mut table = self.table.lock();
        let entry = table.entries.get_mut(key)?;
        Some(DeliveryTarget {
            key: key.clone(),
            generation: entry.generation,
            tx: entry.tx.clone(),
            cancel: entry.cancel.clone(),
            backlog: entry.backlog.take(),
        })
    }

    /// Record the newest deferred delivery for `key`.
    pub(crate) fn set_backlog(&self, key: &SubscriptionKey, generation: u64, handle: JoinHandle<()>) {
        let mut table = self.table.lock();
        if let Some(entry) = table.entries.get_mut(key) {
            if entry.generation == generation {
                entry.backlog = Some(handle);
            }
        }
    }

    /// Drop an entry whose consumer went away, unless it was replaced meanwhile.
    pub(crate) fn discard(&self, key: &SubscriptionKey, generation: u64) {
        let removed = self.table.lock().remove_generation(key, generation);
        if let Some(entry) = removed {
            entry.cancel.cancel();
            debug!(%key, "subscriber dropped, entry discarded");
        }
    }
}

/// Consumer side of one subscription: a lazy, non-restartable sequence of
/// notifications.
///
/// The sequence ends on unsubscribe, replacement, or connection close. Once it
/// has ended, buffered notifications are never yielded.
pub struct Subscription {
    key: SubscriptionKey,
    rx: mpsc::Receiver<Notification>,
    cancel: CancellationToken,
    generation: u64,
    table: Weak<Mutex<Table>>,
}

impl Subscription {
    /// The key this subscription listens on.
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Whether the sequence has been terminated.
    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the next notification, or `None` once terminated.
    pub async fn next(&mut self) -> Option<Notification> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let received = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            received = self.rx.recv() => received,
        };
        if self.cancel.is_cancelled() {
            return None;
        }
        received
    }

    /// Turn the subscription into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Notification> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|n| (n, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let removed = table.lock().remove_generation(&self.key, self.generation);
        if let Some(entry) = removed {
            entry.cancel.cancel();
            debug!(key = %self.key, "subscription dropped, entry removed");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use serde_json::json;

    fn key(source: &str) -> SubscriptionKey {
        SubscriptionKey::new("EndOfStream", source)
    }

    fn event(source: &str, seq: u64) -> Notification {
        Notification {
            method: "onEvent".into(),
            params: json!({"value": {"data": {"type": "EndOfStream", "source": source, "seq": seq}}}),
            key: Some(key(source)),
        }
    }

    fn seq(n: &Notification) -> u64 {
        n.data().unwrap()["seq"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let table = SubscriptionTable::new(8);
        let mut sub = table.subscribe(key("ep-1")).unwrap();
        let target = table.target(&key("ep-1")).unwrap();
        for i in 0..3 {
            target.tx.try_send(event("ep-1", i)).unwrap();
        }
        for i in 0..3 {
            assert_eq!(seq(&sub.next().await.unwrap()), i);
        }
    }

    #[test]
    fn target_for_unknown_key_is_none() {
        let table = SubscriptionTable::new(8);
        let _sub = table.subscribe(key("ep-1")).unwrap();
        assert!(table.target(&key("ep-2")).is_none());
    }

    #[tokio::test]
    async fn unsubscribe_discards_buffered_notifications() {
        let table = SubscriptionTable::new(8);
        let mut sub = table.subscribe(key("ep-1")).unwrap();
        let target = table.target(&key("ep-1")).unwrap();
        target.tx.try_send(event("ep-1", 0)).unwrap();
        target.tx.try_send(event("ep-1", 1)).unwrap();

        assert!(table.unsubscribe(&key("ep-1")));
        assert!(sub.is_terminated());
        assert!(sub.next().await.is_none());
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn unsubscribe_unknown_key_is_noop() {
        let table = SubscriptionTable::new(8);
        assert!(!table.unsubscribe(&key("nobody")));
        assert!(!table.unsubscribe(&key("nobody")));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn resubscribe_replaces_and_terminates_previous() {
        let table = SubscriptionTable::new(8);
        let mut first = table.subscribe(key("ep-1")).unwrap();
        let mut second = table.subscribe(key("ep-1")).unwrap();
        assert_eq!(table.len(), 1);
        assert!(first.next().await.is_none());

        table
            .target(&key("ep-1"))
            .unwrap()
            .tx
            .try_send(event("ep-1", 5))
            .unwrap();
        assert_eq!(seq(&second.next().await.unwrap()), 5);
    }

    #[tokio::test]
    async fn close_terminates_all_and_refuses_new() {
        let table = SubscriptionTable::new(8);
        let mut a = table.subscribe(key("a")).unwrap();
        let mut b = table.subscribe(key("b")).unwrap();
        assert_eq!(table.close(), 2);
        assert!(a.next().await.is_none());
        assert!(b.next().await.is_none());
        assert_matches!(
            table.subscribe(key("c")),
            Err(TransportError::ConnectionClosed)
        );
    }

    #[test]
    fn discard_respects_generation() {
        let table = SubscriptionTable::new(8);
        let _old = table.subscribe(key("ep-1")).unwrap();
        let stale = table.target(&key("ep-1")).unwrap().generation;
        let _new = table.subscribe(key("ep-1")).unwrap();
        table.discard(&key("ep-1"), stale);
        assert!(table.contains(&key("ep-1")));

        let current = table.target(&key("ep-1")).unwrap().generation;
        table.discard(&key("ep-1"), current);
        assert!(!table.contains(&key("ep-1")));
    }

    #[tokio::test]
    async fn stream_ends_after_unsubscribe() {
        let table = SubscriptionTable::new(8);
        let sub = table.subscribe(key("ep-1")).unwrap();
        let target = table.target(&key("ep-1")).unwrap();
        target.tx.try_send(event("ep-1", 0)).unwrap();

        let mut stream = Box::pin(sub.into_stream());
        assert_eq!(seq(&stream.next().await.unwrap()), 0);
        assert!(table.unsubscribe(&key("ep-1")));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn dropping_subscription_removes_entry() {
        let table = SubscriptionTable::new(8);
        let sub = table.subscribe(key("ep-1")).unwrap();
        assert_eq!(table.len(), 1);
        drop(sub);
        assert!(table.is_empty());
        assert!(table.target(&key("ep-1")).is_none());
    }

    #[test]
    fn dropping_replaced_subscription_keeps_replacement() {
        let table = SubscriptionTable::new(8);
        let old = table.subscribe(key("ep-1")).unwrap();
        let new = table.subscribe(key("ep-1")).unwrap();
        drop(old);
        assert!(table.contains(&key("ep-1")));
        assert!(!new.is_terminated());
    }

    #[test]
    fn dropping_after_unsubscribe_or_close_is_harmless() {
        let table = SubscriptionTable::new(8);
        let a = table.subscribe(key("a")).unwrap();
        let b = table.subscribe(key("b")).unwrap();
        assert!(table.unsubscribe(&key("a")));
        drop(a);
        let _ = table.close();
        drop(b);
        assert!(table.is_empty());
    }

    #[test]
    fn subscription_outliving_table_drops_cleanly() {
        let table = SubscriptionTable::new(8);
        let sub = table.subscribe(key("ep-1")).unwrap();
        drop(table);
        drop(sub);
    }

    #[test]
    fn zero_buffer_is_clamped() {
        let table = SubscriptionTable::new(0);
        let _sub = table.subscribe(key("ep-1")).unwrap();
        let target = table.target(&key("ep-1")).unwrap();
        assert!(target.tx.try_send(event("ep-1", 0)).is_ok());
    }
}
