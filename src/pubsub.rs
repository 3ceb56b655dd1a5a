//! Key subscriptions and change notifications.
//!
//! The [`SubscriptionTable`] maps every subscribed key to the notification channels of the
//! sessions that subscribed to it. The store calls [`Notify::notify`] after each mutation,
//! once its own lock is released, and the table writes a notification frame to every
//! channel registered under the key.
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::protocol::{notification_frame, Limits};

// number of buckets of the subscription table
const SUBSCRIPTION_TABLE_SIZE: usize = 3517;

/// Receiver of key change events
pub trait Notify: Send + Sync {
    /// publishes the new `value` of `key`. Returns `true` if at least one subscriber received
    /// it.
    fn notify(&self, key: &str, value: &str) -> bool;
}

/// identifies a client session
pub type SessionId = u64;

/// The notification endpoint of one session.
///
/// Clones share the same underlying pipe. Closing the channel drops the pipe once; sends on
/// a closed channel are silently discarded.
#[derive(Clone)]
pub struct NotificationChannel {
    session: SessionId,
    sink: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
}

impl NotificationChannel {
    /// wraps the writing end of a session's notification pipe
    pub fn new(session: SessionId, sink: Box<dyn Write + Send>) -> Self {
        NotificationChannel {
            session,
            sink: Arc::new(Mutex::new(Some(sink))),
        }
    }

    /// the session this channel belongs to
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// writes one frame. Returns `Ok(false)` if the channel was already closed.
    pub fn send(&self, frame: &[u8]) -> io::Result<bool> {
        let mut sink = self.sink.lock();
        match sink.as_mut() {
            Some(sink) => {
                sink.write_all(frame)?;
                sink.flush()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// closes the channel; later calls do nothing
    pub fn close(&self) {
        self.sink.lock().take();
    }

    /// whether [`NotificationChannel::close`] was called
    pub fn is_closed(&self) -> bool {
        self.sink.lock().is_none()
    }
}

impl fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("session", &self.session)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Result of [`SubscriptionTable::subscribe`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Subscribed {
    /// the channel was added under the key
    Added,
    /// the channel was already registered under the key
    AlreadyPresent,
    /// the key already has the maximum number of subscribers
    Full,
}

#[derive(Debug)]
struct KeySubscribers {
    key: String,
    channels: Vec<NotificationChannel>,
}

/// Table of the subscribers of every key, guarded by one table-wide lock.
///
/// Subscription churn is low compared with store mutations, so a single lock is enough.
/// A channel appears at most once under a given key and each key holds at most
/// `max_subscribers` channels (the session capacity).
#[derive(Clone)]
pub struct SubscriptionTable {
    inner: Arc<TableInner>,
}

struct TableInner {
    buckets: Mutex<Vec<Vec<KeySubscribers>>>,
    max_subscribers: usize,
    limits: Limits,
}

impl SubscriptionTable {
    /// creates an empty table. `limits` sizes the notification frames.
    pub fn new(max_subscribers: usize, limits: Limits) -> Self {
        SubscriptionTable {
            inner: Arc::new(TableInner {
                buckets: Mutex::new((0..SUBSCRIPTION_TABLE_SIZE).map(|_| Vec::new()).collect()),
                max_subscribers,
                limits,
            }),
        }
    }

    /// registers `channel` under `key`
    pub fn subscribe(&self, key: &str, channel: &NotificationChannel) -> Subscribed {
        let mut buckets = self.inner.buckets.lock();
        let bucket = &mut buckets[hash_key(key)];
        let entry = match bucket.iter_mut().position(|e| e.key == key) {
            Some(pos) => &mut bucket[pos],
            None => {
                bucket.push(KeySubscribers {
                    key: key.to_string(),
                    channels: Vec::new(),
                });
                let last = bucket.len() - 1;
                &mut bucket[last]
            }
        };

        if entry.channels.iter().any(|c| c.session == channel.session) {
            return Subscribed::AlreadyPresent;
        }
        if entry.channels.len() >= self.inner.max_subscribers {
            return Subscribed::Full;
        }
        entry.channels.push(channel.clone());
        trace!(key, session = channel.session, "subscribed");
        Subscribed::Added
    }

    /// removes the channel of `session` from `key`. Returns `false` if it was not there.
    pub fn unsubscribe(&self, key: &str, session: SessionId) -> bool {
        let mut buckets = self.inner.buckets.lock();
        let bucket = &mut buckets[hash_key(key)];
        let pos = match bucket.iter().position(|e| e.key == key) {
            Some(pos) => pos,
            None => return false,
        };
        let entry = &mut bucket[pos];
        let before = entry.channels.len();
        entry.channels.retain(|c| c.session != session);
        let found = entry.channels.len() != before;
        if entry.channels.is_empty() {
            bucket.swap_remove(pos);
        }
        if found {
            trace!(key, session, "unsubscribed");
        }
        found
    }

    /// number of channels subscribed to `key`
    pub fn subscriber_count(&self, key: &str) -> usize {
        let buckets = self.inner.buckets.lock();
        buckets[hash_key(key)]
            .iter()
            .find(|e| e.key == key)
            .map_or(0, |e| e.channels.len())
    }
}

impl Notify for SubscriptionTable {
    fn notify(&self, key: &str, value: &str) -> bool {
        let buckets = self.inner.buckets.lock();
        let entry = match buckets[hash_key(key)].iter().find(|e| e.key == key) {
            Some(entry) => entry,
            None => return false,
        };

        let frame = match notification_frame(key, value, &self.inner.limits) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("not publishing a change of {}: {}", key, e);
                return false;
            }
        };
        let mut delivered = false;
        for channel in &entry.channels {
            match channel.send(&frame) {
                Ok(sent) => delivered |= sent,
                // the session owning a dead pipe unsubscribes when it is torn down
                Err(e) => debug!(
                    "dropping notification for session {}: {}",
                    channel.session, e
                ),
            }
        }
        delivered
    }
}

impl fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionTable")
            .field("max_subscribers", &self.inner.max_subscribers)
            .finish_non_exhaustive()
    }
}

/// djb2
fn hash_key(key: &str) -> usize {
    let hash = key
        .bytes()
        .fold(5381u64, |hash, c| hash.wrapping_mul(33).wrapping_add(u64::from(c)));
    (hash % SUBSCRIPTION_TABLE_SIZE as u64) as usize
}
