//! Client sessions and the fixed-capacity registry that holds them.
//!
//! A session moves through `Connecting → Active → Disconnecting → Closed`:
//!
//! - the registration listener [`admits`](SessionRegistry::admit) it once a capacity permit
//!   is free, claims a slot and [`hands it off`](SessionRegistry::hand_off) to a dispatcher;
//! - the dispatcher serves it until DISCONNECT, a dead request pipe, or an eviction;
//! - [`teardown`](SessionRegistry::teardown) unsubscribes every key and closes the response
//!   and notification pipes, then wakes a dispatcher blocked on the request pipe;
//!   [`release`](SessionRegistry::release) closes the request pipe, frees the slot and
//!   returns the permit. Only then can the slot be reused.
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::pipe;
use crate::protocol::Ack;
use crate::pubsub::{NotificationChannel, SessionId, SubscriptionTable};
use crate::sync::{Permit, Permits};
use crate::{KvsError, Result};

/// Lifecycle state of a session
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// admitted, not yet acknowledged
    Connecting,
    /// acknowledged and served by a dispatcher
    Active,
    /// being torn down
    Disconnecting,
    /// every resource has been released
    Closed,
}

/// The three endpoints of a session, as opened by the registration listener
pub struct SessionChannels {
    /// requests from the client
    pub requests: Box<dyn Read + Send>,
    /// acks to the client
    pub responses: Box<dyn Write + Send>,
    /// notifications to the client
    pub notifications: Box<dyn Write + Send>,
    /// the FIFO `requests` reads from, nudged when the session is torn down
    pub request_pipe: Option<PathBuf>,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    keys: Vec<String>,
}

/// One connected client
pub struct Session {
    id: SessionId,
    slot: usize,
    // guards the state and the key-set
    inner: Mutex<SessionInner>,
    requests: Mutex<Option<Box<dyn Read + Send>>>,
    request_pipe: Option<PathBuf>,
    responses: Mutex<Option<Box<dyn Write + Send>>>,
    notifications: NotificationChannel,
    permit: Mutex<Option<Permit>>,
}

impl Session {
    /// the unique id of this session
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// the registry slot this session occupies
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// current lifecycle state
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// whether requests may still be served
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// the keys this session is subscribed to
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().keys.clone()
    }

    /// the notification endpoint of this session
    pub fn notifications(&self) -> &NotificationChannel {
        &self.notifications
    }

    /// takes the request endpoint. Only the dispatcher bound to the session reads requests.
    pub fn take_requests(&self) -> Option<Box<dyn Read + Send>> {
        self.requests.lock().take()
    }

    /// writes an ack on the response endpoint
    pub fn respond(&self, ack: Ack) -> Result<()> {
        let mut responses = self.responses.lock();
        let pipe = responses.as_mut().ok_or_else(|| {
            KvsError::channel(
                format!("session {} responses", self.id),
                std::io::ErrorKind::NotConnected.into(),
            )
        })?;
        pipe.write_all(&ack.encode())
            .and_then(|_| pipe.flush())
            .map_err(|e| KvsError::channel(format!("session {} responses", self.id), e))
    }

    /// Runs `f` on the key-set while holding the session lock, if the session is still
    /// active. Returns `None` for a session that is being torn down.
    pub fn with_keys<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut Vec<String>) -> R,
    {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Active {
            return None;
        }
        Some(f(&mut inner.keys))
    }

    fn set_state(&self, state: SessionState) {
        self.inner.lock().state = state;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

/// Fixed-capacity table of live sessions.
///
/// `capacity` bounds the number of live sessions: [`SessionRegistry::admit`] blocks while
/// every permit is held. The hand-off channel wakes a dispatcher for every admitted session.
pub struct SessionRegistry {
    slots: Mutex<Vec<Option<Arc<Session>>>>,
    capacity: Permits,
    handoff_tx: Mutex<Option<Sender<Arc<Session>>>>,
    handoff_rx: Receiver<Arc<Session>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// creates a registry with `max_sessions` slots
    pub fn new(max_sessions: usize) -> Self {
        let (tx, rx) = channel::bounded(max_sessions);
        SessionRegistry {
            slots: Mutex::new((0..max_sessions).map(|_| None).collect()),
            capacity: Permits::new(max_sessions),
            handoff_tx: Mutex::new(Some(tx)),
            handoff_rx: rx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Waits for a free capacity permit, then stores a new `Connecting` session in a free
    /// slot. The session takes ownership of `channels`.
    pub fn admit(&self, channels: SessionChannels) -> Arc<Session> {
        let permit = self.capacity.acquire();
        self.insert(permit, channels)
    }

    /// Like [`SessionRegistry::admit`], but gives `channels` back if no slot frees up within
    /// `timeout`.
    pub fn admit_timeout(
        &self,
        channels: SessionChannels,
        timeout: Duration,
    ) -> std::result::Result<Arc<Session>, SessionChannels> {
        match self.capacity.acquire_timeout(timeout) {
            Some(permit) => Ok(self.insert(permit, channels)),
            None => Err(channels),
        }
    }

    fn insert(&self, permit: Permit, channels: SessionChannels) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut slots = self.slots.lock();
        // holding a permit guarantees a free slot
        let free = slots.iter().position(Option::is_none);
        let slot = match free {
            Some(slot) => slot,
            None => {
                warn!("no free slot although a permit was granted, growing the table");
                slots.push(None);
                slots.len() - 1
            }
        };
        let session = Arc::new(Session {
            id,
            slot,
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                keys: Vec::new(),
            }),
            requests: Mutex::new(Some(channels.requests)),
            request_pipe: channels.request_pipe,
            responses: Mutex::new(Some(channels.responses)),
            notifications: NotificationChannel::new(id, channels.notifications),
            permit: Mutex::new(Some(permit)),
        });
        slots[slot] = Some(Arc::clone(&session));
        info!(session = id, slot, "session admitted");
        session
    }

    /// marks `session` active and wakes a dispatcher for it
    pub fn hand_off(&self, session: Arc<Session>) -> Result<()> {
        session.set_state(SessionState::Active);
        let tx = self.handoff_tx.lock().clone();
        match tx {
            Some(tx) => tx
                .send(session)
                .map_err(|_| KvsError::StringErr("no dispatcher is running".into())),
            None => Err(KvsError::StringErr("session registry is closed".into())),
        }
    }

    /// blocks until a session is handed off. Returns `None` once the registry is closed and
    /// every pending session was claimed.
    pub fn next_session(&self) -> Option<Arc<Session>> {
        self.handoff_rx.recv().ok()
    }

    /// Unsubscribes every key of `session`, closes its response and notification endpoints
    /// and nudges its request pipe. Does nothing if the session is already being torn down.
    pub fn teardown(&self, session: &Session, subscriptions: &SubscriptionTable) {
        let keys = {
            let mut inner = session.inner.lock();
            match inner.state {
                SessionState::Disconnecting | SessionState::Closed => return,
                _ => inner.state = SessionState::Disconnecting,
            }
            // the lock is kept while unsubscribing so eviction and the dispatcher never
            // interleave on the key-set
            let keys = std::mem::take(&mut inner.keys);
            for key in &keys {
                subscriptions.unsubscribe(key, session.id);
            }
            keys
        };
        session.notifications.close();
        session.responses.lock().take();
        if let Some(path) = &session.request_pipe {
            // the dispatcher reading requests wakes up and finds the session inactive
            if let Err(e) = pipe::nudge(path) {
                debug!(session = session.id, "cannot nudge {:?}: {}", path, e);
            }
        }
        debug!(session = session.id, ?keys, "session torn down");
    }

    /// Closes the request endpoint, frees the slot and returns the capacity permit. The
    /// session must have been torn down.
    pub fn release(&self, session: &Session) {
        session.requests.lock().take();
        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(session.slot) {
                if slot.as_ref().map_or(false, |s| s.id == session.id) {
                    *slot = None;
                }
            }
        }
        session.set_state(SessionState::Closed);
        // returned last: a new session may only reuse the slot once everything above is done
        session.permit.lock().take();
        info!(session = session.id, slot = session.slot, "session closed");
    }

    /// Blocks until every session was released or `timeout` elapses. Returns `true` if no
    /// session is left.
    pub fn wait_released(&self, timeout: Duration) -> bool {
        self.capacity.wait_idle_timeout(timeout)
    }

    /// tears down every live session. Their dispatchers finish the release.
    pub fn evict_all(&self, subscriptions: &SubscriptionTable) -> usize {
        let sessions: Vec<Arc<Session>> = self.slots.lock().iter().flatten().cloned().collect();
        for session in &sessions {
            self.teardown(session, subscriptions);
        }
        info!("evicted {} sessions", sessions.len());
        sessions.len()
    }

    /// stops handing off sessions; dispatchers exit once the pending ones are claimed
    pub fn close(&self) {
        self.handoff_tx.lock().take();
    }

    /// number of occupied slots
    pub fn active_sessions(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// maximum number of live sessions
    pub fn capacity(&self) -> usize {
        self.capacity.max()
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("capacity", &self.capacity.max())
            .field("active", &self.active_sessions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Limits, OpCode, Status};
    use std::io;
    use std::sync::mpsc;
    use std::thread;

    fn channels() -> SessionChannels {
        SessionChannels {
            requests: Box::new(io::empty()),
            responses: Box::new(io::sink()),
            notifications: Box::new(io::sink()),
            request_pipe: None,
        }
    }

    fn table() -> SubscriptionTable {
        SubscriptionTable::new(
            4,
            Limits {
                max_string_len: 10,
                max_pipe_path_len: 10,
            },
        )
    }

    #[test]
    fn admission_blocks_until_a_slot_is_released() {
        let registry = Arc::new(SessionRegistry::new(1));
        let subs = table();
        let first = registry.admit(channels());
        assert_eq!(first.slot(), 0);

        let (tx, rx) = mpsc::channel();
        let waiting = Arc::clone(&registry);
        let handle = thread::spawn(move || {
            let second = waiting.admit(channels());
            tx.send(second.slot()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        registry.teardown(&first, &subs);
        registry.release(&first);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        handle.join().unwrap();
        assert_eq!(first.state(), SessionState::Closed);
    }

    #[test]
    fn teardown_unsubscribes_every_key_once() {
        let registry = SessionRegistry::new(2);
        let subs = table();
        let session = registry.admit(channels());
        registry.hand_off(Arc::clone(&session)).unwrap();

        for key in ["a", "b"] {
            subs.subscribe(key, session.notifications());
            session.with_keys(|keys| keys.push(key.to_string()));
        }
        registry.teardown(&session, &subs);
        registry.teardown(&session, &subs);

        assert_eq!(subs.subscriber_count("a"), 0);
        assert_eq!(subs.subscriber_count("b"), 0);
        assert!(session.keys().is_empty());
        assert!(session.notifications().is_closed());
        assert!(session.with_keys(|_| ()).is_none());
        assert!(session.respond(Ack::new(OpCode::Subscribe, Status::Ok)).is_err());
        // still occupies its slot until released
        assert_eq!(registry.active_sessions(), 1);
        registry.release(&session);
        assert_eq!(registry.active_sessions(), 0);
    }

    #[test]
    fn handed_off_sessions_reach_a_dispatcher() {
        let registry = SessionRegistry::new(2);
        let session = registry.admit(channels());
        assert_eq!(session.state(), SessionState::Connecting);
        registry.hand_off(Arc::clone(&session)).unwrap();

        let claimed = registry.next_session().unwrap();
        assert_eq!(claimed.id(), session.id());
        assert!(claimed.is_active());

        registry.close();
        assert!(registry.next_session().is_none());
        assert!(registry.hand_off(session).is_err());
    }

    #[test]
    fn evict_all_tears_down_live_sessions() {
        let registry = SessionRegistry::new(3);
        let subs = table();
        let sessions: Vec<_> = (0..3).map(|_| registry.admit(channels())).collect();
        for session in &sessions {
            registry.hand_off(Arc::clone(session)).unwrap();
        }

        assert_eq!(registry.evict_all(&subs), 3);
        assert!(sessions
            .iter()
            .all(|s| s.state() == SessionState::Disconnecting));
    }

    #[test]
    fn admit_timeout_returns_the_channels_when_full() {
        let registry = SessionRegistry::new(1);
        let subs = table();
        let first = registry.admit(channels());

        let pending = match registry.admit_timeout(channels(), Duration::from_millis(20)) {
            Ok(_) => panic!("admitted beyond capacity"),
            Err(pending) => pending,
        };
        assert!(!registry.wait_released(Duration::from_millis(20)));

        registry.teardown(&first, &subs);
        registry.release(&first);
        assert!(registry.wait_released(Duration::from_secs(1)));
        let second = registry
            .admit_timeout(pending, Duration::from_secs(1))
            .unwrap_or_else(|_| panic!("slot was not freed"));
        assert_eq!(second.slot(), 0);
    }
}
