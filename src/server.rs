use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::engine::KvsEngine;
use crate::pipe;
use crate::protocol::{read_frame, Ack, Fill, Limits, OpCode, Registration, Request, Status};
use crate::pubsub::{Subscribed, SubscriptionTable};
use crate::session::{Session, SessionChannels, SessionRegistry};
use crate::{KvsError, Result};

// how long a stop or eviction request keeps trying to wake the listener
const WAKE_TIMEOUT: Duration = Duration::from_secs(2);
const WAKE_INTERVAL: Duration = Duration::from_millis(10);
// how often a registration waiting for a slot looks at the control flags
const ADMIT_POLL: Duration = Duration::from_millis(50);
// how long evicted sessions get to be released by their dispatchers
const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// A named pipe server over a key value storage engine.
///
/// The server owns a registration FIFO. A single listener, started by [`KvsServer::run`],
/// reads registration frames from it, opens the three pipes named in each frame and admits
/// the session once a slot is free. A fixed pool of `max_sessions` dispatcher threads serves
/// the admitted sessions, one session per dispatcher at a time.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use kvs_pipes::{KvStore, KvsServer, ServerConfig, SubscriptionTable};
/// # fn main() -> kvs_pipes::Result<()> {
/// let config = ServerConfig::default();
/// let subscriptions = SubscriptionTable::new(config.max_sessions, config.limits());
/// let store = KvStore::with_notifier(Arc::new(subscriptions.clone()), config.limits());
/// store.init()?;
/// let server = KvsServer::bind(config, store, subscriptions, "/tmp/kvs-register")?;
/// let handle = server.handle();
/// // SIGUSR1 handler: handle.evict_all();
/// server.run()?;
/// # Ok(())
/// # }
/// ```
pub struct KvsServer<E: KvsEngine> {
    shared: Arc<Shared<E>>,
}

impl<E: KvsEngine> Clone for KvsServer<E> {
    fn clone(&self) -> Self {
        KvsServer {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<E: KvsEngine> {
    dispatch: Arc<Dispatch<E>>,
    register_path: PathBuf,
    control: Arc<Control>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Default)]
struct Control {
    evict: AtomicBool,
    stop: AtomicBool,
    running: AtomicBool,
}

impl<E: KvsEngine> KvsServer<E> {
    /// Creates the registration FIFO at `register_path` and starts the dispatchers.
    ///
    /// `subscriptions` must be the table `engine` publishes its changes to.
    ///
    /// # Errors
    /// returns [`KvsError::Config`] for an invalid configuration and [`KvsError::Sys`] if the
    /// FIFO cannot be created
    pub fn bind(
        config: ServerConfig,
        engine: E,
        subscriptions: SubscriptionTable,
        register_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let register_path = register_path.into();
        pipe::create_pipe(&register_path)?;

        let dispatch = Arc::new(Dispatch {
            engine,
            subscriptions,
            sessions: SessionRegistry::new(config.max_sessions),
            limits: config.limits(),
            max_subscriptions: config.max_subscriptions,
        });
        let mut dispatchers = Vec::with_capacity(config.max_sessions);
        for i in 0..config.max_sessions {
            let dispatch = Arc::clone(&dispatch);
            let handle = thread::Builder::new()
                .name(format!("kvs-dispatcher-{}", i))
                .spawn(move || dispatch.run())?;
            dispatchers.push(handle);
        }
        info!(
            "listening on {:?} with {} dispatchers",
            register_path, config.max_sessions
        );

        Ok(KvsServer {
            shared: Arc::new(Shared {
                dispatch,
                register_path,
                control: Arc::new(Control::default()),
                dispatchers: Mutex::new(dispatchers),
            }),
        })
    }

    /// a handle that can evict every session or stop the listener from another thread
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            control: Arc::clone(&self.shared.control),
            register_path: self.shared.register_path.clone(),
        }
    }

    /// the path of the registration FIFO
    pub fn register_path(&self) -> &Path {
        &self.shared.register_path
    }

    /// the registry of live sessions
    pub fn sessions(&self) -> &SessionRegistry {
        &self.shared.dispatch.sessions
    }

    /// Runs the registration listener on the calling thread until [`ServerHandle::stop`] is
    /// called.
    ///
    /// # Errors
    /// returns an error if the registration FIFO cannot be opened
    pub fn run(&self) -> Result<()> {
        let control = &self.shared.control;
        control.running.store(true, Ordering::SeqCst);
        let result = self.listen();
        control.running.store(false, Ordering::SeqCst);
        info!("listener stopped");
        result
    }

    fn listen(&self) -> Result<()> {
        let control = &self.shared.control;
        let limits = self.shared.dispatch.limits;
        let mut frame = vec![0u8; limits.registration_len()];

        while !control.stop.load(Ordering::SeqCst) {
            self.check_eviction();
            // blocks until a client (or a wake-up) opens the pipe for writing
            let mut register = match pipe::open_reader(&self.shared.register_path) {
                Ok(register) => register,
                Err(KvsError::ChannelFailure { source, .. })
                    if source.kind() == std::io::ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(e) => return Err(e),
            };

            loop {
                self.check_eviction();
                if control.stop.load(Ordering::SeqCst) {
                    break;
                }
                match read_frame(&mut register, &mut frame) {
                    Ok(Fill::Full) => self.register(&frame),
                    Ok(Fill::Interrupted) => continue,
                    // every writer closed the pipe, reopen it
                    Ok(Fill::Eof) => break,
                    Err(e) => {
                        warn!("failed to read a registration: {}", e);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_eviction(&self) {
        let control = &self.shared.control;
        if control.evict.load(Ordering::SeqCst) {
            let dispatch = &self.shared.dispatch;
            let evicted = dispatch.sessions.evict_all(&dispatch.subscriptions);
            if evicted > 0 && !dispatch.sessions.wait_released(RELEASE_TIMEOUT) {
                warn!("some evicted sessions are still being released");
            }
            // cleared once done, so evict_all returns after the slots are freed
            control.evict.store(false, Ordering::SeqCst);
        }
    }

    #[instrument(skip_all)]
    fn register(&self, frame: &[u8]) {
        let dispatch = &self.shared.dispatch;
        let registration = match Registration::decode(frame, &dispatch.limits) {
            Ok(registration) => registration,
            Err(e) => {
                warn!("dropping registration: {}", e);
                return;
            }
        };
        let channels = match open_channels(&registration) {
            Ok(channels) => channels,
            Err(e) => {
                warn!("dropping registration {:?}: {}", registration, e);
                return;
            }
        };

        // waits while every slot is taken, still answering stop and eviction requests
        let mut pending = channels;
        let session = loop {
            match dispatch.sessions.admit_timeout(pending, ADMIT_POLL) {
                Ok(session) => break session,
                Err(channels) => {
                    self.check_eviction();
                    if self.shared.control.stop.load(Ordering::SeqCst) {
                        info!("stopping, registration {:?} dropped", registration);
                        return;
                    }
                    pending = channels;
                }
            }
        };
        if let Err(e) = session.respond(Ack::new(OpCode::Connect, Status::Ok)) {
            warn!("session {} vanished before its ack: {}", session.id(), e);
            dispatch.sessions.teardown(&session, &dispatch.subscriptions);
            dispatch.sessions.release(&session);
            return;
        }
        if let Err(e) = dispatch.sessions.hand_off(Arc::clone(&session)) {
            error!("cannot hand off session {}: {}", session.id(), e);
            dispatch.sessions.teardown(&session, &dispatch.subscriptions);
            dispatch.sessions.release(&session);
        }
    }

    /// Stops the listener, evicts every session, closes the registry and removes the
    /// registration FIFO. Dispatchers exit once their sessions are released and are joined.
    pub fn shutdown(&self) -> Result<()> {
        self.handle().stop();
        let dispatch = &self.shared.dispatch;
        dispatch.sessions.evict_all(&dispatch.subscriptions);
        dispatch.sessions.close();
        pipe::unlink_pipe(&self.shared.register_path)?;

        let mut dispatchers = self.shared.dispatchers.lock();
        if !dispatch.sessions.wait_released(RELEASE_TIMEOUT) {
            // a dispatcher still blocked on its client cannot be joined
            let (finished, running): (Vec<_>, Vec<_>) =
                dispatchers.drain(..).partition(|handle| handle.is_finished());
            warn!("{} dispatchers are still serving a session", running.len());
            dispatchers.extend(finished);
        }
        while let Some(handle) = dispatchers.pop() {
            if let Err(e) = handle.join() {
                error!("a dispatcher panicked: {:?}", e);
            }
        }
        info!("server shut down");
        Ok(())
    }
}

fn open_channels(registration: &Registration) -> Result<SessionChannels> {
    // same order as the client: requests, responses, notifications
    let requests: File = pipe::open_reader(&registration.request_path)?;
    let responses = pipe::open_writer(&registration.response_path)?;
    let notifications = pipe::open_writer(&registration.notification_path)?;
    Ok(SessionChannels {
        requests: Box::new(requests),
        responses: Box::new(responses),
        notifications: Box::new(notifications),
        request_pipe: Some(registration.request_path.clone()),
    })
}

/// Controls a running [`KvsServer`] from another thread (typically a signal handler thread)
#[derive(Debug, Clone)]
pub struct ServerHandle {
    control: Arc<Control>,
    register_path: PathBuf,
}

impl ServerHandle {
    /// asks the listener to tear down every session, and wakes it up
    pub fn evict_all(&self) {
        info!("eviction requested");
        self.control.evict.store(true, Ordering::SeqCst);
        self.wake_until(|control| !control.evict.load(Ordering::SeqCst));
    }

    /// asks the listener to stop, and waits until it does
    pub fn stop(&self) {
        info!("stop requested");
        self.control.stop.store(true, Ordering::SeqCst);
        self.wake_until(|control| !control.running.load(Ordering::SeqCst));
    }

    /// whether the listener is running
    pub fn is_running(&self) -> bool {
        self.control.running.load(Ordering::SeqCst)
    }

    fn wake_until<F: Fn(&Control) -> bool>(&self, done: F) {
        let deadline = Instant::now() + WAKE_TIMEOUT;
        while !done(&self.control) {
            if !self.control.running.load(Ordering::SeqCst) {
                // nothing to wake, the request is seen when the listener starts
                return;
            }
            if let Err(e) = pipe::poke(&self.register_path) {
                warn!("cannot wake the listener: {}", e);
                return;
            }
            if Instant::now() >= deadline {
                warn!("the listener did not respond, it may be waiting for a free slot");
                return;
            }
            thread::sleep(WAKE_INTERVAL);
        }
    }
}

/// Everything a dispatcher needs to serve sessions
struct Dispatch<E: KvsEngine> {
    engine: E,
    subscriptions: SubscriptionTable,
    sessions: SessionRegistry,
    limits: Limits,
    max_subscriptions: usize,
}

impl<E: KvsEngine> Dispatch<E> {
    // waits for sessions until the registry is closed
    fn run(&self) {
        while let Some(session) = self.sessions.next_session() {
            self.serve(&session);
        }
        debug!("dispatcher exiting");
    }

    #[instrument(skip_all, fields(session = session.id()))]
    fn serve(&self, session: &Session) {
        if let Some(mut requests) = session.take_requests() {
            while session.is_active() {
                let request = match Request::read_from(&mut requests, &self.limits) {
                    Ok(Some(request)) => request,
                    Ok(None) => {
                        info!("client closed its request pipe");
                        break;
                    }
                    Err(KvsError::MalformedRequest(reason)) => {
                        warn!("ignoring malformed request: {}", reason);
                        continue;
                    }
                    Err(e) => {
                        warn!("request pipe failed: {}", e);
                        break;
                    }
                };
                // evicted while waiting for the request
                if !session.is_active() {
                    break;
                }
                debug!(?request, "request received");

                let op = request.op();
                let status = match request {
                    Request::Subscribe(key) => self.subscribe(session, key),
                    Request::Unsubscribe(key) => self.unsubscribe(session, &key),
                    Request::Disconnect => Status::Ok,
                };
                if let Err(e) = session.respond(Ack::new(op, status)) {
                    warn!("cannot answer {}: {}", op, e);
                    break;
                }
                if op == OpCode::Disconnect {
                    break;
                }
            }
        }
        self.sessions.teardown(session, &self.subscriptions);
        self.sessions.release(session);
    }

    fn subscribe(&self, session: &Session, key: String) -> Status {
        let max_subscriptions = self.max_subscriptions;
        let subscribed = session.with_keys(|keys| {
            let known = keys.contains(&key);
            if !known && keys.len() >= max_subscriptions {
                debug!("subscription limit reached, {} refused", key);
                return false;
            }
            let outcome = self
                .engine
                .with_key(&key, || self.subscriptions.subscribe(&key, session.notifications()));
            match outcome {
                Ok(Some(Subscribed::Added)) | Ok(Some(Subscribed::AlreadyPresent)) => {
                    if !known {
                        keys.push(key.clone());
                    }
                    true
                }
                Ok(Some(Subscribed::Full)) => {
                    debug!("key {} has too many subscribers", key);
                    false
                }
                Ok(None) => {
                    debug!("cannot subscribe to missing key {}", key);
                    false
                }
                Err(e) => {
                    warn!("cannot subscribe to {}: {}", key, e);
                    false
                }
            }
        });
        Status::from(subscribed.unwrap_or(false))
    }

    fn unsubscribe(&self, session: &Session, key: &str) -> Status {
        let found = session.with_keys(|keys| match keys.iter().position(|k| k == key) {
            Some(pos) => {
                keys.remove(pos);
                self.subscriptions.unsubscribe(key, session.id());
                true
            }
            None => false,
        });
        Status::from(found.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::KvStore;
    use crate::protocol::parse_notification;
    use crate::session::SessionState;
    use std::io::{self, Cursor, Write};

    const LIMITS: Limits = Limits {
        max_string_len: 10,
        max_pipe_path_len: 20,
    };

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn acks(&self) -> Vec<Ack> {
            let bytes = self.0.lock().clone();
            let mut reader = Cursor::new(bytes);
            let mut acks = Vec::new();
            while let Ok(ack) = Ack::read_from(&mut reader) {
                acks.push(ack);
            }
            acks
        }
    }

    fn dispatch(max_subscriptions: usize) -> Dispatch<KvStore> {
        let subscriptions = SubscriptionTable::new(4, LIMITS);
        let engine = KvStore::with_notifier(Arc::new(subscriptions.clone()), LIMITS);
        engine.init().unwrap();
        Dispatch {
            engine,
            subscriptions,
            sessions: SessionRegistry::new(2),
            limits: LIMITS,
            max_subscriptions,
        }
    }

    fn requests(requests: &[Request]) -> Vec<u8> {
        requests
            .iter()
            .flat_map(|r| r.encode(&LIMITS).unwrap())
            .collect()
    }

    // serves a session that sends `input`, returning its response and notification bytes
    fn serve(dispatch: &Dispatch<KvStore>, input: Vec<u8>) -> (Arc<Session>, SharedBuf, SharedBuf) {
        let responses = SharedBuf::default();
        let notifications = SharedBuf::default();
        let session = dispatch.sessions.admit(SessionChannels {
            requests: Box::new(Cursor::new(input)),
            responses: Box::new(responses.clone()),
            notifications: Box::new(notifications.clone()),
            request_pipe: None,
        });
        dispatch.sessions.hand_off(Arc::clone(&session)).unwrap();
        let claimed = dispatch.sessions.next_session().unwrap();
        dispatch.serve(&claimed);
        (session, responses, notifications)
    }

    fn ack(op: OpCode, ok: bool) -> Ack {
        Ack::new(op, Status::from(ok))
    }

    #[test]
    fn subscribe_requires_an_existing_key() {
        let dispatch = dispatch(4);
        dispatch
            .engine
            .write(&[("x".to_string(), "1".to_string())])
            .unwrap();
        let input = requests(&[
            Request::Subscribe("missing".into()),
            Request::Subscribe("x".into()),
            Request::Subscribe("x".into()),
            Request::Disconnect,
        ]);
        let (session, responses, _) = serve(&dispatch, input);

        assert_eq!(
            responses.acks(),
            vec![
                ack(OpCode::Subscribe, false),
                ack(OpCode::Subscribe, true),
                ack(OpCode::Subscribe, true),
                ack(OpCode::Disconnect, true),
            ]
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(dispatch.subscriptions.subscriber_count("x"), 0);
        assert_eq!(dispatch.sessions.active_sessions(), 0);
    }

    #[test]
    fn subscriptions_per_session_are_capped() {
        let dispatch = dispatch(1);
        dispatch
            .engine
            .write(&[
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ])
            .unwrap();
        let input = requests(&[
            Request::Subscribe("a".into()),
            Request::Subscribe("b".into()),
            Request::Unsubscribe("a".into()),
            Request::Subscribe("b".into()),
        ]);
        let (_, responses, _) = serve(&dispatch, input);

        assert_eq!(
            responses.acks(),
            vec![
                ack(OpCode::Subscribe, true),
                ack(OpCode::Subscribe, false),
                ack(OpCode::Unsubscribe, true),
                ack(OpCode::Subscribe, true),
            ]
        );
    }

    #[test]
    fn unsubscribe_of_an_unknown_key_fails() {
        let dispatch = dispatch(4);
        let input = requests(&[Request::Unsubscribe("nope".into()), Request::Disconnect]);
        let (_, responses, _) = serve(&dispatch, input);
        assert_eq!(
            responses.acks(),
            vec![ack(OpCode::Unsubscribe, false), ack(OpCode::Disconnect, true)]
        );
    }

    #[test]
    fn malformed_requests_are_skipped() {
        let dispatch = dispatch(4);
        let mut input = vec![42u8];
        input.extend(requests(&[Request::Disconnect]));
        let (_, responses, _) = serve(&dispatch, input);
        assert_eq!(responses.acks(), vec![ack(OpCode::Disconnect, true)]);
    }

    #[test]
    fn vanished_client_is_torn_down_without_an_ack() {
        let dispatch = dispatch(4);
        dispatch
            .engine
            .write(&[("k".to_string(), "v".to_string())])
            .unwrap();
        let (session, responses, _) = serve(&dispatch, requests(&[Request::Subscribe("k".into())]));

        assert_eq!(responses.acks(), vec![ack(OpCode::Subscribe, true)]);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(dispatch.subscriptions.subscriber_count("k"), 0);
        assert_eq!(dispatch.sessions.active_sessions(), 0);
    }

    #[test]
    fn subscribers_see_writes_and_deletes() {
        let dispatch = dispatch(4);
        dispatch
            .engine
            .write(&[("k".to_string(), "v".to_string())])
            .unwrap();

        let notifications = SharedBuf::default();
        let session = dispatch.sessions.admit(SessionChannels {
            requests: Box::new(io::empty()),
            responses: Box::new(io::sink()),
            notifications: Box::new(notifications.clone()),
            request_pipe: None,
        });
        dispatch.sessions.hand_off(Arc::clone(&session)).unwrap();
        assert_eq!(dispatch.subscribe(&session, "k".into()), Status::Ok);

        dispatch
            .engine
            .write(&[("k".to_string(), "w".to_string())])
            .unwrap();
        dispatch.engine.delete(&["k".to_string()]).unwrap();

        let bytes = notifications.0.lock().clone();
        let frames: Vec<_> = bytes
            .chunks(LIMITS.notification_len())
            .map(|frame| parse_notification(frame).unwrap())
            .collect();
        assert_eq!(
            frames,
            vec![
                ("k".to_string(), "w".to_string()),
                ("k".to_string(), "DELETED".to_string()),
            ]
        );
    }

    #[test]
    fn evicted_session_is_finalized_by_its_dispatcher() {
        let dispatch = dispatch(4);
        let input = requests(&[Request::Disconnect]);
        let responses = SharedBuf::default();
        let session = dispatch.sessions.admit(SessionChannels {
            requests: Box::new(Cursor::new(input)),
            responses: Box::new(responses.clone()),
            notifications: Box::new(io::sink()),
            request_pipe: None,
        });
        dispatch.sessions.hand_off(Arc::clone(&session)).unwrap();

        dispatch.sessions.evict_all(&dispatch.subscriptions);
        let claimed = dispatch.sessions.next_session().unwrap();
        dispatch.serve(&claimed);

        // the pending DISCONNECT is never answered
        assert!(responses.acks().is_empty());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(dispatch.sessions.active_sessions(), 0);
    }
}
