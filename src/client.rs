use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::pipe;
use crate::protocol::{
    parse_notification, read_frame, Ack, Fill, Limits, OpCode, Registration, Request, Status,
};
use crate::{KvsError, Result};

/// `KvsClient` is the client side of a session with a [`KvsServer`](crate::KvsServer).
///
/// Connecting creates the three session pipes, registers them on the server's registration
/// pipe and waits for the server to admit the session. Every request then blocks until the
/// server answers it. Notifications arrive on their own pipe; take them with
/// [`KvsClient::notifications`] and read them from another thread.
///
/// Dropping the client removes its pipes.
#[derive(Debug)]
pub struct KvsClient {
    registration: Registration,
    limits: Limits,
    requests: Option<File>,
    responses: Option<File>,
    notifications: Option<File>,
}

impl KvsClient {
    /// the pipes of client `id`: `<dir>/req<id>`, `<dir>/resp<id>` and `<dir>/notif<id>`
    pub fn pipes_for(dir: &Path, id: &str) -> Registration {
        Registration {
            request_path: dir.join(format!("req{}", id)),
            response_path: dir.join(format!("resp{}", id)),
            notification_path: dir.join(format!("notif{}", id)),
        }
    }

    /// Creates the pipes of `registration`, registers them with the server listening on
    /// `register_path` and waits until the session is admitted.
    ///
    /// # Errors
    /// returns [`KvsError::ChannelFailure`] if a pipe cannot be opened and
    /// [`KvsError::MalformedRequest`] if a path does not fit in the registration frame
    pub fn connect(register_path: &Path, registration: Registration, limits: Limits) -> Result<Self> {
        let frame = registration.encode(&limits)?;
        for path in paths(&registration) {
            pipe::create_pipe(path)?;
        }
        // pipes are removed on drop, including when connecting fails below
        let mut client = KvsClient {
            registration,
            limits,
            requests: None,
            responses: None,
            notifications: None,
        };

        let mut register = pipe::open_writer(register_path)?;
        register
            .write_all(&frame)
            .map_err(|e| KvsError::channel(register_path.display().to_string(), e))?;
        drop(register);

        client.requests = Some(pipe::open_writer(&client.registration.request_path)?);
        client.responses = Some(pipe::open_reader(&client.registration.response_path)?);
        client.notifications = Some(pipe::open_reader(&client.registration.notification_path)?);

        let ack = client.read_ack(OpCode::Connect)?;
        if ack != Status::Ok {
            return Err(KvsError::StringErr("the server refused the connection".into()));
        }
        debug!("connected through {:?}", register_path);
        Ok(client)
    }

    /// subscribes to `key`. Returns `false` if the server refused: the key does not exist or
    /// a limit was reached.
    pub fn subscribe(&mut self, key: &str) -> Result<bool> {
        self.send(&Request::Subscribe(key.to_string()))?;
        Ok(self.read_ack(OpCode::Subscribe)? == Status::Ok)
    }

    /// cancels the subscription to `key`. Returns `false` if there was none.
    pub fn unsubscribe(&mut self, key: &str) -> Result<bool> {
        self.send(&Request::Unsubscribe(key.to_string()))?;
        Ok(self.read_ack(OpCode::Unsubscribe)? == Status::Ok)
    }

    /// ends the session and removes the pipes
    pub fn disconnect(mut self) -> Result<()> {
        self.send(&Request::Disconnect)?;
        self.read_ack(OpCode::Disconnect)?;
        Ok(())
    }

    /// Takes the notification stream. Returns `None` if it was already taken.
    pub fn notifications(&mut self) -> Option<Notifications> {
        self.notifications.take().map(|pipe| Notifications {
            pipe,
            frame_len: self.limits.notification_len(),
        })
    }

    fn send(&mut self, request: &Request) -> Result<()> {
        let frame = request.encode(&self.limits)?;
        let path = &self.registration.request_path;
        let pipe = self.requests.as_mut().ok_or_else(|| {
            KvsError::channel(path.display().to_string(), std::io::ErrorKind::NotConnected.into())
        })?;
        pipe.write_all(&frame)
            .map_err(|e| KvsError::channel(path.display().to_string(), e))
    }

    fn read_ack(&mut self, op: OpCode) -> Result<Status> {
        let path = &self.registration.response_path;
        let pipe = self.responses.as_mut().ok_or_else(|| {
            KvsError::channel(path.display().to_string(), std::io::ErrorKind::NotConnected.into())
        })?;
        let ack = Ack::read_from(pipe)?;
        if ack.op != op {
            return Err(KvsError::MalformedRequest(format!(
                "expected an answer to {}, got one to {}",
                op, ack.op
            )));
        }
        debug!("server returned {:?} for {}", ack.status, op);
        Ok(ack.status)
    }
}

impl Drop for KvsClient {
    fn drop(&mut self) {
        self.requests.take();
        self.responses.take();
        self.notifications.take();
        for path in paths(&self.registration) {
            if let Err(e) = pipe::unlink_pipe(path) {
                warn!("cannot remove {:?}: {}", path, e);
            }
        }
    }
}

fn paths(registration: &Registration) -> [&PathBuf; 3] {
    [
        &registration.request_path,
        &registration.response_path,
        &registration.notification_path,
    ]
}

/// The notifications of a session, as `(key, value)` pairs. A deleted key is reported with
/// the value `DELETED`.
///
/// The iterator ends when the server closes the pipe.
#[derive(Debug)]
pub struct Notifications {
    pipe: File,
    frame_len: usize,
}

impl Iterator for Notifications {
    type Item = Result<(String, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut frame = vec![0u8; self.frame_len];
        loop {
            match read_frame(&mut self.pipe, &mut frame) {
                Ok(Fill::Full) => break,
                Ok(Fill::Interrupted) => continue,
                Ok(Fill::Eof) => return None,
                Err(e) => return Some(Err(e.into())),
            }
        }
        Some(parse_notification(&frame).ok_or_else(|| {
            KvsError::MalformedRequest(format!(
                "bad notification {:?}",
                String::from_utf8_lossy(&frame)
            ))
        }))
    }
}
