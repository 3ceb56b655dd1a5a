//! The fixed-width wire protocol spoken over the named pipes.
//!
//! Every message is a fixed-width frame whose size depends only on the [`Limits`] shared by
//! the server and its clients:
//!
//! | frame | direction | layout |
//! |---|---|---|
//! | registration | client → server (register pipe) | `[CONNECT][req path][resp path][notif path]` |
//! | subscribe / unsubscribe | client → server (request pipe) | `[op][key, null-padded]` |
//! | disconnect | client → server (request pipe) | `[DISCONNECT]` |
//! | ack | server → client (response pipe) | `[op][status digit]` |
//! | notification | server → client (notification pipe) | `(key,value)`, null-padded |
use std::convert::TryFrom;
use std::fmt;
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};

use crate::{KvsError, Result};

/// value published to subscribers of a key that was deleted
pub const DELETED_MARKER: &str = "DELETED";

/// Sizes that every frame is derived from
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Limits {
    /// maximum length of a key or a value
    pub max_string_len: usize,
    /// maximum length of each pipe path in a registration
    pub max_pipe_path_len: usize,
}

impl Limits {
    /// size of a registration frame
    pub fn registration_len(&self) -> usize {
        1 + 3 * self.max_pipe_path_len
    }

    /// size of the key field that follows a SUBSCRIBE or UNSUBSCRIBE opcode. It leaves room
    /// for a terminating null byte.
    pub fn key_field_len(&self) -> usize {
        self.max_string_len + 1
    }

    /// size of a notification frame
    pub fn notification_len(&self) -> usize {
        2 * self.max_string_len + 3
    }
}

/// One-byte message type tag
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// register a new session
    Connect = 1,
    /// end a session
    Disconnect = 2,
    /// subscribe to changes of a key
    Subscribe = 3,
    /// cancel a subscription
    Unsubscribe = 4,
}

impl TryFrom<u8> for OpCode {
    type Error = KvsError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(OpCode::Connect),
            2 => Ok(OpCode::Disconnect),
            3 => Ok(OpCode::Subscribe),
            4 => Ok(OpCode::Unsubscribe),
            other => Err(KvsError::MalformedRequest(format!("unknown opcode {}", other))),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Connect => "connect",
            OpCode::Disconnect => "disconnect",
            OpCode::Subscribe => "subscribe",
            OpCode::Unsubscribe => "unsubscribe",
        };
        f.write_str(name)
    }
}

/// The status digit of an [`Ack`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// the request succeeded
    Ok,
    /// the request failed (key not found, limit reached, not subscribed...)
    Failed,
}

impl Status {
    fn digit(self) -> u8 {
        match self {
            Status::Ok => b'0',
            Status::Failed => b'1',
        }
    }

    fn from_digit(digit: u8) -> Result<Self> {
        match digit {
            b'0' => Ok(Status::Ok),
            b'1' => Ok(Status::Failed),
            other => Err(KvsError::MalformedRequest(format!("unknown status {:?}", other as char))),
        }
    }
}

impl From<bool> for Status {
    fn from(ok: bool) -> Self {
        if ok {
            Status::Ok
        } else {
            Status::Failed
        }
    }
}

/// a two byte `[opcode][status]` response
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Ack {
    /// the opcode of the request being answered
    pub op: OpCode,
    /// whether it succeeded
    pub status: Status,
}

impl Ack {
    /// builds an ack for `op`
    pub fn new(op: OpCode, status: Status) -> Self {
        Ack { op, status }
    }

    /// the wire bytes of this ack
    pub fn encode(&self) -> [u8; 2] {
        [self.op as u8, self.status.digit()]
    }

    /// reads one ack, blocking until both bytes arrive
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 2];
        match read_frame(reader, &mut buf)? {
            Fill::Full => Ok(Ack {
                op: OpCode::try_from(buf[0])?,
                status: Status::from_digit(buf[1])?,
            }),
            Fill::Eof | Fill::Interrupted => Err(io::Error::from(ErrorKind::UnexpectedEof).into()),
        }
    }
}

/// A registration: the three pipes a client created for its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// pipe the server reads requests from
    pub request_path: PathBuf,
    /// pipe the server writes acks to
    pub response_path: PathBuf,
    /// pipe the server writes notifications to
    pub notification_path: PathBuf,
}

impl Registration {
    /// serializes the registration into a frame of [`Limits::registration_len`] bytes
    ///
    /// # Errors
    /// returns [`KvsError::MalformedRequest`] if a path is longer than the path limit
    pub fn encode(&self, limits: &Limits) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(limits.registration_len());
        frame.push(OpCode::Connect as u8);
        for path in [&self.request_path, &self.response_path, &self.notification_path] {
            let path = path_str(path)?;
            frame.extend_from_slice(&pad(path, limits.max_pipe_path_len)?);
        }
        Ok(frame)
    }

    /// parses a registration frame
    pub fn decode(frame: &[u8], limits: &Limits) -> Result<Self> {
        if frame.len() != limits.registration_len() {
            return Err(KvsError::MalformedRequest(format!(
                "registration frame has {} bytes, expected {}",
                frame.len(),
                limits.registration_len()
            )));
        }
        if OpCode::try_from(frame[0])? != OpCode::Connect {
            return Err(KvsError::MalformedRequest(format!(
                "registration carries opcode {}",
                frame[0]
            )));
        }
        let mut paths = frame[1..]
            .chunks(limits.max_pipe_path_len)
            .map(|field| unpad(field).map(PathBuf::from));
        // chunks of an exactly sized frame always yield three fields
        let mut next = || {
            paths
                .next()
                .unwrap_or_else(|| Err(KvsError::MalformedRequest("missing pipe path".into())))
        };
        Ok(Registration {
            request_path: next()?,
            response_path: next()?,
            notification_path: next()?,
        })
    }
}

/// A request read from a session's request pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// subscribe to a key
    Subscribe(String),
    /// cancel a subscription to a key
    Unsubscribe(String),
    /// end the session
    Disconnect,
}

impl Request {
    /// the opcode of this request
    pub fn op(&self) -> OpCode {
        match self {
            Request::Subscribe(_) => OpCode::Subscribe,
            Request::Unsubscribe(_) => OpCode::Unsubscribe,
            Request::Disconnect => OpCode::Disconnect,
        }
    }

    /// serializes the request into its frame
    pub fn encode(&self, limits: &Limits) -> Result<Vec<u8>> {
        let mut frame = vec![self.op() as u8];
        match self {
            Request::Subscribe(key) | Request::Unsubscribe(key) => {
                if key.len() > limits.max_string_len {
                    return Err(KvsError::MalformedRequest(format!("key {} is too long", key)));
                }
                frame.extend_from_slice(&pad(key, limits.key_field_len())?);
            }
            Request::Disconnect => {}
        }
        Ok(frame)
    }

    /// reads the next request from `reader`.
    ///
    /// Returns `Ok(None)` once the writing end of the pipe is closed between two requests.
    ///
    /// # Errors
    /// [`KvsError::MalformedRequest`] for an unknown opcode or a bad key; the bytes of the
    /// offending frame have been consumed and the stream may be read again.
    /// [`KvsError::Io`] if the pipe fails or closes in the middle of a frame.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R, limits: &Limits) -> Result<Option<Self>> {
        let mut op = [0u8; 1];
        loop {
            match read_frame(reader, &mut op)? {
                Fill::Full => break,
                Fill::Eof => return Ok(None),
                Fill::Interrupted => continue,
            }
        }
        match OpCode::try_from(op[0])? {
            OpCode::Disconnect => Ok(Some(Request::Disconnect)),
            OpCode::Connect => Err(KvsError::MalformedRequest(
                "connect received on a request pipe".into(),
            )),
            code @ (OpCode::Subscribe | OpCode::Unsubscribe) => {
                let mut field = vec![0u8; limits.key_field_len()];
                read_to_fill(reader, &mut field)?;
                let key = unpad(&field)?;
                if key.is_empty() {
                    return Err(KvsError::MalformedRequest(format!("{} without a key", code)));
                }
                Ok(Some(match code {
                    OpCode::Subscribe => Request::Subscribe(key),
                    _ => Request::Unsubscribe(key),
                }))
            }
        }
    }
}

/// builds the notification frame published for a change of `key`
///
/// # Errors
/// returns [`KvsError::InvalidKey`] if the pair does not fit in [`Limits::notification_len`]
/// bytes
pub fn notification_frame(key: &str, value: &str, limits: &Limits) -> Result<Vec<u8>> {
    let mut frame = format!("({},{})", key, value).into_bytes();
    let width = limits.notification_len();
    if frame.len() > width {
        return Err(KvsError::InvalidKey(format!(
            "({},{}) does not fit in a {} byte notification",
            key, value, width
        )));
    }
    frame.resize(width, 0);
    Ok(frame)
}

/// parses a notification frame into its key and value
pub fn parse_notification(frame: &[u8]) -> Option<(String, String)> {
    let end = frame.iter().position(|b| *b == 0).unwrap_or(frame.len());
    let text = std::str::from_utf8(&frame[..end]).ok()?;
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;
    let (key, value) = inner.split_once(',')?;
    Some((key.to_string(), value.to_string()))
}

/// Outcome of filling a frame buffer from a pipe
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fill {
    /// the whole buffer was read
    Full,
    /// the writer closed the pipe before any byte of the frame arrived
    Eof,
    /// a signal interrupted the read before any byte of the frame arrived
    Interrupted,
}

/// Reads exactly `buf.len()` bytes, blocking until they arrive.
///
/// Unlike [`Read::read_exact`], an EOF or a signal that arrives before the first byte is
/// reported to the caller instead of being treated as an error or retried, so a listener can
/// look at its control flags between frames.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(Fill::Eof),
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted && filled == 0 => {
                return Ok(Fill::Interrupted)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Fill::Full)
}

// a frame that has started must be completed
fn read_to_fill<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    loop {
        match read_frame(reader, buf)? {
            Fill::Full => return Ok(()),
            Fill::Eof => return Err(ErrorKind::UnexpectedEof.into()),
            Fill::Interrupted => continue,
        }
    }
}

fn pad(s: &str, width: usize) -> Result<Vec<u8>> {
    if s.len() > width {
        return Err(KvsError::MalformedRequest(format!(
            "{} does not fit in {} bytes",
            s, width
        )));
    }
    let mut field = s.as_bytes().to_vec();
    field.resize(width, 0);
    Ok(field)
}

fn unpad(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec())
        .map_err(|e| KvsError::MalformedRequest(format!("field is not UTF-8: {}", e)))
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| KvsError::MalformedRequest(format!("{:?} is not UTF-8", path)))
}
