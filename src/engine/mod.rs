//! This module provides the key/value storage engine.
//!
//! [`KvsEngine`] is the seam between the storage and everything that drives it: job workers,
//! the backup controller and the client dispatchers are all generic over it. [`KvStore`] is
//! the in-memory implementation.
use std::io::Write;

use crate::Result;

/// A trait for the batch operations of a key/value storage engine.
///
/// Every batch operation sorts its keys before taking the engine's lock, so that two batches
/// touching the same keys always acquire them in the same order.
pub trait KvsEngine: Clone + Send + Sync + 'static {
    /// sets every `(key, value)` pair, atomically with respect to concurrent readers
    ///
    /// If a key already exists its value is overwritten; if a key appears twice the last
    /// pair wins.
    fn write(&self, pairs: &[(String, String)]) -> Result<()>;

    /// reads the value of every key.
    ///
    /// Returns the formatted result `[(k,v)(k2,KVSERROR)]\n`, in sorted key order, where a
    /// missing key is rendered with the `KVSERROR` marker.
    fn read(&self, keys: &[String]) -> Result<String>;

    /// deletes every key.
    ///
    /// Returns `[(k,KVSMISSING)]\n` listing the keys that did not exist, or an empty string
    /// when every key was deleted.
    fn delete(&self, keys: &[String]) -> Result<String>;

    /// renders every entry as a `(key, value)\n` line
    fn show(&self) -> Result<String>;

    /// writes a point-in-time dump of the store (the same text as [`KvsEngine::show`]) into
    /// `sink`
    fn snapshot<W: Write>(&self, sink: &mut W) -> Result<()> {
        let dump = self.show()?;
        sink.write_all(dump.as_bytes())?;
        sink.flush()?;
        Ok(())
    }

    /// runs `f` while holding the engine's read lock, if `key` is present.
    ///
    /// Returns `Ok(None)` without calling `f` when the key is absent.
    fn with_key<F, R>(&self, key: &str, f: F) -> Result<Option<R>>
    where
        F: FnOnce() -> R;
}

mod kvs;

pub use self::kvs::{KvStore, MISSING_MARKER, READ_ERROR_MARKER};
