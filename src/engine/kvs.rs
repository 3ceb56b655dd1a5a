use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use super::KvsEngine;
use crate::error::{KvsError, Result};
use crate::protocol::{Limits, DELETED_MARKER};
use crate::pubsub::Notify;

// number of buckets of the table, one per letter of the alphabet
const TABLE_SIZE: usize = 26;

/// rendered in place of the value of a key that READ could not find
pub const READ_ERROR_MARKER: &str = "KVSERROR";
/// rendered in place of the value of a key that DELETE could not find
pub const MISSING_MARKER: &str = "KVSMISSING";

/// The in-memory key/value store.
///
/// Keys live in a fixed number of buckets chosen by their first character. The whole table
/// sits behind a single reader/writer lock: READ, SHOW and snapshots share it, WRITE and
/// DELETE take it exclusively once per batch.
///
/// The store has an explicit lifecycle. It starts uninitialized; [`KvStore::init`] creates
/// the table and [`KvStore::terminate`] drops it. Every operation outside of that window
/// fails with [`KvsError::NotInitialized`].
///
/// `KvStore` is a cheap handle: clones share the same table.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    table: RwLock<Option<HashTable>>,
    notifier: Option<Arc<dyn Notify>>,
    // longest key or value accepted, unbounded without a notifier
    max_string_len: Option<usize>,
}

impl KvStore {
    /// creates an uninitialized store that publishes no notifications
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Creates an uninitialized store that reports every mutation to `notifier`.
    ///
    /// Notifications have a fixed width, so pairs with a key or a value longer than
    /// `limits.max_string_len` bytes are rejected.
    pub fn with_notifier(notifier: Arc<dyn Notify>, limits: Limits) -> Self {
        Self::build(Some(notifier), Some(limits.max_string_len))
    }

    fn build(notifier: Option<Arc<dyn Notify>>, max_string_len: Option<usize>) -> Self {
        KvStore {
            inner: Arc::new(StoreInner {
                table: RwLock::new(None),
                notifier,
                max_string_len,
            }),
        }
    }

    /// creates the table
    ///
    /// # Errors
    /// returns [`KvsError::AlreadyInitialized`] if the store is already initialized
    pub fn init(&self) -> Result<()> {
        let mut table = self.inner.table.write();
        if table.is_some() {
            return Err(KvsError::AlreadyInitialized);
        }
        *table = Some(HashTable::new());
        debug!("store initialized");
        Ok(())
    }

    /// drops the table and every entry in it
    pub fn terminate(&self) -> Result<()> {
        match self.inner.table.write().take() {
            Some(_) => {
                debug!("store terminated");
                Ok(())
            }
            None => Err(KvsError::NotInitialized),
        }
    }

    fn check_len(&self, key: &str, value: &str) -> Result<()> {
        match self.inner.max_string_len {
            Some(max) if key.len() > max || value.len() > max => Err(KvsError::InvalidKey(
                format!("({},{}) exceeds {} bytes", key, value, max),
            )),
            _ => Ok(()),
        }
    }

    fn publish(&self, key: &str, value: &str) {
        if let Some(notifier) = &self.inner.notifier {
            notifier.notify(key, value);
        }
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("initialized", &self.inner.table.read().is_some())
            .field("notifier", &self.inner.notifier.is_some())
            .field("max_string_len", &self.inner.max_string_len)
            .finish()
    }
}

impl KvsEngine for KvStore {
    #[instrument(skip_all, fields(pairs = pairs.len()))]
    fn write(&self, pairs: &[(String, String)]) -> Result<()> {
        // a stable sort keeps the batch order of repeated keys, so the last one wins
        let mut sorted: Vec<&(String, String)> = pairs.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let mut written = Vec::with_capacity(sorted.len());
        {
            let mut guard = self.inner.table.write();
            let table = guard.as_mut().ok_or(KvsError::NotInitialized)?;
            for (key, value) in sorted {
                match self.check_len(key, value).and_then(|_| table.write_pair(key, value)) {
                    Ok(()) => written.push((key, value)),
                    Err(e) => warn!("failed to write pair ({},{}): {}", key, value, e),
                }
            }
        }

        // the store lock is released before touching the subscription table
        for (key, value) in written {
            self.publish(key, value);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(keys = keys.len()))]
    fn read(&self, keys: &[String]) -> Result<String> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();

        let guard = self.inner.table.read();
        let table = guard.as_ref().ok_or(KvsError::NotInitialized)?;
        let mut out = String::from("[");
        for key in sorted {
            let value = table.read_pair(key).unwrap_or(READ_ERROR_MARKER);
            let _ = write!(out, "({},{})", key, value);
        }
        out.push_str("]\n");
        Ok(out)
    }

    #[instrument(skip_all, fields(keys = keys.len()))]
    fn delete(&self, keys: &[String]) -> Result<String> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();

        let mut deleted = Vec::new();
        let mut missing = String::new();
        {
            let mut guard = self.inner.table.write();
            let table = guard.as_mut().ok_or(KvsError::NotInitialized)?;
            for key in sorted {
                if table.delete_pair(key) {
                    deleted.push(key);
                } else {
                    let _ = write!(missing, "({},{})", key, MISSING_MARKER);
                }
            }
        }

        for key in deleted {
            self.publish(key, DELETED_MARKER);
        }
        if missing.is_empty() {
            Ok(missing)
        } else {
            Ok(format!("[{}]\n", missing))
        }
    }

    fn show(&self) -> Result<String> {
        let guard = self.inner.table.read();
        let table = guard.as_ref().ok_or(KvsError::NotInitialized)?;
        let mut out = String::new();
        for entry in table.entries() {
            let _ = writeln!(out, "({}, {})", entry.key, entry.value);
        }
        Ok(out)
    }

    fn with_key<F, R>(&self, key: &str, f: F) -> Result<Option<R>>
    where
        F: FnOnce() -> R,
    {
        let guard = self.inner.table.read();
        let table = guard.as_ref().ok_or(KvsError::NotInitialized)?;
        Ok(table.read_pair(key).map(|_| f()))
    }
}

#[derive(Debug)]
struct Entry {
    key: String,
    value: String,
}

/// fixed-bucket chained table
#[derive(Debug)]
struct HashTable {
    buckets: Vec<Vec<Entry>>,
}

impl HashTable {
    fn new() -> Self {
        HashTable {
            buckets: (0..TABLE_SIZE).map(|_| Vec::new()).collect(),
        }
    }

    fn write_pair(&mut self, key: &str, value: &str) -> Result<()> {
        let index = bucket_index(key).ok_or_else(|| KvsError::InvalidKey(key.to_string()))?;
        let bucket = &mut self.buckets[index];
        match bucket.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => entry.value = value.to_string(),
            None => bucket.push(Entry {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
        Ok(())
    }

    fn read_pair(&self, key: &str) -> Option<&str> {
        let index = bucket_index(key)?;
        self.buckets[index]
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value.as_str())
    }

    fn delete_pair(&mut self, key: &str) -> bool {
        let index = match bucket_index(key) {
            Some(index) => index,
            None => return false,
        };
        let bucket = &mut self.buckets[index];
        match bucket.iter().position(|entry| entry.key == key) {
            Some(pos) => {
                bucket.remove(pos);
                true
            }
            None => false,
        }
    }

    // bucket order, then insertion order within a bucket
    fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.buckets.iter().flatten()
    }
}

/// letters map to 0..26 regardless of case, digits to 0..10
fn bucket_index(key: &str) -> Option<usize> {
    let first = key.chars().next()?.to_ascii_lowercase();
    match first {
        'a'..='z' => Some(first as usize - 'a' as usize),
        '0'..='9' => Some(first as usize - '0' as usize),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const LIMITS: Limits = Limits {
        max_string_len: 8,
        max_pipe_path_len: 16,
    };

    fn store() -> KvStore {
        let store = KvStore::new();
        store.init().unwrap();
        store
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|k| k.to_string()).collect()
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, String)>>);

    impl Notify for Recorder {
        fn notify(&self, key: &str, value: &str) -> bool {
            self.0.lock().push((key.to_string(), value.to_string()));
            true
        }
    }

    #[test]
    fn operations_require_init() {
        let store = KvStore::new();
        assert!(matches!(store.show(), Err(KvsError::NotInitialized)));
        assert!(matches!(
            store.write(&pairs(&[("a", "1")])),
            Err(KvsError::NotInitialized)
        ));

        store.init().unwrap();
        assert!(matches!(store.init(), Err(KvsError::AlreadyInitialized)));
        store.terminate().unwrap();
        assert!(matches!(store.read(&keys(&["a"])), Err(KvsError::NotInitialized)));
        assert!(matches!(store.terminate(), Err(KvsError::NotInitialized)));
    }

    #[test]
    fn write_read_delete_show_scenario() {
        let store = store();
        store.write(&pairs(&[("a", "1"), ("b", "2")])).unwrap();
        assert_eq!(store.read(&keys(&["b", "a"])).unwrap(), "[(a,1)(b,2)]\n");
        assert_eq!(store.delete(&keys(&["a", "c"])).unwrap(), "[(c,KVSMISSING)]\n");
        assert_eq!(store.show().unwrap(), "(b, 2)\n");
    }

    #[test]
    fn read_marks_missing_keys_only() {
        let store = store();
        store.write(&pairs(&[("x", "9")])).unwrap();
        assert_eq!(
            store.read(&keys(&["y", "x"])).unwrap(),
            "[(x,9)(y,KVSERROR)]\n"
        );
    }

    #[test]
    fn delete_of_present_keys_prints_nothing() {
        let store = store();
        store.write(&pairs(&[("a", "1"), ("b", "2")])).unwrap();
        assert_eq!(store.delete(&keys(&["a", "b"])).unwrap(), "");
        assert_eq!(store.show().unwrap(), "");
    }

    #[test]
    fn last_write_of_a_repeated_key_wins() {
        let store = store();
        store
            .write(&pairs(&[("k", "first"), ("a", "0"), ("k", "second")]))
            .unwrap();
        assert_eq!(store.read(&keys(&["k"])).unwrap(), "[(k,second)]\n");
    }

    #[test]
    fn show_walks_buckets_in_order() {
        let store = store();
        store
            .write(&pairs(&[("zeta", "z"), ("Alpha", "a"), ("1one", "1"), ("beta", "b")]))
            .unwrap();
        // "1one" shares bucket 1 with "beta" and was written first (sorted order)
        assert_eq!(
            store.show().unwrap(),
            "(Alpha, a)\n(1one, 1)\n(beta, b)\n(zeta, z)\n"
        );
    }

    #[test]
    fn keys_outside_the_table_are_rejected_per_pair() {
        let store = store();
        store.write(&pairs(&[("_bad", "x"), ("good", "y")])).unwrap();
        assert_eq!(store.show().unwrap(), "(good, y)\n");
        assert_eq!(store.read(&keys(&["_bad"])).unwrap(), "[(_bad,KVSERROR)]\n");
    }

    #[test]
    fn oversized_pairs_are_rejected_per_pair() {
        let recorder = Arc::new(Recorder::default());
        let store = KvStore::with_notifier(recorder.clone(), LIMITS);
        store.init().unwrap();

        store
            .write(&pairs(&[
                ("a", "a-value-longer-than-8"),
                ("b", "fits"),
                ("c-key-longer-than-8", "1"),
            ]))
            .unwrap();
        assert_eq!(store.show().unwrap(), "(b, fits)\n");
        assert_eq!(
            *recorder.0.lock(),
            vec![("b".to_string(), "fits".to_string())]
        );
    }

    #[test]
    fn stores_without_a_notifier_take_any_length() {
        let store = store();
        let long = "v".repeat(100);
        store.write(&pairs(&[("a", long.as_str())])).unwrap();
        assert_eq!(store.read(&keys(&["a"])).unwrap(), format!("[(a,{})]\n", long));
    }

    #[test]
    fn mutations_are_published_after_the_batch() {
        let recorder = Arc::new(Recorder::default());
        let store = KvStore::with_notifier(recorder.clone(), LIMITS);
        store.init().unwrap();

        store.write(&pairs(&[("b", "2"), ("a", "1")])).unwrap();
        store.delete(&keys(&["a", "missing"])).unwrap();

        assert_eq!(
            *recorder.0.lock(),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), DELETED_MARKER.to_string()),
            ]
        );
    }

    #[test]
    fn snapshot_matches_show() {
        let store = store();
        store.write(&pairs(&[("a", "1"), ("b", "2")])).unwrap();
        let mut sink = Vec::new();
        store.snapshot(&mut sink).unwrap();
        assert_eq!(String::from_utf8(sink).unwrap(), store.show().unwrap());
    }

    #[test]
    fn with_key_only_runs_for_present_keys() {
        let store = store();
        store.write(&pairs(&[("a", "1")])).unwrap();
        assert_eq!(store.with_key("a", || 7).unwrap(), Some(7));
        assert_eq!(store.with_key("b", || 7).unwrap(), None);
    }
}
