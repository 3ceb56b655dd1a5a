use std::sync::atomic::{AtomicBool, Ordering};

use kvs_pipes::{KvStore, KvsEngine, KvsError};
use rand::distributions::Alphanumeric;
use rand::prelude::*;
use rand::rngs::SmallRng;

fn store() -> KvStore {
    let store = KvStore::new();
    store.init().unwrap();
    store
}

fn pair(key: &str, value: &str) -> (String, String) {
    (key.to_string(), value.to_string())
}

// parses "[(a,x)(b,y)]\n" into its values
fn values(read: &str) -> Vec<String> {
    read.trim_end()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(')')
        .filter(|s| !s.is_empty())
        .map(|s| s.split_once(',').unwrap().1.to_string())
        .collect()
}

#[test]
fn readers_never_see_a_partial_batch() {
    let store = store();
    store.write(&[pair("a", "0"), pair("b", "0"), pair("c", "0")]).unwrap();
    let done = AtomicBool::new(false);
    let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];

    crossbeam_utils::thread::scope(|s| {
        for writer in 0..4 {
            let store = store.clone();
            let done = &done;
            s.spawn(move |_| {
                for i in 0..500 {
                    let v = format!("{}-{}", writer, i);
                    // keys out of order, the store sorts them
                    store.write(&[pair("c", &v), pair("a", &v), pair("b", &v)]).unwrap();
                }
                done.store(true, Ordering::SeqCst);
            });
        }
        for _ in 0..4 {
            let store = store.clone();
            let keys = keys.clone();
            let done = &done;
            s.spawn(move |_| {
                while !done.load(Ordering::SeqCst) {
                    let values = values(&store.read(&keys).unwrap());
                    assert_eq!(values.len(), 3);
                    assert!(values.iter().all(|v| *v == values[0]), "{:?}", values);
                }
            });
        }
    })
    .unwrap();
}

#[test]
fn concurrent_disjoint_writers_keep_every_key() {
    let store = store();
    crossbeam_utils::thread::scope(|s| {
        for t in 0..8u64 {
            let store = store.clone();
            s.spawn(move |_| {
                let mut rng = SmallRng::seed_from_u64(t);
                for i in 0..100 {
                    let value: String = (&mut rng)
                        .sample_iter(&Alphanumeric)
                        .take(12)
                        .map(char::from)
                        .collect();
                    let key = format!("k{}_{}", t, i);
                    store.write(&[pair(&key, &value)]).unwrap();
                    assert_eq!(
                        store.read(&[key.clone()]).unwrap(),
                        format!("[({},{})]\n", key, value)
                    );
                }
            });
        }
    })
    .unwrap();
    assert_eq!(store.show().unwrap().lines().count(), 800);
}

#[test]
fn concurrent_deletes_remove_each_key_once() {
    let store = store();
    let keys: Vec<String> = (0..50).map(|i| format!("key{}", i)).collect();
    let pairs: Vec<_> = keys.iter().map(|k| pair(k, "v")).collect();
    store.write(&pairs).unwrap();

    let missing: Vec<String> = crossbeam_utils::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let keys = keys.clone();
                s.spawn(move |_| store.delete(&keys).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
    .unwrap();

    // exactly one batch found the keys, the other three report all of them missing
    assert_eq!(missing.iter().filter(|out| out.is_empty()).count(), 1);
    assert!(missing
        .iter()
        .filter(|out| !out.is_empty())
        .all(|out| out.matches("KVSMISSING").count() == 50));
    assert_eq!(store.show().unwrap(), "");
}

#[test]
fn terminated_store_rejects_operations() {
    let store = store();
    store.write(&[pair("a", "1")]).unwrap();
    store.terminate().unwrap();
    assert!(matches!(store.show(), Err(KvsError::NotInitialized)));
    store.init().unwrap();
    assert_eq!(store.show().unwrap(), "");
}
