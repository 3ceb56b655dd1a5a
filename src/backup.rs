//! Bounded snapshot backups.
//!
//! A BACKUP command takes a [`Permit`] from the controller, blocking while `max_backups`
//! snapshots are running, then captures a snapshot of the store and hands it to the backup
//! [`ThreadPool`] that writes the `.bck` file. The permit travels with the pool job and is
//! returned when the job ends, whether it succeeds, fails or panics.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use crate::engine::KvsEngine;
use crate::sync::{Permit, Permits};
use crate::thread_pool::ThreadPool;
use crate::Result;

/// Bounds the number of concurrent backups and runs them on its own thread pool
pub struct BackupController<P: ThreadPool> {
    permits: Permits,
    pool: Arc<P>,
}

impl<P: ThreadPool> Clone for BackupController<P> {
    fn clone(&self) -> Self {
        BackupController {
            permits: self.permits.clone(),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<P: ThreadPool> BackupController<P> {
    /// creates a controller that runs at most `max_backups` snapshots at once on `pool`
    pub fn new(max_backups: usize, pool: P) -> Self {
        BackupController {
            permits: Permits::new(max_backups),
            pool: Arc::new(pool),
        }
    }

    /// takes a backup permit, blocking while `max_backups` are held
    pub fn begin_backup(&self) -> Permit {
        self.permits.acquire()
    }

    /// returns a permit taken with [`BackupController::begin_backup`]
    pub fn end_backup(&self, permit: Permit) {
        drop(permit);
    }

    /// Backs up `engine` into `<job-stem>-<seq>.bck` next to `job_path` and returns the path
    /// of the backup file.
    ///
    /// Blocks only while the concurrency bound is reached. The store contents are captured
    /// before returning, so commands issued after the BACKUP are not part of it; the file is
    /// written asynchronously on the backup pool.
    #[instrument(skip(self, engine))]
    pub fn perform_backup<E: KvsEngine>(
        &self,
        engine: &E,
        job_path: &Path,
        seq: usize,
    ) -> Result<PathBuf> {
        let permit = self.begin_backup();
        let mut dump = Vec::new();
        engine.snapshot(&mut dump)?;

        let target = backup_path(job_path, seq);
        let file = target.clone();
        self.pool.spawn(move || {
            // held until the file is written
            let _permit = permit;
            match write_backup(&file, &dump) {
                Ok(()) => info!("backup {:?} written", file),
                Err(e) => error!("backup {:?} failed: {}", file, e),
            }
        });
        debug!("backup {:?} scheduled", target);
        Ok(target)
    }

    /// blocks until no backup is running
    pub fn wait_idle(&self) {
        self.permits.wait_idle();
    }

    /// number of backups running right now
    pub fn active(&self) -> usize {
        self.permits.active()
    }

    /// highest number of backups that ever ran at the same time
    pub fn peak(&self) -> usize {
        self.permits.peak()
    }
}

fn write_backup(path: &Path, dump: &[u8]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(dump)?;
    out.flush()?;
    Ok(())
}

/// the path of backup number `seq` of the job at `job_path`: `dir/stem-seq.bck`
pub fn backup_path(job_path: &Path, seq: usize) -> PathBuf {
    let stem = job_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    job_path.with_file_name(format!("{}-{}.bck", stem, seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::KvStore;
    use crate::thread_pool::SharedQueueThreadPool;
    use std::thread;
    use std::time::Duration;

    // runs every job on its own thread after a delay, so backups overlap
    struct SlowPool;

    impl ThreadPool for SlowPool {
        fn new(_threads: u32) -> Result<Self> {
            Ok(SlowPool)
        }

        fn spawn<F>(&self, job: F)
        where
            F: FnOnce() + Send + 'static,
        {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                job();
            });
        }
    }

    // drops every job without running it
    struct DeadPool;

    impl ThreadPool for DeadPool {
        fn new(_threads: u32) -> Result<Self> {
            Ok(DeadPool)
        }

        fn spawn<F>(&self, _job: F)
        where
            F: FnOnce() + Send + 'static,
        {
        }
    }

    fn store() -> KvStore {
        let store = KvStore::new();
        store.init().unwrap();
        store
            .write(&[("a".to_string(), "1".to_string())])
            .unwrap();
        store
    }

    #[test]
    fn backup_paths_follow_the_job_name() {
        assert_eq!(
            backup_path(Path::new("/jobs/test.job"), 2),
            PathBuf::from("/jobs/test-2.bck")
        );
    }

    #[test]
    fn backup_writes_the_store_dump() {
        let dir = tempfile::tempdir().unwrap();
        let backups = BackupController::new(1, SharedQueueThreadPool::new(1).unwrap());
        let store = store();

        let path = backups
            .perform_backup(&store, &dir.path().join("job.job"), 1)
            .unwrap();
        // later writes are not part of the backup
        store
            .write(&[("b".to_string(), "2".to_string())])
            .unwrap();
        backups.wait_idle();

        assert_eq!(path, dir.path().join("job-1.bck"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "(a, 1)\n");
    }

    #[test]
    fn concurrent_backups_never_exceed_the_bound() {
        let dir = tempfile::tempdir().unwrap();
        let backups = BackupController::new(2, SlowPool);
        let store = store();

        crossbeam_utils::thread::scope(|s| {
            for seq in 1..=5 {
                let backups = backups.clone();
                let store = store.clone();
                let job = dir.path().join("job.job");
                s.spawn(move |_| backups.perform_backup(&store, &job, seq).unwrap());
            }
        })
        .unwrap();
        backups.wait_idle();

        assert!(backups.peak() <= 2);
        assert_eq!(backups.active(), 0);
        for seq in 1..=5 {
            assert!(dir.path().join(format!("job-{}.bck", seq)).exists());
        }
    }

    #[test]
    fn permit_is_returned_when_the_job_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let backups = BackupController::new(1, DeadPool);
        let store = store();
        let job = dir.path().join("job.job");

        backups.perform_backup(&store, &job, 1).unwrap();
        backups.perform_backup(&store, &job, 2).unwrap();
        assert_eq!(backups.active(), 0);
    }

    #[test]
    fn failed_snapshot_returns_the_permit() {
        let backups = BackupController::new(1, SharedQueueThreadPool::new(1).unwrap());
        let store = KvStore::new();
        assert!(backups
            .perform_backup(&store, Path::new("job.job"), 1)
            .is_err());
        assert_eq!(backups.active(), 0);
    }
}
