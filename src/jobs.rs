//! Job files and the worker pool that runs them.
//!
//! A job is a text file of [`Command`]s with the `.job` extension. Its results go to the
//! file with the same stem and the `.out` extension. Job paths are pushed on a [`JobQueue`]
//! and popped by a fixed number of worker threads.
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

use crate::backup::BackupController;
use crate::command::{Command, CommandReader, HELP_TEXT};
use crate::engine::KvsEngine;
use crate::thread_pool::ThreadPool;
use crate::{KvsError, Result};

/// extension of the job files picked up from a jobs directory
pub const JOB_EXTENSION: &str = "job";
/// extension of the output file written for every job
pub const OUT_EXTENSION: &str = "out";

/// FIFO of pending job paths.
///
/// After [`JobQueue::drain`], pushes fail and [`JobQueue::pop`] returns the remaining jobs,
/// then `None` to every caller.
#[derive(Debug)]
pub struct JobQueue {
    tx: Mutex<Option<Sender<PathBuf>>>,
    rx: Receiver<PathBuf>,
}

impl JobQueue {
    /// creates an empty queue
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        JobQueue {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// enqueues a job
    ///
    /// # Errors
    /// returns [`KvsError::StringErr`] once the queue is draining
    pub fn push(&self, path: PathBuf) -> Result<()> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx
                .send(path)
                .map_err(|e| KvsError::StringErr(format!("job queue closed: {:?}", e.0))),
            None => Err(KvsError::StringErr(format!(
                "job queue is draining, {:?} was not queued",
                path
            ))),
        }
    }

    /// blocks until a job is available. Returns `None` once the queue is draining and empty.
    pub fn pop(&self) -> Option<PathBuf> {
        self.rx.recv().ok()
    }

    /// stops accepting jobs and wakes every blocked [`JobQueue::pop`] once the queue is empty
    pub fn drain(&self) {
        self.tx.lock().take();
    }

    /// whether [`JobQueue::drain`] was called
    pub fn is_draining(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// number of jobs waiting
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// whether no job is waiting
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

type RunJob = dyn Fn(&Path) -> Result<()> + Send + Sync;

/// A fixed number of worker threads that run the jobs pushed on a shared [`JobQueue`].
///
/// A worker that panics while running a job is replaced by a fresh one, so the pool keeps
/// its size.
pub struct JobWorkerPool {
    queue: Arc<JobQueue>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl JobWorkerPool {
    /// spawns `threads` workers, each calling `run_job` for every job it pops
    pub fn new<F>(threads: usize, run_job: F) -> Result<Self>
    where
        F: Fn(&Path) -> Result<()> + Send + Sync + 'static,
    {
        let pool = JobWorkerPool {
            queue: Arc::new(JobQueue::new()),
            handles: Arc::new(Mutex::new(Vec::with_capacity(threads))),
        };
        let run_job: Arc<RunJob> = Arc::new(run_job);
        for _ in 0..threads {
            let worker = Worker {
                queue: Arc::clone(&pool.queue),
                run_job: Arc::clone(&run_job),
                handles: Arc::clone(&pool.handles),
            };
            let handle = worker.spawn()?;
            pool.handles.lock().push(handle);
        }
        info!("started {} job workers", threads);
        Ok(pool)
    }

    /// enqueues a job file
    pub fn add_job(&self, path: PathBuf) -> Result<()> {
        debug!("queueing job {:?}", path);
        self.queue.push(path)
    }

    /// enqueues every `.job` file directly inside `dir`, in path order. Returns the number of
    /// jobs queued.
    pub fn add_jobs_from_dir(&self, dir: &Path) -> Result<usize> {
        let jobs = job_files(dir)?;
        let count = jobs.len();
        for job in jobs {
            self.add_job(job)?;
        }
        info!("queued {} jobs from {:?}", count, dir);
        Ok(count)
    }

    /// the queue the workers pop from
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// drains the queue and waits for every worker to finish its last job
    pub fn destroy(self) {
        self.queue.drain();
        loop {
            // not held while joining: a panicking worker pushes its replacement
            let handle = self.handles.lock().pop();
            match handle {
                Some(handle) => {
                    if handle.join().is_err() {
                        debug!("joined a worker that panicked");
                    }
                }
                None => break,
            }
        }
        info!("job workers stopped");
    }
}

/// lists the `.job` files directly inside `dir`, sorted
pub fn job_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut jobs = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| KvsError::StringErr(format!("cannot scan {:?}: {}", dir, e)))?;
        let is_job = entry.path().extension().map_or(false, |ext| ext == JOB_EXTENSION);
        if entry.file_type().is_file() && is_job {
            jobs.push(entry.into_path());
        }
    }
    jobs.sort();
    Ok(jobs)
}

struct Worker {
    queue: Arc<JobQueue>,
    run_job: Arc<RunJob>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Worker {
    fn spawn(self) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("kvs-job-worker".into())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    fn run(&self) {
        while let Some(job) = self.queue.pop() {
            if let Err(e) = (self.run_job)(&job) {
                error!("job {:?} failed: {}", job, e);
            }
        }
        debug!("job queue drained, worker exiting");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if thread::panicking() {
            warn!("job worker panicked, starting a new one");
            let replacement = Worker {
                queue: Arc::clone(&self.queue),
                run_job: Arc::clone(&self.run_job),
                handles: Arc::clone(&self.handles),
            };
            match replacement.spawn() {
                Ok(handle) => self.handles.lock().push(handle),
                Err(e) => error!("Failed to spawn a job worker: {}", e),
            }
        }
    }
}

/// the path of the output file of the job at `job_path`
pub fn out_path(job_path: &Path) -> PathBuf {
    job_path.with_extension(OUT_EXTENSION)
}

/// Executes the commands of one job file against a store
pub struct JobRunner<E: KvsEngine, P: ThreadPool> {
    engine: E,
    backups: BackupController<P>,
    max_string_len: usize,
}

impl<E: KvsEngine, P: ThreadPool> Clone for JobRunner<E, P> {
    fn clone(&self) -> Self {
        JobRunner {
            engine: self.engine.clone(),
            backups: self.backups.clone(),
            max_string_len: self.max_string_len,
        }
    }
}

impl<E: KvsEngine, P: ThreadPool> JobRunner<E, P> {
    /// creates a runner over `engine`. Keys and values longer than `max_string_len` make a
    /// command invalid.
    pub fn new(engine: E, backups: BackupController<P>, max_string_len: usize) -> Self {
        JobRunner {
            engine,
            backups,
            max_string_len,
        }
    }

    /// the backup controller used by BACKUP
    pub fn backups(&self) -> &BackupController<P> {
        &self.backups
    }

    /// runs the job at `job_path`, writing its results to the matching `.out` file
    ///
    /// # Errors
    /// fails if the job cannot be read or its output file cannot be written. Errors of a
    /// single command are logged and the job continues.
    #[instrument(skip(self))]
    pub fn run(&self, job_path: &Path) -> Result<()> {
        let job = BufReader::new(File::open(job_path)?);
        let mut out = BufWriter::new(File::create(out_path(job_path))?);
        self.execute(job, &mut out, job_path)?;
        out.flush()?;
        info!("job {:?} done", job_path);
        Ok(())
    }

    /// executes every command read from `job`, writing results to `out`. `job_path` names
    /// the backup files.
    pub fn execute<R: BufRead, W: Write>(
        &self,
        job: R,
        out: &mut W,
        job_path: &Path,
    ) -> Result<()> {
        let mut backup_seq = 0;
        let mut commands = CommandReader::new(job, self.max_string_len);
        while let Some(command) = commands.next() {
            let line = commands.line_no();
            match command? {
                Command::Write(pairs) => {
                    if let Err(e) = self.engine.write(&pairs) {
                        warn!(line, "failed to write pairs: {}", e);
                    }
                }
                Command::Read(keys) => match self.engine.read(&keys) {
                    Ok(result) => out.write_all(result.as_bytes())?,
                    Err(e) => warn!(line, "failed to read keys: {}", e),
                },
                Command::Delete(keys) => match self.engine.delete(&keys) {
                    Ok(result) => out.write_all(result.as_bytes())?,
                    Err(e) => warn!(line, "failed to delete keys: {}", e),
                },
                Command::Show => match self.engine.show() {
                    Ok(result) => out.write_all(result.as_bytes())?,
                    Err(e) => warn!(line, "failed to show the store: {}", e),
                },
                Command::Wait(delay) => {
                    if delay > 0 {
                        debug!(line, "waiting {} ms", delay);
                        thread::sleep(Duration::from_millis(delay));
                    }
                }
                Command::Backup => {
                    backup_seq += 1;
                    if let Err(e) = self.backups.perform_backup(&self.engine, job_path, backup_seq)
                    {
                        error!(line, "failed to perform backup {}: {}", backup_seq, e);
                    }
                }
                Command::Help => out.write_all(HELP_TEXT.as_bytes())?,
                Command::Empty => {}
                Command::Invalid(reason) => {
                    warn!(line, "invalid command, see HELP for usage: {}", reason)
                }
            }
        }
        Ok(())
    }
}
