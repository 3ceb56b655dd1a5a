use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, instrument};

use crate::thread_pool::ThreadPool;
use crate::Result;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A thread pool implemented with a shared job queue (i.e. channel).
///
/// This implementation uses the MPMC [`channel`] provided by the crossbeam crate as a single
/// producer, multiple consumer queue. The single producer is this type itself, and the
/// threads in the pool are the consumers. Dropping the pool closes the channel; every thread
/// exits once the queued tasks have run.
///
/// If a spawned task panics, the old thread will be destroyed and a new one will be
/// created. A failure to create the replacement thread at the OS level is only logged, so
/// the number of threads in the pool can decrease.
///
/// [`channel`]: https://docs.rs/crossbeam/0.8.1/crossbeam/channel/index.html
pub struct SharedQueueThreadPool {
    /// the sending part of the channel
    tx: Sender<Task>,
}

impl ThreadPool for SharedQueueThreadPool {
    /// create a new thread pool with the given number of `threads`.
    /// Every thread created will have a handle to the receiving end of the channel
    fn new(threads: u32) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Task>();
        for i in 0..threads {
            let task_rx = TaskReceiver(rx.clone());
            thread::Builder::new()
                .name(format!("kvs-backup-{}", i))
                .spawn(move || run_tasks(task_rx))?;
        }
        debug!("created shared queue backup pool with {} threads", threads);
        Ok(SharedQueueThreadPool { tx })
    }

    /// Spawns a function into the thread pool. The function is dropped, with an error
    /// logged, if every thread of the pool has died.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            error!("there are no threads left in the backup pool");
        }
    }
}

/// A type that can receive tasks (i.e. closures) from a channel and run them.
/// Additionally, this type is responsible for restarting any threads that panicked
#[derive(Clone)]
struct TaskReceiver(Receiver<Task>);

impl std::fmt::Debug for TaskReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskReceiver")
            .field("pending", &self.0.len())
            .finish()
    }
}

impl Drop for TaskReceiver {
    fn drop(&mut self) {
        if thread::panicking() {
            debug!("thread panicked, starting a new thread");
            let task_rx = self.clone();
            if let Err(e) = thread::Builder::new()
                .name("kvs-backup-respawned".into())
                .spawn(move || run_tasks(task_rx))
            {
                error!("Failed to spawn a thread: {}", e);
            }
        }
    }
}

/// waits for a task to arrive on its (wrapped) receiver, and then runs the task. Returns
/// once the pool is dropped.
#[instrument]
fn run_tasks(rx: TaskReceiver) {
    while let Ok(task) = rx.0.recv() {
        debug!("received a new task");
        task();
    }
    debug!("Thread exited because the thread pool was destroyed.");
}
