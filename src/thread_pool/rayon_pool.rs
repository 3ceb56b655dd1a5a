use crate::thread_pool::ThreadPool;
use crate::{KvsError, Result};
use tracing::{debug, error};

/// A thread pool that uses a work stealing strategy as implemented by the [`Rayon`] library.
///
/// A panicking job is reported through the pool's panic handler instead of aborting the
/// process.
///
/// [`Rayon`]: https://docs.rs/rayon/latest/rayon/index.html
pub struct RayonThreadPool {
    pool: rayon::ThreadPool,
}

impl ThreadPool for RayonThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads as usize)
            .thread_name(|i| format!("kvs-backup-{}", i))
            .panic_handler(|_| error!("a backup job panicked"))
            .build()
            .map_err(|e| KvsError::StringErr(format!("could not build thread pool: {:?}", &e)))?;
        debug!("created rayon backup pool with {} threads", &threads);

        Ok(Self { pool })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(job);
    }
}
