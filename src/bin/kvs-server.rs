//! this binary starts the kvs server
//! to see the list of commands, type: `kvs-server --help`
//!
//! `kvs-server <JOBS_DIR> <MAX_THREADS> <MAX_BACKUPS> [REGISTER_PIPE]`
//!
//!     Runs every `.job` file of JOBS_DIR on MAX_THREADS workers, with at most MAX_BACKUPS
//!     concurrent backups. Without REGISTER_PIPE the server exits once the jobs are done.
//!     With it, clients can register on that pipe until SIGINT or SIGTERM; SIGUSR1
//!     disconnects every client.

use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::thread;

use clap::{arg_enum, crate_version, value_t, App, Arg, ArgMatches};
use kvs_pipes::{
    BackupController, JobRunner, JobWorkerPool, KvStore, KvsError, KvsServer, RayonThreadPool,
    Result, ServerConfig, ServerHandle, SharedQueueThreadPool, SubscriptionTable, ThreadPool,
};
use nix::sys::signal::{SigSet, Signal};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

arg_enum! {
    #[allow(non_camel_case_types)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    enum BackupPool {
        shared,
        rayon
    }
}

const DEFAULT_BACKUP_POOL: BackupPool = BackupPool::shared;
const DEFAULT_LOG_LEVEL: Level = Level::INFO;

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    jobs_dir: PathBuf,
    register_pipe: Option<PathBuf>,
    backup_pool: BackupPool,
    config: ServerConfig,
}

impl Opt {
    /// validates the command line and merges it over the configuration file, if any
    /// # Errors
    /// returns [`KvsError::Parsing`] if one of the parameters is invalid
    fn build(matches: &ArgMatches) -> Result<Opt> {
        let jobs_dir = PathBuf::from(matches.value_of("JOBS_DIR").unwrap_or_default());
        if !jobs_dir.is_dir() {
            return Err(KvsError::Parsing(format!("{:?} is not a directory", jobs_dir)));
        }

        let mut config = match matches.value_of("config") {
            Some(path) => ServerConfig::from_file(Path::new(path))?,
            None => ServerConfig::default(),
        };
        config.max_threads = parse_count(matches, "MAX_THREADS")?;
        config.max_backups = parse_count(matches, "MAX_BACKUPS")?;
        if matches.is_present("max-sessions") {
            config.max_sessions = parse_count(matches, "max-sessions")?;
        }
        config.validate()?;

        Ok(Opt {
            jobs_dir,
            register_pipe: matches.value_of("REGISTER_PIPE").map(PathBuf::from),
            backup_pool: value_t!(matches, "backup-pool", BackupPool).unwrap_or(DEFAULT_BACKUP_POOL),
            config,
        })
    }
}

fn parse_count(matches: &ArgMatches, name: &str) -> Result<usize> {
    value_t!(matches, name, usize)
        .map_err(|_| KvsError::Parsing(format!("{} must be a positive integer", name)))
}

fn main() {
    let matches = App::new("kvs-server")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("a multi-threaded key-value store served over named pipes")
        .arg(Arg::with_name("JOBS_DIR")
            .required(true)
            .index(1)
            .help("directory holding the .job files to run"))
        .arg(Arg::with_name("MAX_THREADS")
            .required(true)
            .index(2)
            .help("number of job worker threads"))
        .arg(Arg::with_name("MAX_BACKUPS")
            .required(true)
            .index(3)
            .help("maximum number of backups running at the same time"))
        .arg(Arg::with_name("REGISTER_PIPE")
            .index(4)
            .help("path of the registration pipe clients connect through"))
        .arg(Arg::with_name("config")
            .long("config")
            .value_name("FILE")
            .help("JSON file with the capacity limits"))
        .arg(Arg::with_name("max-sessions")
            .long("max-sessions")
            .value_name("N")
            .help("maximum number of connected clients"))
        .arg(Arg::with_name("backup-pool")
            .long("backup-pool")
            .value_name("POOL")
            .possible_values(&BackupPool::variants())
            .case_insensitive(true)
            .help("thread pool running the backups")
            .default_value("shared"))
        .arg(Arg::with_name("log-level")
            .long("log-level")
            .value_name("LEVEL")
            .help("maximum level of the log messages written to stderr")
            .default_value("info"))
        .get_matches();

    // set up a tracing subscriber to log to STDERR
    subscriber_config(value_t!(matches, "log-level", Level).unwrap_or(DEFAULT_LOG_LEVEL));

    let opt = match Opt::build(&matches) {
        Ok(opt) => opt,
        Err(err) => {
            eprintln!("{}", err);
            exit(1);
        }
    };

    if let Err(e) = run(opt) {
        eprintln!("{}", e);
        exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    info!("kvs-server {}", env!("CARGO_PKG_VERSION"));
    info!("Jobs directory: {:?}", opt.jobs_dir);
    info!("Backup pool: {}", opt.backup_pool);

    let threads = opt.config.max_backups as u32;
    match opt.backup_pool {
        BackupPool::shared => run_with_pool(SharedQueueThreadPool::new(threads)?, opt),
        BackupPool::rayon => run_with_pool(RayonThreadPool::new(threads)?, opt),
    }
}

fn run_with_pool<P: ThreadPool>(pool: P, opt: Opt) -> Result<()> {
    let config = opt.config;
    // the signal mask is inherited by every thread spawned from here on
    let signals = match &opt.register_pipe {
        Some(_) => Some(block_signals()?),
        None => None,
    };

    let subscriptions = SubscriptionTable::new(config.max_sessions, config.limits());
    let store = KvStore::with_notifier(Arc::new(subscriptions.clone()), config.limits());
    store.init()?;

    let backups = BackupController::new(config.max_backups, pool);
    let runner = JobRunner::new(store.clone(), backups.clone(), config.max_string_len);
    let workers = JobWorkerPool::new(config.max_threads, move |job: &Path| runner.run(job))?;
    workers.add_jobs_from_dir(&opt.jobs_dir)?;

    if let (Some(register_pipe), Some(signals)) = (opt.register_pipe, signals) {
        let server = KvsServer::bind(config, store.clone(), subscriptions, register_pipe)?;
        let handle = server.handle();
        thread::Builder::new()
            .name("kvs-signals".into())
            .spawn(move || handle_signals(signals, handle))?;
        server.run()?;
        server.shutdown()?;
    }

    workers.destroy();
    backups.wait_idle();
    store.terminate()?;
    info!("all jobs done");
    Ok(())
}

fn block_signals() -> Result<SigSet> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGUSR1);
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block()?;
    Ok(signals)
}

/// SIGUSR1 evicts every client, SIGINT and SIGTERM stop the listener
fn handle_signals(signals: SigSet, server: ServerHandle) {
    loop {
        match signals.wait() {
            Ok(Signal::SIGUSR1) => server.evict_all(),
            Ok(signal) => {
                info!("received {}, shutting down", signal);
                server.stop();
                return;
            }
            Err(e) => {
                error!("cannot wait for signals: {}", e);
                return;
            }
        }
    }
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config(level: Level) {
    let subscriber = FmtSubscriber::builder()
        // spans/events up to `level` are written
        .with_max_level(level)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        // completes the builder.
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting tracing default subscriber failed: {}", e);
    }
}
