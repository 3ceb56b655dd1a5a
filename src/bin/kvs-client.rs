//! The kvs-client executable supports the following command line arguments:
//!
//! `kvs-client <CLIENT_ID> <REGISTER_PIPE> [--pipe-dir DIR]`
//!
//!     Creates the pipes DIR/req<CLIENT_ID>, DIR/resp<CLIENT_ID> and DIR/notif<CLIENT_ID>
//!     (DIR defaults to /tmp), registers them on REGISTER_PIPE, then reads commands from
//!     stdin, one per line:
//!
//!     SUBSCRIBE [key]
//!     UNSUBSCRIBE [key]
//!     DELAY <ms>
//!     DISCONNECT
//!
//!     Every notification received is printed to stdout as `(key,value)`.
//!
//! `kvs-client -V`
//!
//!     Print the version.

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg};
use kvs_pipes::{KvsClient, KvsError, Result, ServerConfig};
use tracing::{error, warn, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_PIPE_DIR: &str = "/tmp";

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    client_id: String,
    register_pipe: PathBuf,
    pipe_dir: PathBuf,
    config: ServerConfig,
}

/// a line read from stdin
#[derive(Debug, PartialEq, Eq)]
enum ClientCommand {
    Subscribe(String),
    Unsubscribe(String),
    Delay(u64),
    Disconnect,
}

impl ClientCommand {
    fn parse(line: &str) -> Result<Option<ClientCommand>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let (word, args) = match line.split_once(char::is_whitespace) {
            Some((word, args)) => (word, args.trim()),
            None => (line, ""),
        };
        let invalid = || KvsError::Parsing(format!("invalid command {:?}", line));
        let key = || {
            args.strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .ok_or_else(invalid)
        };
        let command = match word {
            "SUBSCRIBE" => ClientCommand::Subscribe(key()?),
            "UNSUBSCRIBE" => ClientCommand::Unsubscribe(key()?),
            "DELAY" => ClientCommand::Delay(args.parse().map_err(|_| invalid())?),
            "DISCONNECT" => ClientCommand::Disconnect,
            _ => return Err(invalid()),
        };
        Ok(Some(command))
    }
}

fn main() {
    let matches = App::new("kvs-client")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("subscribes to keys of a kvs-server and prints their changes")
        .arg(Arg::with_name("CLIENT_ID").required(true).index(1))
        .arg(Arg::with_name("REGISTER_PIPE").required(true).index(2))
        .arg(Arg::with_name("pipe-dir")
            .long("pipe-dir")
            .value_name("DIR")
            .help("directory the client pipes are created in")
            .default_value(DEFAULT_PIPE_DIR))
        .arg(Arg::with_name("config")
            .long("config")
            .value_name("FILE")
            .help("JSON file with the limits the server runs with"))
        .arg(Arg::with_name("log-level")
            .long("log-level")
            .value_name("LEVEL")
            .default_value("warn"))
        .get_matches();

    // configure a subscriber that will log messages to STDERR
    subscriber_config(value_t!(matches, "log-level", Level).unwrap_or(Level::WARN));

    let config = match matches.value_of("config") {
        Some(path) => ServerConfig::from_file(Path::new(path)),
        None => Ok(ServerConfig::default()),
    };
    let opt = config.map(|config| Opt {
        client_id: matches.value_of("CLIENT_ID").unwrap_or_default().to_string(),
        register_pipe: PathBuf::from(matches.value_of("REGISTER_PIPE").unwrap_or_default()),
        pipe_dir: PathBuf::from(matches.value_of("pipe-dir").unwrap_or(DEFAULT_PIPE_DIR)),
        config,
    });

    if let Err(e) = opt.and_then(run) {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

/// connects to the server and runs the commands read from stdin
fn run(opt: Opt) -> Result<()> {
    let pipes = KvsClient::pipes_for(&opt.pipe_dir, &opt.client_id);
    let mut client = KvsClient::connect(&opt.register_pipe, pipes, opt.config.limits())?;
    println!("Server returned 0 for operation: connect");

    let printer = client.notifications().map(|notifications| {
        thread::spawn(move || {
            for notification in notifications {
                match notification {
                    Ok((key, value)) => println!("({},{})", key, value),
                    Err(e) => {
                        warn!("bad notification: {}", e);
                        break;
                    }
                }
            }
        })
    });

    let stdin = io::stdin();
    let mut disconnected = false;
    for line in stdin.lock().lines() {
        let command = match ClientCommand::parse(&line?) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        match command {
            ClientCommand::Subscribe(key) => report("subscribe", client.subscribe(&key)?),
            ClientCommand::Unsubscribe(key) => report("unsubscribe", client.unsubscribe(&key)?),
            ClientCommand::Delay(ms) => thread::sleep(Duration::from_millis(ms)),
            ClientCommand::Disconnect => {
                disconnected = true;
                break;
            }
        }
    }

    // end of input also ends the session
    if !disconnected {
        warn!("stdin closed, disconnecting");
    }
    client.disconnect()?;
    println!("Server returned 0 for operation: disconnect");
    if let Some(printer) = printer {
        if printer.join().is_err() {
            error!("the notification thread panicked");
        }
    }
    Ok(())
}

fn report(operation: &str, ok: bool) {
    println!(
        "Server returned {} for operation: {}",
        if ok { 0 } else { 1 },
        operation
    );
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting tracing default subscriber failed: {}", e);
    }
}
