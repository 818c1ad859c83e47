//! Purpose: `relaybuf` CLI entry point.
//! Role: Binary crate root; parses args, wires the reader and delivery threads, handles signals.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Only the reader is cancelled by signals; delivery drains until end of input.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use clap::{ArgAction, Parser, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use tracing_subscriber::EnvFilter;

mod pidfile;

use pidfile::Pidfile;
use relaybuf::api::{
    open_destination, open_source, to_exit_code, Backlog, DeliveryConfig, DeliveryEngine,
    Endpoint, Entry, Error, ErrorKind, Multiplexer, RecordQueue, ShutdownToken,
    DEFAULT_CAPACITY,
};

#[derive(Parser, Debug)]
#[command(
    name = "relaybuf",
    version,
    about = "Relay newline-delimited records from many sources to one destination",
    long_about = "Relay newline-delimited records from many sources to one destination.\n\
                  While the destination is unavailable, records are spooled to an on-disk \
                  backlog and replayed in order once it recovers."
)]
struct Cli {
    /// Input endpoint: file:PATH (- for stdin), tcp:[HOST:]PORT, udp:[HOST:]PORT, unix:PATH.
    #[arg(short = 's', long = "source", value_name = "KIND:RES", required = true)]
    sources: Vec<Endpoint>,
    /// Output endpoint: file:PATH (- for stdout), tcp:HOST:PORT, udp:HOST:PORT, unix:PATH.
    #[arg(short = 'd', long = "dest", value_name = "KIND:RES")]
    dest: Endpoint,
    /// Spool file used while the destination is down.
    #[arg(short = 'b', long, value_name = "PATH", default_value = "relaybuf.backlog")]
    backlog: PathBuf,
    /// Refuse to start if another instance holds this pidfile.
    #[arg(short = 'p', long, value_name = "PATH")]
    pidfile: Option<PathBuf>,
    /// Longest record accepted from a source, newline included.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_CAPACITY)]
    max_record_bytes: usize,
    /// Failed attempts per record before spooling to the backlog.
    #[arg(long, value_name = "N", default_value_t = 3)]
    retry: u32,
    /// How long a connected destination may stay unwritable.
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    send_timeout_secs: u64,
    /// Wait between connection attempts.
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    idle_wait_secs: u64,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

/// Everything the pipeline needs, resolved from the command line.
#[derive(Clone, Debug)]
struct RelayConfig {
    sources: Vec<Endpoint>,
    dest: Endpoint,
    backlog: PathBuf,
    pidfile: Option<PathBuf>,
    max_record_bytes: usize,
    delivery: DeliveryConfig,
}

impl RelayConfig {
    fn from_cli(cli: Cli) -> Result<Self, Error> {
        if cli.max_record_bytes < 2 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("--max-record-bytes must be at least 2")
                .with_hint("A record needs room for at least one byte and its newline."));
        }
        if cli.retry == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("--retry must be at least 1"));
        }
        Ok(Self {
            sources: cli.sources,
            dest: cli.dest,
            backlog: cli.backlog,
            pidfile: cli.pidfile,
            max_record_bytes: cli.max_record_bytes,
            delivery: DeliveryConfig {
                retry: cli.retry,
                send_timeout: Duration::from_secs(cli.send_timeout_secs),
                idle_wait: Duration::from_secs(cli.idle_wait_secs),
            },
        })
    }
}

fn main() {
    let exit_code = match run(std::env::args_os()) {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run<I>(args: I) -> Result<i32, Error>
where
    I: IntoIterator<Item = OsString>,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(exit_code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `relaybuf --help`."));
            }
        },
    };

    init_tracing(cli.verbose);
    let config = RelayConfig::from_cli(cli)?;
    let _pidfile = config
        .pidfile
        .as_deref()
        .map(Pidfile::acquire)
        .transpose()?;

    relay(config).map_err(add_io_hint)?;
    Ok(0)
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn relay(config: RelayConfig) -> Result<(), Error> {
    let queue = Arc::new(RecordQueue::new());
    let token = ShutdownToken::new();

    let dest = open_destination(&config.dest)?;
    let engine = DeliveryEngine::new(
        Arc::clone(&queue),
        dest,
        Backlog::new(&config.backlog),
        config.delivery,
    )?;

    let mut mux = Multiplexer::new(Arc::clone(&queue), token.clone());
    for endpoint in &config.sources {
        let source = open_source(endpoint, config.max_record_bytes)?;
        if !mux.add_source(source) {
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("source {endpoint} has no usable descriptor")));
        }
    }
    tracing::info!(
        sources = mux.len(),
        dest = %config.dest,
        backlog = %config.backlog.display(),
        "relay starting"
    );

    let (signal_handle, signal_thread) = spawn_signal_listener(token.clone())?;
    let reader = spawn_named("reader", move || mux.run())?;
    let delivery = match spawn_named("delivery", move || engine.run()) {
        Ok(delivery) => delivery,
        Err(err) => {
            token.cancel();
            let _ = reader.join();
            signal_handle.close();
            let _ = signal_thread.join();
            return Err(err);
        }
    };

    let reader_result = reader.join();
    if reader_result.is_err() {
        // The delivery loop only stops at end of input.
        queue.push(Entry::EndOfInput);
    }
    let delivery_result = delivery.join();
    signal_handle.close();
    let _ = signal_thread.join();

    if reader_result.is_err() {
        return Err(Error::new(ErrorKind::Internal).with_message("reader thread panicked"));
    }
    if delivery_result.is_err() {
        return Err(Error::new(ErrorKind::Internal).with_message("delivery thread panicked"));
    }
    Ok(())
}

fn spawn_named<T, F>(name: &str, body: F) -> Result<JoinHandle<T>, Error>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message(format!("failed to start {name} thread"))
                .with_source(err)
        })
}

// SIGTERM and SIGINT stop the reader; SIGHUP is only acknowledged.
fn spawn_signal_listener(token: ShutdownToken) -> Result<(Handle, JoinHandle<()>), Error> {
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP]).map_err(|err| {
        Error::from_io(err).with_message("failed to install signal handlers")
    })?;
    let handle = signals.handle();
    let listener = spawn_named("signals", move || {
        for signal in signals.forever() {
            match signal {
                SIGHUP => tracing::info!("SIGHUP received, ignoring"),
                _ => {
                    tracing::info!(signal, "shutdown signal received");
                    token.cancel();
                }
            }
        }
    })?;
    Ok((handle, listener))
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => {
            err.with_hint("Permission denied. Check file modes, or pick a port above 1024.")
        }
        ErrorKind::Busy => err.with_hint("Address or file already in use by another process."),
        ErrorKind::NotFound => err.with_hint("Check that the path exists and the host resolves."),
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        _ => err,
    }
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{error_json, run, Cli, RelayConfig};
    use clap::Parser;
    use relaybuf::api::{Error, ErrorKind, TransportKind};
    use std::ffi::OsString;
    use std::time::Duration;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cli = Cli::try_parse_from(args(&["relaybuf", "-s", "file:-", "-d", "tcp:127.0.0.1:514"]))
            .expect("parse");
        let config = RelayConfig::from_cli(cli).expect("config");
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.dest.kind, TransportKind::Tcp);
        assert_eq!(config.backlog.to_str(), Some("relaybuf.backlog"));
        assert_eq!(config.max_record_bytes, 1_000_000);
        assert_eq!(config.delivery.retry, 3);
        assert_eq!(config.delivery.send_timeout, Duration::from_secs(30));
        assert_eq!(config.delivery.idle_wait, Duration::from_secs(5));
        assert!(config.pidfile.is_none());
    }

    #[test]
    fn sources_repeat_and_verbosity_counts() {
        let cli = Cli::try_parse_from(args(&[
            "relaybuf", "-s", "udp:5140", "--source", "TCP:5141", "-d", "file:-", "-vv",
        ]))
        .expect("parse");
        assert_eq!(cli.verbose, 2);
        let kinds: Vec<_> = cli.sources.iter().map(|source| source.kind).collect();
        assert_eq!(kinds, vec![TransportKind::Udp, TransportKind::Tcp]);
    }

    #[test]
    fn missing_source_is_usage_error() {
        let err = run(args(&["relaybuf", "-d", "file:-"])).expect_err("usage");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(err.hint().is_some());
    }

    #[test]
    fn bad_endpoint_kind_is_usage_error() {
        let err = run(args(&["relaybuf", "-s", "pipe:x", "-d", "file:-"])).expect_err("usage");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn zero_retry_is_rejected() {
        let cli = Cli::try_parse_from(args(&[
            "relaybuf", "-s", "file:-", "-d", "file:-", "--retry", "0",
        ]))
        .expect("parse");
        let err = RelayConfig::from_cli(cli).expect_err("retry");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn error_json_shape() {
        let err = Error::new(ErrorKind::Busy)
            .with_message("pidfile held")
            .with_path("/run/relaybuf.pid")
            .with_source(std::io::Error::other("locked"));
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Busy");
        assert_eq!(value["error"]["message"], "pidfile held");
        assert_eq!(value["error"]["path"], "/run/relaybuf.pid");
        assert_eq!(value["error"]["causes"][0], "locked");
        assert!(value["error"].get("hint").is_none());
    }
}
