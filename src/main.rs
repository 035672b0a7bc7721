use slog::o;
use slog::Drain;
use std::env;
use std::sync::{Arc, Mutex};

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

/// Build a string error from a format string, for use with `map_err`/`ok_or_else`
#[macro_export]
macro_rules! se {
    ($($arg:tt)*) => {{
        format!($($arg)*)
    }};
}

/// Build a json `tide::Response`
///
/// - `resp!(json => value)` 200 with `value` serialized as the body
/// - `resp!(status => code, json => value)`
/// - `resp!(status => code, message => msg)` error body `{"error": msg}`
#[macro_export]
macro_rules! resp {
    (json => $obj:expr) => {{
        let body = tide::Body::from_json(&$obj)?;
        tide::Response::builder(200).body(body).build()
    }};
    (status => $status:expr, json => $obj:expr) => {{
        let body = tide::Body::from_json(&$obj)?;
        tide::Response::builder($status).body(body).build()
    }};
    (status => $status:expr, message => $msg:expr) => {{
        tide::Response::builder($status)
            .body(serde_json::json!({ "error": $msg }))
            .build()
    }};
}

// modules come after the macros above so they are in textual scope
mod config;
mod ideas;
mod logging;
mod service;
mod spotify;
mod storage;
mod token;

#[cfg(test)]
mod testing;

use config::Config;

pub fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

/// Root logger behind an async drain, plus the guard that flushes it on drop
fn async_logger<D>(drain: D, level: slog::Level) -> (slog::Logger, slog_async::AsyncGuard)
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    // records logged after the guard is dropped are discarded
    let drain = slog::LevelFilter::new(drain.ignore_res(), level).fuse();
    (slog::Logger::root(drain, o!()), guard)
}

lazy_static::lazy_static! {
    static ref LOG_GUARD: Mutex<Option<slog_async::AsyncGuard>> = Mutex::new(None);

    // The "base" logger that all modules should branch off of
    pub static ref BASE_LOG: slog::Logger = {
        let level: slog::Level = env_or("LOG_LEVEL", "INFO")
                .parse()
                .unwrap_or(slog::Level::Info);
        let format = env_or("LOG_FORMAT", "json").to_lowercase();
        let (logger, guard) = if format.trim() == "pretty" {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::CompactFormat::new(decorator).build().fuse();
            async_logger(drain, level)
        } else {
            let drain = slog_json::Json::default(std::io::stderr()).fuse();
            async_logger(drain, level)
        };
        match LOG_GUARD.lock() {
            Ok(mut slot) => *slot = Some(guard),
            Err(poisoned) => *poisoned.into_inner() = Some(guard),
        }
        logger
    };

    // Base logger
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "website-backend"));
}

/// Write out everything still queued in the async log drain.
/// Call before the process exits.
fn flush_logs() {
    let guard = match LOG_GUARD.lock() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    drop(guard);
}

/// Resolves once SIGINT or SIGTERM has been delivered to the process
async fn termination_signal() -> anyhow::Result<()> {
    let (tx, rx) = async_std::channel::bounded::<()>(1);
    ctrlc2::set_handler(move || {
        tx.try_send(()).ok();
        true
    })
    .map_err(|e| anyhow::anyhow!("error installing signal handler {}", e))?;
    rx.recv()
        .await
        .map_err(|e| anyhow::anyhow!("signal channel closed {}", e))?;
    Ok(())
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    // try sourcing a .env if it exists
    dotenv::dotenv().ok();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            slog::crit!(LOG, "invalid configuration, refusing to start"; "error" => %e);
            flush_logs();
            return Err(e);
        }
    };
    if let Err(e) = config.initialize() {
        slog::crit!(LOG, "invalid configuration, refusing to start"; "error" => %e);
        flush_logs();
        return Err(e);
    }

    let spotify = Arc::new(spotify::SpotifyClient::from_config(&config));
    let blobs: Arc<dyn storage::BlobStore> = Arc::new(storage::GcsObject::from_config(&config));
    let ideas = Arc::new(ideas::IdeasStore::new(blobs, config.ideas_write_attempts));
    let ctx = service::Context::new(spotify, ideas, &config.version);

    let addr = config.listen_addr();
    async_std::task::spawn(async move {
        if let Err(e) = service::start(ctx, addr).await {
            slog::crit!(LOG, "http server failed"; "error" => %e);
            flush_logs();
            std::process::exit(1);
        }
    });

    termination_signal().await?;
    slog::info!(LOG, "termination signal received, shutting down");
    flush_logs();
    Ok(())
}
