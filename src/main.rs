mod config;
mod engine;
mod hooks;
mod httpd;
mod output;
mod receiver;
mod snapshot;
mod streams;
mod sync;
mod vban;

use std::sync::Arc;

use clap::Parser;
use config::Config;
use engine::Engine;
use snapshot::SnapshotPublisher;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = Config::parse();

    hooks::ignore_signals();

    info!(
        port = config.port,
        http_port = config.resolved_http_port(),
        pipe = %config.pipe,
        "🚀 vban-pipe-bridge starting"
    );

    let publisher = Arc::new(SnapshotPublisher::new());

    // stats endpoint; an error there stops that task only
    let _http_handle = httpd::start(config.resolved_http_port(), publisher.clone()).await?;

    // the ingest engine blocks in recvmsg, so it gets its own thread
    let receiver = receiver::VbanReceiver::bind(config.port)?;
    let engine = Engine::new(config, publisher);

    tokio::task::spawn_blocking(move || engine.run(receiver)).await?
}

/// Log to standard error. `DEBUG=1` enables debug-level detail,
/// `VERBOSE=1` verbose detail; otherwise `RUST_LOG` applies, default info.
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = if std::env::var_os("DEBUG").is_some() {
        EnvFilter::new("trace")
    } else if std::env::var_os("VERBOSE").is_some() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}
