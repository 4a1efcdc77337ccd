use anyhow::{Context, Result};
use clap::Parser;
use memstat::channel::{ChannelError, MessageQueue};
use memstat::cli::Cli;
use memstat::config::ServerConfig;
use memstat::consumer::Consumer;
use memstat::lock::{LockError, LockRegion};
use nix::errno::Errno;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; --debug raises everything to TRACE
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Remove the named IPC objects; already-missing objects are fine
fn cleanup(config: &ServerConfig) -> Result<()> {
    match MessageQueue::unlink(&config.channel_name) {
        Ok(()) => tracing::info!("Removed event channel {}", config.channel_name),
        Err(ChannelError::Unlink {
            source: Errno::ENOENT,
            ..
        }) => tracing::info!("Event channel {} does not exist", config.channel_name),
        Err(e) => return Err(e).context("Failed to remove event channel"),
    }

    match LockRegion::unlink(&config.lock_region_name) {
        Ok(()) => tracing::info!("Removed lock region {}", config.lock_region_name),
        Err(LockError::Unlink {
            source: Errno::ENOENT,
            ..
        }) => tracing::info!("Lock region {} does not exist", config.lock_region_name),
        Err(e) => return Err(e).context("Failed to remove lock region"),
    }

    Ok(())
}

/// Attach to the shared objects and aggregate events until killed
fn run_server(config: &ServerConfig) -> Result<()> {
    tracing::info!("Server started, pid: {}", std::process::id());

    let locks = LockRegion::open(&config.lock_region_name)
        .context("Failed to attach lock region")?;
    // Slots wedged by producers that died before this server started.
    locks.reset();

    let channel = MessageQueue::open(&config.channel_name, config.channel_capacity)
        .context("Failed to attach event channel")?;

    tracing::info!(
        "Listening on {} (locks {}, report every {} ms)",
        config.channel_name,
        config.lock_region_name,
        config.report_interval_ms
    );

    let mut consumer = Consumer::new(channel, std::io::stderr(), config.report_settings());
    consumer.run().context("Event channel failed")?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let config = ServerConfig::from_cli(&args)?;

    if args.cleanup {
        return cleanup(&config);
    }

    run_server(&config)
}
