//! CLI argument parsing for the memstat server

use crate::report::ReportFormat;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "memstat")]
#[command(version)]
#[command(about = "Aggregate live heap allocation events from instrumented processes", long_about = None)]
pub struct Cli {
    /// Load server settings from a TOML file (flags below override it)
    #[arg(short = 'C', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Name of the event message queue (e.g. /memstat_events)
    #[arg(long = "channel", value_name = "NAME")]
    pub channel: Option<String>,

    /// Name of the shared lock region (e.g. /memstat_locks)
    #[arg(long = "locks", value_name = "NAME")]
    pub locks: Option<String>,

    /// Queue capacity in events, applied only when the queue is created
    #[arg(long = "capacity", value_name = "EVENTS")]
    pub capacity: Option<usize>,

    /// Minimum milliseconds between snapshots
    #[arg(long = "interval-ms", value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// Snapshot format
    #[arg(long = "format", value_enum)]
    pub format: Option<ReportFormat>,

    /// Remove the named queue and lock region, then exit
    #[arg(long = "cleanup")]
    pub cleanup: bool,

    /// Enable debug logging to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}
