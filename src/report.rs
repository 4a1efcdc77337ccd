//! Periodic snapshot of the live table
//!
//! A snapshot derives age buckets by scanning every live record, picks a
//! symbol scale so no bar grows past 40 marks, and renders either the
//! human-readable chart or a single JSON line.

use crate::live_table::{LiveTable, NUM_SIZE_BINS};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};
use std::time::{Duration, Instant};

/// Number of age buckets
pub const NUM_AGE_BINS: usize = 5;

/// Longest bar drawn before the symbol scale doubles
pub const MAX_BAR_WIDTH: u64 = 40;

const SIZE_LABELS: [&str; NUM_SIZE_BINS] = [
    "0 - 3 bytes",
    "4 - 7 bytes",
    "8 - 15 bytes",
    "16 - 31 bytes",
    "32 - 63 bytes",
    "64 - 127 bytes",
    "128 - 255 bytes",
    "256 - 511 bytes",
    "512 - 1023 bytes",
    "1024 - 2047 bytes",
    "2048 - 4095 bytes",
    "4096+",
];

const AGE_LABELS: [&str; NUM_AGE_BINS] = [
    "< 1 sec",
    "< 10 sec",
    "< 100 sec",
    "< 1000 sec",
    ">= 1000 sec",
];

const BYTE_UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Snapshot output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Human-readable bar charts (default)
    #[default]
    Text,
    /// One JSON object per snapshot
    Json,
}

/// Exponential age bucket: `<1s, <10s, <100s, <1000s, >=1000s`
pub fn age_bin(age: Duration) -> usize {
    let mut secs = age.as_secs();
    let mut bin = 0;
    while secs >= 1 && bin < NUM_AGE_BINS - 1 {
        secs /= 10;
        bin += 1;
    }
    bin
}

/// Counts represented by one `#` mark
///
/// Starts at 1 and doubles, halving the maximum, while the maximum is
/// above [`MAX_BAR_WIDTH`].
pub fn symbol_scale(max_count: u64) -> u64 {
    let mut max = max_count;
    let mut scale = 1;
    while max > MAX_BAR_WIDTH {
        max >>= 1;
        scale <<= 1;
    }
    scale
}

/// Format a byte total in the largest unit that keeps it at or below 1024
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value > 1024.0 && unit < BYTE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, BYTE_UNITS[unit])
}

/// Point-in-time aggregate view of the live table
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Local>,
    pub overall_allocations: u64,
    pub total_current_size: u64,
    pub live_records: usize,
    pub size_bins: [u64; NUM_SIZE_BINS],
    pub age_bins: [u64; NUM_AGE_BINS],
    pub symbol_scale: u64,
}

impl Snapshot {
    /// Capture the table as of now
    pub fn capture(table: &LiveTable) -> Self {
        Self::capture_at(table, Instant::now(), Local::now())
    }

    /// Capture with explicit clocks: `now` ages records, `taken_at` labels the header
    pub fn capture_at(table: &LiveTable, now: Instant, taken_at: DateTime<Local>) -> Self {
        let mut age_bins = [0u64; NUM_AGE_BINS];
        for record in table.iter() {
            age_bins[age_bin(now.saturating_duration_since(record.created_at))] += 1;
        }

        let counters = table.counters();
        let max_count = counters
            .size_bin_counts
            .iter()
            .chain(age_bins.iter())
            .copied()
            .max()
            .unwrap_or(0);

        Self {
            taken_at,
            overall_allocations: counters.overall_allocations,
            total_current_size: counters.total_current_size,
            live_records: table.len(),
            size_bins: counters.size_bin_counts,
            age_bins,
            symbol_scale: symbol_scale(max_count),
        }
    }

    /// Write the bar chart form
    pub fn render_text<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write!(out, "{}", self)
    }

    /// Write a single JSON line
    pub fn render_json<W: Write>(&self, out: &mut W) -> io::Result<()> {
        serde_json::to_writer(&mut *out, self)?;
        writeln!(out)
    }

    pub fn render<W: Write>(&self, format: ReportFormat, out: &mut W) -> io::Result<()> {
        match format {
            ReportFormat::Text => self.render_text(out),
            ReportFormat::Json => self.render_json(out),
        }
    }

    fn bar(&self, count: u64) -> String {
        "#".repeat((count / self.symbol_scale) as usize)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            ">>>>>>>>>>>>>>>> {} <<<<<<<<<<<<<<<<",
            self.taken_at.format("%m-%d-%Y %H:%M:%S %Z")
        )?;
        writeln!(f, "Overall stats:")?;
        writeln!(
            f,
            "{} Overall allocations since start",
            self.overall_allocations
        )?;
        writeln!(
            f,
            "{} Current total allocated size",
            format_bytes(self.total_current_size)
        )?;
        writeln!(f, "\n")?;

        writeln!(
            f,
            "Current allocations by size: (# - {} current allocations)",
            self.symbol_scale
        )?;
        for (label, &count) in SIZE_LABELS.iter().zip(self.size_bins.iter()) {
            writeln!(f, "{}: {}", label, self.bar(count))?;
        }
        writeln!(f, "\n")?;

        writeln!(
            f,
            "Current allocations by age: (# - {} current allocations)",
            self.symbol_scale
        )?;
        for (label, &count) in AGE_LABELS.iter().zip(self.age_bins.iter()) {
            writeln!(f, "{}: {}", label, self.bar(count))?;
        }
        Ok(())
    }
}
