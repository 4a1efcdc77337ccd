//! Single-threaded consumer loop
//!
//! Receives one event at a time, applies it to the live table, then checks
//! whether the report interval has elapsed. The check runs after every
//! event, so the cadence is "at least one interval, checked
//! opportunistically": an idle channel delays the next report until the
//! next event arrives.

use crate::channel::{ChannelError, EventSource};
use crate::live_table::LiveTable;
use crate::report::{ReportFormat, Snapshot};
use std::io::Write;
use std::time::{Duration, Instant};

/// Default time between snapshots
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Report settings for a consumer
#[derive(Debug, Clone, Copy)]
pub struct ReportSettings {
    pub interval: Duration,
    pub format: ReportFormat,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REPORT_INTERVAL,
            format: ReportFormat::Text,
        }
    }
}

/// Outcome of processing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    /// The message decoded and was applied to the table
    pub applied: bool,
    /// A snapshot was rendered after the message
    pub reported: bool,
}

/// Owner of the live table, fed by one event source
pub struct Consumer<S, W> {
    source: S,
    out: W,
    settings: ReportSettings,
    table: LiveTable,
    last_report: Instant,
    reports: u64,
    malformed: u64,
}

impl<S: EventSource, W: Write> Consumer<S, W> {
    /// Create a consumer rendering snapshots into `out`
    pub fn new(source: S, out: W, settings: ReportSettings) -> Self {
        Self {
            source,
            out,
            settings,
            table: LiveTable::new(),
            last_report: Instant::now(),
            reports: 0,
            malformed: 0,
        }
    }

    /// Receive and process exactly one message, blocking until it arrives
    ///
    /// Malformed messages are logged and skipped. Any other channel error
    /// is returned to the caller.
    pub fn step(&mut self) -> Result<StepOutcome, ChannelError> {
        let applied = match self.source.receive() {
            Ok(event) => {
                self.table.apply(&event, Instant::now());
                true
            }
            Err(ChannelError::Decode(e)) => {
                self.malformed += 1;
                tracing::warn!("Discarding malformed event: {}", e);
                false
            }
            Err(e) => return Err(e),
        };

        let reported = self.maybe_report(Instant::now());
        Ok(StepOutcome { applied, reported })
    }

    /// Process messages until the channel fails
    ///
    /// With a named queue this never returns under normal operation; the
    /// process is expected to be terminated externally.
    pub fn run(&mut self) -> Result<(), ChannelError> {
        loop {
            self.step()?;
        }
    }

    /// Render a snapshot if the interval has elapsed since the last one
    pub fn maybe_report(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_report) < self.settings.interval {
            return false;
        }
        self.report_now();
        self.last_report = now;
        true
    }

    /// Render a snapshot unconditionally
    ///
    /// Write failures are logged and never stop the loop.
    pub fn report_now(&mut self) {
        let snapshot = Snapshot::capture(&self.table);
        let result = snapshot
            .render(self.settings.format, &mut self.out)
            .and_then(|()| self.out.flush());
        if let Err(e) = result {
            tracing::warn!("Failed to write snapshot: {}", e);
        }
        self.reports += 1;
    }

    pub fn table(&self) -> &LiveTable {
        &self.table
    }

    /// Snapshots rendered so far
    pub fn reports(&self) -> u64 {
        self.reports
    }

    /// Messages discarded as malformed so far
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    pub fn into_parts(self) -> (S, W, LiveTable) {
        (self.source, self.out, self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{EventSink, LocalChannel};
    use crate::event::{Address, AllocationEvent, DecodeError};
    use std::io;

    fn settings(interval: Duration) -> ReportSettings {
        ReportSettings {
            interval,
            format: ReportFormat::Text,
        }
    }

    #[test]
    fn test_step_applies_events_in_order() {
        let (tx, rx) = LocalChannel::bounded(8);
        tx.send(AllocationEvent::allocate(Address(1), 8).unwrap()).unwrap();
        tx.send(AllocationEvent::allocate(Address(2), 4096).unwrap()).unwrap();
        tx.send(AllocationEvent::free(Address(1))).unwrap();

        let mut consumer = Consumer::new(rx, Vec::new(), settings(Duration::from_secs(3600)));
        for _ in 0..3 {
            let outcome = consumer.step().unwrap();
            assert!(outcome.applied);
            assert!(!outcome.reported);
        }

        let counters = consumer.table().counters();
        assert_eq!(counters.overall_allocations, 2);
        assert_eq!(counters.total_current_size, 4096);
    }

    #[test]
    fn test_report_fires_once_interval_elapsed() {
        let (tx, rx) = LocalChannel::bounded(8);
        tx.send(AllocationEvent::allocate(Address(1), 8).unwrap()).unwrap();

        let mut consumer = Consumer::new(rx, Vec::new(), settings(Duration::ZERO));
        let outcome = consumer.step().unwrap();
        assert!(outcome.reported);
        assert_eq!(consumer.reports(), 1);

        let (_, out, _) = consumer.into_parts();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("1 Overall allocations since start"));
    }

    #[test]
    fn test_maybe_report_respects_interval() {
        let (_tx, rx) = LocalChannel::bounded(1);
        let mut consumer = Consumer::new(rx, Vec::new(), settings(Duration::from_secs(1)));
        let start = consumer.last_report;

        assert!(!consumer.maybe_report(start + Duration::from_millis(999)));
        assert!(consumer.maybe_report(start + Duration::from_secs(1)));
        assert!(!consumer.maybe_report(start + Duration::from_millis(1500)));
        assert!(consumer.maybe_report(start + Duration::from_secs(2)));
        assert_eq!(consumer.reports(), 2);
    }

    #[test]
    fn test_disconnect_ends_run() {
        let (tx, rx) = LocalChannel::bounded(4);
        tx.send(AllocationEvent::allocate(Address(1), 8).unwrap()).unwrap();
        drop(tx);

        let mut consumer = Consumer::new(rx, Vec::new(), settings(Duration::from_secs(3600)));
        assert!(matches!(consumer.run(), Err(ChannelError::Disconnected)));
        assert_eq!(consumer.table().len(), 1);
    }

    struct ScriptedSource(Vec<Result<AllocationEvent, ChannelError>>);

    impl EventSource for ScriptedSource {
        fn receive(&mut self) -> Result<AllocationEvent, ChannelError> {
            if self.0.is_empty() {
                return Err(ChannelError::Disconnected);
            }
            self.0.remove(0)
        }
    }

    #[test]
    fn test_malformed_message_is_skipped() {
        let source = ScriptedSource(vec![
            Err(ChannelError::Decode(DecodeError::ForeignTag(1))),
            Ok(AllocationEvent::allocate(Address(9), 64).unwrap()),
        ]);

        let mut consumer = Consumer::new(source, Vec::new(), settings(Duration::from_secs(3600)));
        assert!(!consumer.step().unwrap().applied);
        assert!(consumer.step().unwrap().applied);
        assert_eq!(consumer.malformed(), 1);
        assert_eq!(consumer.table().counters().total_current_size, 64);
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_render_failure_does_not_stop_loop() {
        let (tx, rx) = LocalChannel::bounded(4);
        tx.send(AllocationEvent::allocate(Address(1), 8).unwrap()).unwrap();
        tx.send(AllocationEvent::allocate(Address(2), 8).unwrap()).unwrap();

        let mut consumer = Consumer::new(rx, BrokenWriter, settings(Duration::ZERO));
        assert!(consumer.step().unwrap().reported);
        assert!(consumer.step().unwrap().applied);
        assert_eq!(consumer.table().len(), 2);
    }
}
