//! memstat - live heap allocation statistics across processes
//!
//! Instrumented producer processes report every allocation and free over a
//! named POSIX message queue. A single consumer process keeps a table of
//! live allocations and periodically renders size and age histograms.
//!
//! ```text
//! producer ─┐  lock (shm)   ┌─ producer
//!           ▼               ▼
//!        [ event channel (mqueue) ]
//!                   │
//!                   ▼
//!      consumer: live table → snapshot → stderr
//! ```

pub mod channel;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod event;
pub mod live_table;
pub mod lock;
pub mod producer;
pub mod report;
