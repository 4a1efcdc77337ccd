//! Integration tests for live-table accounting and snapshot rendering
//!
//! # Test Coverage
//!
//! - ✅ Size bucket boundaries
//! - ✅ Counter arithmetic across allocate/free sequences
//! - ✅ Duplicate-address (reuse) handling
//! - ✅ Unknown frees
//! - ✅ Symbol scaling and rendered layout

use chrono::Local;
use memstat::event::{Address, AllocationEvent};
use memstat::live_table::{size_bin, LiveTable, NUM_SIZE_BINS};
use memstat::report::{symbol_scale, ReportFormat, Snapshot, NUM_AGE_BINS};
use std::time::{Duration, Instant};

const A: Address = Address(0xa000);
const B: Address = Address(0xb000);
const C: Address = Address(0xc000);

#[test]
fn test_size_bin_boundaries() {
    for size in 1..=3 {
        assert_eq!(size_bin(size), 0, "size {}", size);
    }
    assert_eq!(size_bin(4095), 10);
    assert_eq!(size_bin(4096), 11);
    assert_eq!(size_bin(1_000_000), 11);
}

#[test]
fn test_insert_then_free_scenario() {
    let mut table = LiveTable::new();
    table.handle_allocate(A, 8);
    table.handle_allocate(B, 4096);
    table.handle_allocate(C, 5);

    let counters = table.counters();
    assert_eq!(counters.total_current_size, 4109);
    assert_eq!(counters.size_bin_counts[size_bin(8)], 1);
    assert_eq!(counters.size_bin_counts[size_bin(5)], 1);
    assert_eq!(counters.size_bin_counts[11], 1);
    assert_eq!(counters.size_bin_counts.iter().sum::<u64>(), 3);

    table.handle_free(A);

    let counters = table.counters();
    assert_eq!(counters.total_current_size, 4101);
    assert_eq!(counters.size_bin_counts[size_bin(8)], 0);
    assert_eq!(counters.size_bin_counts[11], 1);
    assert_eq!(counters.overall_allocations, 3);
}

#[test]
fn test_address_reuse_removes_single_record() {
    let mut table = LiveTable::new();
    table.handle_allocate(A, 64);
    table.handle_allocate(A, 2000);
    assert_eq!(table.counters().total_current_size, 2064);

    table.handle_free(A);
    assert_eq!(table.counters().total_current_size, 2000);
    assert_eq!(table.len(), 1);
    assert_eq!(table.counters().size_bin_counts[size_bin(2000)], 1);
}

#[test]
fn test_unknown_free_changes_nothing() {
    let mut table = LiveTable::new();
    table.handle_allocate(A, 100);
    let before = table.counters().clone();

    table.handle_free(B);
    table.handle_free(Address(0));
    assert_eq!(table.counters(), &before);
}

#[test]
fn test_events_drive_table() {
    let events = [
        AllocationEvent::allocate(A, 10).unwrap(),
        AllocationEvent::allocate(B, 20).unwrap(),
        AllocationEvent::free(A),
        AllocationEvent::free(C),
        AllocationEvent::allocate(C, 30).unwrap(),
    ];

    let mut table = LiveTable::new();
    let now = Instant::now();
    for event in &events {
        table.apply(event, now);
    }

    assert_eq!(table.counters().overall_allocations, 3);
    assert_eq!(table.counters().total_current_size, 50);
    assert_eq!(table.len(), 2);
}

#[test]
fn test_symbol_scale_for_85() {
    assert_eq!(symbol_scale(85), 4);
}

#[test]
fn test_snapshot_layout() {
    let mut table = LiveTable::new();
    let now = Instant::now() + Duration::from_secs(20);
    table.handle_allocate_at(A, 2, now);
    table.handle_allocate_at(B, 5000, now - Duration::from_secs(15));

    let text = Snapshot::capture_at(&table, now, Local::now()).to_string();
    let lines: Vec<&str> = text.lines().collect();

    assert!(lines[0].starts_with(">>>>>>>>>>>>>>>> "));
    assert!(lines[0].ends_with(" <<<<<<<<<<<<<<<<"));
    assert_eq!(lines[1], "Overall stats:");
    assert_eq!(lines[2], "2 Overall allocations since start");
    assert_eq!(lines[3], "4.9 KiB Current total allocated size");

    let size_header = lines
        .iter()
        .position(|l| l.starts_with("Current allocations by size"))
        .unwrap();
    assert_eq!(lines[size_header + 1], "0 - 3 bytes: #");
    assert_eq!(lines[size_header + NUM_SIZE_BINS], "4096+: #");

    let age_header = lines
        .iter()
        .position(|l| l.starts_with("Current allocations by age"))
        .unwrap();
    assert_eq!(lines[age_header + 1], "< 1 sec: #");
    assert_eq!(lines[age_header + 2], "< 10 sec: ");
    assert_eq!(lines[age_header + 3], "< 100 sec: #");
    assert_eq!(lines.len(), age_header + 1 + NUM_AGE_BINS);
}

#[test]
fn test_json_snapshot_fields() {
    let mut table = LiveTable::new();
    table.handle_allocate(A, 8);

    let mut out = Vec::new();
    Snapshot::capture(&table)
        .render(ReportFormat::Json, &mut out)
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&out).unwrap();

    assert_eq!(value["overall_allocations"], 1);
    assert_eq!(value["live_records"], 1);
    assert_eq!(value["symbol_scale"], 1);
    assert_eq!(value["age_bins"][0], 1);
    assert!(value["taken_at"].is_string());
}
