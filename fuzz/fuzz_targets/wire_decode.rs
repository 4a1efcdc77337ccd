#![no_main]

use libfuzzer_sys::fuzz_target;
use memstat::event::AllocationEvent;
use memstat::live_table::LiveTable;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes either decode or yield a typed error, and every
    // decoded event applies without panicking.
    let mut table = LiveTable::new();
    for chunk in data.chunks(24) {
        if let Ok(event) = AllocationEvent::decode(chunk) {
            table.apply(&event, std::time::Instant::now());
        }
    }
});
