//! Reference producer: the contract every instrumented process follows
//!
//! How a process intercepts its own allocator is up to the host. Once it
//! has, each hooked call goes through a [`Producer`], which:
//!
//! 1. runs the call untracked if this thread is already inside a hook of
//!    the same kind (the real primitive allocating internally),
//! 2. otherwise takes the cross-process lock slot for the kind, marks the
//!    thread as inside the hook, runs the real primitive, unmarks it and
//!    releases the slot,
//! 3. sends the resulting events after the slot is released, blocking if
//!    the channel is full.
//!
//! Zero-size allocations and null addresses never produce events.

use crate::channel::EventSink;
use crate::event::{Address, AllocationEvent};
use crate::lock::{LockKind, LockRegion};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

thread_local! {
    /// One bit per `LockKind`: set while this thread runs that primitive
    static IN_HOOK: Cell<u8> = const { Cell::new(0) };
}

/// Marks the current thread as inside a hook until dropped
struct ReentryFlag {
    bit: u8,
}

impl ReentryFlag {
    fn bit(kind: LockKind) -> u8 {
        1 << kind.index()
    }

    fn is_set(kind: LockKind) -> bool {
        IN_HOOK.with(|flags| flags.get() & Self::bit(kind) != 0)
    }

    fn set(kind: LockKind) -> Self {
        let bit = Self::bit(kind);
        IN_HOOK.with(|flags| flags.set(flags.get() | bit));
        Self { bit }
    }
}

impl Drop for ReentryFlag {
    fn drop(&mut self) {
        IN_HOOK.with(|flags| flags.set(flags.get() & !self.bit));
    }
}

/// Event emitter for one instrumented process
pub struct Producer<S> {
    locks: Arc<LockRegion>,
    sink: S,
    send_failures: AtomicU64,
}

impl<S: EventSink> Producer<S> {
    pub fn new(locks: Arc<LockRegion>, sink: S) -> Self {
        Self {
            locks,
            sink,
            send_failures: AtomicU64::new(0),
        }
    }

    /// Run an allocating primitive and report the block it returns
    pub fn allocate<F>(&self, size: u64, primitive: F) -> Address
    where
        F: FnOnce() -> Address,
    {
        let (address, tracked) = self.guarded(LockKind::Allocate, primitive);
        if tracked && !address.is_null() {
            if let Some(event) = AllocationEvent::allocate(address, size) {
                self.emit(event);
            }
        }
        address
    }

    /// Run a releasing primitive and report the freed block
    pub fn free<F>(&self, address: Address, primitive: F)
    where
        F: FnOnce(),
    {
        let ((), tracked) = self.guarded(LockKind::Free, primitive);
        if tracked && !address.is_null() {
            self.emit(AllocationEvent::free(address));
        }
    }

    /// Run a resizing primitive and report what it did
    ///
    /// - from null: an allocation of `size`
    /// - to size 0: a free of `address`
    /// - otherwise: a free of `address` followed by an allocation of `size`
    ///   at the returned address (which may equal `address`)
    /// - a null result with a nonzero size reports nothing
    pub fn reallocate<F>(&self, address: Address, size: u64, primitive: F) -> Address
    where
        F: FnOnce() -> Address,
    {
        let (new_address, tracked) = self.guarded(LockKind::ReallocateFrom, primitive);
        if !tracked {
            return new_address;
        }

        if size == 0 {
            if !address.is_null() {
                self.emit(AllocationEvent::free(address));
            }
            return new_address;
        }

        // A failed resize leaves the old block in place.
        if new_address.is_null() {
            return new_address;
        }
        if !address.is_null() {
            self.emit(AllocationEvent::free(address));
        }
        if let Some(event) = AllocationEvent::allocate(new_address, size) {
            self.emit(event);
        }
        new_address
    }

    /// Events the channel refused so far
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    /// Run `primitive` inside the lock bracket for `kind`
    ///
    /// Returns whether the call was tracked; re-entrant calls skip the lock.
    fn guarded<R>(&self, kind: LockKind, primitive: impl FnOnce() -> R) -> (R, bool) {
        if ReentryFlag::is_set(kind) {
            return (primitive(), false);
        }

        let _slot = self.locks.acquire(kind);
        let _reentry = ReentryFlag::set(kind);
        (primitive(), true)
    }

    fn emit(&self, event: AllocationEvent) {
        if let Err(e) = self.sink.send(event) {
            self.send_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Failed to report {:?} of {}: {}", event.kind(), event.address(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{LocalChannel, LocalReceiver};
    use crate::event::EventKind;

    fn producer(capacity: usize) -> (Producer<crate::channel::LocalSender>, LocalReceiver) {
        let (tx, rx) = LocalChannel::bounded(capacity);
        (Producer::new(Arc::new(LockRegion::private()), tx), rx)
    }

    fn drain(rx: &LocalReceiver) -> Vec<AllocationEvent> {
        std::iter::from_fn(|| rx.try_receive()).collect()
    }

    #[test]
    fn test_allocate_emits_one_event() {
        let (producer, rx) = producer(8);
        let address = producer.allocate(32, || Address(0x1000));
        assert_eq!(address, Address(0x1000));

        let events = drain(&rx);
        assert_eq!(events, vec![AllocationEvent::allocate(Address(0x1000), 32).unwrap()]);
    }

    #[test]
    fn test_zero_size_allocate_is_not_sent() {
        let (producer, rx) = producer(8);
        producer.allocate(0, || Address(0x1000));
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_failed_allocation_is_not_sent() {
        let (producer, rx) = producer(8);
        producer.allocate(64, || Address(0));
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_free_emits_free_event() {
        let (producer, rx) = producer(8);
        let mut released = false;
        producer.free(Address(0x2000), || released = true);
        assert!(released);

        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Free);
        assert_eq!(events[0].address(), Address(0x2000));
    }

    #[test]
    fn test_reentrant_call_is_untracked() {
        let (producer, rx) = producer(8);
        let outer = producer.allocate(128, || {
            // The real allocator allocating for itself.
            producer.allocate(16, || Address(0x9000));
            Address(0x1000)
        });
        assert_eq!(outer, Address(0x1000));

        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].address(), Address(0x1000));
        assert!(!ReentryFlag::is_set(LockKind::Allocate));
    }

    #[test]
    fn test_slot_released_after_call() {
        let locks = Arc::new(LockRegion::private());
        let (tx, _rx) = LocalChannel::bounded(8);
        let producer = Producer::new(Arc::clone(&locks), tx);

        producer.allocate(8, || {
            assert!(locks.is_held(LockKind::Allocate));
            Address(0x10)
        });
        assert!(!locks.is_held(LockKind::Allocate));
    }

    #[test]
    fn test_reallocate_from_null_is_allocation() {
        let (producer, rx) = producer(8);
        producer.reallocate(Address(0), 24, || Address(0x3000));
        assert_eq!(
            drain(&rx),
            vec![AllocationEvent::allocate(Address(0x3000), 24).unwrap()]
        );
    }

    #[test]
    fn test_reallocate_to_zero_is_free() {
        let (producer, rx) = producer(8);
        producer.reallocate(Address(0x3000), 0, || Address(0));
        assert_eq!(drain(&rx), vec![AllocationEvent::free(Address(0x3000))]);
    }

    #[test]
    fn test_reallocate_moves_block() {
        let (producer, rx) = producer(8);
        let moved = producer.reallocate(Address(0x3000), 256, || Address(0x4000));
        assert_eq!(moved, Address(0x4000));
        assert_eq!(
            drain(&rx),
            vec![
                AllocationEvent::free(Address(0x3000)),
                AllocationEvent::allocate(Address(0x4000), 256).unwrap(),
            ]
        );
    }

    #[test]
    fn test_failed_reallocate_keeps_old_block() {
        let (producer, rx) = producer(8);
        producer.reallocate(Address(0x3000), 1 << 40, || Address(0));
        producer.reallocate(Address(0), 64, || Address(0));
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_send_failure_is_counted() {
        let (producer, rx) = producer(8);
        drop(rx);
        producer.allocate(8, || Address(0x10));
        assert_eq!(producer.send_failures(), 1);
    }
}
