//! Cross-process spin lock over a POSIX shared memory region
//!
//! The region is a fixed 64-byte block viewed as 16 atomic words. Each
//! [`LockKind`] owns one word. A held slot stores 1, a free slot stores 0.
//!
//! # Limitations
//!
//! The lock is advisory. There is no owner tracking, no double-release
//! detection and no timeout: a producer that dies while holding a slot
//! wedges every other producer waiting on that slot until an operator
//! calls [`LockRegion::reset`] (the consumer does so once at startup).
//!
//! ```text
//! Producer A ──┐                        ┌── Producer B
//!              │   /memstat_locks (shm) │
//!              └──► [ A | F | RF | RT | 0 ... 0 ] ◄──┘
//! ```

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// Size of the shared lock region in bytes
pub const LOCK_REGION_SIZE: usize = 64;

/// Number of addressable atomic words in the region
pub const LOCK_REGION_WORDS: usize = LOCK_REGION_SIZE / std::mem::size_of::<AtomicU32>();

const FREE: u32 = 0;
const HELD: u32 = 1;

/// Independent lock slots, one per hooked primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Allocate = 0,
    Free = 1,
    ReallocateFrom = 2,
    ReallocateTo = 3,
}

impl LockKind {
    pub const ALL: [LockKind; 4] = [
        LockKind::Allocate,
        LockKind::Free,
        LockKind::ReallocateFrom,
        LockKind::ReallocateTo,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Errors opening the shared lock region
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Failed to open shared lock region {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to size shared lock region {name}: {source}")]
    Resize {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to map shared lock region {name}: {source}")]
    Map {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to unlink shared lock region {name}: {source}")]
    Unlink {
        name: String,
        #[source]
        source: nix::Error,
    },
}

/// Shared mapping of the lock block
struct SharedMapping {
    ptr: NonNull<c_void>,
}

// SAFETY: the mapping is only ever accessed through atomics.
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        // SAFETY: ptr came from a successful mmap of LOCK_REGION_SIZE bytes
        // and no guard can outlive the region that produced it.
        if let Err(e) = unsafe { munmap(self.ptr, LOCK_REGION_SIZE) } {
            tracing::warn!("Failed to unmap lock region: {}", e);
        }
    }
}

enum Backing {
    Shared(SharedMapping),
    Private(Box<[AtomicU32; LOCK_REGION_WORDS]>),
}

/// Handle to a lock region
///
/// # Example
///
/// ```no_run
/// use memstat::lock::{LockKind, LockRegion};
///
/// let region = LockRegion::open("/memstat_locks")?;
/// {
///     let _guard = region.acquire(LockKind::Allocate);
///     // critical section
/// } // released here, on every exit path
/// # Ok::<(), memstat::lock::LockError>(())
/// ```
pub struct LockRegion {
    backing: Backing,
}

impl LockRegion {
    /// Attach to the named region, creating it if nobody has yet
    ///
    /// A freshly created region is zero-filled, so every slot starts free.
    /// Attaching to an existing region never touches its slots.
    pub fn open(name: &str) -> Result<Self, LockError> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )
        .map_err(|source| LockError::Open {
            name: name.to_string(),
            source,
        })?;

        // Every attacher sizes the object identically, so this is idempotent.
        ftruncate(&fd, LOCK_REGION_SIZE as libc::off_t).map_err(|source| LockError::Resize {
            name: name.to_string(),
            source,
        })?;

        let length = NonZeroUsize::new(LOCK_REGION_SIZE).ok_or_else(|| LockError::Map {
            name: name.to_string(),
            source: nix::Error::EINVAL,
        })?;

        // SAFETY: mapping a fresh shared view of a file descriptor we own;
        // the kernel picks the address.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|source| LockError::Map {
            name: name.to_string(),
            source,
        })?;

        tracing::debug!("Attached lock region {}", name);

        Ok(Self {
            backing: Backing::Shared(SharedMapping { ptr }),
        })
    }

    /// Heap-backed region visible only to this process
    pub fn private() -> Self {
        Self {
            backing: Backing::Private(Box::new(std::array::from_fn(|_| AtomicU32::new(FREE)))),
        }
    }

    /// Remove the named region from the system
    ///
    /// Processes already attached keep their mapping.
    pub fn unlink(name: &str) -> Result<(), LockError> {
        shm_unlink(name).map_err(|source| LockError::Unlink {
            name: name.to_string(),
            source,
        })
    }

    fn words(&self) -> &[AtomicU32] {
        match &self.backing {
            // SAFETY: the mapping is LOCK_REGION_SIZE bytes, page aligned,
            // and lives as long as `self`.
            Backing::Shared(mapping) => unsafe {
                std::slice::from_raw_parts(
                    mapping.ptr.as_ptr().cast::<AtomicU32>(),
                    LOCK_REGION_WORDS,
                )
            },
            Backing::Private(words) => &words[..],
        }
    }

    fn slot(&self, kind: LockKind) -> &AtomicU32 {
        &self.words()[kind.index()]
    }

    /// Spin until the slot for `kind` is ours
    ///
    /// Yields the processor between attempts. Never times out.
    pub fn acquire(&self, kind: LockKind) -> LockGuard<'_> {
        let slot = self.slot(kind);
        while slot
            .compare_exchange_weak(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
        LockGuard { slot }
    }

    /// Take the slot only if it is free right now
    pub fn try_acquire(&self, kind: LockKind) -> Option<LockGuard<'_>> {
        let slot = self.slot(kind);
        slot.compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| LockGuard { slot })
    }

    pub fn is_held(&self, kind: LockKind) -> bool {
        self.slot(kind).load(Ordering::Acquire) == HELD
    }

    /// Force every slot back to free
    ///
    /// Clears slots wedged by crashed producers. Must not run while a
    /// producer is inside a critical section.
    pub fn reset(&self) {
        for word in self.words() {
            word.store(FREE, Ordering::Release);
        }
    }
}

/// Held lock slot, released when dropped
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    slot: &'a AtomicU32,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.slot.store(FREE, Ordering::Release);
    }
}
