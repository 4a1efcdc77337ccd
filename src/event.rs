//! Allocation events and their fixed-size wire encoding
//!
//! Every message on the event channel is a 24-byte little-endian record:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┐
//! │ tag (u64)    │ address (u64)│ size (u64)   │
//! └──────────────┴──────────────┴──────────────┘
//! ```
//!
//! There is no discriminant byte. A record with `size == 0` is a free, any
//! other size is an allocation.

use std::fmt;
use thiserror::Error;

/// Constant identifying this application's messages on a shared channel
pub const CHANNEL_TAG: u64 = 0x4d45_4d53_5441_5401;

/// Encoded size of one event in bytes
pub const WIRE_SIZE: usize = 24;

/// Opaque pointer-sized identity of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub u64);

impl Address {
    /// Take the identity of a raw pointer
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Address(ptr as usize as u64)
    }

    /// Null identity, used by resize calls that start from nothing
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014x}", self.0)
    }
}

/// Kind of an allocation event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Allocate,
    Free,
}

/// A single allocation or free reported by a producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationEvent {
    address: Address,
    size: u64,
}

impl AllocationEvent {
    /// Build an allocate event
    ///
    /// Returns `None` for `size == 0`: such an event is malformed and must
    /// never reach the channel.
    pub fn allocate(address: Address, size: u64) -> Option<Self> {
        if size == 0 {
            return None;
        }
        Some(Self { address, size })
    }

    /// Build a free event
    pub fn free(address: Address) -> Self {
        Self { address, size: 0 }
    }

    pub fn kind(&self) -> EventKind {
        if self.size == 0 {
            EventKind::Free
        } else {
            EventKind::Allocate
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Allocated size in bytes (always 0 for a free)
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Encode into the channel wire format
    pub fn encode(&self) -> [u8; WIRE_SIZE] {
        let mut buf = [0u8; WIRE_SIZE];
        buf[0..8].copy_from_slice(&CHANNEL_TAG.to_le_bytes());
        buf[8..16].copy_from_slice(&self.address.0.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Decode one message received from the channel
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() != WIRE_SIZE {
            return Err(DecodeError::Length {
                expected: WIRE_SIZE,
                actual: buf.len(),
            });
        }

        let tag = read_u64(&buf[0..8]);
        if tag != CHANNEL_TAG {
            return Err(DecodeError::ForeignTag(tag));
        }

        Ok(Self {
            address: Address(read_u64(&buf[8..16])),
            size: read_u64(&buf[16..24]),
        })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

/// Errors decoding a channel message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Message length mismatch: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("Message tag {0:#x} does not belong to this channel")]
    ForeignTag(u64),
}
