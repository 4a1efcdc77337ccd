//! Many-producer, single-consumer event channel
//!
//! Two transports share the same blocking contract:
//!
//! - [`MessageQueue`]: a named POSIX message queue reachable from any process
//! - [`LocalChannel`]: a crossbeam bounded channel for producers living in
//!   the consumer's own process (and for tests)
//!
//! `send` blocks while the channel is full and never drops an event.
//! `receive` blocks until an event is available. Neither ever times out.

use crate::event::{AllocationEvent, DecodeError, WIRE_SIZE};
use crossbeam::channel;
use nix::errno::Errno;
use nix::mqueue::{mq_close, mq_getattr, mq_open, mq_receive, mq_send, mq_unlink, MqAttr, MqdT, MQ_OFlag};
use nix::sys::stat::Mode;
use std::mem::ManuallyDrop;
use thiserror::Error;

/// Errors on the event channel
///
/// A full channel is never an error: senders block instead.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to open event channel {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: Errno,
    },

    #[error("Failed to send event: {0}")]
    Send(#[source] Errno),

    #[error("Failed to receive event: {0}")]
    Receive(#[source] Errno),

    #[error("Malformed event on channel: {0}")]
    Decode(#[from] DecodeError),

    #[error("Failed to unlink event channel {name}: {source}")]
    Unlink {
        name: String,
        #[source]
        source: Errno,
    },

    #[error("Event channel disconnected")]
    Disconnected,
}

/// Sending half of an event channel
pub trait EventSink {
    /// Enqueue one event, blocking while the channel is full
    fn send(&self, event: AllocationEvent) -> Result<(), ChannelError>;
}

/// Receiving half of an event channel
pub trait EventSource {
    /// Block until one event is available and return it
    fn receive(&mut self) -> Result<AllocationEvent, ChannelError>;
}

impl<S: EventSink + ?Sized> EventSink for &S {
    fn send(&self, event: AllocationEvent) -> Result<(), ChannelError> {
        (**self).send(event)
    }
}

/// Named POSIX message queue
///
/// Opening is idempotent: the first opener creates the queue with the
/// requested capacity, later openers attach to it and the capacity they
/// pass is ignored by the kernel.
pub struct MessageQueue {
    name: String,
    mqd: ManuallyDrop<MqdT>,
    recv_buf: Vec<u8>,
}

impl MessageQueue {
    /// Attach to `name`, creating a queue of `capacity` messages if needed
    pub fn open(name: &str, capacity: usize) -> Result<Self, ChannelError> {
        let attr = MqAttr::new(0, capacity as _, WIRE_SIZE as _, 0);
        let mqd = mq_open(
            name,
            MQ_OFlag::O_CREAT | MQ_OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
            Some(&attr),
        )
        .map_err(|source| ChannelError::Open {
            name: name.to_string(),
            source,
        })?;

        // An existing queue keeps the message size it was created with.
        let actual = mq_getattr(&mqd).map_err(|source| ChannelError::Open {
            name: name.to_string(),
            source,
        })?;
        let msgsize = usize::try_from(actual.msgsize()).unwrap_or(WIRE_SIZE);

        tracing::debug!(
            "Attached event channel {} (capacity {}, message size {})",
            name,
            actual.maxmsg(),
            msgsize
        );

        Ok(Self {
            name: name.to_string(),
            mqd: ManuallyDrop::new(mqd),
            recv_buf: vec![0u8; msgsize.max(WIRE_SIZE)],
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of events currently waiting in the queue
    pub fn pending(&self) -> Result<usize, ChannelError> {
        let attr = mq_getattr(&self.mqd).map_err(ChannelError::Receive)?;
        Ok(usize::try_from(attr.curmsgs()).unwrap_or(0))
    }

    /// Remove the named queue from the system
    ///
    /// Processes that already hold it open keep working on the old queue.
    pub fn unlink(name: &str) -> Result<(), ChannelError> {
        mq_unlink(name).map_err(|source| ChannelError::Unlink {
            name: name.to_string(),
            source,
        })
    }
}

impl EventSink for MessageQueue {
    fn send(&self, event: AllocationEvent) -> Result<(), ChannelError> {
        let bytes = event.encode();
        loop {
            match mq_send(&self.mqd, &bytes, 0) {
                Ok(()) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ChannelError::Send(e)),
            }
        }
    }
}

impl EventSource for MessageQueue {
    fn receive(&mut self) -> Result<AllocationEvent, ChannelError> {
        let mut prio = 0u32;
        let len = loop {
            match mq_receive(&self.mqd, &mut self.recv_buf, &mut prio) {
                Ok(len) => break len,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ChannelError::Receive(e)),
            }
        };
        Ok(AllocationEvent::decode(&self.recv_buf[..len])?)
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        // SAFETY: the descriptor is never used again after this point.
        let mqd = unsafe { ManuallyDrop::take(&mut self.mqd) };
        if let Err(e) = mq_close(mqd) {
            tracing::warn!("Failed to close event channel {}: {}", self.name, e);
        }
    }
}

/// In-process bounded channel
///
/// # Example
///
/// ```
/// use memstat::channel::{EventSink, EventSource, LocalChannel};
/// use memstat::event::{Address, AllocationEvent};
///
/// let (tx, mut rx) = LocalChannel::bounded(16);
/// tx.send(AllocationEvent::free(Address(0x10))).unwrap();
/// assert_eq!(rx.receive().unwrap().address(), Address(0x10));
/// ```
pub struct LocalChannel;

impl LocalChannel {
    /// Create a channel holding at most `capacity` in-flight events
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0.
    pub fn bounded(capacity: usize) -> (LocalSender, LocalReceiver) {
        assert!(capacity > 0, "Channel capacity must be > 0");
        let (tx, rx) = channel::bounded(capacity);
        (LocalSender { tx }, LocalReceiver { rx })
    }
}

/// Cloneable producer handle of a [`LocalChannel`]
#[derive(Clone)]
pub struct LocalSender {
    tx: channel::Sender<AllocationEvent>,
}

impl EventSink for LocalSender {
    fn send(&self, event: AllocationEvent) -> Result<(), ChannelError> {
        self.tx.send(event).map_err(|_| ChannelError::Disconnected)
    }
}

/// Consumer handle of a [`LocalChannel`]
pub struct LocalReceiver {
    rx: channel::Receiver<AllocationEvent>,
}

impl LocalReceiver {
    /// Take one event if one is already waiting
    pub fn try_receive(&self) -> Option<AllocationEvent> {
        self.rx.try_recv().ok()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl EventSource for LocalReceiver {
    fn receive(&mut self) -> Result<AllocationEvent, ChannelError> {
        self.rx.recv().map_err(|_| ChannelError::Disconnected)
    }
}
