//! Cross-process channels over named shared memory.
//!
//! Same contracts as [`itc`](crate::itc), with the primitive hosted in a
//! [`SharedMemory`] segment instead of an `Arc`. Every endpoint is generic
//! over its [`ShmMode`]: the side constructed with `create` is the segment
//! [`Owner`] (it initializes the primitive and unlinks the name on drop),
//! the side constructed with `open` is a [`User`]. Either role of a channel
//! may own the segment — a daemon can create its inbox as a Receiver and
//! let clients open the Sender side, or the other way around.
//!
//! ```no_run
//! use rill::ipc;
//! use rill::ShmOptions;
//!
//! // Process A
//! let tx = ipc::Sender::<u64, 1024, rill::Owner>::create("ticks", &ShmOptions::new())?;
//! tx.send(42);
//!
//! // Process B
//! let rx = ipc::Receiver::<u64, 1024, rill::User>::open("ticks", &ShmOptions::new())?;
//! assert_eq!(rx.receive(), 42);
//! # Ok::<(), rill::ShmError>(())
//! ```
//!
//! The type system cannot see across processes: it is on the deployment to
//! ensure a queue has exactly one live producer and one live consumer, and
//! a snapshot exactly one publisher. Within a process the endpoints enforce
//! the roles the same way the ITC ones do (move-only, `!Sync`).

use std::marker::PhantomData;
use std::time::Duration;

use minstant::Instant;

use crate::platform::cpu_relax;
use crate::queue::BoundedQueue;
use crate::seqlock::{SeqLock, SeqLockRing};
use crate::shm::{Owner, Result, SharedMemory, ShmMode, ShmOptions, User};
use crate::trace::debug;
use crate::types::{PhantomUnsync, ShmData};

pub use crate::itc::DEFAULT_SNAPSHOT_DEPTH;

// =============================================================================
// Queue channel
// =============================================================================

/// Creates the Owner sender and a User receiver for a fresh segment in one
/// call. Convenient when one process sets up the channel and hands the
/// receiving end to a child.
pub fn queue<T: ShmData, const N: usize>(
    name: &str,
    opts: &ShmOptions,
) -> Result<(Sender<T, N, Owner>, Receiver<T, N, User>)> {
    let sender = Sender::create(name, opts)?;
    let receiver = Receiver::open(name, opts)?;
    Ok((sender, receiver))
}

/// Write end of a cross-process SPSC queue.
pub struct Sender<T: ShmData, const N: usize, M: ShmMode> {
    shm: SharedMemory<BoundedQueue<T, N>, M>,
    _unsync: PhantomUnsync,
}

impl<T: ShmData, const N: usize> Sender<T, N, Owner> {
    /// Creates the segment and becomes its Owner.
    pub fn create(name: &str, opts: &ShmOptions) -> Result<Self> {
        let shm = SharedMemory::create(name, opts, |ptr| {
            // SAFETY: fresh exclusive mapping from SharedMemory::create.
            unsafe { BoundedQueue::<T, N>::init_in_place(ptr) }
        })?;
        debug!(path = %shm.path(), capacity = N, "created ipc queue sender");
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: ShmData, const N: usize> Sender<T, N, User> {
    /// Attaches to a segment another process created.
    pub fn open(name: &str, opts: &ShmOptions) -> Result<Self> {
        let shm = SharedMemory::open(name, opts)?;
        debug!(path = %shm.path(), capacity = N, "opened ipc queue sender");
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: ShmData, const N: usize, M: ShmMode> Sender<T, N, M> {
    /// Sends a value, spinning while the queue is full. Never drops data.
    #[inline]
    pub fn send(&self, value: T) {
        // SAFETY: a Sender is this process's unique producer handle
        // (move-only, !Sync); the deployment guarantees no second producer
        // process (see module docs).
        unsafe { (*self.shm).push(value) }
    }

    /// Attempts to send without blocking. Returns `false` iff full.
    #[inline]
    pub fn try_send(&self, value: T) -> bool {
        // SAFETY: as in send().
        unsafe { (*self.shm).try_push(value) }
    }

    /// Sends with a time budget. Returns `false` if the queue stayed full
    /// for the whole `timeout`.
    #[inline]
    pub fn send_timeout(&self, value: T, timeout: Duration) -> bool {
        self.send_deadline(value, Instant::now() + timeout)
    }

    /// Sends with an absolute deadline.
    #[inline]
    pub fn send_deadline(&self, value: T, deadline: Instant) -> bool {
        loop {
            if self.try_send(value) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            cpu_relax();
        }
    }

    /// Writes one slot in place through `writer`, spinning while full.
    #[inline]
    pub fn send_with<F: FnMut(&mut T)>(&self, writer: F) {
        // SAFETY: as in send().
        unsafe { (*self.shm).produce(writer) }
    }

    /// Sends values from the slice until the queue fills; returns how many
    /// were accepted.
    pub fn send_batch(&self, values: &[T]) -> usize {
        let mut sent = 0;
        for &value in values {
            if !self.try_send(value) {
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Number of queued elements (approximate under concurrency).
    #[must_use]
    pub fn len(&self) -> usize {
        self.shm.len()
    }

    /// Whether the queue is currently full (approximate under concurrency).
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.shm.is_full()
    }

    /// Fixed capacity `N`.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Full path of the backing segment.
    #[must_use]
    pub fn path(&self) -> &str {
        self.shm.path()
    }
}

/// Read end of a cross-process SPSC queue.
pub struct Receiver<T: ShmData, const N: usize, M: ShmMode> {
    shm: SharedMemory<BoundedQueue<T, N>, M>,
    _unsync: PhantomUnsync,
}

impl<T: ShmData, const N: usize> Receiver<T, N, Owner> {
    /// Creates the segment and becomes its Owner (the "daemon inbox"
    /// pattern: the consumer outlives the producers that attach to it).
    pub fn create(name: &str, opts: &ShmOptions) -> Result<Self> {
        let shm = SharedMemory::create(name, opts, |ptr| {
            // SAFETY: fresh exclusive mapping from SharedMemory::create.
            unsafe { BoundedQueue::<T, N>::init_in_place(ptr) }
        })?;
        debug!(path = %shm.path(), capacity = N, "created ipc queue receiver");
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: ShmData, const N: usize> Receiver<T, N, User> {
    /// Attaches to a segment another process created.
    pub fn open(name: &str, opts: &ShmOptions) -> Result<Self> {
        let shm = SharedMemory::open(name, opts)?;
        debug!(path = %shm.path(), capacity = N, "opened ipc queue receiver");
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: ShmData, const N: usize, M: ShmMode> Receiver<T, N, M> {
    /// Receives a value, spinning while the queue is empty.
    #[inline]
    #[must_use]
    pub fn receive(&self) -> T {
        // SAFETY: a Receiver is this process's unique consumer handle
        // (move-only, !Sync); the deployment guarantees no second consumer
        // process (see module docs).
        unsafe { (*self.shm).pop() }
    }

    /// Attempts to receive without blocking. Returns `None` iff empty.
    #[inline]
    #[must_use]
    pub fn try_receive(&self) -> Option<T> {
        // SAFETY: as in receive().
        unsafe { (*self.shm).try_pop() }
    }

    /// Receives with a time budget.
    #[inline]
    #[must_use]
    pub fn receive_timeout(&self, timeout: Duration) -> Option<T> {
        self.receive_deadline(Instant::now() + timeout)
    }

    /// Receives with an absolute deadline.
    #[inline]
    #[must_use]
    pub fn receive_deadline(&self, deadline: Instant) -> Option<T> {
        loop {
            if let Some(value) = self.try_receive() {
                return Some(value);
            }
            if Instant::now() >= deadline {
                return None;
            }
            cpu_relax();
        }
    }

    /// Consumes one slot in place through `visitor`, spinning while empty.
    #[inline]
    pub fn receive_with<F: FnMut(&mut T)>(&self, visitor: F) {
        // SAFETY: as in receive().
        unsafe { (*self.shm).consume(visitor) }
    }

    /// Fills `out` from the queue until it empties; returns how many values
    /// were received.
    pub fn receive_batch(&self, out: &mut [T]) -> usize {
        let mut received = 0;
        while received < out.len() {
            match self.try_receive() {
                Some(value) => {
                    out[received] = value;
                    received += 1;
                }
                None => break,
            }
        }
        received
    }

    /// Number of queued elements (approximate under concurrency).
    #[must_use]
    pub fn len(&self) -> usize {
        self.shm.len()
    }

    /// Whether the queue is currently empty (approximate under concurrency).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shm.is_empty()
    }

    /// Fixed capacity `N`.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Full path of the backing segment.
    #[must_use]
    pub fn path(&self) -> &str {
        self.shm.path()
    }
}

// =============================================================================
// Snapshot channel (single slot)
// =============================================================================

/// Creates the Owner publisher and a User subscriber for a fresh segment.
pub fn snapshot<T: ShmData>(
    name: &str,
    opts: &ShmOptions,
) -> Result<(Publisher<T, Owner>, Subscriber<T, User>)> {
    let publisher = Publisher::create(name, opts)?;
    let subscriber = Subscriber::open(name, opts)?;
    Ok((publisher, subscriber))
}

/// Write end of a cross-process snapshot channel.
pub struct Publisher<T: ShmData, M: ShmMode> {
    shm: SharedMemory<SeqLock<T>, M>,
    _unsync: PhantomUnsync,
}

impl<T: ShmData> Publisher<T, Owner> {
    /// Creates the segment and becomes its Owner.
    pub fn create(name: &str, opts: &ShmOptions) -> Result<Self> {
        let shm = SharedMemory::create(name, opts, |ptr| {
            // SAFETY: fresh exclusive mapping from SharedMemory::create.
            unsafe { SeqLock::<T>::init_in_place(ptr) }
        })?;
        debug!(path = %shm.path(), "created ipc snapshot publisher");
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: ShmData> Publisher<T, User> {
    /// Attaches to a segment another process created.
    pub fn open(name: &str, opts: &ShmOptions) -> Result<Self> {
        let shm = SharedMemory::open(name, opts)?;
        debug!(path = %shm.path(), "opened ipc snapshot publisher");
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: ShmData, M: ShmMode> Publisher<T, M> {
    /// Publishes a new value. Wait-free.
    #[inline]
    pub fn publish(&self, value: T) {
        // SAFETY: unique publisher handle in this process; deployments keep
        // a single publishing process per name (see module docs).
        unsafe { (*self.shm).push(value) }
    }

    /// Publishes by mutating the slot in place.
    #[inline]
    pub fn publish_with<F: FnOnce(&mut T)>(&self, writer: F) {
        // SAFETY: as in publish().
        unsafe { (*self.shm).produce(writer) }
    }

    /// Full path of the backing segment.
    #[must_use]
    pub fn path(&self) -> &str {
        self.shm.path()
    }
}

/// Read end of a cross-process snapshot channel. Open as many as needed —
/// the cell is multi-consumer.
pub struct Subscriber<T: ShmData, M: ShmMode> {
    shm: SharedMemory<SeqLock<T>, M>,
}

impl<T: ShmData> Subscriber<T, Owner> {
    /// Creates the segment and becomes its Owner.
    pub fn create(name: &str, opts: &ShmOptions) -> Result<Self> {
        let shm = SharedMemory::create(name, opts, |ptr| {
            // SAFETY: fresh exclusive mapping from SharedMemory::create.
            unsafe { SeqLock::<T>::init_in_place(ptr) }
        })?;
        debug!(path = %shm.path(), "created ipc snapshot subscriber");
        Ok(Self { shm })
    }
}

impl<T: ShmData> Subscriber<T, User> {
    /// Attaches to a segment another process created.
    pub fn open(name: &str, opts: &ShmOptions) -> Result<Self> {
        let shm = SharedMemory::open(name, opts)?;
        debug!(path = %shm.path(), "opened ipc snapshot subscriber");
        Ok(Self { shm })
    }
}

impl<T: ShmData, M: ShmMode> Subscriber<T, M> {
    /// Fetches the latest value, spinning until a consistent copy lands.
    #[inline]
    #[must_use]
    pub fn fetch(&self) -> T {
        self.shm.pop_latest()
    }

    /// Attempts a single consistent fetch.
    #[inline]
    #[must_use]
    pub fn try_fetch(&self) -> Option<T> {
        self.shm.try_pop_latest()
    }

    /// Attempts a consistent fetch into `out`, leaving it untouched on retry.
    #[inline]
    pub fn try_fetch_into(&self, out: &mut T) -> bool {
        self.shm.try_pop_latest_into(out)
    }

    /// Fetches (spinning) and hands the snapshot to `visitor`.
    #[inline]
    pub fn fetch_with<F: FnOnce(&T)>(&self, visitor: F) {
        self.shm.consume_latest(visitor);
    }

    /// Fetches with a time budget.
    #[inline]
    pub fn fetch_timeout(&self, out: &mut T, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_fetch_into(out) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            cpu_relax();
        }
    }

    /// Full path of the backing segment.
    #[must_use]
    pub fn path(&self) -> &str {
        self.shm.path()
    }
}

// =============================================================================
// Buffered snapshot channel (ring)
// =============================================================================

/// Creates the Owner publisher and a User subscriber for a fresh buffered
/// segment.
pub fn buffered_snapshot<T: ShmData, const N: usize>(
    name: &str,
    opts: &ShmOptions,
) -> Result<(BufferedPublisher<T, N, Owner>, BufferedSubscriber<T, N, User>)> {
    let publisher = BufferedPublisher::create(name, opts)?;
    let subscriber = BufferedSubscriber::open(name, opts)?;
    Ok((publisher, subscriber))
}

/// Write end of a cross-process buffered snapshot channel.
pub struct BufferedPublisher<T: ShmData, const N: usize, M: ShmMode> {
    shm: SharedMemory<SeqLockRing<T, N>, M>,
    _unsync: PhantomUnsync,
}

impl<T: ShmData, const N: usize> BufferedPublisher<T, N, Owner> {
    /// Creates the segment and becomes its Owner.
    pub fn create(name: &str, opts: &ShmOptions) -> Result<Self> {
        let shm = SharedMemory::create(name, opts, |ptr| {
            // SAFETY: fresh exclusive mapping from SharedMemory::create.
            unsafe { SeqLockRing::<T, N>::init_in_place(ptr) }
        })?;
        debug!(path = %shm.path(), depth = N, "created ipc buffered publisher");
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: ShmData, const N: usize> BufferedPublisher<T, N, User> {
    /// Attaches to a segment another process created.
    pub fn open(name: &str, opts: &ShmOptions) -> Result<Self> {
        let shm = SharedMemory::open(name, opts)?;
        debug!(path = %shm.path(), depth = N, "opened ipc buffered publisher");
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: ShmData, const N: usize, M: ShmMode> BufferedPublisher<T, N, M> {
    /// Publishes a new value. Wait-free.
    #[inline]
    pub fn publish(&self, value: T) {
        // SAFETY: as in Publisher::publish.
        unsafe { (*self.shm).push(value) }
    }

    /// Publishes by mutating the next slot in place.
    #[inline]
    pub fn publish_with<F: FnOnce(&mut T)>(&self, writer: F) {
        // SAFETY: as in publish().
        unsafe { (*self.shm).produce(writer) }
    }

    /// Full path of the backing segment.
    #[must_use]
    pub fn path(&self) -> &str {
        self.shm.path()
    }
}

/// Read end of a cross-process buffered snapshot channel.
pub struct BufferedSubscriber<T: ShmData, const N: usize, M: ShmMode> {
    shm: SharedMemory<SeqLockRing<T, N>, M>,
}

impl<T: ShmData, const N: usize> BufferedSubscriber<T, N, Owner> {
    /// Creates the segment and becomes its Owner.
    pub fn create(name: &str, opts: &ShmOptions) -> Result<Self> {
        let shm = SharedMemory::create(name, opts, |ptr| {
            // SAFETY: fresh exclusive mapping from SharedMemory::create.
            unsafe { SeqLockRing::<T, N>::init_in_place(ptr) }
        })?;
        debug!(path = %shm.path(), depth = N, "created ipc buffered subscriber");
        Ok(Self { shm })
    }
}

impl<T: ShmData, const N: usize> BufferedSubscriber<T, N, User> {
    /// Attaches to a segment another process created.
    pub fn open(name: &str, opts: &ShmOptions) -> Result<Self> {
        let shm = SharedMemory::open(name, opts)?;
        debug!(path = %shm.path(), depth = N, "opened ipc buffered subscriber");
        Ok(Self { shm })
    }
}

impl<T: ShmData, const N: usize, M: ShmMode> BufferedSubscriber<T, N, M> {
    /// Fetches the latest value, spinning until a consistent copy lands.
    #[inline]
    #[must_use]
    pub fn fetch(&self) -> T {
        self.shm.pop_latest()
    }

    /// Attempts a single consistent fetch.
    #[inline]
    #[must_use]
    pub fn try_fetch(&self) -> Option<T> {
        self.shm.try_pop_latest()
    }

    /// Attempts a consistent fetch into `out`, leaving it untouched on retry.
    #[inline]
    pub fn try_fetch_into(&self, out: &mut T) -> bool {
        self.shm.try_pop_latest_into(out)
    }

    /// Fetches (spinning) and hands the snapshot to `visitor`.
    #[inline]
    pub fn fetch_with<F: FnOnce(&T)>(&self, visitor: F) {
        self.shm.consume_latest(visitor);
    }

    /// Fetches with a time budget.
    #[inline]
    pub fn fetch_timeout(&self, out: &mut T, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_fetch_into(out) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            cpu_relax();
        }
    }

    /// Full path of the backing segment.
    #[must_use]
    pub fn path(&self) -> &str {
        self.shm.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmError;
    use rustix::io::Errno;

    macro_rules! unwrap_or_skip {
        ($expr:expr) => {
            match $expr {
                Ok(value) => value,
                Err(ShmError::Posix { source, .. }) if source == Errno::ACCESS => {
                    eprintln!("skipping test: shared memory access denied");
                    return;
                }
                Err(err) => panic!("unexpected shared memory error: {err}"),
            }
        };
    }

    #[test]
    fn queue_pair_roundtrip() {
        let opts = ShmOptions::new();
        let (tx, rx) = unwrap_or_skip!(queue::<u64, 8>("rill-test-ipc-queue", &opts));

        tx.send(42);
        assert_eq!(rx.try_receive(), Some(42));
        assert_eq!(rx.try_receive(), None);
        assert_eq!(tx.path(), "/dev/shm/rill-test-ipc-queue");
    }

    #[test]
    fn receiver_creates_sender_opens() {
        let opts = ShmOptions::new();
        // Daemon owns its inbox; clients attach the sending side.
        let inbox = unwrap_or_skip!(Receiver::<u64, 8, Owner>::create(
            "rill-test-ipc-inbox",
            &opts
        ));
        let outbox = unwrap_or_skip!(Sender::<u64, 8, User>::open("rill-test-ipc-inbox", &opts));

        outbox.send(100);
        outbox.send(200);
        assert_eq!(inbox.try_receive(), Some(100));
        assert_eq!(inbox.try_receive(), Some(200));
        assert_eq!(inbox.try_receive(), None);
    }

    #[test]
    fn queue_full_and_timeout() {
        let opts = ShmOptions::new();
        let (tx, _rx) = unwrap_or_skip!(queue::<u64, 2>("rill-test-ipc-backpressure", &opts));

        assert!(tx.try_send(1));
        assert!(tx.try_send(2));
        assert!(!tx.try_send(3));

        let start = std::time::Instant::now();
        assert!(!tx.send_timeout(3, Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn snapshot_pair_conflates() {
        let opts = ShmOptions::new();
        let (px, sx) = unwrap_or_skip!(snapshot::<u64>("rill-test-ipc-snapshot", &opts));

        for i in 0..100 {
            px.publish(i);
        }
        assert_eq!(sx.fetch(), 99);
    }

    #[test]
    fn buffered_snapshot_pair() {
        let opts = ShmOptions::new();
        let (px, sx) = unwrap_or_skip!(buffered_snapshot::<u64, 8>(
            "rill-test-ipc-buffered",
            &opts
        ));

        px.publish(7);
        let mut out = 0;
        assert!(sx.try_fetch_into(&mut out));
        assert_eq!(out, 7);
    }

    #[test]
    fn open_missing_segment_fails() {
        let opts = ShmOptions::new();
        match Receiver::<u64, 8, User>::open("rill-test-ipc-missing", &opts) {
            Err(ShmError::Posix { op: "open", .. }) => {}
            Err(err) => panic!("expected open failure, got: {err}"),
            Ok(_) => panic!("expected open failure, but open succeeded"),
        }
    }

    #[test]
    fn capacity_mismatch_is_detected() {
        let opts = ShmOptions::new();
        // A user expecting a larger ring than the owner built must be
        // refused by the size check.
        let _owner = unwrap_or_skip!(Sender::<u64, 8, Owner>::create(
            "rill-test-ipc-capacity",
            &opts
        ));
        match Receiver::<u64, 4096, User>::open("rill-test-ipc-capacity", &opts) {
            Err(ShmError::SizeMismatch { .. }) => {}
            Err(err) => panic!("expected SizeMismatch, got: {err}"),
            Ok(_) => panic!("expected SizeMismatch, but open succeeded"),
        }
    }
}
