//! In-process (inter-thread) channels.
//!
//! Thin, move-only endpoints over the lock-free primitives, shared through
//! an `Arc`:
//!
//! - [`queue`] — SPSC FIFO: [`Sender`] / [`Receiver`] over a
//!   [`BoundedQueue`]. Backpressure: blocking sends wait for space, nothing
//!   is dropped.
//! - [`snapshot`] — latest-value broadcast: [`Publisher`] / [`Subscriber`]
//!   over a single-slot [`SeqLock`]. Good for low-rate state (configuration,
//!   mode switches) read by many threads.
//! - [`buffered_snapshot`] — the same contract over a [`SeqLockRing`], for
//!   high-rate publishing (market data, sensor frames) where the ring keeps
//!   the writer off the readers' cache lines.
//!
//! Endpoint types are `Send` but deliberately `!Sync`; holding one is
//! holding the role. Subscribers are additionally `Clone` — the seqlock side
//! is multi-consumer by design.
//!
//! The `*_huge_pages` constructors place the primitive in an anonymous 2 MiB
//! mapping instead of the heap; this is purely an allocation detail and
//! fails loudly when the kernel has no huge pages reserved.

use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;

use crate::platform::cpu_relax;
use crate::queue::BoundedQueue;
use crate::seqlock::{SeqLock, SeqLockRing};
use crate::shm::{AnonHugePages, Result};
use crate::trace::debug;
use crate::types::{PhantomUnsync, ShmData};

/// Ring length used by [`buffered_snapshot`] unless the caller picks one.
pub const DEFAULT_SNAPSHOT_DEPTH: usize = 8;

/// Where an in-process primitive lives. Heap for the common case, an
/// anonymous huge-page mapping when asked for.
enum Backing<P> {
    Heap(P),
    Huge(AnonHugePages<P>),
}

impl<P> Deref for Backing<P> {
    type Target = P;

    #[inline]
    fn deref(&self) -> &P {
        match self {
            Backing::Heap(p) => p,
            Backing::Huge(m) => &**m,
        }
    }
}

// =============================================================================
// Queue channel
// =============================================================================

/// Creates an SPSC FIFO channel with capacity `N` (a power of two).
#[must_use]
pub fn queue<T: ShmData, const N: usize>() -> (Sender<T, N>, Receiver<T, N>) {
    let ring = Arc::new(Backing::Heap(BoundedQueue::new()));
    debug!(capacity = N, "created itc queue");
    (
        Sender {
            ring: Arc::clone(&ring),
            _unsync: PhantomData,
        },
        Receiver {
            ring,
            _unsync: PhantomData,
        },
    )
}

/// Creates an SPSC FIFO channel backed by anonymous huge pages.
///
/// Identical semantics to [`queue`]; fails when huge pages are unavailable
/// rather than silently using the heap.
pub fn queue_huge_pages<T: ShmData, const N: usize>() -> Result<(Sender<T, N>, Receiver<T, N>)> {
    let mapping = AnonHugePages::new(|ptr| {
        // SAFETY: fresh exclusive mapping from AnonHugePages::new.
        unsafe { BoundedQueue::<T, N>::init_in_place(ptr) }
    })?;
    let ring = Arc::new(Backing::Huge(mapping));
    debug!(capacity = N, "created itc queue on huge pages");
    Ok((
        Sender {
            ring: Arc::clone(&ring),
            _unsync: PhantomData,
        },
        Receiver {
            ring,
            _unsync: PhantomData,
        },
    ))
}

/// Write end of an in-process SPSC queue.
///
/// `Send` but not `Sync`, and not clonable: exactly one thread at a time is
/// the producer.
pub struct Sender<T: ShmData, const N: usize> {
    ring: Arc<Backing<BoundedQueue<T, N>>>,
    _unsync: PhantomUnsync,
}

impl<T: ShmData, const N: usize> Sender<T, N> {
    /// Sends a value, spinning while the queue is full. Never drops data.
    #[inline]
    pub fn send(&self, value: T) {
        // SAFETY: a Sender is the queue's unique producer handle (move-only,
        // !Sync), so this thread is the only producer.
        unsafe { self.ring.push(value) }
    }

    /// Attempts to send without blocking. Returns `false` iff full.
    #[inline]
    pub fn try_send(&self, value: T) -> bool {
        // SAFETY: as in send().
        unsafe { self.ring.try_push(value) }
    }

    /// Sends with a time budget. Returns `false` if the queue stayed full
    /// for the whole `timeout`.
    #[inline]
    pub fn send_timeout(&self, value: T, timeout: Duration) -> bool {
        self.send_deadline(value, Instant::now() + timeout)
    }

    /// Sends with an absolute deadline. Returns `false` once `deadline` has
    /// passed with the queue still full.
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
        unsafe { self.ring.produce(writer) }
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
        self.ring.len()
    }

    /// Whether the queue is currently full (approximate under concurrency).
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Fixed capacity `N`.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }
}

/// Read end of an in-process SPSC queue.
///
/// `Send` but not `Sync`, and not clonable: exactly one thread at a time is
/// the consumer.
pub struct Receiver<T: ShmData, const N: usize> {
    ring: Arc<Backing<BoundedQueue<T, N>>>,
    _unsync: PhantomUnsync,
}

impl<T: ShmData, const N: usize> Receiver<T, N> {
    /// Receives a value, spinning while the queue is empty.
    #[inline]
    #[must_use]
    pub fn receive(&self) -> T {
        // SAFETY: a Receiver is the queue's unique consumer handle
        // (move-only, !Sync), so this thread is the only consumer.
        unsafe { self.ring.pop() }
    }

    /// Attempts to receive without blocking. Returns `None` iff empty.
    #[inline]
    #[must_use]
    pub fn try_receive(&self) -> Option<T> {
        // SAFETY: as in receive().
        unsafe { self.ring.try_pop() }
    }

    /// Receives with a time budget. Returns `None` if the queue stayed
    /// empty for the whole `timeout`.
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
        unsafe { self.ring.consume(visitor) }
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
        self.ring.len()
    }

    /// Whether the queue is currently empty (approximate under concurrency).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Fixed capacity `N`.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }
}

// =============================================================================
// Snapshot channel (single slot)
// =============================================================================

/// Creates a latest-value snapshot channel over a single-slot [`SeqLock`].
#[must_use]
pub fn snapshot<T: ShmData>() -> (Publisher<T>, Subscriber<T>) {
    let cell = Arc::new(SeqLock::new());
    debug!("created itc snapshot");
    (
        Publisher {
            cell: Arc::clone(&cell),
            _unsync: PhantomData,
        },
        Subscriber { cell },
    )
}

/// Write end of a snapshot channel. One per channel.
pub struct Publisher<T: ShmData> {
    cell: Arc<SeqLock<T>>,
    _unsync: PhantomUnsync,
}

impl<T: ShmData> Publisher<T> {
    /// Publishes a new value. Wait-free; readers mid-copy simply retry.
    #[inline]
    pub fn publish(&self, value: T) {
        // SAFETY: a Publisher is the cell's unique writer handle (move-only,
        // !Sync, not Clone), so this thread is the only writer.
        unsafe { self.cell.push(value) }
    }

    /// Publishes by mutating the slot in place.
    #[inline]
    pub fn publish_with<F: FnOnce(&mut T)>(&self, writer: F) {
        // SAFETY: as in publish().
        unsafe { self.cell.produce(writer) }
    }
}

/// Read end of a snapshot channel. Clonable — any number of threads may
/// read concurrently.
pub struct Subscriber<T: ShmData> {
    cell: Arc<SeqLock<T>>,
}

impl<T: ShmData> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: ShmData> Subscriber<T> {
    /// Fetches the latest value, spinning until a consistent copy lands.
    #[inline]
    #[must_use]
    pub fn fetch(&self) -> T {
        self.cell.pop_latest()
    }

    /// Attempts a single consistent fetch. `None` means a write overlapped
    /// this read — retry when convenient.
    #[inline]
    #[must_use]
    pub fn try_fetch(&self) -> Option<T> {
        self.cell.try_pop_latest()
    }

    /// Attempts a consistent fetch into `out`, leaving it untouched on retry.
    #[inline]
    pub fn try_fetch_into(&self, out: &mut T) -> bool {
        self.cell.try_pop_latest_into(out)
    }

    /// Fetches (spinning) and hands the snapshot to `visitor`.
    #[inline]
    pub fn fetch_with<F: FnOnce(&T)>(&self, visitor: F) {
        self.cell.consume_latest(visitor);
    }

    /// Fetches with a time budget. Returns `false` if no consistent copy
    /// landed within `timeout` (only plausible under extreme write rates).
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
}

// =============================================================================
// Buffered snapshot channel (ring)
// =============================================================================

/// Creates a buffered snapshot channel over a [`SeqLockRing`] of `N` slots
/// (power of two, `N >= 2`; [`DEFAULT_SNAPSHOT_DEPTH`] is a good default).
#[must_use]
pub fn buffered_snapshot<T: ShmData, const N: usize>()
-> (BufferedPublisher<T, N>, BufferedSubscriber<T, N>) {
    let ring = Arc::new(Backing::Heap(SeqLockRing::new()));
    debug!(depth = N, "created itc buffered snapshot");
    (
        BufferedPublisher {
            ring: Arc::clone(&ring),
            _unsync: PhantomData,
        },
        BufferedSubscriber { ring },
    )
}

/// Creates a buffered snapshot channel backed by anonymous huge pages.
pub fn buffered_snapshot_huge_pages<T: ShmData, const N: usize>()
-> Result<(BufferedPublisher<T, N>, BufferedSubscriber<T, N>)> {
    let mapping = AnonHugePages::new(|ptr| {
        // SAFETY: fresh exclusive mapping from AnonHugePages::new.
        unsafe { SeqLockRing::<T, N>::init_in_place(ptr) }
    })?;
    let ring = Arc::new(Backing::Huge(mapping));
    debug!(depth = N, "created itc buffered snapshot on huge pages");
    Ok((
        BufferedPublisher {
            ring: Arc::clone(&ring),
            _unsync: PhantomData,
        },
        BufferedSubscriber { ring },
    ))
}

/// Write end of a buffered snapshot channel. One per channel.
pub struct BufferedPublisher<T: ShmData, const N: usize = 8> {
    ring: Arc<Backing<SeqLockRing<T, N>>>,
    _unsync: PhantomUnsync,
}

impl<T: ShmData, const N: usize> BufferedPublisher<T, N> {
    /// Publishes a new value. Wait-free.
    #[inline]
    pub fn publish(&self, value: T) {
        // SAFETY: unique writer handle, as in Publisher::publish.
        unsafe { self.ring.push(value) }
    }

    /// Publishes by mutating the next slot in place.
    #[inline]
    pub fn publish_with<F: FnOnce(&mut T)>(&self, writer: F) {
        // SAFETY: as in publish().
        unsafe { self.ring.produce(writer) }
    }
}

/// Read end of a buffered snapshot channel. Clonable.
pub struct BufferedSubscriber<T: ShmData, const N: usize = 8> {
    ring: Arc<Backing<SeqLockRing<T, N>>>,
}

impl<T: ShmData, const N: usize> Clone for BufferedSubscriber<T, N> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T: ShmData, const N: usize> BufferedSubscriber<T, N> {
    /// Fetches the latest value, spinning until a consistent copy lands.
    #[inline]
    #[must_use]
    pub fn fetch(&self) -> T {
        self.ring.pop_latest()
    }

    /// Attempts a single consistent fetch.
    #[inline]
    #[must_use]
    pub fn try_fetch(&self) -> Option<T> {
        self.ring.try_pop_latest()
    }

    /// Attempts a consistent fetch into `out`, leaving it untouched on retry.
    #[inline]
    pub fn try_fetch_into(&self, out: &mut T) -> bool {
        self.ring.try_pop_latest_into(out)
    }

    /// Fetches (spinning) and hands the snapshot to `visitor`.
    #[inline]
    pub fn fetch_with<F: FnOnce(&T)>(&self, visitor: F) {
        self.ring.consume_latest(visitor);
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_basic_roundtrip() {
        let (tx, rx) = queue::<u64, 8>();

        tx.send(42);
        assert_eq!(rx.try_receive(), Some(42));
        assert_eq!(rx.try_receive(), None);
    }

    #[test]
    fn queue_try_send_reports_full() {
        let (tx, rx) = queue::<u64, 4>();

        for i in 0..4 {
            assert!(tx.try_send(i));
        }
        assert!(!tx.try_send(999));
        assert!(tx.is_full());

        assert_eq!(rx.try_receive(), Some(0));
        assert!(tx.try_send(4));
    }

    #[test]
    fn queue_batch_ops() {
        let (tx, rx) = queue::<u64, 4>();

        let sent = tx.send_batch(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(sent, 4);

        let mut out = [0u64; 8];
        let received = rx.receive_batch(&mut out);
        assert_eq!(received, 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn queue_timeout_expires_on_full_queue() {
        let (tx, _rx) = queue::<u64, 2>();

        assert!(tx.try_send(1));
        assert!(tx.try_send(2));

        let start = std::time::Instant::now();
        let accepted = tx.send_timeout(3, Duration::from_millis(50));
        let elapsed = start.elapsed();

        assert!(!accepted);
        assert!(elapsed >= Duration::from_millis(50), "returned after {elapsed:?}");
    }

    #[test]
    fn queue_timeout_succeeds_when_space_exists() {
        let (tx, rx) = queue::<u64, 2>();
        assert!(tx.send_timeout(7, Duration::from_millis(50)));
        assert_eq!(rx.receive_timeout(Duration::from_millis(50)), Some(7));
        assert_eq!(rx.receive_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn queue_visitor_ops() {
        let (tx, rx) = queue::<u64, 4>();
        tx.send_with(|slot| *slot = 11);
        let mut seen = 0;
        rx.receive_with(|slot| seen = *slot);
        assert_eq!(seen, 11);
    }

    #[test]
    fn queue_cross_thread_fifo() {
        let (tx, rx) = queue::<u64, 1024>();
        let count = 100_000u64;

        let producer = std::thread::spawn(move || {
            for i in 0..count {
                tx.send(i);
            }
        });

        for i in 0..count {
            assert_eq!(rx.receive(), i);
        }
        producer.join().unwrap();
        assert!(rx.is_empty());
    }

    #[test]
    fn queue_huge_pages_or_loud_failure() {
        match queue_huge_pages::<u64, 1024>() {
            Ok((tx, rx)) => {
                tx.send(5);
                assert_eq!(rx.receive(), 5);
            }
            Err(crate::shm::ShmError::HugePagesUnavailable { .. }) => {
                eprintln!("skipping: no huge pages reserved");
            }
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn snapshot_roundtrip() {
        let (px, sx) = snapshot::<u64>();

        px.publish(42);
        assert_eq!(sx.fetch(), 42);
        // Deterministic without intervening publishes.
        assert_eq!(sx.fetch(), 42);

        px.publish_with(|slot| *slot += 1);
        assert_eq!(sx.fetch(), 43);
    }

    #[test]
    fn snapshot_many_subscribers() {
        let (px, sx) = snapshot::<u64>();
        px.publish(9);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sx = sx.clone();
                std::thread::spawn(move || sx.fetch())
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), 9);
        }
    }

    #[test]
    fn snapshot_fetch_timeout_succeeds_immediately() {
        let (px, sx) = snapshot::<u64>();
        px.publish(3);

        let mut out = 0;
        assert!(sx.fetch_timeout(&mut out, Duration::from_millis(10)));
        assert_eq!(out, 3);
    }

    #[test]
    fn buffered_snapshot_conflates() {
        let (px, sx) = buffered_snapshot::<u64, 8>();

        for i in 1..=1000 {
            px.publish(i);
        }
        assert_eq!(sx.fetch(), 1000);
    }

    #[test]
    fn buffered_snapshot_concurrent_monotonic() {
        let (px, sx) = buffered_snapshot::<u64, 8>();
        let last = 50_000u64;

        let publisher = std::thread::spawn(move || {
            for i in 1..=last {
                px.publish(i);
            }
        });

        let mut prev = 0u64;
        while prev != last {
            if let Some(v) = sx.try_fetch() {
                assert!(v >= prev, "conflation went backwards: {prev} -> {v}");
                prev = v;
            }
        }
        publisher.join().unwrap();
    }
}
