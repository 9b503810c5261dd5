//! Single-writer, many-reader "latest value" cells.
//!
//! Three siblings share one protocol:
//!
//! - [`SeqLock`] — a single slot. Minimal footprint; writer and readers
//!   contend on the same cache line, which is fine when writes are
//!   infrequent or readers are rare.
//! - [`SeqLockRing`] — `N` slots (power of two, `N >= 2`), each on its own
//!   cache line. The writer moves to slot `i + 1` while readers still copy
//!   slot `i`, so coherence traffic flows one way instead of ping-ponging.
//! - [`TripleBuffer`] — the classic three-slot arrangement with a
//!   branch-free slot rotation, for when two spare slots are enough and the
//!   monotonic global index is not worth its line.
//!
//! Every slot carries a 64-bit sequence: even = stable, odd = writer in
//! progress. A reader copies the payload optimistically and keeps the copy
//! only if the sequence was even and unchanged across the copy; otherwise it
//! reports a retry. The writer never waits on readers — older values are
//! conflated away, which is the point.
//!
//! Writer methods are `unsafe` (single-writer contract, enforced safely by
//! the channel endpoints); reader methods are safe and may be called from
//! any number of threads concurrently.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering, fence};

use crate::platform::cpu_relax;
use crate::types::{RoleCell, ShmData, ShmLayout, WriterRole};

/// One sequence-guarded slot, kept on its own cache line so ring variants
/// can write slot `i + 1` without disturbing readers of slot `i`.
#[repr(C)]
#[repr(align(64))]
struct Slot<T> {
    /// Even = stable, odd = write in progress. Strictly monotonic per slot.
    seq: AtomicU64,
    data: UnsafeCell<T>,
}

impl<T: ShmData> Slot<T> {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            data: UnsafeCell::new(T::default()),
        }
    }

    /// Core write protocol: mark odd, fence, mutate, fence, mark even.
    ///
    /// The two release fences order the sequence stores against the payload
    /// mutation; the reader's acquire fence plus the `s1 == s2` check reject
    /// any copy that overlapped this window.
    ///
    /// # Safety
    ///
    /// Caller must be the single writer of the containing cell.
    #[inline]
    unsafe fn write<F: FnOnce(&mut T)>(&self, writer: F) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        // SAFETY: readers never form a reference to the payload (they go
        // through read_volatile), and the single-writer contract rules out a
        // second mutable reference.
        writer(unsafe { &mut *self.data.get() });

        fence(Ordering::Release);
        self.seq.store(seq.wrapping_add(2), Ordering::Relaxed);
    }

    /// Core read protocol. Returns the copied value if it was consistent.
    #[inline]
    fn read(&self) -> Option<T> {
        let s1 = self.seq.load(Ordering::Acquire);
        if s1 & 1 != 0 {
            return None; // Writer in progress
        }

        // Optimistic copy. This may race with a concurrent write; the copy
        // is byte-level (volatile, never a reference) and is discarded below
        // unless the sequence proves it was stable. ShmData keeps a torn
        // copy inert.
        let value = unsafe { std::ptr::read_volatile(self.data.get()) };

        fence(Ordering::Acquire);
        let s2 = self.seq.load(Ordering::Relaxed);

        (s1 == s2).then_some(value)
    }

    unsafe fn init_in_place(ptr: *mut Self) {
        // SAFETY: per caller contract of the containers' init_in_place.
        unsafe {
            std::ptr::addr_of_mut!((*ptr).seq).write(AtomicU64::new(0));
            std::ptr::addr_of_mut!((*ptr).data).write(UnsafeCell::new(T::default()));
        }
    }
}

// =============================================================================
// SeqLock (single slot)
// =============================================================================

/// Single-slot sequence-lock cell: the degenerate `N = 1` ring.
///
/// The writer is wait-free; readers are lock-free with optimistic retry.
/// Readers only ever observe complete prior writes — a read that collides
/// with a write reports retry instead.
#[repr(C)]
pub struct SeqLock<T> {
    slot: Slot<T>,
}

impl<T: ShmData> SeqLock<T> {
    /// Creates a cell holding `T::default()` with an even (stable) sequence.
    #[must_use]
    pub fn new() -> Self {
        Self { slot: Slot::new() }
    }

    /// Initializes a cell directly inside freshly mapped shared memory.
    ///
    /// # Safety
    ///
    /// Same contract as [`BoundedQueue::init_in_place`](crate::queue::BoundedQueue::init_in_place).
    pub unsafe fn init_in_place(ptr: *mut Self) {
        // SAFETY: forwarded caller contract; slot is the first (only) field.
        unsafe { Slot::init_in_place(std::ptr::addr_of_mut!((*ptr).slot)) }
    }

    /// Writes the payload in place through `writer`. Wait-free.
    ///
    /// # Safety
    ///
    /// Caller must be the cell's only writer, with no concurrent call to any
    /// writer operation.
    #[inline]
    pub unsafe fn produce<F: FnOnce(&mut T)>(&self, writer: F) {
        // SAFETY: forwarded writer contract.
        unsafe { self.slot.write(writer) }
    }

    /// Publishes a new value. Wait-free.
    ///
    /// # Safety
    ///
    /// Same contract as [`produce`](Self::produce).
    #[inline]
    pub unsafe fn push(&self, value: T) {
        // SAFETY: forwarded writer contract.
        unsafe { self.slot.write(|slot| *slot = value) }
    }

    /// Attempts a consistent read, invoking `visitor` on the snapshot.
    ///
    /// Returns `false` iff a concurrent write overlapped the read; the
    /// visitor is not invoked in that case.
    #[inline]
    pub fn try_consume_latest<F: FnOnce(&T)>(&self, visitor: F) -> bool {
        match self.slot.read() {
            Some(value) => {
                visitor(&value);
                true
            }
            None => false,
        }
    }

    /// Attempts a consistent read into `out`, leaving it untouched on retry.
    #[inline]
    pub fn try_pop_latest_into(&self, out: &mut T) -> bool {
        match self.slot.read() {
            Some(value) => {
                *out = value;
                true
            }
            None => false,
        }
    }

    /// Attempts a consistent read.
    #[inline]
    #[must_use]
    pub fn try_pop_latest(&self) -> Option<T> {
        self.slot.read()
    }

    /// Reads the latest value, spinning until a consistent copy lands.
    #[inline]
    #[must_use]
    pub fn pop_latest(&self) -> T {
        loop {
            if let Some(value) = self.slot.read() {
                return value;
            }
            cpu_relax();
        }
    }

    /// Reads the latest value (spinning) and hands it to `visitor`.
    #[inline]
    pub fn consume_latest<F: FnOnce(&T)>(&self, visitor: F) {
        visitor(&self.pop_latest());
    }

    /// Slot count (always 1).
    #[must_use]
    pub const fn capacity(&self) -> usize {
        1
    }

    /// Best-effort check whether a write is in progress right now.
    #[must_use]
    pub fn busy(&self) -> bool {
        self.slot.seq.load(Ordering::Relaxed) & 1 != 0
    }
}

impl<T: ShmData> Default for SeqLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the payload is only touched through the sequence protocol; the
// single-writer contract lives on the unsafe writer methods.
unsafe impl<T: ShmData> Send for SeqLock<T> {}
unsafe impl<T: ShmData> Sync for SeqLock<T> {}

// SAFETY: repr(C), self-contained, atomics-only synchronization, no Drop
// reliance.
unsafe impl<T: ShmData> ShmLayout for SeqLock<T> {}

// =============================================================================
// SeqLockRing (N slots, N >= 2, power of two)
// =============================================================================

/// Writer-private line: the monotonic write index. Not shared, not atomic.
#[repr(C)]
#[repr(align(64))]
struct WriterLine {
    index: RoleCell<u64, WriterRole>,
}

/// Reader-shared line: the index of the most recent completed write.
#[repr(C)]
#[repr(align(64))]
struct GlobalLine {
    index: AtomicU64,
}

/// Multi-slot sequence-lock ring.
///
/// Writes land on slot `(global_index + 1) & (N - 1)` while readers copy the
/// slot named by `global_index`, so in the steady state the writer's store
/// traffic and the readers' load traffic touch different cache lines. A
/// reader only retries when the writer laps the whole ring during one copy.
#[repr(C)]
pub struct SeqLockRing<T, const N: usize> {
    writer: WriterLine,
    global: GlobalLine,
    slots: [Slot<T>; N],
}

impl<T: ShmData, const N: usize> SeqLockRing<T, N> {
    /// Compile-time assertion: at least two slots, power of two.
    /// (One slot is [`SeqLock`], three is [`TripleBuffer`].)
    const CAPACITY_OK: () = assert!(
        N >= 2 && N & (N - 1) == 0,
        "ring capacity must be a power of two >= 2"
    );

    const MASK: u64 = (N as u64) - 1;

    /// Creates a ring of default-valued slots, all sequences even.
    #[must_use]
    pub fn new() -> Self {
        let () = Self::CAPACITY_OK;
        Self {
            writer: WriterLine {
                index: RoleCell::new(0),
            },
            global: GlobalLine {
                index: AtomicU64::new(0),
            },
            slots: std::array::from_fn(|_| Slot::new()),
        }
    }

    /// Initializes a ring directly inside freshly mapped shared memory.
    ///
    /// # Safety
    ///
    /// Same contract as [`BoundedQueue::init_in_place`](crate::queue::BoundedQueue::init_in_place).
    pub unsafe fn init_in_place(ptr: *mut Self) {
        let () = Self::CAPACITY_OK;
        // SAFETY: per caller contract; fields written without intermediate
        // references.
        unsafe {
            std::ptr::addr_of_mut!((*ptr).writer).write(WriterLine {
                index: RoleCell::new(0),
            });
            std::ptr::addr_of_mut!((*ptr).global).write(GlobalLine {
                index: AtomicU64::new(0),
            });
            let slots = std::ptr::addr_of_mut!((*ptr).slots).cast::<Slot<T>>();
            for i in 0..N {
                Slot::init_in_place(slots.add(i));
            }
        }
    }

    /// Writes the next slot in place through `writer`, then publishes it.
    /// Wait-free.
    ///
    /// # Safety
    ///
    /// Caller must be the ring's only writer, with no concurrent call to any
    /// writer operation.
    #[inline]
    pub unsafe fn produce<F: FnOnce(&mut T)>(&self, writer: F) {
        // SAFETY: writer role owns the shadow index exclusively.
        let current = unsafe { *self.writer.index.get().get() };
        let next = current.wrapping_add(1);

        let slot = &self.slots[(next & Self::MASK) as usize];
        // SAFETY: forwarded writer contract.
        unsafe { slot.write(writer) };

        // Publish: Release pairs with readers' Acquire load of the global
        // index, making the completed slot visible.
        self.global.index.store(next, Ordering::Release);

        // SAFETY: writer role owns the shadow index exclusively.
        unsafe {
            *self.writer.index.get().get() = next;
        }
    }

    /// Publishes a new value. Wait-free.
    ///
    /// # Safety
    ///
    /// Same contract as [`produce`](Self::produce).
    #[inline]
    pub unsafe fn push(&self, value: T) {
        // SAFETY: forwarded writer contract.
        unsafe { self.produce(|slot| *slot = value) }
    }

    /// Attempts a consistent read of the most recently published slot,
    /// invoking `visitor` on the snapshot.
    ///
    /// Returns `false` iff the writer lapped the ring into that slot during
    /// the copy; the visitor is not invoked in that case.
    #[inline]
    pub fn try_consume_latest<F: FnOnce(&T)>(&self, visitor: F) -> bool {
        let idx = self.global.index.load(Ordering::Acquire);
        match self.slots[(idx & Self::MASK) as usize].read() {
            Some(value) => {
                visitor(&value);
                true
            }
            None => false,
        }
    }

    /// Attempts a consistent read into `out`, leaving it untouched on retry.
    #[inline]
    pub fn try_pop_latest_into(&self, out: &mut T) -> bool {
        let idx = self.global.index.load(Ordering::Acquire);
        match self.slots[(idx & Self::MASK) as usize].read() {
            Some(value) => {
                *out = value;
                true
            }
            None => false,
        }
    }

    /// Attempts a consistent read.
    #[inline]
    #[must_use]
    pub fn try_pop_latest(&self) -> Option<T> {
        let idx = self.global.index.load(Ordering::Acquire);
        self.slots[(idx & Self::MASK) as usize].read()
    }

    /// Reads the latest value, spinning until a consistent copy lands.
    #[inline]
    #[must_use]
    pub fn pop_latest(&self) -> T {
        loop {
            if let Some(value) = self.try_pop_latest() {
                return value;
            }
            cpu_relax();
        }
    }

    /// Reads the latest value (spinning) and hands it to `visitor`.
    #[inline]
    pub fn consume_latest<F: FnOnce(&T)>(&self, visitor: F) {
        visitor(&self.pop_latest());
    }

    /// Slot count.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Best-effort check whether a write is in progress on the slot the
    /// writer is expected to fill next.
    #[must_use]
    pub fn busy(&self) -> bool {
        let idx = self.global.index.load(Ordering::Relaxed);
        let next = idx.wrapping_add(1);
        self.slots[(next & Self::MASK) as usize]
            .seq
            .load(Ordering::Relaxed)
            & 1
            != 0
    }
}

impl<T: ShmData, const N: usize> Default for SeqLockRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: as for SeqLock; the writer-private index is a RoleCell covered by
// the single-writer contract.
unsafe impl<T: ShmData, const N: usize> Send for SeqLockRing<T, N> {}
unsafe impl<T: ShmData, const N: usize> Sync for SeqLockRing<T, N> {}

// SAFETY: repr(C), self-contained, atomics-only synchronization, no Drop
// reliance.
unsafe impl<T: ShmData, const N: usize> ShmLayout for SeqLockRing<T, N> {}

// =============================================================================
// TripleBuffer (N = 3)
// =============================================================================

#[repr(C)]
#[repr(align(64))]
struct WriterLineU8 {
    index: RoleCell<u8, WriterRole>,
}

#[repr(C)]
#[repr(align(64))]
struct GlobalLineU8 {
    index: AtomicU8,
}

/// Three-slot buffer with a branch-free slot rotation.
///
/// Unlike [`SeqLockRing`], the published index is the *physical* slot number
/// (0, 1, 2) rather than a monotonic counter, so the rotation avoids masking
/// and the global line carries a single byte. The per-slot sequence check is
/// unchanged.
#[repr(C)]
pub struct TripleBuffer<T> {
    slots: [Slot<T>; 3],
    writer: WriterLineU8,
    global: GlobalLineU8,
}

impl<T: ShmData> TripleBuffer<T> {
    /// Next physical slot: 0 -> 1 -> 2 -> 0, compiled to a comparison and a
    /// conditional move.
    #[inline]
    const fn next_slot(current: u8) -> u8 {
        if current + 1 == 3 { 0 } else { current + 1 }
    }

    /// Creates a buffer of default-valued slots, all sequences even.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::new()),
            writer: WriterLineU8 {
                index: RoleCell::new(0),
            },
            global: GlobalLineU8 {
                index: AtomicU8::new(0),
            },
        }
    }

    /// Initializes a buffer directly inside freshly mapped shared memory.
    ///
    /// # Safety
    ///
    /// Same contract as [`BoundedQueue::init_in_place`](crate::queue::BoundedQueue::init_in_place).
    pub unsafe fn init_in_place(ptr: *mut Self) {
        // SAFETY: per caller contract.
        unsafe {
            let slots = std::ptr::addr_of_mut!((*ptr).slots).cast::<Slot<T>>();
            for i in 0..3 {
                Slot::init_in_place(slots.add(i));
            }
            std::ptr::addr_of_mut!((*ptr).writer).write(WriterLineU8 {
                index: RoleCell::new(0),
            });
            std::ptr::addr_of_mut!((*ptr).global).write(GlobalLineU8 {
                index: AtomicU8::new(0),
            });
        }
    }

    /// Writes the next slot in place through `writer`, then publishes it.
    /// Wait-free.
    ///
    /// # Safety
    ///
    /// Caller must be the buffer's only writer, with no concurrent call to
    /// any writer operation.
    #[inline]
    pub unsafe fn produce<F: FnOnce(&mut T)>(&self, writer: F) {
        // SAFETY: writer role owns the shadow index exclusively.
        let next = Self::next_slot(unsafe { *self.writer.index.get().get() });

        let slot = &self.slots[next as usize];
        // SAFETY: forwarded writer contract.
        unsafe { slot.write(writer) };

        self.global.index.store(next, Ordering::Release);

        // SAFETY: writer role owns the shadow index exclusively.
        unsafe {
            *self.writer.index.get().get() = next;
        }
    }

    /// Publishes a new value. Wait-free.
    ///
    /// # Safety
    ///
    /// Same contract as [`produce`](Self::produce).
    #[inline]
    pub unsafe fn push(&self, value: T) {
        // SAFETY: forwarded writer contract.
        unsafe { self.produce(|slot| *slot = value) }
    }

    /// Shared read path: validates the published physical index, then runs
    /// the slot protocol. The `>= 3` guard rejects a corrupted byte when the
    /// buffer lives in a mapping another process could scribble on.
    #[inline]
    fn read_latest(&self) -> Option<T> {
        let idx = self.global.index.load(Ordering::Acquire);
        if idx >= 3 {
            return None;
        }
        self.slots[idx as usize].read()
    }

    /// Attempts a consistent read of the most recently published slot.
    #[inline]
    pub fn try_consume_latest<F: FnOnce(&T)>(&self, visitor: F) -> bool {
        match self.read_latest() {
            Some(value) => {
                visitor(&value);
                true
            }
            None => false,
        }
    }

    /// Attempts a consistent read into `out`, leaving it untouched on retry.
    #[inline]
    pub fn try_pop_latest_into(&self, out: &mut T) -> bool {
        match self.read_latest() {
            Some(value) => {
                *out = value;
                true
            }
            None => false,
        }
    }

    /// Attempts a consistent read.
    #[inline]
    #[must_use]
    pub fn try_pop_latest(&self) -> Option<T> {
        self.read_latest()
    }

    /// Reads the latest value, spinning until a consistent copy lands.
    #[inline]
    #[must_use]
    pub fn pop_latest(&self) -> T {
        loop {
            if let Some(value) = self.try_pop_latest() {
                return value;
            }
            cpu_relax();
        }
    }

    /// Reads the latest value (spinning) and hands it to `visitor`.
    #[inline]
    pub fn consume_latest<F: FnOnce(&T)>(&self, visitor: F) {
        visitor(&self.pop_latest());
    }

    /// Slot count (always 3).
    #[must_use]
    pub const fn capacity(&self) -> usize {
        3
    }

    /// Best-effort check whether a write is in progress on the slot the
    /// writer is expected to fill next.
    #[must_use]
    pub fn busy(&self) -> bool {
        let idx = self.global.index.load(Ordering::Relaxed);
        let next = Self::next_slot(idx % 3);
        self.slots[next as usize].seq.load(Ordering::Relaxed) & 1 != 0
    }
}

impl<T: ShmData> Default for TripleBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: as for SeqLockRing.
unsafe impl<T: ShmData> Send for TripleBuffer<T> {}
unsafe impl<T: ShmData> Sync for TripleBuffer<T> {}

// SAFETY: repr(C), self-contained, atomics-only synchronization, no Drop
// reliance.
unsafe impl<T: ShmData> ShmLayout for TripleBuffer<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::CACHE_LINE_SIZE;
    use std::mem::{offset_of, size_of};
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn slot_occupies_whole_cache_lines() {
        assert_eq!(size_of::<Slot<u64>>(), CACHE_LINE_SIZE);
        assert_eq!(size_of::<Slot<[u8; 120]>>(), 2 * CACHE_LINE_SIZE);
    }

    #[test]
    fn ring_lines_are_partitioned() {
        type R = SeqLockRing<u64, 8>;
        assert_eq!(offset_of!(R, writer), 0);
        assert_eq!(offset_of!(R, global), CACHE_LINE_SIZE);
        assert_eq!(offset_of!(R, slots), 2 * CACHE_LINE_SIZE);
    }

    #[test]
    fn seqlock_publish_then_fetch() {
        let cell = SeqLock::<u64>::new();

        unsafe { cell.push(42) };
        assert_eq!(cell.try_pop_latest(), Some(42));

        // Repeated fetches without intervening writes are deterministic.
        assert_eq!(cell.pop_latest(), 42);
        assert_eq!(cell.pop_latest(), 42);
    }

    #[test]
    fn seqlock_initial_value_is_default() {
        let cell = SeqLock::<u64>::new();
        assert_eq!(cell.try_pop_latest(), Some(0));
        assert!(!cell.busy());
    }

    #[test]
    fn seqlock_visitor_forms() {
        let cell = SeqLock::<u64>::new();

        unsafe { cell.produce(|slot| *slot = 7) };

        let mut seen = 0;
        assert!(cell.try_consume_latest(|v| seen = *v));
        assert_eq!(seen, 7);

        let mut out = 0;
        assert!(cell.try_pop_latest_into(&mut out));
        assert_eq!(out, 7);

        cell.consume_latest(|v| assert_eq!(*v, 7));
    }

    #[test]
    fn ring_conflates_to_latest() {
        let ring = SeqLockRing::<u64, 8>::new();

        for i in 1..=100 {
            unsafe { ring.push(i) };
        }
        assert_eq!(ring.pop_latest(), 100);
        assert_eq!(ring.capacity(), 8);
    }

    #[test]
    fn triple_buffer_rotation() {
        let buf = TripleBuffer::<u64>::new();

        for i in 1..=10 {
            unsafe { buf.push(i) };
            assert_eq!(buf.pop_latest(), i);
        }
        assert_eq!(buf.capacity(), 3);
    }

    #[test]
    fn triple_buffer_visitor_forms() {
        let buf = TripleBuffer::<u64>::new();
        unsafe { buf.push(5) };

        let mut out = 0;
        assert!(buf.try_pop_latest_into(&mut out));
        assert_eq!(out, 5);
        assert_eq!(buf.try_pop_latest(), Some(5));
    }

    #[test]
    fn distinct_observed_values_increase() {
        let cell = Arc::new(SeqLock::<u64>::new());
        let done = Arc::new(AtomicBool::new(false));
        let last = 100_000u64;

        let writer = {
            let cell = Arc::clone(&cell);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for i in 1..=last {
                    // SAFETY: this thread is the only writer.
                    unsafe { cell.push(i) };
                }
                done.store(true, Ordering::Release);
            })
        };

        let mut observed = Vec::new();
        let mut prev = 0u64;
        loop {
            if let Some(v) = cell.try_pop_latest() {
                assert!(v >= prev, "went backwards: {prev} -> {v}");
                if v != prev {
                    observed.push(v);
                    prev = v;
                }
            }
            if done.load(Ordering::Acquire) && prev == last {
                break;
            }
        }

        writer.join().unwrap();
        assert_eq!(*observed.last().unwrap(), last);
        for pair in observed.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn tearing_probe() {
        #[derive(Clone, Copy, Default)]
        #[repr(C)]
        struct Probe {
            id: u64,
            checksum: u64,
        }
        // SAFETY: plain #[repr(C)] pair of u64s, no pointers.
        unsafe impl crate::types::ShmData for Probe {}

        fn sum(id: u64) -> u64 {
            id.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ 0xDEAD_BEEF
        }

        let ring = Arc::new(SeqLockRing::<Probe, 4>::new());
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let ring = Arc::clone(&ring);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for id in 0..300_000u64 {
                    // SAFETY: this thread is the only writer.
                    unsafe {
                        ring.push(Probe {
                            id,
                            checksum: sum(id),
                        });
                    }
                }
                done.store(true, Ordering::Release);
            })
        };

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let ring = Arc::clone(&ring);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    let mut successes = 0u64;
                    while !done.load(Ordering::Acquire) {
                        if let Some(p) = ring.try_pop_latest() {
                            assert_eq!(p.checksum, sum(p.id), "torn read at id {}", p.id);
                            successes += 1;
                        }
                    }
                    successes
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            assert!(r.join().unwrap() > 0);
        }
    }
}
