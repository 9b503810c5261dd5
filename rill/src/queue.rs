//! Bounded lock-free SPSC FIFO with shadow indices.
//!
//! [`BoundedQueue`] is the core ring used by both the in-process and the
//! shared-memory queue channels. Producer and consumer each own one cache
//! line holding their atomic index plus a local *shadow* copy of the other
//! side's index; the shadow is refreshed only when the queue looks full
//! (producer) or empty (consumer), so the steady-state hot path touches no
//! foreign cache line.
//!
//! # Safety
//!
//! The producer- and consumer-side methods are `unsafe` because they require
//! the caller to uphold the SPSC invariant: exactly one producer and one
//! consumer, with no concurrent access to either role. The channel endpoints
//! in [`itc`](crate::itc) and [`ipc`](crate::ipc) enforce this with move-only
//! handle types and provide the safe public surface.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::platform::{CACHE_LINE_SIZE, cpu_relax};
use crate::types::{ConsumerRole, ProducerRole, RoleCell, ShmData, ShmLayout, SlotRole};

/// Producer-side hot line: write index plus shadow copy of the read index.
#[repr(C)]
#[repr(align(64))]
struct ProducerLine {
    /// Next write index (monotonic). Owned by producer, read by consumer.
    tail: AtomicU64,

    /// Producer-local snapshot of `head`. Lags the true value; refreshed
    /// only on the apparent-full path.
    shadow_head: RoleCell<u64, ProducerRole>,
}

impl ProducerLine {
    const fn new() -> Self {
        Self {
            tail: AtomicU64::new(0),
            shadow_head: RoleCell::new(0),
        }
    }
}

/// Consumer-side hot line: read index plus shadow copy of the write index.
#[repr(C)]
#[repr(align(64))]
struct ConsumerLine {
    /// Next read index (monotonic). Owned by consumer, read by producer.
    head: AtomicU64,

    /// Consumer-local snapshot of `tail`. Lags the true value; refreshed
    /// only on the apparent-empty path.
    shadow_tail: RoleCell<u64, ConsumerRole>,
}

impl ConsumerLine {
    const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
            shadow_tail: RoleCell::new(0),
        }
    }
}

/// Bounded single-producer/single-consumer FIFO ring.
///
/// - `N` must be a power of two (compile-time checked); the physical slot of
///   a monotonic index is `index & (N - 1)`.
/// - Empty when `head == tail`, full when `tail - head == N`.
/// - The only runtime failure modes are "full" and "empty", reported by the
///   `try_*` methods. No allocation, no syscalls, no panics on the hot path.
///
/// Layout: the producer's fields, the consumer's fields, and the slot array
/// each start on their own cache line, with a spacer line between the index
/// lines and the slots.
#[repr(C)]
pub struct BoundedQueue<T, const N: usize> {
    producer: ProducerLine,
    consumer: ConsumerLine,

    /// Keeps the consumer line and the first slots from sharing a line.
    _pad: [u8; CACHE_LINE_SIZE],

    buffer: [RoleCell<T, SlotRole>; N],
}

impl<T: ShmData, const N: usize> BoundedQueue<T, N> {
    /// Compile-time assertion that the capacity is a non-zero power of two.
    const CAPACITY_OK: () = assert!(
        N > 0 && N & (N - 1) == 0,
        "queue capacity must be a power of two"
    );

    const MASK: u64 = (N as u64) - 1;

    /// Creates a zero-initialized queue (`head = tail = 0`, slots default).
    #[must_use]
    pub fn new() -> Self {
        let () = Self::CAPACITY_OK;
        Self {
            producer: ProducerLine::new(),
            consumer: ConsumerLine::new(),
            _pad: [0; CACHE_LINE_SIZE],
            buffer: std::array::from_fn(|_| RoleCell::new(T::default())),
        }
    }

    /// Initializes a queue directly inside freshly mapped shared memory.
    ///
    /// Writes the index lines and default-initializes every slot through raw
    /// pointers, without constructing the whole value on the stack first.
    ///
    /// # Safety
    ///
    /// - `ptr` is non-null, well-aligned for `Self`, and points to a
    ///   writable region of at least `size_of::<Self>()` bytes.
    /// - No other reference to this memory exists during initialization.
    pub unsafe fn init_in_place(ptr: *mut Self) {
        let () = Self::CAPACITY_OK;
        // SAFETY: caller guarantees ptr is valid, aligned, writable, and
        // exclusively owned. addr_of_mut! writes fields without creating
        // intermediate references to uninitialized memory.
        unsafe {
            std::ptr::addr_of_mut!((*ptr).producer).write(ProducerLine::new());
            std::ptr::addr_of_mut!((*ptr).consumer).write(ConsumerLine::new());
            let slots = std::ptr::addr_of_mut!((*ptr).buffer).cast::<RoleCell<T, SlotRole>>();
            for i in 0..N {
                slots.add(i).write(RoleCell::new(T::default()));
            }
        }
    }

    // =======================================================================
    // Producer operations
    // =======================================================================

    /// Attempts to write one slot through `writer`.
    ///
    /// Fast path: the producer-local shadow of `head` shows free space, so no
    /// foreign cache line is touched. Slow path: the shadow says full, so the
    /// true `head` is re-loaded (Acquire) once and the check repeats.
    ///
    /// Returns `false` iff the queue is full after the refresh.
    ///
    /// # Safety
    ///
    /// Caller must be the queue's only producer, with no concurrent call to
    /// any producer operation.
    #[inline]
    pub unsafe fn try_produce<F: FnOnce(&mut T)>(&self, writer: F) -> bool {
        // Only the producer writes tail, so Relaxed is sufficient here.
        let tail = self.producer.tail.load(Ordering::Relaxed);

        // SAFETY: producer role owns shadow_head exclusively.
        let mut shadow_head = unsafe { *self.producer.shadow_head.get().get() };

        if tail.wrapping_sub(shadow_head) >= N as u64 {
            // Apparent full: refresh the shadow from the true head.
            // Acquire pairs with the consumer's Release store, so slots the
            // consumer has vacated are safe to reuse.
            shadow_head = self.consumer.head.load(Ordering::Acquire);
            // SAFETY: producer role owns shadow_head exclusively.
            unsafe {
                *self.producer.shadow_head.get().get() = shadow_head;
            }

            if tail.wrapping_sub(shadow_head) >= N as u64 {
                return false; // Full
            }
        }

        // SAFETY: the slot at tail & MASK is producer-owned: tail has not
        // been published yet and the capacity check above proves the
        // consumer is not reading it.
        unsafe {
            writer(&mut *self.buffer[(tail & Self::MASK) as usize].get().get());
        }

        // Publish: Release makes the slot write visible before the new tail.
        self.producer
            .tail
            .store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Attempts to push a value.
    ///
    /// Returns `false` iff the queue is full.
    ///
    /// # Safety
    ///
    /// Same contract as [`try_produce`](Self::try_produce).
    #[inline]
    pub unsafe fn try_push(&self, value: T) -> bool {
        // SAFETY: forwarded producer contract.
        unsafe { self.try_produce(|slot| *slot = value) }
    }

    /// Writes one slot through `writer`, spinning while the queue is full.
    ///
    /// # Safety
    ///
    /// Same contract as [`try_produce`](Self::try_produce).
    #[inline]
    pub unsafe fn produce<F: FnMut(&mut T)>(&self, mut writer: F) {
        // SAFETY: forwarded producer contract.
        while !unsafe { self.try_produce(&mut writer) } {
            cpu_relax();
        }
    }

    /// Pushes a value, spinning while the queue is full.
    ///
    /// # Safety
    ///
    /// Same contract as [`try_produce`](Self::try_produce).
    #[inline]
    pub unsafe fn push(&self, value: T) {
        // SAFETY: forwarded producer contract.
        while !unsafe { self.try_push(value) } {
            cpu_relax();
        }
    }

    // =======================================================================
    // Consumer operations
    // =======================================================================

    /// Attempts to consume the head slot through `visitor`.
    ///
    /// The head index advances only after the visitor returns, so the
    /// visitor has exclusive access to the slot for its whole run.
    ///
    /// Returns `false` iff the queue is empty after refreshing the shadow.
    ///
    /// # Safety
    ///
    /// Caller must be the queue's only consumer, with no concurrent call to
    /// any consumer operation.
    #[inline]
    pub unsafe fn try_consume<F: FnOnce(&mut T)>(&self, visitor: F) -> bool {
        // Only the consumer writes head, so Relaxed is sufficient here.
        let head = self.consumer.head.load(Ordering::Relaxed);

        // SAFETY: consumer role owns shadow_tail exclusively.
        let shadow_tail = unsafe { *self.consumer.shadow_tail.get().get() };

        if shadow_tail == head {
            // Apparent empty: refresh the shadow from the true tail.
            // Acquire pairs with the producer's Release store, making the
            // slot contents visible.
            let tail = self.producer.tail.load(Ordering::Acquire);
            // SAFETY: consumer role owns shadow_tail exclusively.
            unsafe {
                *self.consumer.shadow_tail.get().get() = tail;
            }

            if head == tail {
                return false; // Empty
            }
        }

        // SAFETY: head != tail, so the slot at head & MASK holds a value the
        // producer published and will not touch until head advances past it.
        unsafe {
            visitor(&mut *self.buffer[(head & Self::MASK) as usize].get().get());
        }

        // Publish: Release hands the slot back to the producer.
        self.consumer
            .head
            .store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Attempts to pop a value.
    ///
    /// Returns `None` iff the queue is empty.
    ///
    /// # Safety
    ///
    /// Same contract as [`try_consume`](Self::try_consume).
    #[inline]
    #[must_use]
    pub unsafe fn try_pop(&self) -> Option<T> {
        let mut out = None;
        // SAFETY: forwarded consumer contract.
        unsafe {
            self.try_consume(|slot| out = Some(*slot));
        }
        out
    }

    /// Consumes one slot through `visitor`, spinning while the queue is empty.
    ///
    /// # Safety
    ///
    /// Same contract as [`try_consume`](Self::try_consume).
    #[inline]
    pub unsafe fn consume<F: FnMut(&mut T)>(&self, mut visitor: F) {
        // SAFETY: forwarded consumer contract.
        while !unsafe { self.try_consume(&mut visitor) } {
            cpu_relax();
        }
    }

    /// Pops a value, spinning while the queue is empty.
    ///
    /// # Safety
    ///
    /// Same contract as [`try_consume`](Self::try_consume).
    #[inline]
    #[must_use]
    pub unsafe fn pop(&self) -> T {
        loop {
            // SAFETY: forwarded consumer contract.
            if let Some(value) = unsafe { self.try_pop() } {
                return value;
            }
            cpu_relax();
        }
    }

    // =======================================================================
    // Status queries (safe: read-only snapshots of the two indices)
    // =======================================================================

    /// Number of queued elements. Approximate while the other side runs.
    #[must_use]
    pub fn len(&self) -> usize {
        let tail = self.producer.tail.load(Ordering::Relaxed);
        let head = self.consumer.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head) as usize
    }

    /// Whether the queue is empty. Approximate while the other side runs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue is full. Approximate while the other side runs.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    /// Fixed capacity `N`.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T: ShmData, const N: usize> Default for BoundedQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: all fields are Send (atomics and RoleCells of ShmData).
unsafe impl<T: ShmData, const N: usize> Send for BoundedQueue<T, N> {}

// SAFETY: concurrent access is mediated by the two atomic indices with
// Release/Acquire pairing; slot ownership alternates between the roles per
// the SPSC protocol documented on the unsafe methods.
unsafe impl<T: ShmData, const N: usize> Sync for BoundedQueue<T, N> {}

// SAFETY: repr(C), self-contained (indices + inline slots), synchronized
// purely by its own atomics, and nothing here relies on Drop running.
unsafe impl<T: ShmData, const N: usize> ShmLayout for BoundedQueue<T, N> {}
