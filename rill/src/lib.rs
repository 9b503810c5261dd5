//! Low-latency local-machine messaging built from two families of lock-free
//! primitives and a thin channel layer over them.
//!
//! # Primitives
//!
//! - [`queue::BoundedQueue`] — a bounded single-producer/single-consumer FIFO
//!   with shadow indices and cache-line partitioning. Strict ordering, no
//!   allocation, no syscalls.
//! - [`seqlock::SeqLock`] / [`seqlock::SeqLockRing`] /
//!   [`seqlock::TripleBuffer`] — single-writer/multi-reader "latest value"
//!   cells. The writer is wait-free; readers retry when a write overlaps
//!   their copy. Intermediate values are conflated away by design.
//! - [`shm::SharedMemory`] — an RAII mapping that hosts one of the above in a
//!   named segment under `/dev/shm` (or `/dev/hugepages`), with an
//!   initialization handshake so attachers never observe a half-built
//!   payload.
//!
//! # Channels
//!
//! The [`itc`] module wires primitives between threads of one process; the
//! [`ipc`] module wires them between processes through shared memory. Both
//! expose `Sender`/`Receiver` pairs over the queue and
//! `Publisher`/`Subscriber` pairs over the seqlock family. [`duplex`]
//! composes two opposite-direction channels into a request/response pair or
//! a symmetric state exchange.
//!
//! # Element types
//!
//! Everything stored in a shared slot must be [`ShmData`]: plain, pointer-free,
//! `Copy + Default` data with a stable layout. Use the derive:
//!
//! ```
//! use rill::ShmData;
//!
//! #[derive(ShmData, Clone, Copy, Default)]
//! #[repr(C)]
//! struct Tick {
//!     instrument: u32,
//!     price: f64,
//! }
//!
//! let (tx, rx) = rill::itc::queue::<Tick, 1024>();
//! tx.send(Tick { instrument: 7, price: 101.25 });
//! assert_eq!(rx.receive().instrument, 7);
//! ```

// Allow the crate to reference itself as ::rill for derive macro usage
extern crate self as rill;

pub mod duplex;
pub mod ipc;
pub mod itc;
pub mod platform;
pub mod queue;
pub mod seqlock;
pub mod shm;
pub mod types;

pub mod trace;

#[doc(inline)]
pub use rill_derive::ShmData;

#[doc(inline)]
pub use types::{ShmData, ShmLayout};

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use types::ShmData as __ShmDataPrivate;

pub use shm::{Owner, ShmError, ShmMode, ShmOptions, SharedMemory, User};

/// Monotonic instant used by all deadline-bounded operations.
pub use minstant::Instant;
