//! Duplex compositions: request/response over two opposite-direction
//! queues, and symmetric state exchange over two opposite-direction
//! seqlock rings.
//!
//! Nothing here adds new synchronization — a duplex endpoint is exactly two
//! primitives glued together, and the two directions are not ordered
//! against each other. The queue pair gives a classic blocking RPC shape
//! plus decoupled halves for pipelining; the snapshot pair gives two peers
//! that each publish their own state and read the other's latest.
//!
//! [`itc`] wires the pairs through `Arc`s inside one process; [`ipc`] hosts
//! both directions in a single shared segment (the client side owns it).

use crate::queue::BoundedQueue;
use crate::seqlock::SeqLockRing;
use crate::types::{ShmData, ShmLayout};

/// Both directions of a cross-process queue duplex, hosted in one segment.
#[repr(C)]
pub struct DuplexQueueLayout<T: ShmData, const N: usize> {
    /// Client-to-server direction.
    c2s: BoundedQueue<T, N>,
    /// Server-to-client direction.
    s2c: BoundedQueue<T, N>,
}

impl<T: ShmData, const N: usize> DuplexQueueLayout<T, N> {
    /// # Safety
    ///
    /// Same contract as [`BoundedQueue::init_in_place`].
    unsafe fn init_in_place(ptr: *mut Self) {
        // SAFETY: forwarded caller contract, one queue at a time.
        unsafe {
            BoundedQueue::init_in_place(std::ptr::addr_of_mut!((*ptr).c2s));
            BoundedQueue::init_in_place(std::ptr::addr_of_mut!((*ptr).s2c));
        }
    }
}

// SAFETY: a repr(C) pair of ShmLayout queues is itself repr(C),
// self-contained, atomics-only, and Drop-free.
unsafe impl<T: ShmData, const N: usize> ShmLayout for DuplexQueueLayout<T, N> {}

/// Both directions of a cross-process snapshot duplex.
#[repr(C)]
pub struct DuplexSnapshotLayout<T: ShmData, const N: usize> {
    /// Owner-to-peer direction.
    a2b: SeqLockRing<T, N>,
    /// Peer-to-owner direction.
    b2a: SeqLockRing<T, N>,
}

impl<T: ShmData, const N: usize> DuplexSnapshotLayout<T, N> {
    /// # Safety
    ///
    /// Same contract as [`BoundedQueue::init_in_place`].
    unsafe fn init_in_place(ptr: *mut Self) {
        // SAFETY: forwarded caller contract, one ring at a time.
        unsafe {
            SeqLockRing::init_in_place(std::ptr::addr_of_mut!((*ptr).a2b));
            SeqLockRing::init_in_place(std::ptr::addr_of_mut!((*ptr).b2a));
        }
    }
}

// SAFETY: as for DuplexQueueLayout.
unsafe impl<T: ShmData, const N: usize> ShmLayout for DuplexSnapshotLayout<T, N> {}

/// Shared RPC loop bodies, parameterized over how the two queue references
/// are reached (Arc'd pair for ITC, one shared layout for IPC).
macro_rules! duplex_client_ops {
    () => {
        /// Sends a request and blocks for the response.
        #[must_use]
        pub fn send_receive(&self, request: T) -> T {
            // SAFETY: the client endpoint is the unique producer of the
            // request queue and unique consumer of the response queue.
            unsafe {
                self.tx().push(request);
                self.rx().pop()
            }
        }

        /// Sends a request and immediately polls for a response. `None` if
        /// the request queue is full or no response is ready yet; useful
        /// when responses are known to be pre-staged.
        #[must_use]
        pub fn try_send_receive(&self, request: T) -> Option<T> {
            // SAFETY: as in send_receive().
            unsafe {
                if !self.tx().try_push(request) {
                    return None;
                }
                self.rx().try_pop()
            }
        }

        /// Round-trips a request within a single time budget covering both
        /// the send and the wait for the response.
        #[must_use]
        pub fn send_receive_timeout(&self, request: T, timeout: Duration) -> Option<T> {
            let deadline = Instant::now() + timeout;
            loop {
                // SAFETY: as in send_receive().
                if unsafe { self.tx().try_push(request) } {
                    break;
                }
                if Instant::now() >= deadline {
                    return None;
                }
                cpu_relax();
            }
            loop {
                // SAFETY: as in send_receive().
                if let Some(response) = unsafe { self.rx().try_pop() } {
                    return Some(response);
                }
                if Instant::now() >= deadline {
                    return None;
                }
                cpu_relax();
            }
        }

        /// Decoupled half: sends a request, blocking while full.
        pub fn send_request(&self, request: T) {
            // SAFETY: as in send_receive().
            unsafe { self.tx().push(request) }
        }

        /// Decoupled half: attempts to send a request.
        pub fn try_send_request(&self, request: T) -> bool {
            // SAFETY: as in send_receive().
            unsafe { self.tx().try_push(request) }
        }

        /// Decoupled half: blocks for the next response.
        #[must_use]
        pub fn receive_response(&self) -> T {
            // SAFETY: as in send_receive().
            unsafe { self.rx().pop() }
        }

        /// Decoupled half: attempts to take a response.
        #[must_use]
        pub fn try_receive_response(&self) -> Option<T> {
            // SAFETY: as in send_receive().
            unsafe { self.rx().try_pop() }
        }
    };
}

macro_rules! duplex_server_ops {
    () => {
        /// Blocks for one request, runs `handler`, and blocks the response
        /// into the return queue.
        pub fn receive_send<F: FnOnce(T) -> T>(&self, handler: F) {
            // SAFETY: the server endpoint is the unique consumer of the
            // request queue and unique producer of the response queue.
            unsafe {
                let request = self.rx().pop();
                let response = handler(request);
                self.tx().push(response);
            }
        }

        /// Waits up to `timeout` for a request; once one arrives, the
        /// handler runs and the response is sent (blocking). Returns
        /// `false` iff no request arrived in time.
        pub fn receive_send_timeout<F: FnOnce(T) -> T>(
            &self,
            handler: F,
            timeout: Duration,
        ) -> bool {
            let deadline = Instant::now() + timeout;
            let request = loop {
                // SAFETY: as in receive_send().
                if let Some(request) = unsafe { self.rx().try_pop() } {
                    break request;
                }
                if Instant::now() >= deadline {
                    return false;
                }
                cpu_relax();
            };
            let response = handler(request);
            // SAFETY: as in receive_send().
            unsafe { self.tx().push(response) };
            true
        }

        /// Handles one request if one is waiting. Returns `false` iff the
        /// request queue was empty.
        pub fn try_receive_send<F: FnOnce(T) -> T>(&self, handler: F) -> bool {
            // SAFETY: as in receive_send().
            let Some(request) = (unsafe { self.rx().try_pop() }) else {
                return false;
            };
            let response = handler(request);
            // SAFETY: as in receive_send().
            unsafe { self.tx().push(response) };
            true
        }

        /// Decoupled half: blocks for the next request.
        #[must_use]
        pub fn receive_request(&self) -> T {
            // SAFETY: as in receive_send().
            unsafe { self.rx().pop() }
        }

        /// Decoupled half: attempts to take a request.
        #[must_use]
        pub fn try_receive_request(&self) -> Option<T> {
            // SAFETY: as in receive_send().
            unsafe { self.rx().try_pop() }
        }

        /// Decoupled half: sends a response, blocking while full.
        pub fn send_response(&self, response: T) {
            // SAFETY: as in receive_send().
            unsafe { self.tx().push(response) }
        }

        /// Decoupled half: attempts to send a response.
        pub fn try_send_response(&self, response: T) -> bool {
            // SAFETY: as in receive_send().
            unsafe { self.tx().try_push(response) }
        }
    };
}

macro_rules! snapshot_peer_ops {
    () => {
        /// Publishes this side's state. Wait-free; the peer sees only the
        /// latest value.
        pub fn publish(&self, value: T) {
            // SAFETY: the peer endpoint is the unique writer of its own
            // direction's ring.
            unsafe { self.tx().push(value) }
        }

        /// Publishes by mutating the next slot in place.
        pub fn publish_with<F: FnOnce(&mut T)>(&self, writer: F) {
            // SAFETY: as in publish().
            unsafe { self.tx().produce(writer) }
        }

        /// Fetches the peer's latest state, spinning until consistent.
        #[must_use]
        pub fn fetch(&self) -> T {
            self.rx().pop_latest()
        }

        /// Attempts a single consistent fetch of the peer's state.
        #[must_use]
        pub fn try_fetch(&self) -> Option<T> {
            self.rx().try_pop_latest()
        }

        /// Fetches the peer's state with a time budget.
        pub fn fetch_timeout(&self, out: &mut T, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            loop {
                if self.rx().try_pop_latest_into(out) {
                    return true;
                }
                if Instant::now() >= deadline {
                    return false;
                }
                cpu_relax();
            }
        }
    };
}

pub mod itc {
    //! In-process duplex pairs.

    use std::marker::PhantomData;
    use std::sync::Arc;
    use std::time::Duration;

    use minstant::Instant;

    use crate::platform::cpu_relax;
    use crate::queue::BoundedQueue;
    use crate::seqlock::SeqLockRing;
    use crate::trace::debug;
    use crate::types::{PhantomUnsync, ShmData};

    /// Creates a request/response pair between two threads.
    #[must_use]
    pub fn duplex_queue<T: ShmData, const N: usize>()
    -> (DuplexClient<T, N>, DuplexServer<T, N>) {
        let c2s = Arc::new(BoundedQueue::new());
        let s2c = Arc::new(BoundedQueue::new());
        debug!(capacity = N, "created itc duplex queue");
        (
            DuplexClient {
                c2s: Arc::clone(&c2s),
                s2c: Arc::clone(&s2c),
                _unsync: PhantomData,
            },
            DuplexServer {
                c2s,
                s2c,
                _unsync: PhantomData,
            },
        )
    }

    /// Creates a symmetric state-exchange pair between two threads.
    #[must_use]
    pub fn duplex_snapshot<T: ShmData, const N: usize>()
    -> (SnapshotPeer<T, N>, SnapshotPeer<T, N>) {
        let a2b = Arc::new(SeqLockRing::new());
        let b2a = Arc::new(SeqLockRing::new());
        debug!(depth = N, "created itc duplex snapshot");
        (
            SnapshotPeer {
                tx: Arc::clone(&a2b),
                rx: Arc::clone(&b2a),
                _unsync: PhantomData,
            },
            SnapshotPeer {
                tx: b2a,
                rx: a2b,
                _unsync: PhantomData,
            },
        )
    }

    /// Requesting side of an in-process duplex queue.
    pub struct DuplexClient<T: ShmData, const N: usize> {
        c2s: Arc<BoundedQueue<T, N>>,
        s2c: Arc<BoundedQueue<T, N>>,
        _unsync: PhantomUnsync,
    }

    impl<T: ShmData, const N: usize> DuplexClient<T, N> {
        fn tx(&self) -> &BoundedQueue<T, N> {
            &self.c2s
        }

        fn rx(&self) -> &BoundedQueue<T, N> {
            &self.s2c
        }

        duplex_client_ops!();
    }

    /// Responding side of an in-process duplex queue.
    pub struct DuplexServer<T: ShmData, const N: usize> {
        c2s: Arc<BoundedQueue<T, N>>,
        s2c: Arc<BoundedQueue<T, N>>,
        _unsync: PhantomUnsync,
    }

    impl<T: ShmData, const N: usize> DuplexServer<T, N> {
        fn tx(&self) -> &BoundedQueue<T, N> {
            &self.s2c
        }

        fn rx(&self) -> &BoundedQueue<T, N> {
            &self.c2s
        }

        duplex_server_ops!();
    }

    /// One side of an in-process state exchange: publishes into its own
    /// ring, reads the peer's.
    pub struct SnapshotPeer<T: ShmData, const N: usize> {
        tx: Arc<SeqLockRing<T, N>>,
        rx: Arc<SeqLockRing<T, N>>,
        _unsync: PhantomUnsync,
    }

    impl<T: ShmData, const N: usize> SnapshotPeer<T, N> {
        fn tx(&self) -> &SeqLockRing<T, N> {
            &self.tx
        }

        fn rx(&self) -> &SeqLockRing<T, N> {
            &self.rx
        }

        snapshot_peer_ops!();
    }
}

pub mod ipc {
    //! Cross-process duplex pairs, both directions in one shared segment.
    //!
    //! The client side owns the segment (creates, initializes, unlinks);
    //! the server side attaches. For the snapshot exchange the Owner
    //! publishes into the `a2b` ring and the User into `b2a`.

    use std::marker::PhantomData;
    use std::time::Duration;

    use minstant::Instant;

    use super::{DuplexQueueLayout, DuplexSnapshotLayout};
    use crate::platform::cpu_relax;
    use crate::queue::BoundedQueue;
    use crate::seqlock::SeqLockRing;
    use crate::shm::{Owner, Result, SharedMemory, ShmMode, ShmOptions, User};
    use crate::trace::debug;
    use crate::types::{PhantomUnsync, ShmData};

    /// Requesting side of a cross-process duplex queue. Owns the segment.
    pub struct DuplexClient<T: ShmData, const N: usize> {
        shm: SharedMemory<DuplexQueueLayout<T, N>, Owner>,
        _unsync: PhantomUnsync,
    }

    impl<T: ShmData, const N: usize> DuplexClient<T, N> {
        /// Creates the two-queue segment and becomes its Owner.
        pub fn create(name: &str, opts: &ShmOptions) -> Result<Self> {
            let shm = SharedMemory::create(name, opts, |ptr| {
                // SAFETY: fresh exclusive mapping from SharedMemory::create.
                unsafe { DuplexQueueLayout::<T, N>::init_in_place(ptr) }
            })?;
            debug!(path = %shm.path(), capacity = N, "created ipc duplex client");
            Ok(Self {
                shm,
                _unsync: PhantomData,
            })
        }

        /// Full path of the backing segment.
        #[must_use]
        pub fn path(&self) -> &str {
            self.shm.path()
        }

        fn tx(&self) -> &BoundedQueue<T, N> {
            &self.shm.c2s
        }

        fn rx(&self) -> &BoundedQueue<T, N> {
            &self.shm.s2c
        }

        duplex_client_ops!();
    }

    /// Responding side of a cross-process duplex queue. Attaches to the
    /// client's segment.
    pub struct DuplexServer<T: ShmData, const N: usize> {
        shm: SharedMemory<DuplexQueueLayout<T, N>, User>,
        _unsync: PhantomUnsync,
    }

    impl<T: ShmData, const N: usize> DuplexServer<T, N> {
        /// Attaches to a segment a [`DuplexClient`] created.
        pub fn open(name: &str, opts: &ShmOptions) -> Result<Self> {
            let shm = SharedMemory::open(name, opts)?;
            debug!(path = %shm.path(), capacity = N, "opened ipc duplex server");
            Ok(Self {
                shm,
                _unsync: PhantomData,
            })
        }

        /// Full path of the backing segment.
        #[must_use]
        pub fn path(&self) -> &str {
            self.shm.path()
        }

        fn tx(&self) -> &BoundedQueue<T, N> {
            &self.shm.s2c
        }

        fn rx(&self) -> &BoundedQueue<T, N> {
            &self.shm.c2s
        }

        duplex_server_ops!();
    }

    /// One side of a cross-process state exchange.
    ///
    /// Construct the Owner side with [`SnapshotPeer::create`] and the other
    /// with [`SnapshotPeer::open`]; each publishes into its own ring and
    /// reads the peer's.
    pub struct SnapshotPeer<T: ShmData, const N: usize, M: ShmMode> {
        shm: SharedMemory<DuplexSnapshotLayout<T, N>, M>,
        _unsync: PhantomUnsync,
    }

    impl<T: ShmData, const N: usize> SnapshotPeer<T, N, Owner> {
        /// Creates the two-ring segment and becomes its Owner.
        pub fn create(name: &str, opts: &ShmOptions) -> Result<Self> {
            let shm = SharedMemory::create(name, opts, |ptr| {
                // SAFETY: fresh exclusive mapping from SharedMemory::create.
                unsafe { DuplexSnapshotLayout::<T, N>::init_in_place(ptr) }
            })?;
            debug!(path = %shm.path(), depth = N, "created ipc snapshot peer");
            Ok(Self {
                shm,
                _unsync: PhantomData,
            })
        }
    }

    impl<T: ShmData, const N: usize> SnapshotPeer<T, N, User> {
        /// Attaches to a segment the Owner peer created.
        pub fn open(name: &str, opts: &ShmOptions) -> Result<Self> {
            let shm = SharedMemory::open(name, opts)?;
            debug!(path = %shm.path(), depth = N, "opened ipc snapshot peer");
            Ok(Self {
                shm,
                _unsync: PhantomData,
            })
        }
    }

    impl<T: ShmData, const N: usize, M: ShmMode> SnapshotPeer<T, N, M> {
        /// Full path of the backing segment.
        #[must_use]
        pub fn path(&self) -> &str {
            self.shm.path()
        }

        // Direction is fixed by ownership: the Owner writes a2b, the User
        // writes b2a. M::IS_OWNER is const, so these fold to field reads.
        fn tx(&self) -> &SeqLockRing<T, N> {
            if M::IS_OWNER {
                &self.shm.a2b
            } else {
                &self.shm.b2a
            }
        }

        fn rx(&self) -> &SeqLockRing<T, N> {
            if M::IS_OWNER {
                &self.shm.b2a
            } else {
                &self.shm.a2b
            }
        }

        snapshot_peer_ops!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn itc_rpc_roundtrip() {
        let (client, server) = itc::duplex_queue::<u64, 8>();

        let worker = std::thread::spawn(move || {
            for _ in 0..3 {
                server.receive_send(|request| request * 2);
            }
        });

        assert_eq!(client.send_receive(21), 42);
        assert_eq!(client.send_receive(100), 200);
        assert_eq!(client.send_receive(0), 0);
        worker.join().unwrap();
    }

    #[test]
    fn itc_try_rpc_when_response_prestaged() {
        let (client, server) = itc::duplex_queue::<u64, 8>();

        // No response staged yet.
        assert_eq!(client.try_send_receive(1), None);
        assert!(server.try_receive_send(|req| req + 1));

        // The response from the first request is now waiting.
        assert_eq!(client.try_receive_response(), Some(2));
    }

    #[test]
    fn itc_rpc_timeout_without_server() {
        let (client, _server) = itc::duplex_queue::<u64, 8>();

        let start = std::time::Instant::now();
        assert_eq!(
            client.send_receive_timeout(5, Duration::from_millis(30)),
            None
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn itc_server_timeout_without_requests() {
        let (_client, server) = itc::duplex_queue::<u64, 8>();
        assert!(!server.receive_send_timeout(|r| r, Duration::from_millis(20)));
    }

    #[test]
    fn itc_decoupled_halves() {
        let (client, server) = itc::duplex_queue::<u64, 8>();

        client.send_request(10);
        client.send_request(11);
        assert_eq!(server.receive_request(), 10);
        assert_eq!(server.try_receive_request(), Some(11));
        assert_eq!(server.try_receive_request(), None);

        server.send_response(20);
        assert_eq!(client.receive_response(), 20);
    }

    #[test]
    fn itc_snapshot_peers_exchange_state() {
        let (alice, bob) = itc::duplex_snapshot::<u64, 4>();

        alice.publish(1);
        bob.publish(2);

        assert_eq!(alice.fetch(), 2);
        assert_eq!(bob.fetch(), 1);

        // Each side conflates independently.
        for i in 10..20 {
            alice.publish(i);
        }
        assert_eq!(bob.fetch(), 19);
        assert_eq!(alice.fetch(), 2);
    }

    #[test]
    fn itc_snapshot_peer_timeout_forms() {
        let (alice, bob) = itc::duplex_snapshot::<u64, 4>();
        bob.publish_with(|slot| *slot = 77);

        let mut out = 0;
        assert!(alice.fetch_timeout(&mut out, Duration::from_millis(10)));
        assert_eq!(out, 77);
        assert_eq!(alice.try_fetch(), Some(77));
    }

    mod ipc_pairs {
        use super::super::*;
        use crate::shm::{ShmError, ShmOptions};
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
        fn rpc_roundtrip_through_shared_segment() {
            let opts = ShmOptions::new();
            let client = unwrap_or_skip!(ipc::DuplexClient::<u64, 8>::create(
                "rill-test-duplex-rpc",
                &opts
            ));
            let server = unwrap_or_skip!(ipc::DuplexServer::<u64, 8>::open(
                "rill-test-duplex-rpc",
                &opts
            ));

            let worker = std::thread::spawn(move || {
                server.receive_send(|request| request + 1);
            });

            assert_eq!(client.send_receive(41), 42);
            worker.join().unwrap();
        }

        #[test]
        fn snapshot_peers_through_shared_segment() {
            let opts = ShmOptions::new();
            let owner = unwrap_or_skip!(ipc::SnapshotPeer::<u64, 4, crate::Owner>::create(
                "rill-test-duplex-state",
                &opts
            ));
            let peer = unwrap_or_skip!(ipc::SnapshotPeer::<u64, 4, crate::User>::open(
                "rill-test-duplex-state",
                &opts
            ));

            owner.publish(5);
            peer.publish(6);
            assert_eq!(owner.fetch(), 6);
            assert_eq!(peer.fetch(), 5);
        }
    }
}
