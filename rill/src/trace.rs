//! Lifecycle event logging.
//!
//! The send/receive/publish/fetch paths are a handful of atomic operations
//! and must stay that way, so nothing in this crate logs from a hot path.
//! What is worth seeing is the slow path: segments being created, attached,
//! and unlinked, and channels being wired up. Those events flow through the
//! `debug!` and `trace!` macros below — `debug!` for lifecycle milestones,
//! `trace!` for teardown noise.
//!
//! Without the `tracing` feature both macros expand to nothing and the
//! `tracing` crates are not even compiled in. With the feature enabled they
//! forward to `tracing`, and [`init_tracing`] installs a reasonable
//! formatting subscriber for tests and example binaries.

/// Installs a formatting subscriber for this process.
///
/// Honors `RUST_LOG` when set; otherwise shows rill's lifecycle events
/// (`rill=debug`). Safe to call more than once — later calls lose the race
/// to install and are ignored, which lets every test call it freely.
///
/// Compiles to a no-op without the `tracing` feature.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rill=debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .compact()
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, trace};

/// Disabled build: the macros swallow their arguments and expand to
/// nothing, so call sites cost zero and need no cfg of their own.
#[cfg(not(feature = "tracing"))]
mod off {
    macro_rules! debug {
        ($($ignored:tt)*) => {};
    }

    macro_rules! trace {
        ($($ignored:tt)*) => {};
    }

    pub(crate) use {debug, trace};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use off::{debug, trace};
