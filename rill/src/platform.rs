//! Platform constants and thread-placement helpers.
//!
//! The containers only need [`cpu_relax`] and the size constants; the
//! binding/priority helpers exist for callers that pin latency-critical
//! threads. Their failures are reported to the caller and never abort the
//! run — a process that cannot get `SCHED_FIFO` still works, just with
//! worse tail latency.

use std::io;

use thiserror::Error;

/// Unit of cache coherence transfer. Independently written atomics are kept
/// on separate lines of this size.
pub const CACHE_LINE_SIZE: usize = 64;

/// Huge page unit (2 MiB on x86-64/aarch64 Linux with default hugetlbfs).
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Failures from the thread-placement helpers.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The requested core does not exist (or core enumeration failed).
    #[error("core {core} is not available on this system")]
    UnknownCore { core: usize },

    /// The OS rejected the affinity change.
    #[error("failed to pin the current thread to core {core}")]
    AffinityRejected { core: usize },

    /// NUMA information is missing from sysfs.
    #[error("NUMA node {node} is not present on this system")]
    NumaUnavailable { node: usize },

    /// The core is physically on a different NUMA node than requested.
    #[error("topology mismatch: core {core} is not on NUMA node {node}")]
    TopologyMismatch { node: usize, core: usize },

    /// An OS call failed.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

/// CPU spin-wait hint.
///
/// Called between attempts in every spin loop: keeps the pipeline from
/// being flushed on loop exit, lowers power draw, and yields the execution
/// units to a hyper-thread sibling.
#[inline]
pub fn cpu_relax() {
    std::hint::spin_loop();
}

/// Rounds `size` up to the next multiple of `align` (a power of two).
#[inline]
pub(crate) const fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// Pins the current thread to `core`.
pub fn bind_cpu(core: usize) -> Result<(), PlatformError> {
    let core_ids =
        core_affinity::get_core_ids().ok_or(PlatformError::UnknownCore { core })?;
    let id = core_ids
        .into_iter()
        .find(|c| c.id == core)
        .ok_or(PlatformError::UnknownCore { core })?;

    if core_affinity::set_for_current(id) {
        Ok(())
    } else {
        Err(PlatformError::AffinityRejected { core })
    }
}

/// Binds the current thread's memory policy to `node` and pins it to `core`.
///
/// The core/node pairing is verified against the sysfs topology first, so a
/// mismatched request fails fast instead of silently placing memory and
/// compute on opposite sides of the interconnect.
pub fn bind_numa(node: usize, core: usize) -> Result<(), PlatformError> {
    if !node_contains_core(node, core)? {
        return Err(PlatformError::TopologyMismatch { node, core });
    }

    // MPOL_BIND: allocations for this thread come from `node` only.
    let mask: libc::c_ulong = 1 << node;
    let max_node = (8 * std::mem::size_of::<libc::c_ulong>()) as libc::c_ulong;
    let rc = unsafe {
        libc::syscall(libc::SYS_set_mempolicy, libc::MPOL_BIND, &mask, max_node)
    };
    if rc != 0 {
        return Err(PlatformError::Os {
            op: "set_mempolicy",
            source: io::Error::last_os_error(),
        });
    }

    bind_cpu(core)
}

/// Switches the current thread to `SCHED_FIFO` at `priority` (1..=99).
///
/// Requires `CAP_SYS_NICE` or root; callers should treat failure as a
/// degraded mode, not a fatal error.
pub fn set_realtime_priority(priority: i32) -> Result<(), PlatformError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        return Err(PlatformError::Os {
            op: "sched_setscheduler",
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Checks `/sys/devices/system/node/node{node}/cpulist` for `core`.
fn node_contains_core(node: usize, core: usize) -> Result<bool, PlatformError> {
    let path = format!("/sys/devices/system/node/node{node}/cpulist");
    let list = std::fs::read_to_string(&path)
        .map_err(|_| PlatformError::NumaUnavailable { node })?;
    Ok(parse_cpulist(list.trim()).any(|c| c == core))
}

/// Parses the kernel's cpulist format ("0-3,7,9-11") into core numbers.
/// Malformed entries are skipped.
fn parse_cpulist(list: &str) -> impl Iterator<Item = usize> + '_ {
    list.split(',')
        .filter_map(|part| {
            let part = part.trim();
            match part.split_once('-') {
                Some((lo, hi)) => Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?)),
                None => {
                    let v: usize = part.parse().ok()?;
                    Some((v, v))
                }
            }
        })
        .flat_map(|(lo, hi)| lo..=hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(HUGE_PAGE_SIZE - 1, HUGE_PAGE_SIZE), HUGE_PAGE_SIZE);
        assert_eq!(align_up(HUGE_PAGE_SIZE + 1, HUGE_PAGE_SIZE), 2 * HUGE_PAGE_SIZE);
    }

    #[test]
    fn cpulist_single_values() {
        let cores: Vec<usize> = parse_cpulist("0,2,5").collect();
        assert_eq!(cores, vec![0, 2, 5]);
    }

    #[test]
    fn cpulist_ranges() {
        let cores: Vec<usize> = parse_cpulist("0-3,7,9-11").collect();
        assert_eq!(cores, vec![0, 1, 2, 3, 7, 9, 10, 11]);
    }

    #[test]
    fn cpulist_empty() {
        assert_eq!(parse_cpulist("").count(), 0);
    }

    #[test]
    fn bind_cpu_rejects_absurd_core() {
        assert!(matches!(
            bind_cpu(usize::MAX),
            Err(PlatformError::UnknownCore { .. })
        ));
    }

    #[test]
    fn bind_numa_rejects_mismatched_topology() {
        // Node 0 exists on any Linux box running the tests; an absurd core
        // can never be in its cpulist. Machines without sysfs NUMA info
        // report NumaUnavailable instead, which is equally acceptable here.
        match bind_numa(0, usize::MAX) {
            Err(PlatformError::TopologyMismatch { .. })
            | Err(PlatformError::NumaUnavailable { .. }) => {}
            other => panic!("expected topology or availability error, got {other:?}"),
        }
    }
}
