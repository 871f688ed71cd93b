//! ## minnesvakt-core::ledger
//! **Process-wide allocation registry with leak reporting**
//!
//! Every live allocation routed through the trackable capability is keyed
//! here by address. One coarse mutex guards the record map, the running
//! byte total, and the emergency reserve; bookkeeping is not the hot path,
//! so simplicity wins over throughput.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Default emergency reserve capacity: 1 MiB.
pub const DEFAULT_RESERVE_SIZE: usize = 1024 * 1024;

static GLOBAL_LEDGER: OnceCell<AllocationLedger> = OnceCell::new();

/// Where an allocation came from, as recorded at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationOrigin {
    /// Single object allocated without call-site information.
    Unknown,
    /// Array allocated without call-site information.
    UnknownArray,
    /// Call site captured explicitly (label plus line number).
    Tagged { label: &'static str, line: u32 },
    /// Block handed out by a fixed-block pool.
    Pool,
}

impl fmt::Display for AllocationOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationOrigin::Unknown => f.write_str("unknown"),
            AllocationOrigin::UnknownArray => f.write_str("unknown[]"),
            AllocationOrigin::Tagged { label, line } => write!(f, "{label}:{line}"),
            AllocationOrigin::Pool => f.write_str("MemoryPool"),
        }
    }
}

/// Metadata held for one live allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub size: usize,
    pub origin: AllocationOrigin,
}

/// One still-live allocation in a [`LeakReport`].
#[derive(Debug, Clone)]
pub struct LeakEntry {
    pub address: usize,
    pub size: usize,
    pub origin: AllocationOrigin,
}

/// Snapshot of every record still present in the ledger.
///
/// Reporting only: producing a report never mutates the ledger and never
/// fails the process.
#[derive(Debug, Clone, Default)]
pub struct LeakReport {
    pub entries: Vec<LeakEntry>,
    pub total_live: usize,
}

impl LeakReport {
    /// True iff no records remained when the snapshot was taken.
    pub fn is_clean(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn leak_count(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "no leaks detected ({} bytes live)", self.total_live);
        }
        writeln!(
            f,
            "{} leaked allocation(s), {} bytes live:",
            self.entries.len(),
            self.total_live
        )?;
        for entry in &self.entries {
            writeln!(
                f,
                "  {:#x}: {} bytes ({})",
                entry.address, entry.size, entry.origin
            )?;
        }
        Ok(())
    }
}

/// Reserve state is one-way: the buffer is held from construction until the
/// exhaustion hook releases it, and is never re-acquired.
enum ReserveState {
    Held(Box<[u8]>),
    Released,
}

struct LedgerInner {
    live: HashMap<usize, AllocationRecord>,
    total_live: usize,
    reserve: ReserveState,
}

/// Registry mapping live allocation addresses to their metadata.
///
/// The process-wide instance is created on first use via
/// [`AllocationLedger::global`] and lives until process exit; explicit
/// instances can be constructed for injection and report their remaining
/// records when dropped.
pub struct AllocationLedger {
    inner: Mutex<LedgerInner>,
}

impl AllocationLedger {
    /// Creates a ledger holding the default 1 MiB emergency reserve.
    pub fn new() -> Self {
        Self::with_reserve(DEFAULT_RESERVE_SIZE)
    }

    /// Creates a ledger with an explicit reserve capacity.
    pub fn with_reserve(reserve_size: usize) -> Self {
        debug!(reserve_size, "created allocation ledger");
        Self {
            inner: Mutex::new(LedgerInner {
                live: HashMap::new(),
                total_live: 0,
                reserve: ReserveState::Held(vec![0u8; reserve_size].into_boxed_slice()),
            }),
        }
    }

    /// Process-wide instance, created on first use.
    pub fn global() -> &'static AllocationLedger {
        GLOBAL_LEDGER.get_or_init(AllocationLedger::new)
    }

    /// Installs the process-wide instance with an explicit reserve size.
    ///
    /// Returns `false` if the instance already exists; first use wins and
    /// the existing instance is left untouched.
    pub fn init_global(reserve_size: usize) -> bool {
        GLOBAL_LEDGER
            .set(AllocationLedger::with_reserve(reserve_size))
            .is_ok()
    }

    /// Records a live allocation at `address`.
    ///
    /// A zero (null) address is ignored. Re-recording an address already
    /// present indicates a double allocation; the record is overwritten
    /// with a warning and the running total stays equal to the sum of the
    /// sizes of present records.
    pub fn record_allocation(&self, address: usize, size: usize, origin: AllocationOrigin) {
        if address == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(previous) = inner
            .live
            .insert(address, AllocationRecord { size, origin: origin.clone() })
        {
            warn!(
                address,
                previous_size = previous.size,
                "address re-recorded while still live, overwriting"
            );
            inner.total_live -= previous.size;
        }
        inner.total_live += size;
        debug!(address, size, origin = %origin, "recorded allocation");
    }

    /// Clears the record for `address`, returning it.
    ///
    /// Releasing an address that was never recorded is a detectable but
    /// non-fatal condition: a warning is emitted, nothing changes, and
    /// `None` tells the caller to skip the underlying release.
    pub fn record_deallocation(&self, address: usize) -> Option<AllocationRecord> {
        if address == 0 {
            return None;
        }
        let mut inner = self.inner.lock();
        match inner.live.remove(&address) {
            Some(record) => {
                inner.total_live -= record.size;
                debug!(address, size = record.size, "cleared allocation record");
                Some(record)
            }
            None => {
                warn!(address, "releasing untracked memory");
                None
            }
        }
    }

    /// Pure lookup: is `address` currently recorded?
    pub fn is_tracked(&self, address: usize) -> bool {
        self.inner.lock().live.contains_key(&address)
    }

    /// Running total of live bytes across all records.
    pub fn total_live(&self) -> usize {
        self.inner.lock().total_live
    }

    /// Number of live records.
    pub fn tracked_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Whether the emergency reserve is still held.
    pub fn reserve_held(&self) -> bool {
        matches!(self.inner.lock().reserve, ReserveState::Held(_))
    }

    /// Exhaustion hook: releases the emergency reserve so the failing
    /// request can be retried once.
    ///
    /// Returns `true` exactly once, when the reserve transitions from held
    /// to released. Afterwards the hook is disabled and returns `false`, so
    /// an identical failure propagates as an out-of-memory condition
    /// instead of looping.
    pub fn on_exhausted(&self) -> bool {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.reserve, ReserveState::Released) {
            ReserveState::Held(buffer) => {
                warn!(
                    released_bytes = buffer.len(),
                    "allocation failed, released emergency reserve for one retry"
                );
                true
            }
            ReserveState::Released => {
                warn!("allocation failed and emergency reserve is already gone");
                false
            }
        }
    }

    /// Enumerates all remaining records.
    ///
    /// Entries are sorted by address for stable output. The report is also
    /// emitted on the diagnostic stream: a warning per leaked entry, or a
    /// single line when the ledger is clean.
    pub fn leak_report(&self) -> LeakReport {
        let inner = self.inner.lock();
        let mut entries: Vec<LeakEntry> = inner
            .live
            .iter()
            .map(|(address, record)| LeakEntry {
                address: *address,
                size: record.size,
                origin: record.origin.clone(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.address);
        let report = LeakReport {
            entries,
            total_live: inner.total_live,
        };
        drop(inner);

        if report.is_clean() {
            info!("leak report: no leaks detected");
        } else {
            for entry in &report.entries {
                warn!(
                    address = entry.address,
                    size = entry.size,
                    origin = %entry.origin,
                    "leaked allocation"
                );
            }
            warn!(
                leaks = report.leak_count(),
                total_live = report.total_live,
                "leak report complete"
            );
        }
        report
    }
}

impl Default for AllocationLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AllocationLedger {
    fn drop(&mut self) {
        // Teardown order: report leaks first, then the reserve goes with
        // the rest of the inner state.
        self.leak_report();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    #[test]
    fn total_follows_record_sequence() {
        let ledger = AllocationLedger::with_reserve(0);
        ledger.record_allocation(0x1000, 64, AllocationOrigin::Unknown);
        ledger.record_allocation(0x2000, 100, AllocationOrigin::Unknown);
        assert_eq!(ledger.total_live(), 164);
        assert_eq!(ledger.tracked_count(), 2);

        ledger.record_deallocation(0x1000);
        assert_eq!(ledger.total_live(), 100);
        assert_eq!(ledger.tracked_count(), 1);

        ledger.record_deallocation(0x2000);
        assert_eq!(ledger.total_live(), 0);
        assert_eq!(ledger.tracked_count(), 0);
    }

    #[test]
    fn tracks_addresses_across_transitions() {
        let ledger = AllocationLedger::with_reserve(0);
        assert!(!ledger.is_tracked(0x4000));
        ledger.record_allocation(0x4000, 16, AllocationOrigin::Unknown);
        assert!(ledger.is_tracked(0x4000));
        ledger.record_deallocation(0x4000);
        assert!(!ledger.is_tracked(0x4000));
    }

    #[traced_test]
    #[test]
    fn untracked_release_is_a_noop() {
        let ledger = AllocationLedger::with_reserve(0);
        ledger.record_allocation(0x1000, 32, AllocationOrigin::Unknown);
        assert!(ledger.record_deallocation(0x9999).is_none());
        assert_eq!(ledger.total_live(), 32);
        assert_eq!(ledger.tracked_count(), 1);
        assert!(logs_contain("releasing untracked memory"));
    }

    #[traced_test]
    #[test]
    fn re_recording_overwrites_and_warns() {
        let ledger = AllocationLedger::with_reserve(0);
        ledger.record_allocation(0x1000, 32, AllocationOrigin::Unknown);
        ledger.record_allocation(0x1000, 48, AllocationOrigin::Unknown);
        assert_eq!(ledger.tracked_count(), 1);
        // Total stays the sum of present records after the overwrite.
        assert_eq!(ledger.total_live(), 48);
        assert!(logs_contain("re-recorded"));
    }

    #[test]
    fn null_address_is_ignored() {
        let ledger = AllocationLedger::with_reserve(0);
        ledger.record_allocation(0, 128, AllocationOrigin::Unknown);
        assert_eq!(ledger.total_live(), 0);
        assert!(ledger.record_deallocation(0).is_none());
    }

    #[test]
    fn leak_report_lists_live_records() {
        let ledger = AllocationLedger::with_reserve(0);
        ledger.record_allocation(0x1000, 100, AllocationOrigin::Unknown);

        let report = ledger.leak_report();
        assert_eq!(report.leak_count(), 1);
        assert_eq!(report.entries[0].address, 0x1000);
        assert_eq!(report.entries[0].size, 100);
        assert_eq!(report.total_live, 100);

        ledger.record_deallocation(0x1000);
        let report = ledger.leak_report();
        assert!(report.is_clean());
        assert_eq!(report.total_live, 0);
    }

    #[test]
    fn leak_report_is_sorted_by_address() {
        let ledger = AllocationLedger::with_reserve(0);
        ledger.record_allocation(0x3000, 1, AllocationOrigin::Unknown);
        ledger.record_allocation(0x1000, 2, AllocationOrigin::Unknown);
        ledger.record_allocation(0x2000, 3, AllocationOrigin::Unknown);
        let addresses: Vec<usize> = ledger
            .leak_report()
            .entries
            .iter()
            .map(|entry| entry.address)
            .collect();
        assert_eq!(addresses, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn reserve_releases_exactly_once() {
        let ledger = AllocationLedger::with_reserve(4096);
        assert!(ledger.reserve_held());
        assert!(ledger.on_exhausted());
        assert!(!ledger.reserve_held());
        // The hook disables itself after the one-way transition.
        assert!(!ledger.on_exhausted());
        assert!(!ledger.reserve_held());
    }

    #[test]
    fn origin_labels_render() {
        assert_eq!(AllocationOrigin::Unknown.to_string(), "unknown");
        assert_eq!(AllocationOrigin::UnknownArray.to_string(), "unknown[]");
        assert_eq!(AllocationOrigin::Pool.to_string(), "MemoryPool");
        assert_eq!(
            AllocationOrigin::Tagged { label: "driver", line: 7 }.to_string(),
            "driver:7"
        );
    }

    proptest! {
        /// For any record/clear sequence, the running total equals the sum
        /// of the sizes of currently-present records.
        #[test]
        fn total_equals_sum_of_live_records(ops in proptest::collection::vec((0usize..8, 1usize..512, any::<bool>()), 0..64)) {
            let ledger = AllocationLedger::with_reserve(0);
            let mut model: std::collections::HashMap<usize, usize> = std::collections::HashMap::new();

            for (slot, size, release) in ops {
                let address = 0x1000 + slot * 0x100;
                if release {
                    ledger.record_deallocation(address);
                    model.remove(&address);
                } else {
                    ledger.record_allocation(address, size, AllocationOrigin::Unknown);
                    model.insert(address, size);
                }
                prop_assert_eq!(ledger.total_live(), model.values().sum::<usize>());
                prop_assert_eq!(ledger.tracked_count(), model.len());
            }
        }
    }
}
