//! Driver scenarios exercising the allocation subsystem end to end:
//! basic and tagged tracking, pool exhaustion, construction failure on
//! both storage paths, and deliberate leak reporting.

use thiserror::Error;
use tracing::{info, warn};

use minnesvakt_core::error::{EmplaceError, MemoryError};
use minnesvakt_core::ledger::AllocationLedger;
use minnesvakt_core::pool::BlockPool;
use minnesvakt_core::trackable::{Trackable, TrackedSlice};
use minnesvakt_core::tracked;
use minnesvakt_telemetry::metrics::MetricsRecorder;

type ScenarioResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Demonstration payload: a client type adopting the trackable
/// capability, owning a tracked buffer of its own.
pub struct Sample {
    data: TrackedSlice<'static, u32>,
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("sample construction failed on request")]
    Rigged,
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl Sample {
    const ELEMENTS: usize = 100;

    pub fn new() -> Result<Self, MemoryError> {
        Ok(Self {
            data: TrackedSlice::from_fn(AllocationLedger::global(), Self::ELEMENTS, |i| i as u32)?,
        })
    }

    /// Constructor that fails after acquiring its own buffer; the buffer
    /// is released on the way out, mimicking a client initializer that
    /// gives up halfway.
    pub fn failing() -> Result<Self, SampleError> {
        let _incomplete = Self::new()?;
        Err(SampleError::Rigged)
    }

    pub fn checksum(&self) -> u64 {
        self.data.iter().map(|v| u64::from(*v)).sum()
    }
}

impl Trackable for Sample {}

/// Basic tracking: object, tagged object, and array through the general
/// mechanism, with live totals logged around each release.
pub fn run_tracking(metrics: &MetricsRecorder) -> ScenarioResult {
    info!("scenario: basic tracking");
    let ledger = AllocationLedger::global();

    let sample = Sample::new()?.new_tracked()?;
    metrics.inc_allocations();
    info!(
        total_live = ledger.total_live(),
        checksum = sample.checksum(),
        "tracked object live"
    );
    drop(sample);
    metrics.inc_releases();
    info!(total_live = ledger.total_live(), "tracked object released");

    let inner = Sample::new()?;
    let tagged = tracked!(inner)?;
    metrics.inc_allocations();
    info!(address = tagged.address(), "tagged allocation live");
    drop(tagged);
    metrics.inc_releases();

    let numbers = TrackedSlice::<u64>::new_in(ledger, 32)?;
    metrics.inc_allocations();
    info!(
        len = numbers.len(),
        total_live = ledger.total_live(),
        "tracked array live"
    );
    drop(numbers);
    metrics.inc_releases();

    metrics.set_live_bytes(ledger.total_live());
    Ok(())
}

/// Pool walk: allocate pool-backed samples until exhaustion, then reclaim
/// and verify the free counts recover.
pub fn run_pool_walk(block_size: usize, pool_size: usize, metrics: &MetricsRecorder) -> ScenarioResult {
    info!(block_size, pool_size, "scenario: pool walk");
    let pool = BlockPool::new(block_size, pool_size)?;
    info!(
        free = pool.free_count(),
        blocks = pool.num_blocks(),
        "pool ready"
    );

    let mut checked_out = Vec::new();
    loop {
        match Sample::new()?.new_in_pool(&pool) {
            Ok(sample) => {
                metrics.inc_allocations();
                checked_out.push(sample);
            }
            Err(MemoryError::PoolExhausted) => {
                info!(checked_out = checked_out.len(), "pool exhausted, as expected");
                break;
            }
            Err(err) => return Err(err.into()),
        }
    }
    info!(free = pool.free_count(), used = pool.used(), "pool at exhaustion");

    if let Some(sample) = checked_out.pop() {
        drop(sample);
        metrics.inc_releases();
        info!(
            free = pool.free_count(),
            used = pool.used(),
            "one block reclaimed"
        );
    }

    let remaining = checked_out.len();
    checked_out.clear();
    for _ in 0..remaining {
        metrics.inc_releases();
    }
    info!(free = pool.free_count(), used = pool.used(), "pool drained");

    metrics.set_live_bytes(AllocationLedger::global().total_live());
    Ok(())
}

/// Construction failure: the initializer fails after storage acquisition
/// on the general path, then on the pool path. Storage is reclaimed to
/// its origin and the initializer's own error is what surfaces.
pub fn run_construction_failure(
    block_size: usize,
    pool_size: usize,
    metrics: &MetricsRecorder,
) -> ScenarioResult {
    info!("scenario: construction failure");
    let ledger = AllocationLedger::global();
    let before = ledger.total_live();

    match Sample::try_new_tagged(file!(), line!(), Sample::failing) {
        Ok(_) => warn!("construction unexpectedly succeeded"),
        Err(EmplaceError::Init(err)) => {
            info!(error = %err, "initializer failed, storage reclaimed");
        }
        Err(EmplaceError::Alloc(err)) => return Err(err.into()),
    }
    info!(before, after = ledger.total_live(), "general path balanced");

    let pool = BlockPool::new(block_size, pool_size)?;
    let free_before = pool.free_count();
    match Sample::try_new_in_pool(&pool, Sample::failing) {
        Ok(_) => warn!("construction unexpectedly succeeded"),
        Err(EmplaceError::Init(err)) => {
            info!(
                error = %err,
                free_before,
                free_after = pool.free_count(),
                "block returned to the pool"
            );
        }
        Err(EmplaceError::Alloc(err)) => return Err(err.into()),
    }

    metrics.set_live_bytes(ledger.total_live());
    Ok(())
}

/// Deliberate leak: forget a tracked object, then produce the on-demand
/// leak report that names it.
pub fn run_leak_report(metrics: &MetricsRecorder) -> ScenarioResult {
    info!("scenario: deliberate leak");
    let ledger = AllocationLedger::global();

    let leaked = Sample::new()?.new_tracked()?;
    metrics.inc_allocations();
    info!(
        address = leaked.address(),
        "leaking one tracked object on purpose"
    );
    std::mem::forget(leaked);

    let report = ledger.leak_report();
    info!(
        leaks = report.leak_count(),
        total_live = report.total_live,
        "on-demand leak report"
    );

    metrics.set_live_bytes(ledger.total_live());
    Ok(())
}
