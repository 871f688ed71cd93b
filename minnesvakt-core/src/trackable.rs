//! ## minnesvakt-core::trackable
//! **Ledger-routed storage for opt-in types**
//!
//! Three allocation strategies, selectable at the call site:
//! - default: general mechanism, origin recorded as "unknown"
//! - tagged: general mechanism, origin recorded as label + line
//! - pool: a caller-supplied [`BlockPool`], origin recorded as "MemoryPool"
//!
//! Each strategy has an RAII owner whose drop clears the ledger entry and
//! returns storage to the mechanism it came from. Fallible construction is
//! two explicit steps (storage, then in-place initialization), so a failed
//! initializer undoes exactly the allocation and the caller sees its own
//! error unchanged.

use std::alloc::{alloc, dealloc, Layout};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use tracing::warn;

use crate::error::{EmplaceError, MemoryError};
use crate::ledger::{AllocationLedger, AllocationOrigin};
use crate::pool::BlockPool;

/// Zero-size requests still receive a distinct, trackable address.
fn pad_zero_size(layout: Layout) -> Layout {
    if layout.size() == 0 {
        // SAFETY: the alignment comes from an already-valid layout.
        unsafe { Layout::from_size_align_unchecked(1, layout.align()) }
    } else {
        layout
    }
}

fn storage_layout<T>() -> Layout {
    pad_zero_size(Layout::new::<T>())
}

fn slice_layout<T>(len: usize) -> Result<Layout, MemoryError> {
    Layout::array::<T>(len)
        .map(pad_zero_size)
        .map_err(|_| MemoryError::OutOfMemory)
}

/// Obtains storage from the general mechanism.
///
/// On failure the ledger's exhaustion hook runs; if it frees the emergency
/// reserve the request is retried exactly once, otherwise the failure
/// propagates as [`MemoryError::OutOfMemory`].
fn raw_alloc(ledger: &AllocationLedger, layout: Layout) -> Result<NonNull<u8>, MemoryError> {
    debug_assert!(layout.size() > 0);
    // SAFETY: layout has non-zero size.
    if let Some(ptr) = NonNull::new(unsafe { alloc(layout) }) {
        return Ok(ptr);
    }
    if ledger.on_exhausted() {
        // SAFETY: as above; one retry after the reserve release.
        if let Some(ptr) = NonNull::new(unsafe { alloc(layout) }) {
            return Ok(ptr);
        }
    }
    Err(MemoryError::OutOfMemory)
}

/// # Safety
///
/// `ptr` must have been returned by [`raw_alloc`] with the same layout.
unsafe fn raw_dealloc(ptr: NonNull<u8>, layout: Layout) {
    debug_assert!(layout.size() > 0);
    unsafe { dealloc(ptr.as_ptr(), layout) };
}

/// Owning handle for a single object allocated through the general
/// mechanism and recorded in a ledger.
pub struct TrackedBox<'l, T> {
    ptr: NonNull<T>,
    ledger: &'l AllocationLedger,
    _marker: PhantomData<T>,
}

// SAFETY: the box exclusively owns its value; the ledger handles its own
// synchronization.
unsafe impl<T: Send> Send for TrackedBox<'_, T> {}
unsafe impl<T: Sync> Sync for TrackedBox<'_, T> {}

impl<'l, T> TrackedBox<'l, T> {
    /// Default strategy: origin recorded as "unknown".
    pub fn new_in(ledger: &'l AllocationLedger, value: T) -> Result<Self, MemoryError> {
        Self::with_origin(ledger, value, AllocationOrigin::Unknown)
    }

    /// Origin-tagged strategy: the call site supplies a label and line.
    pub fn tagged_in(
        ledger: &'l AllocationLedger,
        value: T,
        label: &'static str,
        line: u32,
    ) -> Result<Self, MemoryError> {
        Self::with_origin(ledger, value, AllocationOrigin::Tagged { label, line })
    }

    fn with_origin(
        ledger: &'l AllocationLedger,
        value: T,
        origin: AllocationOrigin,
    ) -> Result<Self, MemoryError> {
        let layout = storage_layout::<T>();
        let raw = raw_alloc(ledger, layout)?;
        let ptr = raw.cast::<T>();
        ledger.record_allocation(raw.as_ptr() as usize, layout.size(), origin);
        // SAFETY: freshly allocated storage sized and aligned for T.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            ptr,
            ledger,
            _marker: PhantomData,
        })
    }

    /// Two-step fallible construction: storage is acquired and recorded,
    /// then `init` runs.
    ///
    /// If `init` fails, exactly the allocation is undone (ledger entry
    /// cleared, storage returned to the general mechanism, no destructor
    /// runs for the never-completed value) and the initializer's error
    /// comes back unchanged in [`EmplaceError::Init`].
    pub fn try_emplace_in<E>(
        ledger: &'l AllocationLedger,
        label: &'static str,
        line: u32,
        init: impl FnOnce() -> Result<T, E>,
    ) -> Result<Self, EmplaceError<E>> {
        let layout = storage_layout::<T>();
        let raw = raw_alloc(ledger, layout)?;
        let address = raw.as_ptr() as usize;
        ledger.record_allocation(address, layout.size(), AllocationOrigin::Tagged { label, line });

        match init() {
            Ok(value) => {
                let ptr = raw.cast::<T>();
                // SAFETY: freshly allocated storage sized and aligned for T.
                unsafe { ptr.as_ptr().write(value) };
                Ok(Self {
                    ptr,
                    ledger,
                    _marker: PhantomData,
                })
            }
            Err(err) => {
                ledger.record_deallocation(address);
                // SAFETY: the storage was never initialized; only the
                // allocation itself is undone here.
                unsafe { raw_dealloc(raw, layout) };
                Err(EmplaceError::Init(err))
            }
        }
    }

    /// Address under which this allocation is recorded.
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl<T> Deref for TrackedBox<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: ptr is valid and initialized for the box lifetime.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for TrackedBox<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: exclusive access through &mut self.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for TrackedBox<'_, T> {
    fn drop(&mut self) {
        let address = self.address();
        // SAFETY: the value is initialized and exclusively owned.
        unsafe { ptr::drop_in_place(self.ptr.as_ptr()) };
        if self.ledger.record_deallocation(address).is_some() {
            // SAFETY: storage came from raw_alloc with this layout.
            unsafe { raw_dealloc(self.ptr.cast(), storage_layout::<T>()) };
        } else {
            // Not obtained through the matching path; releasing it could
            // hand the general mechanism memory it never issued.
            warn!(address, "skipping release of untracked storage");
        }
    }
}

/// Owning handle for an array allocated through the general mechanism,
/// recorded with the "unknown[]" origin.
pub struct TrackedSlice<'l, T> {
    ptr: NonNull<T>,
    len: usize,
    ledger: &'l AllocationLedger,
    _marker: PhantomData<T>,
}

// SAFETY: as for TrackedBox.
unsafe impl<T: Send> Send for TrackedSlice<'_, T> {}
unsafe impl<T: Sync> Sync for TrackedSlice<'_, T> {}

impl<'l, T> TrackedSlice<'l, T> {
    /// Allocates `len` default-constructed elements.
    pub fn new_in(ledger: &'l AllocationLedger, len: usize) -> Result<Self, MemoryError>
    where
        T: Default,
    {
        Self::from_fn(ledger, len, |_| T::default())
    }

    /// Allocates `len` elements produced by `fill(index)`.
    pub fn from_fn(
        ledger: &'l AllocationLedger,
        len: usize,
        mut fill: impl FnMut(usize) -> T,
    ) -> Result<Self, MemoryError> {
        let layout = slice_layout::<T>(len)?;
        let raw = raw_alloc(ledger, layout)?;
        let ptr = raw.cast::<T>();
        ledger.record_allocation(raw.as_ptr() as usize, layout.size(), AllocationOrigin::UnknownArray);
        for i in 0..len {
            // SAFETY: slot i of a fresh allocation sized for len elements.
            unsafe { ptr.as_ptr().add(i).write(fill(i)) };
        }
        Ok(Self {
            ptr,
            len,
            ledger,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address under which this allocation is recorded.
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl<T> Deref for TrackedSlice<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: len elements were initialized at construction.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for TrackedSlice<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for TrackedSlice<'_, T> {
    fn drop(&mut self) {
        let address = self.address();
        // SAFETY: all len elements are initialized and exclusively owned.
        unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len)) };
        if self.ledger.record_deallocation(address).is_some() {
            // The layout was validated when the allocation succeeded.
            if let Ok(layout) = slice_layout::<T>(self.len) {
                // SAFETY: storage came from raw_alloc with this layout.
                unsafe { raw_dealloc(self.ptr.cast(), layout) };
            }
        } else {
            warn!(address, "skipping release of untracked storage");
        }
    }
}

/// Owning handle for an object stored in a block of a caller-supplied
/// [`BlockPool`].
///
/// The handle borrows the pool, so the borrow checker enforces the
/// precondition that the pool outlives every object allocated from it.
pub struct PoolBox<'a, T> {
    ptr: NonNull<T>,
    pool: &'a BlockPool,
    ledger: &'a AllocationLedger,
    _marker: PhantomData<T>,
}

// SAFETY: the box exclusively owns its value; pool and ledger handle their
// own synchronization.
unsafe impl<T: Send> Send for PoolBox<'_, T> {}
unsafe impl<T: Sync> Sync for PoolBox<'_, T> {}

impl<'a, T> PoolBox<'a, T> {
    /// Pool strategy: storage comes from `pool`, origin is recorded as
    /// "MemoryPool".
    ///
    /// Fails with [`MemoryError::BlockOverflow`] before touching the pool
    /// if a block cannot hold `T`, and with
    /// [`MemoryError::PoolExhausted`] when no block is free.
    pub fn new_in(
        pool: &'a BlockPool,
        ledger: &'a AllocationLedger,
        value: T,
    ) -> Result<Self, MemoryError> {
        let raw = acquire_block::<T>(pool, ledger)?;
        let ptr = raw.cast::<T>();
        // SAFETY: acquire_block guaranteed size and alignment for T.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            ptr,
            pool,
            ledger,
            _marker: PhantomData,
        })
    }

    /// Two-step fallible construction on the pool path.
    ///
    /// If `init` fails the ledger entry is cleared and the block returns
    /// to the pool, not to the general mechanism; the initializer's error
    /// comes back unchanged.
    pub fn try_emplace_in<E>(
        pool: &'a BlockPool,
        ledger: &'a AllocationLedger,
        init: impl FnOnce() -> Result<T, E>,
    ) -> Result<Self, EmplaceError<E>> {
        let raw = acquire_block::<T>(pool, ledger)?;
        let address = raw.as_ptr() as usize;

        match init() {
            Ok(value) => {
                let ptr = raw.cast::<T>();
                // SAFETY: acquire_block guaranteed size and alignment for T.
                unsafe { ptr.as_ptr().write(value) };
                Ok(Self {
                    ptr,
                    pool,
                    ledger,
                    _marker: PhantomData,
                })
            }
            Err(err) => {
                ledger.record_deallocation(address);
                pool.deallocate(raw);
                Err(EmplaceError::Init(err))
            }
        }
    }

    /// Address under which this allocation is recorded.
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

fn acquire_block<T>(
    pool: &BlockPool,
    ledger: &AllocationLedger,
) -> Result<NonNull<u8>, MemoryError> {
    let layout = Layout::new::<T>();
    if !pool.fits(layout) {
        return Err(MemoryError::BlockOverflow {
            requested: layout.size(),
            block_size: pool.block_size(),
        });
    }
    let raw = pool.allocate().ok_or(MemoryError::PoolExhausted)?;
    ledger.record_allocation(raw.as_ptr() as usize, layout.size(), AllocationOrigin::Pool);
    Ok(raw)
}

impl<T> Deref for PoolBox<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: ptr is valid and initialized for the box lifetime.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for PoolBox<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: exclusive access through &mut self.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for PoolBox<'_, T> {
    fn drop(&mut self) {
        let address = self.address();
        // SAFETY: the value is initialized and exclusively owned.
        unsafe { ptr::drop_in_place(self.ptr.as_ptr()) };
        // Clear the ledger entry if present, then return the block to the
        // pool either way: blocks must not leak from their arena.
        self.ledger.record_deallocation(address);
        self.pool.deallocate(self.ptr.cast());
    }
}

/// Opt-in capability: a conforming type routes its instances' raw storage
/// through the process-wide ledger, and optionally through a pool.
///
/// Adoption is a one-line `impl Trackable for T {}`; the provided
/// operation set below is the whole contract.
pub trait Trackable: Sized {
    /// Default strategy against the process-wide ledger.
    fn new_tracked(self) -> Result<TrackedBox<'static, Self>, MemoryError> {
        TrackedBox::new_in(AllocationLedger::global(), self)
    }

    /// Origin-tagged strategy against the process-wide ledger. Prefer the
    /// [`tracked!`](crate::tracked) macro, which captures the call site.
    fn new_tagged(
        self,
        label: &'static str,
        line: u32,
    ) -> Result<TrackedBox<'static, Self>, MemoryError> {
        TrackedBox::tagged_in(AllocationLedger::global(), self, label, line)
    }

    /// Pool strategy against the process-wide ledger.
    fn new_in_pool(self, pool: &BlockPool) -> Result<PoolBox<'_, Self>, MemoryError> {
        PoolBox::new_in(pool, AllocationLedger::global(), self)
    }

    /// Two-step fallible construction on the general mechanism.
    fn try_new_tagged<E>(
        label: &'static str,
        line: u32,
        init: impl FnOnce() -> Result<Self, E>,
    ) -> Result<TrackedBox<'static, Self>, EmplaceError<E>> {
        TrackedBox::try_emplace_in(AllocationLedger::global(), label, line, init)
    }

    /// Two-step fallible construction on the pool path.
    fn try_new_in_pool<E>(
        pool: &BlockPool,
        init: impl FnOnce() -> Result<Self, E>,
    ) -> Result<PoolBox<'_, Self>, EmplaceError<E>> {
        PoolBox::try_emplace_in(pool, AllocationLedger::global(), init)
    }
}

/// Allocates a tracked value with the call site captured as its origin.
#[macro_export]
macro_rules! tracked {
    ($value:expr) => {
        $crate::trackable::Trackable::new_tagged($value, ::core::file!(), ::core::line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq, Eq)]
    #[error("rigged to fail: {0}")]
    struct Rigged(u32);

    #[test]
    fn tracked_box_records_and_clears() {
        let ledger = AllocationLedger::with_reserve(0);
        let value = TrackedBox::new_in(&ledger, 7u64).unwrap();
        let address = value.address();

        assert_eq!(*value, 7);
        assert!(ledger.is_tracked(address));
        assert_eq!(ledger.total_live(), 8);

        drop(value);
        assert!(!ledger.is_tracked(address));
        assert_eq!(ledger.total_live(), 0);
    }

    #[test]
    fn tracked_box_is_mutable_through_deref() {
        let ledger = AllocationLedger::with_reserve(0);
        let mut value = TrackedBox::new_in(&ledger, vec![1, 2, 3]).unwrap();
        value.push(4);
        assert_eq!(value.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn origins_are_recorded_per_strategy() {
        let ledger = AllocationLedger::with_reserve(0);
        let pool = BlockPool::new(64, 640).unwrap();

        let plain = TrackedBox::new_in(&ledger, 1u32).unwrap();
        let tagged = TrackedBox::tagged_in(&ledger, 2u32, "driver", 42).unwrap();
        let slice = TrackedSlice::from_fn(&ledger, 4, |i| i as u32).unwrap();
        let pooled = PoolBox::new_in(&pool, &ledger, 3u32).unwrap();

        let report = ledger.leak_report();
        let origin_of = |address: usize| {
            report
                .entries
                .iter()
                .find(|entry| entry.address == address)
                .map(|entry| entry.origin.clone())
                .unwrap()
        };

        assert_eq!(origin_of(plain.address()), AllocationOrigin::Unknown);
        assert_eq!(
            origin_of(tagged.address()),
            AllocationOrigin::Tagged { label: "driver", line: 42 }
        );
        assert_eq!(origin_of(slice.address()), AllocationOrigin::UnknownArray);
        assert_eq!(origin_of(pooled.address()), AllocationOrigin::Pool);
    }

    #[test]
    fn zero_sized_values_still_get_an_address() {
        let ledger = AllocationLedger::with_reserve(0);
        let unit = TrackedBox::new_in(&ledger, ()).unwrap();
        assert!(ledger.is_tracked(unit.address()));
        assert_eq!(ledger.total_live(), 1);
        drop(unit);
        assert_eq!(ledger.total_live(), 0);
    }

    #[test]
    fn slice_tracks_as_one_allocation_and_drops_elements() {
        let ledger = AllocationLedger::with_reserve(0);
        let drops = Rc::new(Cell::new(0u32));

        struct Counted(Rc<Cell<u32>>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let slice = TrackedSlice::from_fn(&ledger, 5, |_| Counted(Rc::clone(&drops))).unwrap();
        assert_eq!(slice.len(), 5);
        assert_eq!(ledger.tracked_count(), 1);

        drop(slice);
        assert_eq!(drops.get(), 5);
        assert_eq!(ledger.total_live(), 0);
    }

    #[test]
    fn slice_contents_match_fill() {
        let ledger = AllocationLedger::with_reserve(0);
        let mut slice = TrackedSlice::from_fn(&ledger, 100, |i| i as u32).unwrap();
        assert_eq!(slice[99], 99);
        slice[0] = 7;
        assert_eq!(slice[0], 7);
        assert_eq!(ledger.total_live(), 400);
    }

    #[test]
    fn pool_box_checks_out_and_returns_a_block() {
        let ledger = AllocationLedger::with_reserve(0);
        let pool = BlockPool::new(64, 640).unwrap();

        let value = PoolBox::new_in(&pool, &ledger, 11u64).unwrap();
        assert_eq!(*value, 11);
        assert_eq!(pool.free_count(), 9);
        assert_eq!(pool.used(), 64);
        assert!(ledger.is_tracked(value.address()));

        drop(value);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.used(), 0);
        assert_eq!(ledger.total_live(), 0);
    }

    #[test]
    fn oversized_pool_request_fails_before_touching_the_pool() {
        let ledger = AllocationLedger::with_reserve(0);
        let pool = BlockPool::new(64, 640).unwrap();

        let result = PoolBox::new_in(&pool, &ledger, [0u8; 65]);
        assert!(matches!(
            result,
            Err(MemoryError::BlockOverflow { requested: 65, block_size: 64 })
        ));
        assert_eq!(pool.free_count(), 10);
        assert_eq!(ledger.total_live(), 0);
    }

    #[test]
    fn exhausted_pool_fails_allocation() {
        let ledger = AllocationLedger::with_reserve(0);
        let pool = BlockPool::new(64, 128).unwrap();

        let first = PoolBox::new_in(&pool, &ledger, 1u8).unwrap();
        let second = PoolBox::new_in(&pool, &ledger, 2u8).unwrap();
        assert!(matches!(
            PoolBox::new_in(&pool, &ledger, 3u8),
            Err(MemoryError::PoolExhausted)
        ));
        drop(first);
        drop(second);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn failed_init_undoes_exactly_the_allocation() {
        let ledger = AllocationLedger::with_reserve(0);
        ledger.record_allocation(0x1000, 10, AllocationOrigin::Unknown);
        let before = ledger.total_live();

        let result: Result<TrackedBox<'_, [u8; 32]>, _> =
            TrackedBox::try_emplace_in(&ledger, "test", 1, || Err(Rigged(42)));

        // The caller observes its own error, unchanged.
        match result {
            Err(EmplaceError::Init(err)) => assert_eq!(err, Rigged(42)),
            Err(EmplaceError::Alloc(err)) => panic!("unexpected alloc failure: {err}"),
            Ok(_) => panic!("construction unexpectedly succeeded"),
        }
        assert_eq!(ledger.total_live(), before);
        assert_eq!(ledger.tracked_count(), 1);
    }

    #[test]
    fn successful_emplace_behaves_like_tagged() {
        let ledger = AllocationLedger::with_reserve(0);
        let value: TrackedBox<'_, u32> =
            TrackedBox::try_emplace_in(&ledger, "test", 2, || Ok::<_, Rigged>(5)).unwrap();
        assert_eq!(*value, 5);
        assert!(ledger.is_tracked(value.address()));
        drop(value);
        assert_eq!(ledger.total_live(), 0);
    }

    #[test]
    fn failed_pool_init_returns_the_block() {
        let ledger = AllocationLedger::with_reserve(0);
        let pool = BlockPool::new(64, 640).unwrap();

        let result: Result<PoolBox<'_, u64>, _> =
            PoolBox::try_emplace_in(&pool, &ledger, || Err(Rigged(7)));

        match result {
            Err(EmplaceError::Init(err)) => assert_eq!(err, Rigged(7)),
            Err(EmplaceError::Alloc(err)) => panic!("unexpected alloc failure: {err}"),
            Ok(_) => panic!("construction unexpectedly succeeded"),
        }
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.used(), 0);
        assert_eq!(ledger.total_live(), 0);
    }

    #[test]
    fn trait_routes_through_the_global_ledger() {
        struct Payload(#[allow(dead_code)] u64);
        impl Trackable for Payload {}

        let value = Payload(9).new_tracked().unwrap();
        let address = value.address();
        assert!(AllocationLedger::global().is_tracked(address));
        drop(value);
        assert!(!AllocationLedger::global().is_tracked(address));
    }

    #[test]
    fn tracked_macro_captures_the_call_site() {
        struct Payload;
        impl Trackable for Payload {}

        let value = tracked!(Payload).unwrap();
        let report = AllocationLedger::global().leak_report();
        let entry = report
            .entries
            .iter()
            .find(|entry| entry.address == value.address())
            .unwrap();
        match &entry.origin {
            AllocationOrigin::Tagged { label, .. } => assert!(label.ends_with("trackable.rs")),
            other => panic!("expected tagged origin, got {other}"),
        }
    }
}
