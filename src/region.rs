use std::{ptr::NonNull, sync::Mutex};

use crate::{
    allocator::{AllocError, Allocator},
    bounds::BoundsCheckingPolicy,
    marking::MarkingPolicy,
    threading::ThreadingPolicy,
    tracking::{SourceInfo, TrackingPolicy},
    AllocResult,
};

/// A policy-composed façade over an [`Allocator`]. The five policies are
/// type parameters, so a region is exactly as expensive as what it was
/// configured to do and the no-op flavors compile away entirely.
///
/// On allocation a region:
///
/// 1. brackets the operation with the threading policy,
/// 2. grows the request by the bounds sentinel sizes and asks the inner
///    allocator to keep `pointer + front` aligned,
/// 3. writes the front and back sentinels around the caller's bytes,
/// 4. fills the caller's bytes with the allocation pattern, and
/// 5. reports the allocation to the tracker.
///
/// Release reverses the list: verify sentinels, notify the tracker, fill
/// with the release pattern, hand the pointer back to the inner
/// allocator.
///
/// ```text
///            +----------------+----------------------+----------------+
/// inner ->   | front sentinel |    caller's bytes    | back sentinel  |
///            +----------------+----------------------+----------------+
///                             ^
///                             +-- pointer returned by Region::allocate
/// ```
///
/// Sentinel verification on release needs the inner allocator to remember
/// allocation sizes; over an inner allocator whose
/// [`Allocator::allocation_size`] returns 0 the back sentinel is written
/// but not verified.
pub struct Region<A, T, B, K, M> {
    allocator: A,
    thread_guard: T,
    bounds_checker: B,
    tracker: K,
    marker: M,
}

impl<A, T, B, K, M> Region<A, T, B, K, M>
where
    A: Allocator,
    T: ThreadingPolicy,
    B: BoundsCheckingPolicy,
    K: TrackingPolicy,
    M: MarkingPolicy,
{
    /// Builds a region over the given allocator with default-constructed
    /// policies.
    pub fn with_allocator(allocator: A) -> Self {
        Self {
            allocator,
            thread_guard: T::default(),
            bounds_checker: B::default(),
            tracker: K::default(),
            marker: M::default(),
        }
    }

    pub fn tracker(&self) -> &K {
        &self.tracker
    }

    pub fn allocate(&mut self, size: usize, alignment: usize, source: SourceInfo) -> AllocResult {
        self.thread_guard.begin();
        let result = self.allocate_guarded(size, alignment, source);
        self.thread_guard.end();
        result
    }

    /// # Safety
    ///
    /// `addr` must have been returned by [`Self::allocate`] on this same
    /// region and must not have been released already.
    pub unsafe fn release(&mut self, addr: NonNull<u8>) {
        self.thread_guard.begin();
        self.release_guarded(addr);
        self.thread_guard.end();
    }

    fn allocate_guarded(
        &mut self,
        size: usize,
        alignment: usize,
        source: SourceInfo,
    ) -> AllocResult {
        let new_size = size + B::SIZE_FRONT + B::SIZE_BACK;

        let mem = self
            .allocator
            .allocate(new_size, alignment, B::SIZE_FRONT)?;

        unsafe {
            let mem = mem.as_ptr();
            self.bounds_checker.guard_front(mem);
            self.bounds_checker.guard_back(mem.add(B::SIZE_FRONT + size));
            self.marker.on_allocation(mem.add(B::SIZE_FRONT), size);
            self.tracker.on_allocation(mem, new_size, alignment, source);

            Ok(NonNull::new_unchecked(mem.add(B::SIZE_FRONT)))
        }
    }

    unsafe fn release_guarded(&mut self, addr: NonNull<u8>) {
        let orig = addr.as_ptr().sub(B::SIZE_FRONT);
        let alloc_size = self
            .allocator
            .allocation_size(NonNull::new_unchecked(orig));

        if !self.bounds_checker.check_front(orig) {
            log::error!("front bounds sentinel violated at {orig:?}");
            debug_assert!(false, "front bounds sentinel violated");
        }
        if alloc_size != 0 && !self.bounds_checker.check_back(orig.add(alloc_size - B::SIZE_BACK))
        {
            log::error!("back bounds sentinel violated at {orig:?}");
            debug_assert!(false, "back bounds sentinel violated");
        }

        self.tracker.on_release(orig);
        self.marker.on_release(orig, alloc_size);

        self.allocator.release(NonNull::new_unchecked(orig));
    }
}

impl<A, T, B, K, M> Default for Region<A, T, B, K, M>
where
    A: Allocator + Default,
    T: ThreadingPolicy,
    B: BoundsCheckingPolicy,
    K: TrackingPolicy,
    M: MarkingPolicy,
{
    fn default() -> Self {
        Self::with_allocator(A::default())
    }
}

/// Object-safe region contract. This is the form the process-wide
/// registry stores and the typed helpers consume, so any policy
/// composition can stand behind an integer region id.
pub trait RegionBase: Sync {
    fn allocate(&self, size: usize, alignment: usize, source: SourceInfo) -> AllocResult;

    /// # Safety
    ///
    /// `addr` must have been returned by `allocate` on this same region
    /// and must not have been released already.
    unsafe fn release(&self, addr: NonNull<u8>);
}

/// A region behind a mutex: the shareable, registrable handle form.
/// Regions themselves take `&mut self` (their allocators are
/// single-threaded), so sharing one across threads or storing it in the
/// registry means going through a lock.
pub struct SharedRegion<R> {
    inner: Mutex<R>,
}

// The mutex serializes all access to the inner region, which is the only
// reason the region's raw pointers were not Sync in the first place.
unsafe impl<R> Sync for SharedRegion<R> {}

impl<R> SharedRegion<R> {
    pub const fn new(region: R) -> Self {
        Self {
            inner: Mutex::new(region),
        }
    }

    /// Runs `f` with exclusive access to the wrapped region. This is how
    /// callers reach policy state, e.g. the tracker's allocation list.
    pub fn with<Ret>(&self, f: impl FnOnce(&mut R) -> Ret) -> Ret {
        let mut region = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut region)
    }
}

impl<A, T, B, K, M> RegionBase for SharedRegion<Region<A, T, B, K, M>>
where
    A: Allocator,
    T: ThreadingPolicy,
    B: BoundsCheckingPolicy,
    K: TrackingPolicy,
    M: MarkingPolicy,
{
    fn allocate(&self, size: usize, alignment: usize, source: SourceInfo) -> AllocResult {
        match self.inner.lock() {
            Ok(mut region) => region.allocate(size, alignment, source),
            Err(_) => Err(AllocError),
        }
    }

    unsafe fn release(&self, addr: NonNull<u8>) {
        if let Ok(mut region) = self.inner.lock() {
            region.release(addr);
        }
    }
}
