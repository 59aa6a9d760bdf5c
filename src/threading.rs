//! Thread serialization policies for [`crate::region::Region`]. The policy
//! brackets every region operation with a begin/end pair; the multi
//! threaded flavor maps those to lock/unlock on a [`SyncPrim`].
//!
//! Exclusive access already serializes a region used directly through
//! `&mut`; the policy matters for regions reached through shared handles,
//! see [`crate::region::SharedRegion`].

/// A raw lock/unlock pair. Unlike a guard-based mutex the two halves are
/// called separately, which is what the begin/end bracket needs.
pub trait SyncPrim: Default {
    fn lock(&self);
    fn unlock(&self);
}

impl SyncPrim for spin::Mutex<()> {
    fn lock(&self) {
        // The guard is reconstructed by force_unlock on the other side of
        // the bracket.
        std::mem::forget(spin::Mutex::lock(self));
    }

    fn unlock(&self) {
        unsafe { self.force_unlock() }
    }
}

/// Policy bracketing every region operation.
pub trait ThreadingPolicy: Default {
    fn begin(&self);
    fn end(&self);
}

/// No serialization. The right choice when a region is confined to one
/// thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleThreaded;

impl ThreadingPolicy for SingleThreaded {
    fn begin(&self) {}
    fn end(&self) {}
}

/// Serializes region operations through a [`SyncPrim`].
#[derive(Debug, Default)]
pub struct MultiThreaded<S: SyncPrim = spin::Mutex<()>> {
    prim: S,
}

impl<S: SyncPrim> ThreadingPolicy for MultiThreaded<S> {
    fn begin(&self) {
        self.prim.lock();
    }

    fn end(&self) {
        self.prim.unlock();
    }
}
