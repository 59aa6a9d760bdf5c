//! Constructor-aware typed allocation over a [`RegionBase`]. These are
//! the building blocks a `new`/`delete` pair would be made of: single
//! values are written in place and dropped in place, arrays of types with
//! drop glue carry a hidden length word so the destructor side knows how
//! many elements to drop.

use std::{mem, ptr::NonNull};

use crate::{allocator::AllocError, region::RegionBase, tracking::SourceInfo};

const LENGTH_FIELD: usize = mem::size_of::<usize>();

/// Allocates a `T` from the region and moves `value` into it.
pub fn create<T>(
    region: &dyn RegionBase,
    value: T,
    source: SourceInfo,
) -> Result<NonNull<T>, AllocError> {
    let mem = region.allocate(mem::size_of::<T>(), mem::align_of::<T>(), source)?;
    let ptr = mem.cast::<T>();

    unsafe { ptr.as_ptr().write(value) };

    Ok(ptr)
}

/// Drops the value and returns its memory to the region.
///
/// # Safety
///
/// `ptr` must come from [`create`] on the same region and must not have
/// been destroyed already.
pub unsafe fn destroy<T>(region: &dyn RegionBase, ptr: NonNull<T>) {
    ptr.as_ptr().drop_in_place();
    region.release(ptr.cast());
}

/// Header bytes in front of an array of droppable elements. A whole
/// multiple of the element alignment, so the elements stay aligned; the
/// length word occupies the header's last `LENGTH_FIELD` bytes.
fn array_header<T>() -> usize {
    mem::align_of::<T>().max(LENGTH_FIELD)
}

/// Allocates an array of `n` default-constructed elements. For types with
/// drop glue the element count is stashed in a hidden header in front of
/// the array so the destructor side knows how many elements to drop.
pub fn create_array<T: Default>(
    region: &dyn RegionBase,
    n: usize,
    source: SourceInfo,
) -> Result<NonNull<T>, AllocError> {
    unsafe {
        let elements = if mem::needs_drop::<T>() {
            let header = array_header::<T>();
            let size = header + n * mem::size_of::<T>();
            let mem = region.allocate(size, mem::align_of::<T>(), source)?;

            let elements = mem.as_ptr().add(header);
            // The length word can sit at an arbitrary byte boundary, only
            // the elements after the header are aligned.
            elements
                .sub(LENGTH_FIELD)
                .cast::<usize>()
                .write_unaligned(n);
            elements.cast::<T>()
        } else {
            let mem = region.allocate(n * mem::size_of::<T>(), mem::align_of::<T>(), source)?;
            mem.as_ptr().cast::<T>()
        };

        for i in 0..n {
            elements.add(i).write(T::default());
        }

        Ok(NonNull::new_unchecked(elements))
    }
}

/// Drops every element in construction order reversed and returns the
/// array's memory to the region.
///
/// # Safety
///
/// `ptr` must come from [`create_array::<T>`] on the same region and must
/// not have been destroyed already.
pub unsafe fn destroy_array<T>(region: &dyn RegionBase, ptr: NonNull<T>) {
    if !mem::needs_drop::<T>() {
        region.release(ptr.cast());
        return;
    }

    let n = ptr
        .as_ptr()
        .cast::<u8>()
        .sub(LENGTH_FIELD)
        .cast::<usize>()
        .read_unaligned();

    for i in (0..n).rev() {
        ptr.as_ptr().add(i).drop_in_place();
    }

    let base = ptr.as_ptr().cast::<u8>().sub(array_header::<T>());
    region.release(NonNull::new_unchecked(base));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bounds::NoBoundsChecking,
        malloc::MallocAllocator,
        marking::NoMarking,
        region::{Region, SharedRegion},
        source_info,
        threading::SingleThreaded,
        tracking::NoTracking,
    };

    type MallocRegion =
        Region<MallocAllocator, SingleThreaded, NoBoundsChecking, NoTracking, NoMarking>;

    fn region() -> SharedRegion<MallocRegion> {
        SharedRegion::new(MallocRegion::default())
    }

    // Per-thread counter: the test harness runs tests concurrently and
    // each one resets the count.
    thread_local! {
        static DROPS: std::cell::Cell<usize> = std::cell::Cell::new(0);
    }

    fn drops() -> usize {
        DROPS.with(|drops| drops.get())
    }

    fn reset_drops() {
        DROPS.with(|drops| drops.set(0));
    }

    #[derive(Default)]
    struct Droppable {
        value: u64,
    }

    impl Drop for Droppable {
        fn drop(&mut self) {
            DROPS.with(|drops| drops.set(drops.get() + 1));
        }
    }

    #[test]
    fn create_and_destroy_a_value() {
        let region = region();
        unsafe {
            let x = create(&region, 42u64, source_info!()).unwrap();
            assert_eq!(*x.as_ref(), 42);
            assert_eq!(x.as_ptr() as usize % mem::align_of::<u64>(), 0);
            destroy(&region, x);
        }
    }

    #[test]
    fn destroy_runs_the_destructor() {
        let region = region();
        unsafe {
            reset_drops();
            let x = create(&region, Droppable { value: 7 }, source_info!()).unwrap();
            assert_eq!(x.as_ref().value, 7);
            destroy(&region, x);
            assert_eq!(drops(), 1);
        }
    }

    #[test]
    fn plain_arrays_have_no_hidden_header() {
        let region = region();
        unsafe {
            let array = create_array::<u32>(&region, 16, source_info!()).unwrap();
            for i in 0..16 {
                assert_eq!(*array.as_ptr().add(i), 0);
                *array.as_ptr().add(i) = i as u32;
            }
            destroy_array(&region, array);
        }
    }

    #[test]
    fn droppable_arrays_drop_every_element() {
        let region = region();
        unsafe {
            reset_drops();
            let array = create_array::<Droppable>(&region, 10, source_info!()).unwrap();
            assert_eq!(array.as_ptr() as usize % mem::align_of::<Droppable>(), 0);

            destroy_array(&region, array);
            assert_eq!(drops(), 10);
        }
    }

    #[test]
    fn empty_droppable_array_round_trips() {
        let region = region();
        unsafe {
            reset_drops();
            let array = create_array::<Droppable>(&region, 0, source_info!()).unwrap();
            destroy_array(&region, array);
            assert_eq!(drops(), 0);
        }
    }
}
