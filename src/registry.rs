//! Process-wide region registry. Subsystems that shouldn't carry region
//! references around address their region by a small integer id instead,
//! and one id is designated as the process default.

use std::sync::Mutex;

use crate::region::RegionBase;

/// Sentinel id resolving to whatever [`set_default_region`] last chose.
pub const DEFAULT_REGION: i32 = -1;

const MAX_REGIONS: usize = 8;

struct Registry {
    regions: [Option<&'static dyn RegionBase>; MAX_REGIONS],
    default_region: i32,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    regions: [None; MAX_REGIONS],
    default_region: 1,
});

fn registry() -> std::sync::MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registers a region under the given id, making it reachable through
/// [`get_region`] for the rest of the process lifetime.
///
/// # Panics
///
/// Registering an out-of-range id or an id that is already taken is a
/// programming error and panics.
pub fn register_region(region: &'static dyn RegionBase, id: i32) {
    assert!(
        id > DEFAULT_REGION && (id as usize) < MAX_REGIONS,
        "region id {id} out of range"
    );

    let mut registry = registry();
    assert!(
        registry.regions[id as usize].is_none(),
        "region id {id} already registered"
    );
    registry.regions[id as usize] = Some(region);
}

/// Retrieves a previously registered region. [`DEFAULT_REGION`] resolves
/// to the current default id.
///
/// # Panics
///
/// Panics if no region is registered under the resolved id.
pub fn get_region(id: i32) -> &'static dyn RegionBase {
    let registry = registry();
    let id = if id == DEFAULT_REGION {
        registry.default_region
    } else {
        id
    };

    assert!(
        id >= 0 && (id as usize) < MAX_REGIONS,
        "region id {id} out of range"
    );
    registry.regions[id as usize].expect("no region registered under this id")
}

/// Changes which id [`DEFAULT_REGION`] resolves to.
pub fn set_default_region(id: i32) {
    assert!(
        id > DEFAULT_REGION && (id as usize) < MAX_REGIONS,
        "region id {id} out of range"
    );
    registry().default_region = id;
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

    fn leak_region() -> &'static SharedRegion<MallocRegion> {
        Box::leak(Box::new(SharedRegion::new(MallocRegion::default())))
    }

    fn addr_of(region: &dyn RegionBase) -> *const u8 {
        region as *const dyn RegionBase as *const u8
    }

    // One test for the whole registry: registration is process-global
    // state, separate tests would race through the shared slots.
    #[test]
    fn register_get_and_default() {
        let region1 = leak_region();
        let region2 = leak_region();

        register_region(region1, 1);
        register_region(region2, 2);

        assert_eq!(addr_of(get_region(1)), addr_of(region1));
        assert_eq!(addr_of(get_region(2)), addr_of(region2));

        // Default id starts out as 1 and can be repointed.
        assert_eq!(addr_of(get_region(DEFAULT_REGION)), addr_of(region1));
        set_default_region(2);
        assert_eq!(addr_of(get_region(DEFAULT_REGION)), addr_of(region2));

        // Registered regions serve allocations through the id.
        unsafe {
            let x = get_region(2).allocate(64, 8, source_info!()).unwrap();
            get_region(2).release(x);
        }
    }
}
