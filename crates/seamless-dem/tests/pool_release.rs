//! Releasing pools that are never dropped.
//!
//! Lives in its own test binary: `release_all` shuts down every pool in the
//! process.

use seamless_dem::pool::{release_all, PooledResource, ResourcePool};
use seamless_dem::DemError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

static CLOSED: AtomicUsize = AtomicUsize::new(0);

struct Handle;

impl PooledResource for Handle {
    fn close(&mut self) {
        CLOSED.fetch_add(1, Ordering::SeqCst);
    }
}

fn global_pool() -> &'static ResourcePool<u32, Handle> {
    static POOL: OnceLock<ResourcePool<u32, Handle>> = OnceLock::new();
    POOL.get_or_init(|| ResourcePool::new("global", |_key: &u32| Ok(Handle)))
}

#[test]
fn test_release_all_reaches_static_pools() {
    drop(global_pool().get_or_create(&1).unwrap());
    drop(global_pool().get_or_create(&2).unwrap());

    let local = ResourcePool::new("local", |_key: &u32| Ok(Handle));
    drop(local.get_or_create(&1).unwrap());

    // A pool that was already dropped is skipped
    {
        let gone = ResourcePool::new("gone", |_key: &u32| Ok(Handle));
        drop(gone.get_or_create(&9).unwrap());
    }
    assert_eq!(CLOSED.load(Ordering::SeqCst), 1);

    assert_eq!(release_all(), 3);
    assert_eq!(CLOSED.load(Ordering::SeqCst), 4);
    assert!(global_pool().is_closed());
    assert!(local.is_closed());
    assert!(matches!(
        global_pool().get_or_create(&1),
        Err(DemError::PoolClosed { .. })
    ));

    // Nothing left to release
    assert_eq!(release_all(), 0);
    assert_eq!(local.shutdown(), 0);
}
