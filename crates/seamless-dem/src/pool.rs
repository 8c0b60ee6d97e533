//! Keyed pool of lazily created, shared resources.
//!
//! A [`ResourcePool`] hands out [`Pooled`] leases to resources built on first
//! use by a factory, one resource per key.
//!
//! ## Thread Safety
//!
//! - Lookups of keys that already exist only take a read lock
//! - Multiple threads requesting the same missing key coordinate: one builds
//!   the resource while the others wait for it
//! - Different keys are built concurrently
//!
//! ## Lifecycle
//!
//! [`ResourcePool::shutdown`] releases every resource and makes further
//! `get_or_create` calls fail with [`DemError::PoolClosed`]. A resource that
//! is still leased at that point is closed when its last lease drops, so a
//! fetch in progress never loses its connection underneath it. Dropping the
//! pool shuts it down.
//!
//! Pools that are never dropped (held in a `static`, or alive when the
//! process exits through [`std::process::exit`]) can be released with
//! [`release_all`], which shuts down every pool still alive.

use crate::{DemError, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use tracing::{debug, info, warn};

/// Every pool created in this process, for [`release_all`].
static LIVE_POOLS: Mutex<Vec<Weak<dyn Release>>> = Mutex::new(Vec::new());

/// Shut down every pool that is still alive in this process.
///
/// Meant for exit paths that skip destructors. Returns the number of
/// resources released.
pub fn release_all() -> usize {
    let pools: Vec<Arc<dyn Release>> = {
        let mut live = LIVE_POOLS.lock().unwrap_or_else(|e| e.into_inner());
        live.retain(|pool| pool.strong_count() > 0);
        live.iter().filter_map(Weak::upgrade).collect()
    };
    pools.iter().map(|pool| pool.release()).sum()
}

/// A resource that can live in a [`ResourcePool`].
pub trait PooledResource: Send + Sync {
    /// Release whatever the resource holds.
    ///
    /// Called exactly once, after the pool has let go of the resource and no
    /// lease remains.
    fn close(&mut self) {}
}

/// Factory building the resource for a key.
pub type ResourceFactory<K, R> = Box<dyn Fn(&K) -> Result<R> + Send + Sync>;

/// Owns a resource and closes it when the last reference goes away.
struct Slot<R: PooledResource> {
    resource: R,
    key: String,
}

impl<R: PooledResource> Drop for Slot<R> {
    fn drop(&mut self) {
        debug!(key = %self.key, "closing pooled resource");
        self.resource.close();
    }
}

/// A shared lease on a pooled resource.
///
/// Dereferences to the resource. Cloning a lease is cheap.
pub struct Pooled<R: PooledResource> {
    slot: Arc<Slot<R>>,
}

impl<R: PooledResource> Pooled<R> {
    /// Whether two leases refer to the same resource instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.slot, &b.slot)
    }
}

impl<R: PooledResource> Clone for Pooled<R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<R: PooledResource> Deref for Pooled<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.slot.resource
    }
}

impl<R: PooledResource + fmt::Debug> fmt::Debug for Pooled<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("key", &self.slot.key)
            .field("resource", &self.slot.resource)
            .finish()
    }
}

/// Something [`release_all`] can shut down.
trait Release: Send + Sync {
    fn release(&self) -> usize;
}

/// Pool contents, shared with the process-wide registry.
struct PoolState<K, R: PooledResource> {
    /// Pool name used in logs and errors.
    name: String,
    /// Resources that have been created.
    ready: RwLock<HashMap<K, Arc<Slot<R>>>>,
    /// Keys whose resource is being built right now.
    creating: Mutex<HashSet<K>>,
    /// Signalled whenever a creation settles or the pool closes.
    creation_settled: Condvar,
    closed: AtomicBool,
}

impl<K, R> Release for PoolState<K, R>
where
    K: Eq + Hash + Send + Sync,
    R: PooledResource,
{
    fn release(&self) -> usize {
        let first = !self.closed.swap(true, Ordering::AcqRel);

        // Taking the creation lock orders this after any in-progress insert.
        let released = {
            let _creating = self.creating.lock().unwrap_or_else(|e| e.into_inner());
            let mut ready = self.ready.write().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *ready)
        };
        self.creation_settled.notify_all();

        let count = released.len();
        let leased = released
            .values()
            .filter(|slot| Arc::strong_count(slot) > 1)
            .count();
        drop(released);

        if first {
            info!(
                pool = %self.name,
                released = count,
                still_leased = leased,
                "resource pool shut down"
            );
        }
        count
    }
}

/// Process-lifetime registry of keyed, lazily created resources.
pub struct ResourcePool<K, R: PooledResource> {
    state: Arc<PoolState<K, R>>,
    /// Builds the resource for a key.
    factory: ResourceFactory<K, R>,
}

impl<K, R: PooledResource> fmt::Debug for ResourcePool<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.state.name)
            .field("closed", &self.state.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<K, R> ResourcePool<K, R>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    R: PooledResource + 'static,
{
    /// Create an empty pool. Nothing is built until first requested.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&K) -> Result<R> + Send + Sync + 'static,
    {
        let state = Arc::new(PoolState {
            name: name.into(),
            ready: RwLock::new(HashMap::new()),
            creating: Mutex::new(HashSet::new()),
            creation_settled: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        let registered: Weak<dyn Release> = Arc::downgrade(&state) as Weak<dyn Release>;
        {
            let mut live = LIVE_POOLS.lock().unwrap_or_else(|e| e.into_inner());
            live.retain(|pool| pool.strong_count() > 0);
            live.push(registered);
        }
        Self {
            state,
            factory: Box::new(factory),
        }
    }

    /// Name of the pool.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Whether `shutdown()` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Number of resources currently held by the pool.
    pub fn len(&self) -> usize {
        self.state.ready.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the pool holds no resources.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the resource for `key`, building it if it does not exist yet.
    ///
    /// If several threads ask for the same missing key, exactly one runs the
    /// factory and the rest block until it finishes. A factory failure is
    /// reported to that caller as [`DemError::ResourceInit`]; the key stays
    /// absent, so waiting and later callers try again themselves.
    pub fn get_or_create(&self, key: &K) -> Result<Pooled<R>> {
        if let Some(lease) = self.lookup(key)? {
            return Ok(lease);
        }

        // Claim the key or wait for whoever holds the claim.
        {
            let mut creating = self.lock_creating()?;
            loop {
                if self.is_closed() {
                    return Err(self.closed_error());
                }
                if let Some(lease) = self.lookup(key)? {
                    return Ok(lease);
                }
                if creating.contains(key) {
                    creating = self
                        .state
                        .creation_settled
                        .wait(creating)
                        .map_err(|_| self.poisoned())?;
                    continue;
                }
                creating.insert(key.clone());
                break;
            }
        }

        // Build outside the lock so other keys are not held up. The claim is
        // released even if the factory panics.
        let claim = Claim {
            state: &self.state,
            key,
        };
        debug!(pool = %self.state.name, ?key, "creating pooled resource");
        let built = (self.factory)(key);

        let result = match built {
            Ok(resource) => {
                let slot = Arc::new(Slot {
                    resource,
                    key: format!("{}/{:?}", self.state.name, key),
                });
                let _creating = self.lock_creating()?;
                if self.is_closed() {
                    // Shutdown raced with creation; the slot closes on drop.
                    Err(self.closed_error())
                } else {
                    let mut ready = self.state.ready.write().unwrap_or_else(|e| e.into_inner());
                    ready.insert(key.clone(), Arc::clone(&slot));
                    Ok(Pooled { slot })
                }
            }
            Err(e) => {
                warn!(pool = %self.state.name, ?key, error = %e, "failed to create pooled resource");
                Err(match e {
                    err @ DemError::ResourceInit { .. } => err,
                    other => DemError::ResourceInit {
                        key: format!("{:?}", key),
                        reason: other.to_string(),
                    },
                })
            }
        };
        drop(claim);
        result
    }

    /// Release every resource held by the pool.
    ///
    /// Idempotent: a second call releases nothing and returns `0`. Resources
    /// that are still leased are closed when their last lease is dropped.
    /// Returns the number of resources released by this call.
    pub fn shutdown(&self) -> usize {
        self.state.release()
    }

    fn lookup(&self, key: &K) -> Result<Option<Pooled<R>>> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let ready = self.state.ready.read().map_err(|_| self.poisoned())?;
        Ok(ready.get(key).map(|slot| Pooled {
            slot: Arc::clone(slot),
        }))
    }

    fn lock_creating(&self) -> Result<MutexGuard<'_, HashSet<K>>> {
        self.state.creating.lock().map_err(|_| self.poisoned())
    }

    fn closed_error(&self) -> DemError {
        DemError::PoolClosed {
            pool: self.state.name.clone(),
        }
    }

    fn poisoned(&self) -> DemError {
        DemError::ResourceInit {
            key: self.state.name.clone(),
            reason: "pool lock was poisoned".to_string(),
        }
    }
}

/// A key claimed for creation. Dropping it releases the claim and wakes
/// waiters, whether the factory returned or unwound.
struct Claim<'a, K, R: PooledResource>
where
    K: Eq + Hash,
{
    state: &'a PoolState<K, R>,
    key: &'a K,
}

impl<K, R> Drop for Claim<'_, K, R>
where
    K: Eq + Hash,
    R: PooledResource,
{
    fn drop(&mut self) {
        let mut creating = self
            .state
            .creating
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        creating.remove(self.key);
        drop(creating);
        self.state.creation_settled.notify_all();
    }
}

impl<K, R: PooledResource> Drop for ResourcePool<K, R> {
    fn drop(&mut self) {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            debug!(pool = %self.state.name, "releasing pool on drop");
        }
        let mut ready = self.state.ready.write().unwrap_or_else(|e| e.into_inner());
        ready.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug)]
    struct Counted {
        id: u32,
        closes: Arc<AtomicUsize>,
    }

    impl PooledResource for Counted {
        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_pool(
        created: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    ) -> ResourcePool<u32, Counted> {
        ResourcePool::new("test", move |key: &u32| {
            created.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            Ok(Counted {
                id: *key,
                closes: Arc::clone(&closes),
            })
        })
    }

    #[test]
    fn test_reuses_existing_key() {
        let created = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool(Arc::clone(&created), closes);

        let a = pool.get_or_create(&10).unwrap();
        let b = pool.get_or_create(&10).unwrap();
        let c = pool.get_or_create(&30).unwrap();

        assert!(Pooled::ptr_eq(&a, &b));
        assert!(!Pooled::ptr_eq(&a, &c));
        assert_eq!(a.id, 10);
        assert_eq!(c.id, 30);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_concurrent_creation_happens_once() {
        let created = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool(Arc::clone(&created), closes);
        let barrier = Barrier::new(16);

        let leases: Vec<Pooled<Counted>> = thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        pool.get_or_create(&60).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(created.load(Ordering::SeqCst), 1);
        for lease in &leases {
            assert!(Pooled::ptr_eq(lease, &leases[0]));
        }
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let created = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool(created, Arc::clone(&closes));

        drop(pool.get_or_create(&1).unwrap());
        drop(pool.get_or_create(&2).unwrap());

        assert_eq!(pool.shutdown(), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert_eq!(pool.shutdown(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_get_after_shutdown_fails() {
        let pool = counting_pool(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        pool.shutdown();
        assert!(matches!(
            pool.get_or_create(&1),
            Err(DemError::PoolClosed { .. })
        ));
    }

    #[test]
    fn test_leased_resource_closes_after_last_lease() {
        let closes = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool(Arc::new(AtomicUsize::new(0)), Arc::clone(&closes));

        let lease = pool.get_or_create(&7).unwrap();
        let copy = lease.clone();
        pool.shutdown();

        // Still in use: not closed yet
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert_eq!(lease.id, 7);
        drop(lease);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        drop(copy);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_resources() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let pool = counting_pool(Arc::new(AtomicUsize::new(0)), Arc::clone(&closes));
            drop(pool.get_or_create(&1).unwrap());
            drop(pool.get_or_create(&2).unwrap());
            drop(pool.get_or_create(&3).unwrap());
        }
        assert_eq!(closes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failed_creation_does_not_poison() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let pool: ResourcePool<u32, Counted> = ResourcePool::new("flaky", move |key: &u32| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if *key == 0 && n == 0 {
                return Err(DemError::Metadata("service unavailable".to_string()));
            }
            Ok(Counted {
                id: *key,
                closes: Arc::new(AtomicUsize::new(0)),
            })
        });

        let err = pool.get_or_create(&0).unwrap_err();
        assert!(matches!(err, DemError::ResourceInit { .. }));
        assert!(err.to_string().contains("service unavailable"));

        // Other keys are unaffected and the failed key can be retried
        assert_eq!(pool.get_or_create(&1).unwrap().id, 1);
        assert_eq!(pool.get_or_create(&0).unwrap().id, 0);
    }

    #[test]
    fn test_panicking_factory_releases_claim() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let pool: Arc<ResourcePool<u32, Counted>> =
            Arc::new(ResourcePool::new("panicky", move |key: &u32| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(50));
                    panic!("factory blew up");
                }
                Ok(Counted {
                    id: *key,
                    closes: Arc::new(AtomicUsize::new(0)),
                })
            }));

        let first = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get_or_create(&5).map(|lease| lease.id))
        };
        // Make sure the second caller waits on the first one's claim
        while attempts.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get_or_create(&5).map(|lease| lease.id))
        };

        assert!(first.join().is_err());
        assert_eq!(waiter.join().unwrap().unwrap(), 5);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(pool.get_or_create(&5).unwrap().id, 5);
    }
}
