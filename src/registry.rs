//! Instance registry: id allocation and the set of per-thread arrays.
//!
//! Every [`ThreadLocal`](crate::ThreadLocal) owns one small integer
//! *instance id*. Each thread that touches any slot of a registry gets one
//! [`ThreadArray`] for that registry, indexed by instance id, holding the
//! thread's value pointer for every slot.
//!
//! Locking discipline:
//! - Id allocation/release, array registration, enumeration and slot
//!   teardown take the registry mutex.
//! - A thread reading or filling its own array entry takes no lock. Only
//!   the owning thread fills entries; teardown clears them under the mutex
//!   while the slot is exclusively borrowed, so the two never overlap.
//!
//! Arrays outlive their threads. When a thread exits its array is marked
//! orphaned; it stays registered (its values remain enumerable) until a
//! teardown sweep finds it empty.
//!
//! A thread's handles to arrays of a dropped registry are released the next
//! time that thread registers with any registry, or when it exits.

use crate::allocator;
use crate::bitset::BitAllocator;
use crate::config::{DEFAULT_MAX_INSTANCES, RuntimeConfig};
use crate::error::{Error, Result};
use crate::platform;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

// =============================================================================
// Per-thread arrays
// =============================================================================

/// One thread's value pointers for every instance id of a registry.
///
/// Entries are type-erased; the owning [`ThreadLocal`](crate::ThreadLocal)
/// knows the real type behind its own id.
pub struct ThreadArray {
    entries: NonNull<AtomicPtr<()>>,
    capacity: usize,
    /// Non-null entries.
    live: AtomicUsize,
    /// Set once the owning thread has exited.
    orphaned: AtomicBool,
    thread_id: u64,
}

// SAFETY: the entry table is a heap block of atomics owned by this value.
unsafe impl Send for ThreadArray {}
unsafe impl Sync for ThreadArray {}

impl ThreadArray {
    /// Allocate a zeroed array with `capacity` entries for the calling thread.
    pub fn new(capacity: usize) -> Result<Self> {
        let bytes = capacity
            .checked_mul(core::mem::size_of::<AtomicPtr<()>>())
            .ok_or(Error::AllocationFailure { size: usize::MAX })?;
        // Zeroed memory is a table of null AtomicPtrs.
        let entries = allocator::system_allocate_zeroed(bytes)?.cast::<AtomicPtr<()>>();
        Ok(Self {
            entries,
            capacity,
            live: AtomicUsize::new(0),
            orphaned: AtomicBool::new(false),
            thread_id: platform::current_thread_id(),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// OS thread id of the thread that created the array.
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Number of non-empty entries.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }

    #[inline]
    fn entry(&self, id: usize) -> &AtomicPtr<()> {
        assert!(id < self.capacity, "instance id out of range");
        // SAFETY: in bounds, and the table lives as long as self.
        unsafe { &*self.entries.as_ptr().add(id) }
    }

    /// Current value pointer at `id`, null if empty.
    #[inline]
    pub(crate) fn load(&self, id: usize) -> *mut () {
        self.entry(id).load(Ordering::Acquire)
    }

    /// Fill an empty entry. Returns the pointer already there if the entry
    /// was filled in the meantime, leaving ownership of `value` with the caller.
    pub(crate) fn install(&self, id: usize, value: NonNull<()>) -> core::result::Result<(), NonNull<()>> {
        match self.entry(id).compare_exchange(
            core::ptr::null_mut(),
            value.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.live.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            // Non-null by construction.
            Err(existing) => Err(unsafe { NonNull::new_unchecked(existing) }),
        }
    }

    /// Empty the entry at `id`, returning what was there.
    fn take(&self, id: usize) -> Option<NonNull<()>> {
        let prev = NonNull::new(self.entry(id).swap(core::ptr::null_mut(), Ordering::AcqRel))?;
        self.live.fetch_sub(1, Ordering::Relaxed);
        Some(prev)
    }
}

impl Drop for ThreadArray {
    fn drop(&mut self) {
        // SAFETY: allocated by system_allocate_zeroed in new().
        unsafe { allocator::system_free(self.entries.cast()) };
    }
}

impl core::fmt::Debug for ThreadArray {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadArray")
            .field("thread_id", &self.thread_id)
            .field("capacity", &self.capacity)
            .field("live", &self.live())
            .field("orphaned", &self.is_orphaned())
            .finish()
    }
}

/// The calling thread's array for one registry.
struct LocalArray {
    key: usize,
    /// Dead once the registry is dropped.
    registry: Weak<()>,
    array: Arc<ThreadArray>,
}

/// The calling thread's arrays, one per registry it has touched.
struct LocalArrays {
    arrays: RefCell<Vec<LocalArray>>,
}

impl Drop for LocalArrays {
    fn drop(&mut self) {
        for local in self.arrays.get_mut().drain(..) {
            local.array.orphaned.store(true, Ordering::Release);
        }
    }
}

thread_local! {
    static LOCAL_ARRAYS: LocalArrays = const {
        LocalArrays { arrays: RefCell::new(Vec::new()) }
    };
}

// =============================================================================
// Registry
// =============================================================================

static NEXT_REGISTRY_KEY: AtomicUsize = AtomicUsize::new(0);

static GLOBAL: OnceCell<InstanceRegistry> = OnceCell::new();

struct RegistryState {
    ids: BitAllocator,
    arrays: Vec<Arc<ThreadArray>>,
}

/// Hands out instance ids and tracks every per-thread array ever created.
pub struct InstanceRegistry {
    /// Distinguishes this registry's arrays in a thread's local list.
    key: usize,
    /// Threads hold a `Weak` to this to notice the registry is gone.
    alive: Arc<()>,
    capacity: usize,
    state: Mutex<RegistryState>,
}

impl InstanceRegistry {
    /// Create a registry with room for `capacity` live instance ids.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("registry capacity must be nonzero"));
        }
        Ok(Self::build(capacity))
    }

    fn build(capacity: usize) -> Self {
        Self {
            key: NEXT_REGISTRY_KEY.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
            capacity,
            state: Mutex::new(RegistryState {
                ids: BitAllocator::with_capacity_rounded(capacity),
                arrays: Vec::new(),
            }),
        }
    }

    /// The process-wide registry.
    ///
    /// Created on first use with the capacity from [`RuntimeConfig::from_env`]
    /// unless [`install_global`] ran first. An invalid environment value
    /// falls back to the default capacity.
    pub fn global() -> &'static InstanceRegistry {
        GLOBAL.get_or_init(|| {
            let config = RuntimeConfig::from_env();
            let capacity = match config.validate() {
                Ok(()) => config.max_instances,
                Err(e) => {
                    warn!(target: "rtkit::registry", error = %e, "ignoring registry config");
                    DEFAULT_MAX_INSTANCES
                }
            };
            Self::build(capacity)
        })
    }

    /// Maximum number of live instance ids.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take the lowest free instance id.
    pub fn new_instance_id(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let id = state.ids.find_first_unset();
        if id >= self.capacity {
            warn!(target: "rtkit::registry", capacity = self.capacity, "instance ids exhausted");
            return Err(Error::Exhausted { capacity: self.capacity });
        }
        state.ids.set(id);
        trace!(target: "rtkit::registry", id, "instance id allocated");
        Ok(id)
    }

    /// Return an id to the free pool.
    ///
    /// # Safety
    /// No live [`ThreadLocal`](crate::ThreadLocal) may own `id`, and every
    /// per-thread entry for `id` must already be torn down. A slot created
    /// afterwards receives the same id and would read the old entries as its
    /// own type.
    pub unsafe fn delete_instance_id(&self, id: usize) -> Result<()> {
        if id >= self.capacity {
            return Err(Error::InvalidArgument("instance id out of range"));
        }
        self.state.lock().ids.clear(id);
        trace!(target: "rtkit::registry", id, "instance id released");
        Ok(())
    }

    /// Record a thread's array so enumeration and teardown can reach it.
    pub fn register_thread_array(&self, array: Arc<ThreadArray>) -> Result<()> {
        if array.capacity() < self.capacity {
            return Err(Error::InvalidArgument("thread array smaller than registry"));
        }
        let thread_id = array.thread_id();
        let mut state = self.state.lock();
        state.arrays.push(array);
        debug!(
            target: "rtkit::registry",
            thread_id,
            threads = state.arrays.len(),
            "thread array registered"
        );
        Ok(())
    }

    /// Call `f` with every non-empty entry at `id`, across all threads.
    ///
    /// Holds the registry lock throughout: `f` must not create slots or make
    /// a thread's first access to this registry. The first error returned by
    /// `f` stops the walk and is returned.
    pub fn for_each<F>(&self, id: usize, mut f: F) -> Result<()>
    where
        F: FnMut(NonNull<()>) -> Result<()>,
    {
        if id >= self.capacity {
            return Err(Error::InvalidArgument("instance id out of range"));
        }
        let state = self.state.lock();
        for array in &state.arrays {
            if let Some(entry) = NonNull::new(array.load(id)) {
                f(entry)?;
            }
        }
        Ok(())
    }

    /// Number of arrays currently registered.
    pub fn thread_count(&self) -> usize {
        self.state.lock().arrays.len()
    }

    /// Number of instance ids in use.
    pub fn live_ids(&self) -> usize {
        self.state.lock().ids.count()
    }

    /// Empty the entry at `id` in every registered array and hand back the
    /// removed pointers. Arrays of exited threads left empty are unregistered.
    pub(crate) fn drain_instance(&self, id: usize) -> Vec<NonNull<()>> {
        let mut drained = Vec::new();
        let reclaimed: Vec<Arc<ThreadArray>>;
        {
            let mut state = self.state.lock();
            for array in &state.arrays {
                if let Some(entry) = array.take(id) {
                    drained.push(entry);
                }
            }
            let (dead, alive): (Vec<_>, Vec<_>) = state
                .arrays
                .drain(..)
                .partition(|a| a.is_orphaned() && a.live() == 0);
            state.arrays = alive;
            reclaimed = dead;
        }
        if !reclaimed.is_empty() {
            debug!(
                target: "rtkit::registry",
                count = reclaimed.len(),
                "reclaimed arrays of exited threads"
            );
        }
        drained
    }

    /// Run `f` on the calling thread's array for this registry, creating and
    /// registering the array on first use.
    ///
    /// Fails with [`Error::Destroyed`] while the thread's own storage is being
    /// torn down at exit.
    #[inline]
    pub(crate) fn with_local_array<R>(&self, f: impl FnOnce(&ThreadArray) -> R) -> Result<R> {
        let found = LOCAL_ARRAYS
            .try_with(|local| {
                local
                    .arrays
                    .borrow()
                    .iter()
                    .find(|local| local.key == self.key)
                    .map(|local| Arc::as_ptr(&local.array))
            })
            .map_err(|_| Error::Destroyed)?;
        let array = match found {
            Some(ptr) => ptr,
            None => self.register_current_thread()?,
        };
        // SAFETY: the calling thread's LocalArrays holds an Arc to the array
        // until the thread exits, which cannot happen during `f`. The RefCell
        // borrow is released so `f` may reenter for another slot.
        Ok(f(unsafe { &*array }))
    }

    #[cold]
    #[inline(never)]
    fn register_current_thread(&self) -> Result<*const ThreadArray> {
        let array = Arc::new(ThreadArray::new(self.capacity)?);
        let ptr = Arc::as_ptr(&array);
        LOCAL_ARRAYS
            .try_with(|local| {
                let mut arrays = local.arrays.borrow_mut();
                // Arrays of dropped registries are only referenced from here.
                arrays.retain(|local| local.registry.strong_count() > 0);
                arrays.push(LocalArray {
                    key: self.key,
                    registry: Arc::downgrade(&self.alive),
                    array: Arc::clone(&array),
                });
            })
            .map_err(|_| Error::Destroyed)?;
        self.register_thread_array(array)?;
        Ok(ptr)
    }
}

impl core::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InstanceRegistry")
            .field("capacity", &self.capacity)
            .field("live_ids", &state.ids.count())
            .field("threads", &state.arrays.len())
            .finish()
    }
}

/// Create the process-wide registry with an explicit capacity.
///
/// Fails with [`Error::AlreadyInitialized`] if it already exists.
pub fn install_global(capacity: usize) -> Result<&'static InstanceRegistry> {
    let registry = InstanceRegistry::new(capacity)?;
    GLOBAL.set(registry).map_err(|_| Error::AlreadyInitialized)?;
    Ok(InstanceRegistry::global())
}

#[cfg(test)]
fn local_registry_keys() -> Vec<usize> {
    LOCAL_ARRAYS.with(|local| local.arrays.borrow().iter().map(|l| l.key).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked(capacity: usize) -> &'static InstanceRegistry {
        Box::leak(Box::new(InstanceRegistry::new(capacity).unwrap()))
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            InstanceRegistry::new(0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_ids_lowest_first_and_reused() {
        let registry = InstanceRegistry::new(8).unwrap();
        let ids: Vec<usize> = (0..8).map(|_| registry.new_instance_id().unwrap()).collect();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
        assert_eq!(
            registry.new_instance_id(),
            Err(Error::Exhausted { capacity: 8 })
        );

        unsafe { registry.delete_instance_id(3).unwrap() };
        assert_eq!(registry.new_instance_id().unwrap(), 3);
        assert_eq!(registry.live_ids(), 8);
    }

    #[test]
    fn test_capacity_not_multiple_of_word() {
        let registry = InstanceRegistry::new(2).unwrap();
        assert_eq!(registry.new_instance_id().unwrap(), 0);
        assert_eq!(registry.new_instance_id().unwrap(), 1);
        assert_eq!(
            registry.new_instance_id(),
            Err(Error::Exhausted { capacity: 2 })
        );
    }

    #[test]
    fn test_out_of_range_ids() {
        let registry = InstanceRegistry::new(4).unwrap();
        assert!(matches!(
            unsafe { registry.delete_instance_id(4) },
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.for_each(4, |_| Ok(())),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_local_array_created_once_per_thread() {
        let registry = leaked(4);
        let first = registry.with_local_array(|a| a as *const ThreadArray).unwrap();
        let second = registry.with_local_array(|a| a as *const ThreadArray).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.thread_count(), 1);

        std::thread::spawn(move || {
            registry.with_local_array(|_| ()).unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(registry.thread_count(), 2);
    }

    #[test]
    fn test_for_each_visits_filled_entries_and_stops_on_error() {
        let registry = leaked(4);
        let id = registry.new_instance_id().unwrap();
        let mut values: Vec<Box<u32>> = Vec::new();
        for v in [10u32, 20, 30] {
            let mut boxed = Box::new(v);
            let addr = boxed.as_mut() as *mut u32 as usize;
            values.push(boxed);
            // join() waits for the thread's TLS destructors, so the array is
            // orphaned by the time it returns.
            std::thread::spawn(move || {
                let ptr = NonNull::new(addr as *mut ()).unwrap();
                registry
                    .with_local_array(|a| a.install(id, ptr).unwrap())
                    .unwrap();
            })
            .join()
            .unwrap();
        }

        let mut seen = Vec::new();
        registry
            .for_each(id, |p| {
                seen.push(unsafe { *p.cast::<u32>().as_ref() });
                Ok(())
            })
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec![10, 20, 30]);

        let mut calls = 0;
        let result = registry.for_each(id, |_| {
            calls += 1;
            Err(Error::CallFailed)
        });
        assert_eq!(result, Err(Error::CallFailed));
        assert_eq!(calls, 1);

        // Threads have exited; draining empties and reclaims their arrays.
        let drained = registry.drain_instance(id);
        assert_eq!(drained.len(), 3);
        assert_eq!(registry.thread_count(), 0);
        unsafe { registry.delete_instance_id(id).unwrap() };
    }

    #[test]
    fn test_register_rejects_small_array() {
        let registry = InstanceRegistry::new(128).unwrap();
        let small = Arc::new(ThreadArray::new(64).unwrap());
        assert!(matches!(
            registry.register_thread_array(small),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_dropped_registry_arrays_pruned() {
        std::thread::spawn(|| {
            let gone = InstanceRegistry::new(4).unwrap();
            gone.with_local_array(|_| ()).unwrap();
            let gone_key = gone.key;
            drop(gone);
            assert!(local_registry_keys().contains(&gone_key));

            let kept = leaked(4);
            kept.with_local_array(|_| ()).unwrap();
            let keys = local_registry_keys();
            assert!(!keys.contains(&gone_key));
            assert!(keys.contains(&kept.key));
        })
        .join()
        .unwrap();
    }
}
