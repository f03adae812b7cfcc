//! Dynamically created thread-local slots.
//!
//! A [`ThreadLocal<T>`] is an ordinary value that gives every thread its own
//! lazily created `T`. Any number of slots can be created and destroyed at
//! runtime, up to the registry capacity. Each slot owns one instance id in an
//! [`InstanceRegistry`]; a thread's value lives at that index of the thread's
//! array.
//!
//! Values outlive the thread that created them. They stay visible to
//! [`ThreadLocal::for_each`] and are torn down by [`ThreadLocal::destroy`]
//! (or drop), which runs the destroy hook once per value on the calling
//! thread.

use crate::error::{Error, Result};
use crate::registry::InstanceRegistry;
use core::marker::PhantomData;
use core::ptr::NonNull;
use tracing::{debug, trace, warn};

type CreateFn<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;
type DestroyFn<T> = Box<dyn Fn(T) + Send + Sync>;

struct Active<T> {
    registry: &'static InstanceRegistry,
    id: usize,
    create: CreateFn<T>,
    destroy: Option<DestroyFn<T>>,
}

impl<T> Active<T> {
    /// Reclaim a value produced by `create` and hand it to the destroy hook.
    ///
    /// # Safety
    /// `ptr` must come from `Box::into_raw` of a `T` in this slot and must not
    /// be reachable from any thread array.
    unsafe fn dispose(&self, ptr: NonNull<()>) {
        let value = *unsafe { Box::from_raw(ptr.cast::<T>().as_ptr()) };
        match &self.destroy {
            Some(destroy) => destroy(value),
            None => drop(value),
        }
    }
}

/// Drained values of a slot being destroyed, plus its id.
struct Teardown<T> {
    active: Active<T>,
    pending: std::vec::IntoIter<NonNull<()>>,
    count: usize,
}

impl<T> Teardown<T> {
    fn dispose_pending(&mut self) {
        for ptr in self.pending.by_ref() {
            // SAFETY: drained entries are unreachable from every array, and
            // `next` hands each one out once.
            unsafe { self.active.dispose(ptr) };
        }
    }
}

impl<T> Drop for Teardown<T> {
    /// Finishes a teardown interrupted by a panicking hook, then releases
    /// the id. A second panicking hook here aborts.
    fn drop(&mut self) {
        self.dispose_pending();
        let id = self.active.id;
        // SAFETY: the owning slot gave up its state, and every entry for
        // `id` was drained.
        if let Err(e) = unsafe { self.active.registry.delete_instance_id(id) } {
            warn!(target: "rtkit::thread_local", id, error = %e, "failed to release instance id");
        }
        debug!(target: "rtkit::thread_local", id, values = self.count, "slot destroyed");
    }
}

/// Per-thread value of type `T`, created on each thread's first access.
pub struct ThreadLocal<T> {
    /// `None` once destroyed or moved out of.
    state: Option<Active<T>>,
    _owns: PhantomData<T>,
}

// SAFETY: each thread only reaches its own value through `get`. Values cross
// threads when `destroy` drops them (needs `T: Send`) and when `for_each`
// lends them out (which requires `T: Sync` itself).
unsafe impl<T: Send> Send for ThreadLocal<T> {}
unsafe impl<T: Send> Sync for ThreadLocal<T> {}

impl<T: Send + Default + 'static> ThreadLocal<T> {
    /// Slot in the global registry whose values start as `T::default()`.
    pub fn new() -> Result<Self> {
        Self::new_in(InstanceRegistry::global())
    }

    pub fn new_in(registry: &'static InstanceRegistry) -> Result<Self> {
        Self::build(registry, Box::new(|| Ok(T::default())), None)
    }
}

impl<T: Send + 'static> ThreadLocal<T> {
    /// Slot in the global registry that builds values with `create`.
    ///
    /// If `create` fails, `get` returns its error and the next `get` on that
    /// thread calls it again.
    pub fn with_create<C>(create: C) -> Result<Self>
    where
        C: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self::build(InstanceRegistry::global(), Box::new(create), None)
    }

    /// Slot with both a create hook and a destroy hook. `destroy` receives
    /// each thread's value when the slot is torn down.
    pub fn with_hooks<C, D>(create: C, destroy: D) -> Result<Self>
    where
        C: Fn() -> Result<T> + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        Self::with_hooks_in(InstanceRegistry::global(), create, destroy)
    }

    pub fn with_create_in<C>(registry: &'static InstanceRegistry, create: C) -> Result<Self>
    where
        C: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self::build(registry, Box::new(create), None)
    }

    pub fn with_hooks_in<C, D>(registry: &'static InstanceRegistry, create: C, destroy: D) -> Result<Self>
    where
        C: Fn() -> Result<T> + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        Self::build(registry, Box::new(create), Some(Box::new(destroy)))
    }

    fn build(
        registry: &'static InstanceRegistry,
        create: CreateFn<T>,
        destroy: Option<DestroyFn<T>>,
    ) -> Result<Self> {
        let id = registry.new_instance_id()?;
        trace!(target: "rtkit::thread_local", id, "slot created");
        Ok(Self {
            state: Some(Active {
                registry,
                id,
                create,
                destroy,
            }),
            _owns: PhantomData,
        })
    }
}

impl<T> ThreadLocal<T> {
    /// The calling thread's value, created on first access.
    ///
    /// Fails with [`Error::Destroyed`] after `destroy` or a move out, and
    /// with the create hook's error if it fails.
    #[inline]
    pub fn get(&self) -> Result<&T> {
        let active = self.state.as_ref().ok_or(Error::Destroyed)?;
        let ptr = active.registry.with_local_array(|array| array.load(active.id))?;
        match NonNull::new(ptr) {
            // SAFETY: non-null entries hold a live boxed T until `destroy`,
            // which needs `&mut self`.
            Some(value) => Ok(unsafe { value.cast::<T>().as_ref() }),
            None => self.create_local(active),
        }
    }

    #[cold]
    #[inline(never)]
    fn create_local(&self, active: &Active<T>) -> Result<&T> {
        let value = (active.create)()?;
        // SAFETY: Box never returns null.
        let boxed = unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(value))) }.cast::<()>();
        match active
            .registry
            .with_local_array(|array| array.install(active.id, boxed))
        {
            // SAFETY: installed; lives until `destroy`.
            Ok(Ok(())) => Ok(unsafe { boxed.cast::<T>().as_ref() }),
            // The create hook reentered this slot and filled the entry first.
            Ok(Err(existing)) => {
                // SAFETY: `boxed` was never published.
                unsafe { active.dispose(boxed) };
                Ok(unsafe { existing.cast::<T>().as_ref() })
            }
            Err(e) => {
                // SAFETY: `boxed` was never published.
                unsafe { active.dispose(boxed) };
                Err(e)
            }
        }
    }

    /// Call `f` with every thread's value, including values of threads that
    /// have exited. Stops at the first error from `f` and returns it.
    ///
    /// The registry lock is held throughout, so `f` must not create slots or
    /// call `get` on a slot the current thread has never touched.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        T: Sync,
        F: FnMut(&T) -> Result<()>,
    {
        let active = self.state.as_ref().ok_or(Error::Destroyed)?;
        active
            .registry
            .for_each(active.id, |ptr| f(unsafe { ptr.cast::<T>().as_ref() }))
    }

    /// Tear the slot down: destroy every thread's value and release the
    /// instance id. Later calls do nothing.
    pub fn destroy(&mut self) {
        let Some(active) = self.state.take() else {
            return;
        };
        let values = active.registry.drain_instance(active.id);
        // Hooks run without the registry lock held. If one panics, dropping
        // the guard disposes of the rest and still releases the id.
        let mut teardown = Teardown {
            count: values.len(),
            pending: values.into_iter(),
            active,
        };
        teardown.dispose_pending();
    }

    /// Move the slot out, leaving `self` destroyed without running any hook.
    pub fn take(&mut self) -> ThreadLocal<T> {
        ThreadLocal {
            state: self.state.take(),
            _owns: PhantomData,
        }
    }

    pub fn instance_id(&self) -> Option<usize> {
        self.state.as_ref().map(|a| a.id)
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.is_none()
    }
}

impl<T> Drop for ThreadLocal<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<T> core::fmt::Debug for ThreadLocal<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadLocal")
            .field("instance_id", &self.instance_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn leaked(capacity: usize) -> &'static InstanceRegistry {
        Box::leak(Box::new(InstanceRegistry::new(capacity).unwrap()))
    }

    #[test]
    fn test_default_value_per_thread() {
        let slot: ThreadLocal<Cell<u32>> = ThreadLocal::new().unwrap();
        slot.get().unwrap().set(7);
        assert_eq!(slot.get().unwrap().get(), 7);

        std::thread::scope(|s| {
            s.spawn(|| assert_eq!(slot.get().unwrap().get(), 0));
        });
        assert_eq!(slot.get().unwrap().get(), 7);
    }

    #[test]
    fn test_same_reference_on_repeat_access() {
        let slot = ThreadLocal::with_create(|| Ok(String::from("x"))).unwrap();
        let a = slot.get().unwrap() as *const String;
        let b = slot.get().unwrap() as *const String;
        assert_eq!(a, b);
    }

    #[test]
    fn test_create_failure_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let slot = ThreadLocal::with_create(move || {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::CallFailed)
            } else {
                Ok(5u64)
            }
        })
        .unwrap();
        assert_eq!(slot.get(), Err(Error::CallFailed));
        assert_eq!(slot.get(), Ok(&5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_destroy_runs_hook_once_per_value() {
        let registry = leaked(8);
        let destroyed = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&destroyed);
        let mut slot = ThreadLocal::with_hooks_in(
            registry,
            || Ok(1u32),
            move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        slot.get().unwrap();
        std::thread::scope(|s| {
            s.spawn(|| slot.get().map(|_| ()));
        });

        slot.destroy();
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert!(slot.is_destroyed());
        assert_eq!(slot.get(), Err(Error::Destroyed));

        slot.destroy();
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(registry.live_ids(), 0);
    }

    #[test]
    fn test_take_moves_ownership() {
        let mut slot = ThreadLocal::with_create(|| Ok(3i32)).unwrap();
        let id = slot.instance_id();
        let moved = slot.take();
        assert_eq!(slot.get(), Err(Error::Destroyed));
        assert_eq!(slot.instance_id(), None);
        assert_eq!(moved.instance_id(), id);
        assert_eq!(moved.get(), Ok(&3));
    }

    #[test]
    fn test_capacity_exhaustion_and_reuse() {
        let registry = leaked(2);
        let a = ThreadLocal::<u8>::new_in(registry).unwrap();
        let _b = ThreadLocal::<u8>::new_in(registry).unwrap();
        assert_eq!(
            ThreadLocal::<u8>::new_in(registry).unwrap_err(),
            Error::Exhausted { capacity: 2 }
        );
        let freed = a.instance_id();
        drop(a);
        let c = ThreadLocal::<u8>::new_in(registry).unwrap();
        assert_eq!(c.instance_id(), freed);
    }

    #[test]
    fn test_create_hook_may_touch_other_slot() {
        let inner: &'static ThreadLocal<u32> =
            Box::leak(Box::new(ThreadLocal::with_create(|| Ok(40)).unwrap()));
        let outer = ThreadLocal::with_create(move || Ok(*inner.get()? + 2)).unwrap();
        assert_eq!(outer.get(), Ok(&42));
    }

    #[test]
    fn test_for_each_after_destroy() {
        let mut slot = ThreadLocal::<u32>::new().unwrap();
        slot.destroy();
        assert_eq!(slot.for_each(|_| Ok(())), Err(Error::Destroyed));
    }

    #[test]
    fn test_panicking_destroy_hook_still_releases() {
        let registry = leaked(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let mut slot = ThreadLocal::with_hooks_in(
            registry,
            || Ok(0u8),
            move |_| {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("hook failure");
                }
            },
        )
        .unwrap();
        slot.get().unwrap();
        for _ in 0..2 {
            std::thread::scope(|s| {
                s.spawn(|| slot.get().map(|_| ()));
            });
        }

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| slot.destroy()));
        assert!(result.is_err());
        assert!(slot.is_destroyed());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(registry.live_ids(), 0);
        assert!(ThreadLocal::<u8>::new_in(registry).is_ok());
    }
}
