//! Tracked allocators: byte blocks with per-thread allocation counters.
//!
//! Two layers live here:
//!
//! - The *system* byte allocator: size-prefixed blocks from the Rust global
//!   allocator, with one process-wide set of counters behind a mutex. The
//!   instance registry places its per-thread arrays through it.
//! - [`TrackedAllocator`]: a named allocator that keeps one
//!   [`ThreadLocal`] stats record per thread, so the hot path never
//!   contends, and aggregates all threads' records on demand.
//!
//! Named allocators are kept in a process-wide table keyed by name.

use crate::cache_map::CachingMap;
use crate::error::{Error, Result};
use crate::platform;
use crate::thread_local::ThreadLocal;
use core::alloc::Layout;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU64, Ordering};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use std::alloc;
use std::sync::Arc;
use tracing::{debug, info};

/// Bytes reserved in front of every block to remember its size.
/// Kept at 16 so user pointers stay 16-aligned.
const HEADER_SIZE: usize = 16;
const BLOCK_ALIGN: usize = 16;

/// Name of the allocator returned by [`global_allocator`].
pub const GLOBAL_ALLOCATOR_NAME: &str = "rtkit.global";

// =============================================================================
// Size-prefixed blocks
// =============================================================================

#[inline]
fn block_layout(size: usize) -> Option<Layout> {
    let total = size.checked_add(HEADER_SIZE)?;
    Layout::from_size_align(total, BLOCK_ALIGN).ok()
}

/// Allocate `size` usable bytes behind a size header.
fn raw_allocate(size: usize, zeroed: bool) -> Result<NonNull<u8>> {
    let layout = block_layout(size).ok_or(Error::AllocationFailure { size })?;
    let base = unsafe {
        if zeroed {
            alloc::alloc_zeroed(layout)
        } else {
            alloc::alloc(layout)
        }
    };
    if base.is_null() {
        return Err(Error::AllocationFailure { size });
    }
    unsafe {
        base.cast::<usize>().write(size);
        Ok(NonNull::new_unchecked(base.add(HEADER_SIZE)))
    }
}

/// Size recorded for a block returned by [`raw_allocate`].
///
/// # Safety
/// `ptr` must come from `raw_allocate`/`raw_reallocate` and not be freed.
#[inline]
unsafe fn raw_size(ptr: NonNull<u8>) -> usize {
    unsafe { ptr.as_ptr().sub(HEADER_SIZE).cast::<usize>().read() }
}

/// Free a block and return its size.
///
/// # Safety
/// Same as [`raw_size`].
unsafe fn raw_free(ptr: NonNull<u8>) -> usize {
    unsafe {
        let size = raw_size(ptr);
        let base = ptr.as_ptr().sub(HEADER_SIZE);
        alloc::dealloc(base, Layout::from_size_align_unchecked(size + HEADER_SIZE, BLOCK_ALIGN));
        size
    }
}

/// Resize a block, returning the new pointer and the old size.
///
/// # Safety
/// Same as [`raw_size`]. On error the old block is untouched.
unsafe fn raw_reallocate(ptr: NonNull<u8>, new_size: usize) -> Result<(NonNull<u8>, usize)> {
    let new_layout = block_layout(new_size).ok_or(Error::AllocationFailure { size: new_size })?;
    unsafe {
        let old_size = raw_size(ptr);
        let base = ptr.as_ptr().sub(HEADER_SIZE);
        let old_layout = Layout::from_size_align_unchecked(old_size + HEADER_SIZE, BLOCK_ALIGN);
        let new_base = alloc::realloc(base, old_layout, new_layout.size());
        if new_base.is_null() {
            return Err(Error::AllocationFailure { size: new_size });
        }
        new_base.cast::<usize>().write(new_size);
        Ok((NonNull::new_unchecked(new_base.add(HEADER_SIZE)), old_size))
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Allocation counters for one thread (or, for [`system_stats`], the process).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct AllocateStats {
    /// OS thread id of the thread the record belongs to; 0 for process totals.
    pub thread_id: u64,
    /// Total bytes handed out.
    pub allocated_size: u64,
    /// Number of blocks handed out.
    pub allocated_count: u64,
    /// Total bytes returned.
    pub freed_size: u64,
    /// Number of blocks returned.
    pub freed_count: u64,
}

impl AllocateStats {
    const ZERO: Self = Self {
        thread_id: 0,
        allocated_size: 0,
        allocated_count: 0,
        freed_size: 0,
        freed_count: 0,
    };

    /// Bytes allocated and not yet freed.
    pub fn outstanding_size(&self) -> u64 {
        self.allocated_size.saturating_sub(self.freed_size)
    }

    fn record_alloc(&mut self, size: usize) {
        self.allocated_size += size as u64;
        self.allocated_count += 1;
    }

    fn record_free(&mut self, size: usize) {
        self.freed_size += size as u64;
        self.freed_count += 1;
    }
}

/// Per-thread counters. Written only by the owning thread; read by
/// enumerating threads, so the fields are relaxed atomics.
#[derive(Debug)]
struct ThreadStats {
    thread_id: u64,
    allocated_size: AtomicU64,
    allocated_count: AtomicU64,
    freed_size: AtomicU64,
    freed_count: AtomicU64,
}

impl ThreadStats {
    fn for_current_thread() -> Self {
        Self {
            thread_id: platform::current_thread_id(),
            allocated_size: AtomicU64::new(0),
            allocated_count: AtomicU64::new(0),
            freed_size: AtomicU64::new(0),
            freed_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record_alloc(&self, size: usize) {
        self.allocated_size.fetch_add(size as u64, Ordering::Relaxed);
        self.allocated_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_free(&self, size: usize) {
        self.freed_size.fetch_add(size as u64, Ordering::Relaxed);
        self.freed_count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> AllocateStats {
        AllocateStats {
            thread_id: self.thread_id,
            allocated_size: self.allocated_size.load(Ordering::Relaxed),
            allocated_count: self.allocated_count.load(Ordering::Relaxed),
            freed_size: self.freed_size.load(Ordering::Relaxed),
            freed_count: self.freed_count.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// System byte allocator
// =============================================================================

static SYSTEM_STATS: Mutex<AllocateStats> = parking_lot::const_mutex(AllocateStats::ZERO);

/// Allocate `size` bytes from the system allocator.
pub fn system_allocate(size: usize) -> Result<NonNull<u8>> {
    let ptr = raw_allocate(size, false)?;
    SYSTEM_STATS.lock().record_alloc(size);
    Ok(ptr)
}

/// Allocate `size` zeroed bytes from the system allocator.
pub fn system_allocate_zeroed(size: usize) -> Result<NonNull<u8>> {
    let ptr = raw_allocate(size, true)?;
    SYSTEM_STATS.lock().record_alloc(size);
    Ok(ptr)
}

/// Return a block to the system allocator.
///
/// # Safety
/// `ptr` must come from [`system_allocate`] or [`system_allocate_zeroed`]
/// and must not have been freed already.
pub unsafe fn system_free(ptr: NonNull<u8>) {
    let size = unsafe { raw_free(ptr) };
    SYSTEM_STATS.lock().record_free(size);
}

/// Process-wide counters of the system byte allocator.
pub fn system_stats() -> AllocateStats {
    *SYSTEM_STATS.lock()
}

// =============================================================================
// TrackedAllocator
// =============================================================================

/// A named byte allocator that counts allocations per thread.
///
/// Each thread that allocates or frees through the allocator gets its own
/// stats record, created on first use and stamped with the OS thread id.
/// Records of exited threads stay visible until the allocator is dropped.
pub struct TrackedAllocator {
    name: String,
    /// Cap on outstanding bytes; 0 means unlimited.
    max_size: u64,
    in_use: AtomicU64,
    stats: ThreadLocal<ThreadStats>,
}

impl TrackedAllocator {
    /// Create an allocator. `max_size_mb == 0` means no limit.
    ///
    /// Fails with [`Error::Exhausted`] when the process-wide registry has no
    /// free instance id left.
    pub fn new(name: &str, max_size_mb: u64) -> Result<Self> {
        let stats = ThreadLocal::with_create(|| Ok(ThreadStats::for_current_thread()))?;
        Ok(Self {
            name: name.to_owned(),
            max_size: max_size_mb.saturating_mul(1024 * 1024),
            in_use: AtomicU64::new(0),
            stats,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Byte limit on outstanding allocations, 0 for unlimited.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes currently allocated and not freed.
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Relaxed)
    }

    fn reserve(&self, size: usize) -> Result<()> {
        let size64 = size as u64;
        // Only commit when the new total fits, so a failed request never
        // inflates `in_use` for a concurrent one.
        self.in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                let total = used.checked_add(size64)?;
                (self.max_size == 0 || total <= self.max_size).then_some(total)
            })
            .map(|_| ())
            .map_err(|_| {
                debug!(target: "rtkit::allocator", allocator = %self.name, size, "allocation over limit");
                Error::AllocationFailure { size }
            })
    }

    #[inline]
    fn unreserve(&self, size: usize) {
        self.in_use.fetch_sub(size as u64, Ordering::Relaxed);
    }

    /// Allocate `size` bytes, aligned to 16.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.reserve(size)?;
        let ptr = match raw_allocate(size, false) {
            Ok(ptr) => ptr,
            Err(e) => {
                self.unreserve(size);
                return Err(e);
            }
        };
        if let Ok(stats) = self.stats.get() {
            stats.record_alloc(size);
        }
        Ok(ptr)
    }

    /// Free a block returned by this allocator.
    ///
    /// # Safety
    /// `ptr` must be null or a live block from this allocator's
    /// `allocate`/`reallocate`.
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<()> {
        let ptr = NonNull::new(ptr).ok_or(Error::InvalidArgument("null pointer"))?;
        let size = unsafe { raw_free(ptr) };
        self.unreserve(size);
        if let Ok(stats) = self.stats.get() {
            stats.record_free(size);
        }
        Ok(())
    }

    /// Resize a block. A null `ptr` behaves like [`allocate`](Self::allocate).
    /// Counted as one free of the old size plus one allocation of the new.
    ///
    /// # Safety
    /// Same as [`free`](Self::free). On error the old block stays valid.
    pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>> {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(size);
        };
        let old_size = unsafe { raw_size(old) };
        if size > old_size {
            self.reserve(size - old_size)?;
        }
        let (new_ptr, old_size) = match unsafe { raw_reallocate(old, size) } {
            Ok(r) => r,
            Err(e) => {
                if size > old_size {
                    self.unreserve(size - old_size);
                }
                return Err(e);
            }
        };
        if size < old_size {
            self.unreserve(old_size - size);
        }
        if let Ok(stats) = self.stats.get() {
            stats.record_free(old_size);
            stats.record_alloc(size);
        }
        Ok(new_ptr)
    }

    /// Move `value` into a block from this allocator.
    pub fn new_object<T>(&self, value: T) -> Result<NonNull<T>> {
        if core::mem::align_of::<T>() > BLOCK_ALIGN {
            return Err(Error::InvalidArgument("type alignment exceeds 16"));
        }
        let ptr = self.allocate(core::mem::size_of::<T>())?.cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Drop an object created by [`new_object`](Self::new_object) and free its block.
    ///
    /// # Safety
    /// `ptr` must come from `new_object::<T>` on this allocator and not be
    /// deleted twice.
    pub unsafe fn delete_object<T>(&self, ptr: NonNull<T>) -> Result<()> {
        unsafe {
            ptr::drop_in_place(ptr.as_ptr());
            self.free(ptr.as_ptr().cast())
        }
    }

    /// Snapshot of every thread's counters.
    pub fn allocate_stats(&self) -> Result<Vec<AllocateStats>> {
        let mut out = Vec::new();
        self.stats.for_each(|stats| {
            out.push(stats.snapshot());
            Ok(())
        })?;
        Ok(out)
    }

    /// Fill `buf` with per-thread snapshots and return how many were written.
    /// Threads beyond `buf.len()` are skipped.
    pub fn allocate_stats_into(&self, buf: &mut [AllocateStats]) -> Result<usize> {
        let mut written = 0;
        self.stats.for_each(|stats| {
            if let Some(slot) = buf.get_mut(written) {
                *slot = stats.snapshot();
                written += 1;
            }
            Ok(())
        })?;
        Ok(written)
    }

    /// Sum of all threads' counters (`thread_id` is 0).
    pub fn total_stats(&self) -> Result<AllocateStats> {
        let mut total = AllocateStats::ZERO;
        self.stats.for_each(|stats| {
            let s = stats.snapshot();
            total.allocated_size += s.allocated_size;
            total.allocated_count += s.allocated_count;
            total.freed_size += s.freed_size;
            total.freed_count += s.freed_count;
            Ok(())
        })?;
        Ok(total)
    }
}

impl core::fmt::Debug for TrackedAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrackedAllocator")
            .field("name", &self.name)
            .field("max_size", &self.max_size)
            .field("in_use", &self.in_use())
            .finish()
    }
}

// =============================================================================
// Named allocator table
// =============================================================================

static ALLOCATORS: Lazy<Mutex<CachingMap<String, Arc<TrackedAllocator>, 16>>> =
    Lazy::new(|| Mutex::new(CachingMap::new()));

static GLOBAL: OnceCell<TrackedAllocator> = OnceCell::new();

/// Create and register a named allocator.
///
/// Fails with [`Error::AlreadyPresent`] if the name is taken.
pub fn create_allocator(name: &str, max_size_mb: u64) -> Result<Arc<TrackedAllocator>> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty allocator name"));
    }
    let mut table = ALLOCATORS.lock();
    if table.contains(name) {
        return Err(Error::AlreadyPresent);
    }
    let allocator = Arc::new(TrackedAllocator::new(name, max_size_mb)?);
    table.insert(name.to_owned(), Arc::clone(&allocator))?;
    info!(target: "rtkit::allocator", name, max_size_mb, "allocator created");
    Ok(allocator)
}

/// Look up a registered allocator by name.
pub fn find_allocator(name: &str) -> Option<Arc<TrackedAllocator>> {
    ALLOCATORS.lock().find(name).cloned()
}

/// Unregister an allocator. Its stats are torn down once the last `Arc`
/// is dropped.
///
/// Fails with [`Error::InvalidArgument`] if `allocator` is not the one
/// registered under its name.
pub fn destroy_allocator(allocator: &Arc<TrackedAllocator>) -> Result<()> {
    let mut table = ALLOCATORS.lock();
    match table.find(allocator.name()) {
        Some(registered) if Arc::ptr_eq(registered, allocator) => {}
        _ => return Err(Error::InvalidArgument("allocator is not registered")),
    }
    table.erase(allocator.name());
    info!(target: "rtkit::allocator", name = allocator.name(), "allocator destroyed");
    Ok(())
}

/// The process-wide default allocator, created on first use.
pub fn global_allocator() -> Result<&'static TrackedAllocator> {
    GLOBAL.get_or_try_init(|| TrackedAllocator::new(GLOBAL_ALLOCATOR_NAME, 0))
}
