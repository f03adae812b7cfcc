//! C-ABI exports of the system byte allocator.
//!
//! Gated behind `features = ["ffi"]`. Blocks carry their own size header, so
//! `rtkit_free` needs only the pointer.

use crate::allocator::{self, AllocateStats};
use core::ptr::{self, NonNull};

/// Allocate `size` bytes. Returns null on failure.
#[unsafe(export_name = "rtkit_allocate")]
pub extern "C" fn rtkit_allocate(size: usize) -> *mut u8 {
    allocator::system_allocate(size).map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Free a block from `rtkit_allocate`. Null is ignored.
///
/// # Safety
/// `ptr` must be null or a live block from `rtkit_allocate`.
#[unsafe(export_name = "rtkit_free")]
pub unsafe extern "C" fn rtkit_free(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        unsafe { allocator::system_free(ptr) }
    }
}

/// Copy the process-wide counters into `out`. Returns 0, or -1 if `out` is
/// null.
///
/// # Safety
/// `out` must be null or valid for one `AllocateStats` write.
#[unsafe(export_name = "rtkit_get_allocate_stats")]
pub unsafe extern "C" fn rtkit_get_allocate_stats(out: *mut AllocateStats) -> i32 {
    if out.is_null() {
        return -1;
    }
    unsafe { out.write(allocator::system_stats()) };
    0
}
