//! rtkit: dynamic thread-local storage and small runtime utilities.
//!
//! Components:
//! - [`ThreadLocal`]: runtime-created thread-local slots with per-thread
//!   values, cross-thread enumeration and create/destroy hooks
//! - [`InstanceRegistry`]: instance id allocation and per-thread arrays
//! - [`BitAllocator`]: fixed-capacity bitmap for id allocation
//! - [`CachingMap`]: hash map fronted by a direct-mapped lookup cache
//! - [`TrackedAllocator`]: named allocators with per-thread statistics
//!
//! # Usage
//!
//! ```ignore
//! rtkit::init(&rtkit::RuntimeConfig::from_env())?;
//!
//! let hits = rtkit::ThreadLocal::<std::cell::Cell<u64>>::new()?;
//! hits.get()?.set(hits.get()?.get() + 1);
//! ```

pub mod allocator;
pub mod bitset;
pub mod cache_map;
pub mod config;
pub mod error;
pub mod logging;
pub mod platform;
pub mod registry;
pub mod thread_local;

#[cfg(feature = "ffi")]
pub mod ffi;

pub use allocator::{AllocateStats, TrackedAllocator};
pub use bitset::BitAllocator;
pub use cache_map::CachingMap;
pub use config::{LogLevel, RuntimeConfig};
pub use error::{Error, Result};
pub use registry::{InstanceRegistry, ThreadArray};
pub use thread_local::ThreadLocal;

/// Validate `config`, install logging and create the process-wide registry.
///
/// Must run before anything touches the global registry; otherwise it fails
/// with [`Error::AlreadyInitialized`] and the existing registry is kept.
pub fn init(config: &RuntimeConfig) -> Result<()> {
    config.validate()?;
    logging::init_logging(config.log_level);
    let registry = registry::install_global(config.max_instances)?;
    tracing::info!(target: "rtkit::registry", capacity = registry.capacity(), "rtkit initialized");
    Ok(())
}
