//! OS queries used for diagnostic stamping.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Kernel thread id of the calling thread.
        #[inline]
        pub fn current_thread_id() -> u64 {
            // SAFETY: gettid has no preconditions.
            unsafe { libc::gettid() as u64 }
        }
    } else if #[cfg(unix)] {
        /// pthread handle of the calling thread.
        #[inline]
        pub fn current_thread_id() -> u64 {
            // SAFETY: pthread_self has no preconditions.
            unsafe { libc::pthread_self() as usize as u64 }
        }
    } else {
        /// Stable hash of the calling thread's `ThreadId`.
        pub fn current_thread_id() -> u64 {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::thread::current().id().hash(&mut hasher);
            hasher.finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_stable_and_distinct() {
        let main = current_thread_id();
        assert_eq!(main, current_thread_id());
        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(main, other);
    }
}
