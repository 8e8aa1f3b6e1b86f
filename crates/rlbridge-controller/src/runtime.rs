//! Process-wide model cache.
//!
//! Loaded models are expensive and often shared by several bridges in one
//! process. [`ModelCache`] initialises each key at most once, hands out
//! shared handles, and releases everything on [`ModelCache::teardown`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

/// Keyed, lazily initialised store of shared values.
///
/// Usable as a `static`:
///
/// ```
/// use rlbridge_controller::runtime::ModelCache;
///
/// static CACHE: ModelCache<String> = ModelCache::new();
///
/// let a = CACHE.get_or_try_init("k", || Ok::<_, ()>("model".to_string())).unwrap();
/// let b = CACHE.get_or_try_init("k", || Err(())).unwrap();
/// assert_eq!(a, b);
/// CACHE.teardown();
/// ```
#[derive(Debug)]
pub struct ModelCache<T> {
    entries: Mutex<Vec<(String, Arc<T>)>>,
}

impl<T> ModelCache<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// The value for `key`, running `init` if none is cached yet.
    ///
    /// `init` runs under the cache lock, so concurrent callers for the same
    /// key never initialise twice. A failed `init` caches nothing.
    pub fn get_or_try_init<E>(
        &self,
        key: &str,
        init: impl FnOnce() -> Result<T, E>,
    ) -> Result<Arc<T>, E> {
        let mut entries = self.lock();
        if let Some((_, value)) = entries.iter().find(|(k, _)| k == key) {
            debug!(key, "model cache hit");
            return Ok(Arc::clone(value));
        }
        let value = Arc::new(init()?);
        entries.push((key.to_string(), Arc::clone(&value)));
        info!(key, "model cached");
        Ok(value)
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| Arc::clone(v))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop the entry for `key`. Outstanding handles stay valid.
    pub fn remove(&self, key: &str) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(k, _)| k != key);
        entries.len() != before
    }

    /// Drop every entry. Returns how many were released.
    pub fn teardown(&self) -> usize {
        let released = std::mem::take(&mut *self.lock()).len();
        if released > 0 {
            info!(released, "model cache torn down");
        }
        released
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, Arc<T>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for ModelCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn initialises_once_per_key() {
        let cache = ModelCache::new();
        let calls = AtomicUsize::new(0);
        let init = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(7_u32)
        };
        let a = cache.get_or_try_init("m", init).unwrap();
        let b = cache.get_or_try_init("m", init).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.get_or_try_init("other", init).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn failed_init_is_not_cached() {
        let cache: ModelCache<u32> = ModelCache::new();
        assert_eq!(cache.get_or_try_init("m", || Err("boom")), Err("boom"));
        assert!(!cache.contains("m"));
        assert_eq!(*cache.get_or_try_init("m", || Ok::<_, ()>(1)).unwrap(), 1);
    }

    #[test]
    fn teardown_releases_entries_but_not_handles() {
        let cache = ModelCache::new();
        let handle = cache.get_or_try_init("m", || Ok::<_, ()>(vec![1.0_f32])).unwrap();
        assert_eq!(cache.teardown(), 1);
        assert!(cache.is_empty());
        assert!(cache.get("m").is_none());
        assert_eq!(handle[0], 1.0);
        assert_eq!(cache.teardown(), 0);
    }

    #[test]
    fn remove_single_entry() {
        let cache = ModelCache::new();
        cache.get_or_try_init("a", || Ok::<_, ()>(1)).unwrap();
        cache.get_or_try_init("b", || Ok::<_, ()>(2)).unwrap();
        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert_eq!(cache.get("b").map(|v| *v), Some(2));
    }

    #[test]
    fn concurrent_callers_share_one_value() {
        static CACHE: ModelCache<usize> = ModelCache::new();
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    CACHE
                        .get_or_try_init("shared", || {
                            Ok::<_, ()>(CALLS.fetch_add(1, Ordering::SeqCst))
                        })
                        .unwrap()
                })
            })
            .collect();
        let values: Vec<_> = handles.into_iter().map(|h| *h.join().unwrap()).collect();
        assert!(values.iter().all(|v| *v == values[0]));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        CACHE.teardown();
    }
}
