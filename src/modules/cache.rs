//! BP-011: Cached metadata lookups.
//!
//! Several modules commonly share one source, so lookups are cached per
//! `(source, kind)`. Distinct keys are independent and are prefetched on
//! scoped worker threads, at most one batch of `available_parallelism`
//! threads at a time.

use super::{MetadataProvider, ModuleError, ModuleInfo};
use crate::core::types::ModuleKind;
use rustc_hash::FxHashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

type CacheKey = (String, ModuleKind);

/// Wraps another provider with a `(source, kind)` cache.
pub struct CachedProvider<P> {
    inner: P,
    cache: Mutex<FxHashMap<CacheKey, ModuleInfo>>,
}

impl<P: MetadataProvider> CachedProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Number of cached entries.
    pub fn cached(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<CacheKey, ModuleInfo>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, source: &str, kind: &ModuleKind) -> Option<ModuleInfo> {
        self.lock().get(&(source.to_string(), kind.clone())).cloned()
    }
}

impl<P: MetadataProvider> MetadataProvider for CachedProvider<P> {
    fn module_info(&self, source: &str, kind: &ModuleKind) -> Result<ModuleInfo, ModuleError> {
        if let Some(info) = self.lookup(source, kind) {
            return Ok(info);
        }
        let info = self.inner.module_info(source, kind)?;
        self.lock()
            .insert((source.to_string(), kind.clone()), info.clone());
        Ok(info)
    }

    fn prefetch(&self, keys: &[(String, ModuleKind)]) {
        let missing: Vec<&CacheKey> = {
            let cache = self.lock();
            let mut seen = Vec::new();
            for key in keys {
                if !cache.contains_key(key) && !seen.contains(&key) {
                    seen.push(key);
                }
            }
            seen
        };
        if missing.len() < 2 {
            return;
        }
        let workers = prefetch_workers();
        debug!(count = missing.len(), workers, "prefetching module metadata");
        for batch in missing.chunks(workers) {
            std::thread::scope(|scope| {
                for key in batch.iter().copied() {
                    let (source, kind) = key;
                    scope.spawn(move || {
                        // Errors are reported by the later `module_info` call.
                        let _ = self.module_info(source, kind);
                    });
                }
            });
        }
    }
}

/// Threads per prefetch batch.
fn prefetch_workers() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
}
