//! Per-process memoization of probed capability snapshots.
//!
//! The capability set itself carries no cache; this is the external
//! memoization layer that callers key by helper path. An entry is reused
//! for the lifetime of the process unless the binary's modification time
//! changes, in which case the next lookup re-probes. A path whose mtime
//! cannot be read (e.g., a bare command name resolved via PATH) is treated
//! as always stale: without a visible binary identity, every lookup
//! re-probes. Nothing is persisted across restarts.

use crate::probe::{Invoke, ProbeError, Prober};
use crate::set::HelperCaps;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{debug, trace};

struct CacheEntry {
    caps: Arc<HelperCaps>,
    /// Binary mtime observed just before the probe ran.
    modified: Option<SystemTime>,
}

/// In-memory cache of capability snapshots keyed by helper path.
#[derive(Default)]
pub struct CapsCache {
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl CapsCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached snapshot for `path`, probing (or re-probing when
    /// the binary changed on disk) as needed.
    ///
    /// Probe failures are returned and never cached, so a later lookup
    /// retries.
    pub fn lookup<I: Invoke>(
        &self,
        path: &Path,
        prober: &Prober<I>,
    ) -> Result<Arc<HelperCaps>, ProbeError> {
        let modified = binary_mtime(path);

        {
            let entries = self.lock();
            if let Some(entry) = entries.get(path) {
                // An unreadable mtime gives no binary identity to compare,
                // so such entries never hit.
                if modified.is_some() && entry.modified == modified {
                    trace!(helper = %path.display(), "capability cache hit");
                    return Ok(Arc::clone(&entry.caps));
                }
                debug!(
                    helper = %path.display(),
                    "helper changed on disk or mtime unreadable, re-probing"
                );
            }
        }

        // Probe outside the lock; concurrent lookups of the same path may
        // race to probe, and the last writer wins. Both observe the same
        // binary, so either snapshot is valid.
        let caps = prober.probe(path)?;

        self.lock().insert(
            path.to_path_buf(),
            CacheEntry {
                caps: Arc::clone(&caps),
                modified,
            },
        );

        Ok(caps)
    }

    /// Drop the entry for `path`, forcing the next lookup to re-probe.
    pub fn invalidate(&self, path: &Path) {
        self.lock().remove(path);
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of cached snapshots.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache holds no snapshots.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, CacheEntry>> {
        // A panicked probe cannot leave an entry half-written, so a
        // poisoned lock is safe to recover.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn binary_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{CapFlag, Listing};
    use crate::probe::InvokeFailure;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts invocations; optionally fails the first probe.
    struct CountingInvoker {
        calls: AtomicUsize,
        fail_first_probe: bool,
    }

    impl CountingInvoker {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first_probe: false,
            }
        }

        fn failing_once() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first_probe: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Invoke for CountingInvoker {
        fn invoke(&self, _path: &Path, args: &[&str]) -> Result<String, InvokeFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);

            // A failing probe aborts on its first invocation, so failing
            // call 0 fails exactly the first probe.
            if self.fail_first_probe && call == 0 {
                return Err(InvokeFailure::CouldNotRun("not executable".to_string()));
            }

            if args == Listing::Plugins.args() {
                Ok("curl\n".to_string())
            } else if args == Listing::Filters.args() {
                Ok("readahead\n".to_string())
            } else {
                Ok("helper 1.0.0\n".to_string())
            }
        }
    }

    /// A real on-disk file, so lookups see a readable, stable mtime.
    fn helper_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("helper");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        path
    }

    #[test]
    fn test_lookup_memoizes_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = helper_file(&dir);
        let cache = CapsCache::new();
        let prober = Prober::new(CountingInvoker::new());

        let first = cache.lookup(&path, &prober).unwrap();
        let second = cache.lookup(&path, &prober).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        // Three invocations for the single probe, none for the hit.
        assert_eq!(prober_calls(&prober), 3);
    }

    #[test]
    fn test_invalidate_forces_reprobe() {
        let dir = tempfile::tempdir().unwrap();
        let path = helper_file(&dir);
        let cache = CapsCache::new();
        let prober = Prober::new(CountingInvoker::new());

        let first = cache.lookup(&path, &prober).unwrap();
        cache.invalidate(&path);
        let second = cache.lookup(&path, &prober).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.caps, second.caps);
        assert_eq!(prober_calls(&prober), 6);
    }

    #[test]
    fn test_failed_probe_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = helper_file(&dir);
        let cache = CapsCache::new();
        let prober = Prober::new(CountingInvoker::failing_once());

        assert!(matches!(
            cache.lookup(&path, &prober),
            Err(ProbeError::Invocation { .. })
        ));
        assert!(cache.is_empty());

        // Retry succeeds and is cached: the failed probe spent one
        // invocation, the successful one three.
        let caps = cache.lookup(&path, &prober).unwrap();
        assert!(caps.get(CapFlag::PluginCurl));
        assert_eq!(cache.len(), 1);
        assert_eq!(prober_calls(&prober), 4);

        // And the retry's snapshot hits from now on.
        let again = cache.lookup(&path, &prober).unwrap();
        assert!(Arc::ptr_eq(&caps, &again));
        assert_eq!(prober_calls(&prober), 4);
    }

    #[test]
    fn test_unreadable_mtime_is_always_stale() {
        // A bare command name has no metadata to key on; every lookup
        // must re-probe rather than trust a stale entry.
        let cache = CapsCache::new();
        let prober = Prober::new(CountingInvoker::new());
        let path = Path::new("helper-on-path");

        let first = cache.lookup(path, &prober).unwrap();
        let second = cache.lookup(path, &prober).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.caps, second.caps);
        assert_eq!(prober_calls(&prober), 6);
    }

    #[test]
    fn test_mtime_change_forces_reprobe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helper");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();

        let cache = CapsCache::new();
        let prober = Prober::new(CountingInvoker::new());

        let first = cache.lookup(&path, &prober).unwrap();

        // Shift the binary's mtime well away from the recorded one.
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1000))
            .unwrap();
        drop(file);

        let second = cache.lookup(&path, &prober).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(prober_calls(&prober), 6);

        // Unchanged after the re-probe: hit again.
        let third = cache.lookup(&path, &prober).unwrap();
        assert!(Arc::ptr_eq(&second, &third));
        assert_eq!(prober_calls(&prober), 6);
    }

    #[test]
    fn test_clear() {
        let cache = CapsCache::new();
        let prober = Prober::new(CountingInvoker::new());

        cache.lookup(Path::new("/a/helper"), &prober).unwrap();
        cache.lookup(Path::new("/b/helper"), &prober).unwrap();
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }

    fn prober_calls(prober: &Prober<CountingInvoker>) -> usize {
        prober.invoker().calls()
    }
}
