//! Process-wide memoization of symbolization results.
//!
//! Single-flight: the first lookup of a key claims it and runs the backend
//! query; concurrent lookups of the same key subscribe to that query instead
//! of launching their own. Lookups of different keys proceed in parallel.
//! Only successful resolutions are stored, so the cache is monotonic: once a
//! key resolves, every later lookup returns the same value. A failed query
//! is forgotten and a later lookup may retry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::error::SymbolizeError;
use crate::shared::types::SymbolisedStackFrame;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: PathBuf,
    pub file_virtual_address: u64,
}

impl CacheKey {
    pub fn new(path: &Path, file_virtual_address: u64) -> Self {
        CacheKey {
            path: path.to_path_buf(),
            file_virtual_address,
        }
    }
}

struct InFlightQuery {
    result: Mutex<Option<Result<SymbolisedStackFrame, SymbolizeError>>>,
    ready: Condvar,
}

enum Slot {
    InFlight(Arc<InFlightQuery>),
    Ready(SymbolisedStackFrame),
}

#[derive(Default)]
pub struct SymbolCache {
    slots: Mutex<FxHashMap<CacheKey, Slot>>,
}

impl SymbolCache {
    pub fn new() -> Self {
        SymbolCache::default()
    }

    /// Returns the cached value for `key`, or runs `resolve` to produce it.
    /// At most one `resolve` runs per key at a time; callers that lose the
    /// race receive the winner's result, including its error.
    pub fn get_or_resolve(
        &self,
        key: CacheKey,
        resolve: impl FnOnce() -> Result<SymbolisedStackFrame, SymbolizeError>,
    ) -> Result<SymbolisedStackFrame, SymbolizeError> {
        let claimed = {
            let mut slots = self.slots.lock();
            match slots.get(&key) {
                Some(Slot::Ready(value)) => return Ok(value.clone()),
                Some(Slot::InFlight(query)) => Err(query.clone()),
                None => {
                    let query = Arc::new(InFlightQuery {
                        result: Mutex::new(None),
                        ready: Condvar::new(),
                    });
                    slots.insert(key.clone(), Slot::InFlight(query.clone()));
                    Ok(query)
                }
            }
        };

        match claimed {
            Err(query) => {
                // Someone else is resolving this key; wait for their answer.
                let mut result = query.result.lock();
                while result.is_none() {
                    query.ready.wait(&mut result);
                }
                result.clone().expect("in-flight query signalled without a result")
            }
            Ok(query) => {
                let outcome = resolve();
                {
                    let mut slots = self.slots.lock();
                    match &outcome {
                        Ok(value) => {
                            slots.insert(key, Slot::Ready(value.clone()));
                        }
                        Err(_) => {
                            // Do not poison the cache; a later lookup retries.
                            slots.remove(&key);
                        }
                    }
                }
                *query.result.lock() = Some(outcome.clone());
                query.ready.notify_all();
                outcome
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    use crate::shared::types::SingleFrame;

    fn frame_named(name: &str) -> SymbolisedStackFrame {
        SymbolisedStackFrame::single(SingleFrame {
            address: 0x10,
            function_name: name.to_string(),
            function_offset: 0,
            library: None,
            vmap: None,
            source_file: None,
            source_line: None,
        })
    }

    fn key(address: u64) -> CacheKey {
        CacheKey::new(Path::new("/lib/libfoo.so"), address)
    }

    #[test]
    fn successive_lookups_return_the_same_value() {
        let cache = SymbolCache::new();
        let first = cache
            .get_or_resolve(key(0x10), || Ok(frame_named("one")))
            .unwrap();
        let second = cache
            .get_or_resolve(key(0x10), || Ok(frame_named("two")))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.frames[0].function_name, "one");
    }

    #[test]
    fn concurrent_lookups_of_one_key_query_once() {
        let cache = Arc::new(SymbolCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let mut lookups = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            lookups.push(std::thread::spawn(move || {
                barrier.wait();
                cache
                    .get_or_resolve(key(0x20), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(30));
                        Ok(frame_named("solo"))
                    })
                    .unwrap()
            }));
        }
        for lookup in lookups {
            let value = lookup.join().unwrap();
            assert_eq!(value.frames[0].function_name, "solo");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = SymbolCache::new();
        let err = cache.get_or_resolve(key(0x30), || Err(SymbolizeError::BackendTimeout(10)));
        assert!(err.is_err());
        assert!(cache.is_empty());

        let value = cache
            .get_or_resolve(key(0x30), || Ok(frame_named("retried")))
            .unwrap();
        assert_eq!(value.frames[0].function_name, "retried");
    }

    #[test]
    fn distinct_keys_resolve_independently() {
        let cache = SymbolCache::new();
        cache
            .get_or_resolve(key(0x1), || Ok(frame_named("a")))
            .unwrap();
        cache
            .get_or_resolve(key(0x2), || Ok(frame_named("b")))
            .unwrap();
        assert_eq!(cache.len(), 2);
    }
}
