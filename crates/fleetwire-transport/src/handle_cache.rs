// Copyright 2025 Fleetwire Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cache of reusable connection handles with a bounded lifetime.
//!
//! # Architecture
//!
//! - Handles are grouped by key (the transport uses the node id)
//! - Each key owns one entry with its own mutex, so unrelated keys never contend
//! - Each handle gets an expiry timer when it is created; the timer retires the
//!   handle and then clears the entry if it still holds that same handle
//! - A key whose entry holds no handle is dropped from the index, so keys of
//!   departed nodes do not accumulate
//! - Retirement is a compare-and-set on the handle, so an explicit
//!   [`HandleCache::expire`] racing the timer retires it exactly once
//!
//! A retired or expired handle is never returned by [`HandleCache::acquire`];
//! the next acquire for the key creates a fresh one.
//!
//! # Example
//!
//! ```
//! use fleetwire_transport::HandleCache;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let cache: HandleCache<String, String> = HandleCache::new(
//!     Duration::from_secs(300),
//!     Arc::new(|key: &String| -> fleetwire_common::Result<String> {
//!         Ok(format!("channel to {}", key))
//!     }),
//! );
//!
//! let first = cache.acquire(&"http://a:9200".to_string()).unwrap();
//! let again = cache.acquire(&"http://a:9200".to_string()).unwrap();
//! assert_eq!(first.generation(), again.generation());
//! ```

use dashmap::DashMap;
use fleetwire_common::protocol::error::Result;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

/// Creates the handle for a key. Must not perform I/O.
pub type HandleFactory<K, H> = Arc<dyn Fn(&K) -> Result<H> + Send + Sync>;

/// Called exactly once per handle when it is retired.
pub type RetireHook<K, H> = Arc<dyn Fn(&K, &H) + Send + Sync>;

/// A handle owned by the cache.
pub struct CachedHandle<K, H> {
    key: K,
    generation: u64,
    created_at: Instant,
    expires_at: Instant,
    retired: AtomicBool,
    inner: H,
    on_retire: Option<RetireHook<K, H>>,
}

impl<K: fmt::Debug, H> CachedHandle<K, H> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Unique per handle within one cache; a replacement always differs.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Retires the handle. Returns `true` only for the call that did it.
    fn retire(&self) -> bool {
        if self
            .retired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        debug!(key = ?self.key, generation = self.generation, "Retired connection handle");
        if let Some(hook) = &self.on_retire {
            hook(&self.key, &self.inner);
        }
        true
    }
}

impl<K, H> Deref for CachedHandle<K, H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.inner
    }
}

struct Slot<K, H> {
    handle: Arc<CachedHandle<K, H>>,
    timer: Option<AbortHandle>,
}

impl<K: fmt::Debug, H> Slot<K, H> {
    fn retire(self) -> bool {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        self.handle.retire()
    }
}

struct EntryState<K, H> {
    slot: Option<Slot<K, H>>,
    /// Dropped from the index; acquirers must look the key up again
    removed: bool,
}

struct CacheEntry<K, H> {
    state: Mutex<EntryState<K, H>>,
}

impl<K, H> CacheEntry<K, H> {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState {
                slot: None,
                removed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EntryState<K, H>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type Index<K, H> = DashMap<K, Arc<CacheEntry<K, H>>>;

/// Drops `key` from the index if its entry holds no handle.
fn unlink<K: Eq + Hash, H>(entries: &Index<K, H>, key: &K) {
    entries.remove_if(key, |_, entry| {
        let mut state = entry.lock();
        if state.slot.is_some() {
            return false;
        }
        state.removed = true;
        true
    });
}

/// Keyed cache of time-bounded handles.
pub struct HandleCache<K, H> {
    entries: Arc<Index<K, H>>,
    factory: HandleFactory<K, H>,
    on_retire: Option<RetireHook<K, H>>,
    lifetime: Duration,
    next_generation: AtomicU64,
}

impl<K, H> HandleCache<K, H>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    H: Send + Sync + 'static,
{
    /// Creates a cache whose handles live at most `lifetime`.
    pub fn new(lifetime: Duration, factory: HandleFactory<K, H>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            factory,
            on_retire: None,
            lifetime,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Registers a hook run once for every retired handle.
    pub fn with_retire_hook(mut self, hook: RetireHook<K, H>) -> Self {
        self.on_retire = Some(hook);
        self
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Returns the live handle for `key`, creating one if needed.
    ///
    /// Creation and timer arming happen under the key's own lock. When no
    /// tokio runtime is available no timer is armed and expiry is enforced
    /// here, on the next acquire.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error; the entry is left empty.
    pub fn acquire(&self, key: &K) -> Result<Arc<CachedHandle<K, H>>> {
        loop {
            let entry = Arc::clone(
                self.entries
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(CacheEntry::new()))
                    .value(),
            );

            let (handle, stale) = {
                let mut state = entry.lock();
                if state.removed {
                    continue;
                }

                if let Some(current) = state.slot.as_ref() {
                    if !current.handle.is_retired() && !current.handle.is_expired_at(Instant::now()) {
                        return Ok(Arc::clone(&current.handle));
                    }
                }
                let stale = state.slot.take();

                let inner = match (self.factory)(key) {
                    Ok(inner) => inner,
                    Err(e) => {
                        drop(state);
                        if let Some(stale) = stale {
                            stale.retire();
                        }
                        unlink(&self.entries, key);
                        return Err(e);
                    }
                };
                let created_at = Instant::now();
                let handle = Arc::new(CachedHandle {
                    key: key.clone(),
                    generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                    created_at,
                    expires_at: created_at + self.lifetime,
                    retired: AtomicBool::new(false),
                    inner,
                    on_retire: self.on_retire.clone(),
                });
                let timer = arm_expiry_timer(&self.entries, &entry, &handle);
                debug!(key = ?key, generation = handle.generation, "Created connection handle");

                state.slot = Some(Slot {
                    handle: Arc::clone(&handle),
                    timer,
                });
                (handle, stale)
            };

            if let Some(stale) = stale {
                stale.retire();
            }
            return Ok(handle);
        }
    }

    /// Evicts the handle for `key`, if any.
    ///
    /// Returns `true` if this call retired a handle; `false` when there was
    /// none or its timer got there first.
    pub fn expire(&self, key: &K) -> bool {
        let Some(entry) = self.entries.get(key).map(|e| Arc::clone(e.value())) else {
            return false;
        };

        let stale = entry.lock().slot.take();
        unlink(&self.entries, key);
        stale.map(Slot::retire).unwrap_or(false)
    }

    /// Evicts every handle. Returns how many were retired by this call.
    pub fn expire_all(&self) -> usize {
        let keys: Vec<K> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter(|key| self.expire(key)).count()
    }

    /// Number of keys currently holding a live handle.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| {
                e.value()
                    .lock()
                    .slot
                    .as_ref()
                    .is_some_and(|s| !s.handle.is_retired() && !s.handle.is_expired_at(now))
            })
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn arm_expiry_timer<K, H>(
    entries: &Arc<Index<K, H>>,
    entry: &Arc<CacheEntry<K, H>>,
    handle: &Arc<CachedHandle<K, H>>,
) -> Option<AbortHandle>
where
    K: Eq + Hash + fmt::Debug + Send + Sync + 'static,
    H: Send + Sync + 'static,
{
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let entries: Weak<Index<K, H>> = Arc::downgrade(entries);
    let entry: Weak<CacheEntry<K, H>> = Arc::downgrade(entry);
    let target: Weak<CachedHandle<K, H>> = Arc::downgrade(handle);
    let expires_at = handle.expires_at;

    let task = runtime.spawn(async move {
        tokio::time::sleep_until(expires_at).await;

        let Some(handle) = target.upgrade() else {
            return;
        };
        handle.retire();

        let Some(entry) = entry.upgrade() else {
            return;
        };
        let cleared = {
            let mut state = entry.lock();
            let same = state
                .slot
                .as_ref()
                .is_some_and(|s| s.handle.generation == handle.generation);
            if same {
                state.slot = None;
            }
            same
        };
        if !cleared {
            return;
        }
        if let Some(entries) = entries.upgrade() {
            unlink(&entries, &handle.key);
        }
    });
    Some(task.abort_handle())
}
