// Step Cache
// Process-wide memoization of step outputs with single-flight deduplication

pub mod store;

pub use store::{CacheStoreError, DirectoryStore, DurableStore};

use crate::data::Dataset;
use crate::error::PipelineError;
use crate::pipeline::CacheKey;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast;

/// What a step produced: its data plus the scratch annotations it made
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepOutput {
    pub data: Dataset,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl StepOutput {
    pub fn new(data: Dataset) -> Self {
        Self {
            data,
            annotations: BTreeMap::new(),
        }
    }
}

/// A stored step output
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub output: StepOutput,
    pub stored_at: SystemTime,
}

/// How a cached value was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// Already present, compute function not invoked
    Hit,
    /// Computed by this caller
    Computed,
    /// Computed by a concurrent caller this one waited on
    Coalesced,
    /// The step is not cacheable and ran directly
    Bypassed,
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub computed: u64,
    pub coalesced: u64,
    pub failures: u64,
    pub entries: usize,
}

type Broadcast = broadcast::Sender<Result<Arc<CacheEntry>, PipelineError>>;

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    computed: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
}

/// Shared step-output cache.
///
/// At most one caller computes a given key at a time; concurrent callers for
/// the same key wait for that computation and receive its result. Entries are
/// written once and failed computations leave no entry.
pub struct StepCache {
    entries: RwLock<HashMap<CacheKey, Arc<CacheEntry>>>,
    in_flight: Mutex<HashMap<CacheKey, Broadcast>>,
    store: Option<Arc<dyn DurableStore>>,
    counters: Counters,
}

enum Role {
    Ready(Arc<CacheEntry>),
    Wait(broadcast::Receiver<Result<Arc<CacheEntry>, PipelineError>>),
    Lead(Broadcast),
}

/// Clears the in-flight registration if the leader goes away without
/// finishing, so waiters can elect a new leader
struct LeaderGuard<'a> {
    cache: &'a StepCache,
    key: &'a CacheKey,
    armed: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.in_flight.lock().remove(self.key);
        }
    }
}

impl Default for StepCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StepCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            store: None,
            counters: Counters::default(),
        }
    }

    /// Cache backed by a durable store consulted on misses
    pub fn with_store(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            computed: self.counters.computed.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Return the entry for `key`, running `compute` only if no entry exists
    /// and no other caller is already computing it.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        compute: F,
    ) -> Result<(Arc<CacheEntry>, CacheSource), PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StepOutput, PipelineError>>,
    {
        let tx = loop {
            match self.claim(key) {
                Role::Ready(entry) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok((entry, CacheSource::Hit));
                }
                Role::Wait(mut rx) => match rx.recv().await {
                    Ok(result) => {
                        self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                        return result.map(|entry| (entry, CacheSource::Coalesced));
                    }
                    // the leader was dropped before finishing
                    Err(_) => continue,
                },
                Role::Lead(tx) => break tx,
            }
        };

        let mut guard = LeaderGuard {
            cache: self,
            key,
            armed: true,
        };

        if let Some(output) = self.load_durable(key) {
            let entry = self.publish(key, output);
            guard.armed = false;
            let _ = tx.send(Ok(entry.clone()));
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((entry, CacheSource::Hit));
        }

        match compute().await {
            Ok(output) => {
                self.store_durable(key, &output);
                let entry = self.publish(key, output);
                guard.armed = false;
                let _ = tx.send(Ok(entry.clone()));
                self.counters.computed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "cached step output");
                Ok((entry, CacheSource::Computed))
            }
            Err(e) => {
                self.in_flight.lock().remove(key);
                guard.armed = false;
                let _ = tx.send(Err(e.clone()));
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, error = %e, "step computation failed, not cached");
                Err(e)
            }
        }
    }

    fn claim(&self, key: &CacheKey) -> Role {
        if let Some(entry) = self.get(key) {
            return Role::Ready(entry);
        }

        let mut in_flight = self.in_flight.lock();
        // entries are published while holding the in-flight lock
        if let Some(entry) = self.get(key) {
            return Role::Ready(entry);
        }
        if let Some(tx) = in_flight.get(key) {
            return Role::Wait(tx.subscribe());
        }
        let (tx, _) = broadcast::channel(1);
        in_flight.insert(key.clone(), tx.clone());
        Role::Lead(tx)
    }

    /// Insert under first-writer-wins and end the in-flight registration
    fn publish(&self, key: &CacheKey, output: StepOutput) -> Arc<CacheEntry> {
        let mut in_flight = self.in_flight.lock();
        let entry = self
            .entries
            .write()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(CacheEntry {
                    output,
                    stored_at: SystemTime::now(),
                })
            })
            .clone();
        in_flight.remove(key);
        entry
    }

    fn load_durable(&self, key: &CacheKey) -> Option<StepOutput> {
        let store = self.store.as_ref()?;
        match store.load(key) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to read durable cache entry");
                None
            }
        }
    }

    fn store_durable(&self, key: &CacheKey, output: &StepOutput) {
        if let Some(store) = &self.store {
            if let Err(e) = store.store(key, output) {
                tracing::warn!(key = %key, error = %e, "failed to persist cache entry");
            }
        }
    }
}
