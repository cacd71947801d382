use chrono::{DateTime, Utc};
use image::DynamicImage;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;

use super::PageProvider;
use crate::config::EngineConfig;
use crate::error::Error;
use crate::pool::WorkerPools;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub image: Arc<DynamicImage>,
    pub inserted_at: DateTime<Utc>,
    /// Cache generation the page was decoded under.
    pub generation: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hit_rate: f32,
    pub total_hits: u64,
    pub total_misses: u64,
    pub total_loads: u64,
    pub generation: u64,
}

#[derive(Clone)]
enum LoadState {
    Pending,
    Done(Option<Arc<DynamicImage>>),
}

enum Plan {
    Hit(Arc<DynamicImage>),
    Join(watch::Receiver<LoadState>),
    Load(watch::Sender<LoadState>, InFlightGuard),
}

struct InFlight {
    generation: u64,
    receiver: watch::Receiver<LoadState>,
}

struct State {
    entries: LruCache<usize, CacheEntry>,
    current: Option<usize>,
    in_flight: HashMap<usize, InFlight>,
}

struct Shared {
    state: Mutex<State>,
    provider: RwLock<Option<Arc<dyn PageProvider>>>,
    /// Decode lane; without one, decodes go to tokio's blocking threads.
    pools: Option<WorkerPools>,
    generation: AtomicU64,
    capacity: usize,
    prefetch_radius: usize,
    decode_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
}

/// Bounded store of decoded pages for one reading session.
///
/// Cloning is cheap and every clone shares the same pages, so prefetch tasks
/// hold their own handle. Eviction is least-recently-used but never picks the
/// current page or a page within `prefetch_radius` of it while anything else
/// can go.
#[derive(Clone)]
pub struct PageCache {
    shared: Arc<Shared>,
}

/// Removes an in-flight marker when its load finishes or is abandoned.
struct InFlightGuard {
    shared: Arc<Shared>,
    index: usize,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            let ours = state
                .in_flight
                .get(&self.index)
                .is_some_and(|f| f.generation == self.generation);
            if ours {
                state.in_flight.remove(&self.index);
            }
        }
    }
}

impl PageCache {
    pub fn new(config: &EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// A cache that decodes pages on the CPU lane of `pools`.
    pub fn with_pools(config: &EngineConfig, pools: WorkerPools) -> Self {
        Self::build(config, Some(pools))
    }

    fn build(config: &EngineConfig, pools: Option<WorkerPools>) -> Self {
        let capacity = config.cache.page_capacity.max(1);
        let entries = LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN));

        PageCache {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries,
                    current: None,
                    in_flight: HashMap::new(),
                }),
                provider: RwLock::new(None),
                pools,
                generation: AtomicU64::new(0),
                capacity,
                prefetch_radius: config.cache.prefetch_radius,
                decode_timeout: config.timeouts.decode(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                loads: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_provider(provider: Arc<dyn PageProvider>, config: &EngineConfig) -> Self {
        let cache = Self::new(config);
        cache.set_provider(provider);
        cache
    }

    /// Swap the page source. Every cached page and pending load belongs to the
    /// old source and is dropped.
    pub fn set_provider(&self, provider: Arc<dyn PageProvider>) {
        log::debug!(
            "Page cache switching to {} provider with {} pages",
            provider.kind(),
            provider.page_count()
        );
        if let Ok(mut slot) = self.shared.provider.write() {
            *slot = Some(provider);
        }
        self.clear();
        if let Ok(mut state) = self.shared.state.lock() {
            state.current = None;
        }
    }

    fn provider(&self) -> Option<Arc<dyn PageProvider>> {
        self.shared.provider.read().ok()?.clone()
    }

    pub fn page_count(&self) -> usize {
        self.provider().map(|p| p.page_count()).unwrap_or(0)
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    pub fn current_page(&self) -> Option<usize> {
        self.shared.state.lock().ok()?.current
    }

    pub fn set_current_page(&self, index: usize) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.current = Some(index);
        }
    }

    /// Cached page, if any. Never triggers a load.
    pub fn get(&self, index: usize) -> Option<Arc<DynamicImage>> {
        let mut state = self.shared.state.lock().ok()?;
        match state.entries.get(&index) {
            Some(entry) => {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.image.clone())
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Presence check that neither promotes the page nor touches the stats.
    pub fn contains(&self, index: usize) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.entries.contains(&index))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|state| state.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a page unless one is already cached for `index`.
    /// Returns whether the page was stored.
    pub fn put(&self, index: usize, image: Arc<DynamicImage>) -> bool {
        let generation = self.generation();
        match self.shared.state.lock() {
            Ok(mut state) => self.insert_locked(&mut state, index, image, generation),
            Err(_) => false,
        }
    }

    pub fn invalidate(&self, index: usize) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.entries.pop(&index);
        }
    }

    /// Drop every page and start a new generation; loads still running under
    /// the old generation will not be cached.
    pub fn clear(&self) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut state) = self.shared.state.lock() {
            state.entries.clear();
            state.in_flight.clear();
        }
        log::debug!("Page cache cleared, generation {generation}");
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.shared.hits.load(Ordering::Relaxed);
        let misses = self.shared.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.len(),
            capacity: self.shared.capacity,
            hit_rate: if total > 0 { hits as f32 / total as f32 } else { 0.0 },
            total_hits: hits,
            total_misses: misses,
            total_loads: self.shared.loads.load(Ordering::Relaxed),
            generation: self.generation(),
        }
    }

    fn is_protected(&self, current: Option<usize>, index: usize) -> bool {
        let Some(current) = current else {
            return false;
        };
        let radius = self.shared.prefetch_radius;
        index >= current.saturating_sub(radius) && index <= current.saturating_add(radius)
    }

    fn insert_locked(
        &self,
        state: &mut State,
        index: usize,
        image: Arc<DynamicImage>,
        generation: u64,
    ) -> bool {
        if state.entries.contains(&index) {
            return false;
        }

        while state.entries.len() >= self.shared.capacity {
            let current = state.current;
            // iter() runs from most to least recently used.
            let victim = state
                .entries
                .iter()
                .rev()
                .map(|(key, _)| *key)
                .find(|key| !self.is_protected(current, *key));
            let evicted = match victim {
                Some(key) => state.entries.pop(&key).map(|_| key),
                None => state.entries.pop_lru().map(|(key, _)| key),
            };
            match evicted {
                Some(key) => log::debug!("Evicted page {key}"),
                None => break,
            }
        }

        state.entries.put(
            index,
            CacheEntry {
                image,
                inserted_at: Utc::now(),
                generation,
            },
        );
        true
    }

    /// Return page `index`, decoding it on a blocking worker if needed.
    ///
    /// Concurrent calls for the same page share one decode. A decode that
    /// outlives a `clear` or `set_provider` is thrown away and yields `None`.
    pub async fn ensure_page(&self, index: usize) -> Option<Arc<DynamicImage>> {
        let provider = self.provider()?;
        if index >= provider.page_count() {
            log::debug!(
                "Page {index} out of range ({} pages)",
                provider.page_count()
            );
            return None;
        }

        let generation = self.generation();
        let plan = {
            let mut state = self.shared.state.lock().ok()?;
            if let Some(entry) = state.entries.get(&index) {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                Plan::Hit(entry.image.clone())
            } else {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                let joined = state
                    .in_flight
                    .get(&index)
                    .filter(|f| f.generation == generation)
                    .map(|f| f.receiver.clone());
                match joined {
                    Some(receiver) => Plan::Join(receiver),
                    None => {
                        let (sender, receiver) = watch::channel(LoadState::Pending);
                        state
                            .in_flight
                            .insert(index, InFlight { generation, receiver });
                        let guard = InFlightGuard {
                            shared: self.shared.clone(),
                            index,
                            generation,
                        };
                        Plan::Load(sender, guard)
                    }
                }
            }
        };

        let (sender, guard) = match plan {
            Plan::Hit(image) => return Some(image),
            Plan::Join(receiver) => return Self::wait_for(receiver).await,
            Plan::Load(sender, guard) => (sender, guard),
        };

        let page = match self.load(provider, index).await {
            Some(image) => self.store_loaded(index, Arc::new(image), generation),
            None => None,
        };

        let _ = sender.send(LoadState::Done(page.clone()));
        drop(guard);
        page
    }

    /// Cache a fresh decode, or hand back the page someone else stored first.
    /// A decode from an older generation is dropped; the check runs under the
    /// state lock so it cannot interleave with `clear`.
    fn store_loaded(
        &self,
        index: usize,
        image: Arc<DynamicImage>,
        generation: u64,
    ) -> Option<Arc<DynamicImage>> {
        let mut state = self.shared.state.lock().ok()?;
        if self.generation() != generation {
            log::debug!("Discarding stale decode of page {index} from generation {generation}");
            return None;
        }
        if self.insert_locked(&mut state, index, image.clone(), generation) {
            return Some(image);
        }
        Some(
            state
                .entries
                .get(&index)
                .map(|entry| entry.image.clone())
                .unwrap_or(image),
        )
    }

    async fn wait_for(mut receiver: watch::Receiver<LoadState>) -> Option<Arc<DynamicImage>> {
        let state = receiver
            .wait_for(|state| matches!(state, LoadState::Done(_)))
            .await
            .ok()?;
        match &*state {
            LoadState::Done(page) => page.clone(),
            LoadState::Pending => None,
        }
    }

    async fn load(&self, provider: Arc<dyn PageProvider>, index: usize) -> Option<DynamicImage> {
        self.shared.loads.fetch_add(1, Ordering::Relaxed);
        let timeout = self.shared.decode_timeout;
        let pools = self.shared.pools.clone();
        let decode = async move {
            match pools {
                Some(pools) => pools.run_cpu(move || provider.get_page(index)).await,
                None => tokio::task::spawn_blocking(move || provider.get_page(index))
                    .await
                    .map_err(Error::from),
            }
        };
        match tokio::time::timeout(timeout, decode).await {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                log::warn!("Page {index} decode task failed: {e}");
                None
            }
            Err(_) => {
                log::warn!("Page {index} decode timed out after {timeout:?}");
                None
            }
        }
    }

    /// Make `index` the current page, wait for it, then prefetch its
    /// neighbours in the background.
    pub async fn navigate_to(&self, index: usize) -> Option<Arc<DynamicImage>> {
        self.set_current_page(index);
        let page = self.ensure_page(index).await;
        self.prefetch(index);
        page
    }

    /// Start background loads for the pages around `index` that are neither
    /// cached nor already loading. Needs a tokio runtime; without one it does
    /// nothing.
    pub fn prefetch(&self, index: usize) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!("No runtime available, skipping prefetch around page {index}");
            return;
        };
        let count = self.page_count();
        let radius = self.shared.prefetch_radius;
        let start = index.saturating_sub(radius);
        let end = index.saturating_add(radius).min(count.saturating_sub(1));

        for neighbour in start..=end {
            if neighbour == index || neighbour >= count || self.is_busy(neighbour) {
                continue;
            }
            let cache = self.clone();
            runtime.spawn(async move {
                cache.ensure_page(neighbour).await;
            });
        }
    }

    fn is_busy(&self, index: usize) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.entries.contains(&index) || state.in_flight.contains_key(&index))
            .unwrap_or(true)
    }
}
