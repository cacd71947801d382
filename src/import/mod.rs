pub mod cache;
pub mod metadata;
pub mod worker;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::archive::{detect_document_kind, get_archive_info, DocumentKind, ProgressFn};
use crate::config::{EngineConfig, ImportConfig};
use crate::error::{Error, Result};
use crate::identity::{get_file_identity, quick_hash_parts};
use crate::pages::decode_image_bytes;
use crate::pool::WorkerPools;
use metadata::{finish_metadata, read_cover_page, read_metadata};

pub use cache::{AgedCache, MetadataCache, PreloadCache, PreloadedFile};
pub use metadata::{
    extract_metadata, parse_comic_info, parse_file_name, parse_sidecar_json, validate_file,
    ComicMetadata, FileNameInfo, ImageAnalysis, Orientation,
};
pub use worker::{ImportQueue, ImportTask};

/// Batch progress sink receiving `(completed, total)`.
pub type BatchProgressFn = dyn Fn(usize, usize) + Send + Sync;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// How much work goes into a file's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStrategy {
    /// Listing and sidecars only.
    Fast,
    /// Adds cover and orientation analysis.
    Balanced,
    /// Adds heuristic tags on top of the analysis.
    Thorough,
}

pub fn select_strategy(size: u64, config: &ImportConfig) -> ProcessingStrategy {
    if config.prioritize_speed || size > config.fast_threshold_bytes {
        ProcessingStrategy::Fast
    } else if size < config.thorough_threshold_bytes {
        ProcessingStrategy::Thorough
    } else {
        ProcessingStrategy::Balanced
    }
}

/// Snapshot of the pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMetrics {
    pub processed_files: u64,
    pub cache_hits: u64,
    pub cache_requests: u64,
    pub errors: u64,
    pub total_processing_ms: u64,
}

impl ImportMetrics {
    /// Fraction of cache lookups that hit, `0.0..=1.0`.
    pub fn hit_rate(&self) -> f64 {
        if self.cache_requests == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.cache_requests as f64
        }
    }

    pub fn average_processing_ms(&self) -> f64 {
        if self.processed_files == 0 {
            0.0
        } else {
            self.total_processing_ms as f64 / self.processed_files as f64
        }
    }

    /// Fraction of attempted imports that failed.
    pub fn error_rate(&self) -> f64 {
        let attempts = self.processed_files + self.errors;
        if attempts == 0 {
            0.0
        } else {
            self.errors as f64 / attempts as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    processed_files: AtomicU64,
    cache_hits: AtomicU64,
    cache_requests: AtomicU64,
    errors: AtomicU64,
    total_processing_ms: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ImportMetrics {
        ImportMetrics {
            processed_files: self.processed_files.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_requests: self.cache_requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_processing_ms: self.total_processing_ms.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.processed_files,
            &self.cache_hits,
            &self.cache_requests,
            &self.errors,
            &self.total_processing_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Strategy-driven metadata import over the engine's worker pools.
///
/// Cheap to clone; clones share the caches and counters.
#[derive(Clone)]
pub struct ImportPipeline {
    config: ImportConfig,
    pools: WorkerPools,
    cache: Arc<MetadataCache>,
    preload_cache: Arc<PreloadCache>,
    counters: Arc<Counters>,
}

impl ImportPipeline {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let pools = WorkerPools::new(&config.pools)?;
        Ok(Self::with_pools(config, pools))
    }

    pub fn with_pools(config: &EngineConfig, pools: WorkerPools) -> Self {
        Self {
            config: config.import.clone(),
            pools,
            cache: Arc::new(MetadataCache::new(config.cache.metadata_capacity)),
            preload_cache: Arc::new(PreloadCache::new(config.cache.preload_capacity)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    pub fn preload_cache(&self) -> &PreloadCache {
        &self.preload_cache
    }

    /// Preloaded info for `path`, if it is still current.
    pub fn preloaded(&self, path: &Path) -> Option<PreloadedFile> {
        self.preload_cache.get(&cache_key(path).0)
    }

    pub fn metrics(&self) -> ImportMetrics {
        self.counters.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.counters.reset();
    }

    /// Import one file.
    ///
    /// A cache hit on the quick hash returns without opening the file.
    /// Otherwise progress runs 0.1 (validated), 0.2 (strategy chosen),
    /// 0.3..0.8 (extraction), 0.9 (extracted) and 1.0 (cached).
    pub async fn optimized_import(
        &self,
        path: &Path,
        priority: Priority,
        on_progress: Option<Arc<ProgressFn>>,
    ) -> Result<ComicMetadata> {
        let started = Instant::now();
        let report = |value: f32| {
            if let Some(callback) = &on_progress {
                callback(value);
            }
        };

        let (key, size) = cache_key(path);

        if self.config.enable_caching {
            self.counters.cache_requests.fetch_add(1, Ordering::Relaxed);
            if let Some(hit) = self.cache.get(&key) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                log::debug!("Metadata cache hit for {}", path.display());
                report(1.0);
                return Ok(hit);
            }
        }

        let errors = validate_file(path);
        if !errors.is_empty() {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            log::warn!("Rejected {}: {}", path.display(), errors.join("; "));
            return Err(Error::Validation(errors));
        }
        report(0.1);

        let strategy = select_strategy(size, &self.config);
        log::debug!(
            "Importing {} with {:?} strategy at {:?} priority",
            path.display(),
            strategy,
            priority
        );
        report(0.2);

        let metadata = match self.extract(path, strategy, on_progress.clone()).await {
            Ok(metadata) => metadata,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Failed to import {}: {e}", path.display());
                return Err(e);
            }
        };
        report(0.9);

        if self.config.enable_caching && self.cache.insert(key, metadata.clone()) {
            self.prune_cache().await;
        }
        report(1.0);

        self.counters.processed_files.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_processing_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        log::info!(
            "Imported {} ({} pages) in {:?}",
            path.display(),
            metadata.page_count,
            started.elapsed()
        );
        Ok(metadata)
    }

    /// File reads on the I/O lane, then analysis on the CPU pool.
    async fn extract(
        &self,
        path: &Path,
        strategy: ProcessingStrategy,
        on_progress: Option<Arc<ProgressFn>>,
    ) -> Result<ComicMetadata> {
        let job_path = path.to_path_buf();
        let job_config = self.config.clone();
        let read_progress = on_progress.clone();
        let pending = self
            .pools
            .run_io(move || {
                let progress = |value: f32| {
                    if let Some(callback) = &read_progress {
                        callback(value);
                    }
                };
                read_metadata(&job_path, strategy, &job_config, &progress)
            })
            .await??;

        self.pools
            .run_cpu(move || {
                let progress = |value: f32| {
                    if let Some(callback) = &on_progress {
                        callback(value);
                    }
                };
                finish_metadata(pending, &progress)
            })
            .await
    }

    /// Warm the preload cache with an archive's info and a small cover.
    ///
    /// Returns `Ok(None)` when preloading is disabled. A current cache entry is
    /// returned without touching the file.
    pub async fn preload(&self, path: &Path) -> Result<Option<PreloadedFile>> {
        if !self.config.enable_preloading {
            return Ok(None);
        }
        let (key, _) = cache_key(path);
        if let Some(hit) = self.preload_cache.get(&key) {
            return Ok(Some(hit));
        }

        let errors = validate_file(path);
        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }
        let DocumentKind::Archive(format) = detect_document_kind(path) else {
            return Err(Error::UnsupportedFormat(path.to_path_buf()));
        };

        let job_path = path.to_path_buf();
        let (info, cover) = self
            .pools
            .run_io(move || -> Result<_> {
                let info = get_archive_info(&job_path);
                let cover = read_cover_page(&job_path, format)?;
                Ok((info, cover))
            })
            .await??;

        let edge = self.config.preview_edge;
        let cover_preview = match cover {
            Some((name, bytes)) => {
                let decoded = self
                    .pools
                    .run_cpu(move || {
                        decode_image_bytes(&bytes).map(|image| {
                            if image.width() > edge || image.height() > edge {
                                image.thumbnail(edge, edge)
                            } else {
                                image
                            }
                        })
                    })
                    .await?;
                match decoded {
                    Ok(preview) => Some(Arc::new(preview)),
                    Err(e) => {
                        log::debug!("No cover preview for {}: {name}: {e}", path.display());
                        None
                    }
                }
            }
            None => None,
        };

        let preloaded = PreloadedFile {
            info,
            cover_preview,
        };
        if self.preload_cache.insert(key, preloaded.clone()) {
            self.prune_cache().await;
        }
        log::debug!("Preloaded {}", path.display());
        Ok(Some(preloaded))
    }

    /// Housekeeping on the background lane; waits so the bounds hold on return.
    async fn prune_cache(&self) {
        let cache = self.cache.clone();
        let preload_cache = self.preload_cache.clone();
        let (done, finished) = oneshot::channel();
        self.pools.spawn_background(move || {
            let _ = done.send(cache.prune() + preload_cache.prune());
        });
        if finished.await.is_err() {
            log::warn!("Cache pruning did not finish");
        }
    }

    /// Import many files, smallest first, `batch_size` at a time.
    ///
    /// Results come back in processing order (ascending file size). A failed
    /// file does not stop the batch.
    pub async fn batch_import(
        &self,
        paths: Vec<PathBuf>,
        on_progress: Option<&(dyn Fn(usize, usize) + Send + Sync + '_)>,
    ) -> Vec<Result<ComicMetadata>> {
        let total = paths.len();
        let mut sized: Vec<(u64, PathBuf)> = paths
            .into_iter()
            .map(|path| (get_file_identity(&path).size, path))
            .collect();
        sized.sort_by_key(|(size, _)| *size);

        let batch_size = self.config.batch_size.max(1);
        let pause = Duration::from_millis(self.config.batch_pause_ms);
        let mut results = Vec::with_capacity(total);

        for (chunk_index, chunk) in sized.chunks(batch_size).enumerate() {
            if chunk_index > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            let handles: Vec<_> = chunk
                .iter()
                .map(|(_, path)| {
                    let pipeline = self.clone();
                    let path = path.clone();
                    tokio::spawn(async move {
                        pipeline
                            .optimized_import(&path, Priority::Normal, None)
                            .await
                    })
                })
                .collect();

            for handle in handles {
                let result = handle.await.map_err(Error::from).and_then(|r| r);
                results.push(result);
                if let Some(callback) = on_progress {
                    callback(results.len(), total);
                }
            }
        }

        log::info!(
            "Batch import finished: {} files, {} failed",
            total,
            results.iter().filter(|r| r.is_err()).count()
        );
        results
    }
}

/// Quick-hash key and size of `path`.
fn cache_key(path: &Path) -> (String, u64) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let identity = get_file_identity(path);
    (quick_hash_parts(&name, &identity), identity.size)
}
