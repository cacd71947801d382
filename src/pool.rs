use rayon::ThreadPool;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::PoolConfig;
use crate::error::{Error, Result};

/// The engine's three execution lanes.
///
/// Blocking archive I/O runs on tokio's blocking threads behind a small
/// semaphore, decode and analysis run on a CPU-sized rayon pool, and
/// housekeeping runs on its own tiny pool so it never competes with page
/// loads.
#[derive(Clone)]
pub struct WorkerPools {
    io: Arc<Semaphore>,
    io_workers: usize,
    cpu: Arc<ThreadPool>,
    background: Arc<ThreadPool>,
}

impl WorkerPools {
    pub fn new(config: &PoolConfig) -> Result<Self> {
        let cpu_workers = config.resolved_cpu_workers();
        let cpu = rayon::ThreadPoolBuilder::new()
            .num_threads(cpu_workers)
            .thread_name(|i| format!("comicat-cpu-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create CPU pool: {e}")))?;
        let background = rayon::ThreadPoolBuilder::new()
            .num_threads(config.background_workers.max(1))
            .thread_name(|i| format!("comicat-bg-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create background pool: {e}")))?;

        log::info!(
            "Worker pools ready: {} io, {} cpu, {} background",
            config.io_workers,
            cpu_workers,
            config.background_workers
        );

        Ok(Self {
            io: Arc::new(Semaphore::new(config.io_workers.max(1))),
            io_workers: config.io_workers.max(1),
            cpu: Arc::new(cpu),
            background: Arc::new(background),
        })
    }

    /// Run blocking I/O once an I/O slot is free.
    pub async fn run_io<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .io
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::TaskJoin(format!("I/O pool closed: {e}")))?;
        let result = tokio::task::spawn_blocking(move || {
            let out = job();
            drop(permit);
            out
        })
        .await?;
        Ok(result)
    }

    /// Run CPU-bound work on the decode pool without blocking the runtime.
    pub async fn run_cpu<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.cpu.clone();
        let result = tokio::task::spawn_blocking(move || pool.install(job)).await?;
        Ok(result)
    }

    /// Fire-and-forget housekeeping.
    pub fn spawn_background<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.background.spawn(job);
    }

    pub fn io_slots_available(&self) -> usize {
        self.io.available_permits()
    }

    pub fn io_workers(&self) -> usize {
        self.io_workers
    }

    pub fn cpu_workers(&self) -> usize {
        self.cpu.current_num_threads()
    }
}
