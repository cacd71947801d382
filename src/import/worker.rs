use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;

use super::metadata::ComicMetadata;
use super::{ImportPipeline, Priority};
use crate::error::{Error, Result};

type Callback = Box<dyn FnOnce(Result<ComicMetadata>) + Send>;

/// One file waiting for import.
#[derive(Debug, Clone)]
pub struct ImportTask {
    pub id: String,
    pub path: PathBuf,
    pub priority: Priority,
}

enum Job {
    Import(Callback),
    /// Fills the pipeline's preload cache; the result is only logged.
    Preload,
}

struct QueuedTask {
    task: ImportTask,
    sequence: u64,
    job: Job,
}

impl Eq for QueuedTask {}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.sequence == other.sequence
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier submissions first
        match self.task.priority.cmp(&other.task.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

enum QueueMessage {
    Enqueue(QueuedTask),
    Cancel(String),
}

/// Prioritized import queue with a bounded number of imports in flight.
///
/// Tasks run `Critical > High > Normal > Low`, FIFO within a priority. Each
/// task's callback receives the import result once it finishes. Dropping the
/// queue stops dispatching; imports already running complete.
pub struct ImportQueue {
    sender: mpsc::UnboundedSender<QueueMessage>,
    sequence: AtomicU64,
    dispatcher: JoinHandle<()>,
}

impl ImportQueue {
    /// Start the dispatcher. Must be called inside a tokio runtime.
    pub fn start(pipeline: ImportPipeline, max_in_flight: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(max_in_flight.max(1)));
        let dispatcher = tokio::spawn(dispatch(pipeline, receiver, semaphore));

        Self {
            sender,
            sequence: AtomicU64::new(0),
            dispatcher,
        }
    }

    /// Queue `path` and return the task id.
    pub fn submit<F>(&self, path: PathBuf, priority: Priority, callback: F) -> Result<String>
    where
        F: FnOnce(Result<ComicMetadata>) + Send + 'static,
    {
        self.enqueue(path, priority, Job::Import(Box::new(callback)))
    }

    /// Queue a preload of `path` behind all imports and return the task id.
    pub fn preload(&self, path: PathBuf) -> Result<String> {
        self.enqueue(path, Priority::Low, Job::Preload)
    }

    fn enqueue(&self, path: PathBuf, priority: Priority, job: Job) -> Result<String> {
        let task = ImportTask {
            id: uuid::Uuid::new_v4().to_string(),
            path,
            priority,
        };
        let id = task.id.clone();
        let queued = QueuedTask {
            task,
            sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            job,
        };

        self.sender
            .send(QueueMessage::Enqueue(queued))
            .map_err(|_| Error::TaskJoin("Import queue is closed".to_string()))?;
        Ok(id)
    }

    /// Queue `path` and wait for its result.
    pub async fn import(&self, path: PathBuf, priority: Priority) -> Result<ComicMetadata> {
        let (reply, response) = oneshot::channel();
        self.submit(path, priority, move |result| {
            let _ = reply.send(result);
        })?;
        response
            .await
            .map_err(|_| Error::TaskJoin("Import task was cancelled".to_string()))?
    }

    /// Drop a task that has not started yet. Its callback is never invoked.
    pub fn cancel(&self, id: &str) -> bool {
        self.sender
            .send(QueueMessage::Cancel(id.to_string()))
            .is_ok()
    }
}

impl Drop for ImportQueue {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn accept(queue: &mut BinaryHeap<QueuedTask>, message: QueueMessage) {
    match message {
        QueueMessage::Enqueue(task) => queue.push(task),
        QueueMessage::Cancel(id) => {
            let before = queue.len();
            queue.retain(|queued| queued.task.id != id);
            if queue.len() < before {
                log::debug!("Cancelled import task {id}");
            }
        }
    }
}

async fn dispatch(
    pipeline: ImportPipeline,
    mut receiver: mpsc::UnboundedReceiver<QueueMessage>,
    semaphore: Arc<Semaphore>,
) {
    let mut queue = BinaryHeap::new();
    log::info!("Import queue started");

    loop {
        if queue.is_empty() {
            match receiver.recv().await {
                Some(message) => accept(&mut queue, message),
                None => break,
            }
        }
        while let Ok(message) = receiver.try_recv() {
            accept(&mut queue, message);
        }

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        // Pick up anything that arrived while every slot was busy.
        while let Ok(message) = receiver.try_recv() {
            accept(&mut queue, message);
        }
        let Some(queued) = queue.pop() else {
            drop(permit);
            continue;
        };

        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let QueuedTask { task, job, .. } = queued;
            match job {
                Job::Import(callback) => {
                    log::debug!(
                        "Importing {} at {:?} priority",
                        task.path.display(),
                        task.priority
                    );
                    let result = pipeline
                        .optimized_import(&task.path, task.priority, None)
                        .await;
                    callback(result);
                }
                Job::Preload => {
                    if let Err(e) = pipeline.preload(&task.path).await {
                        log::debug!("Preload of {} failed: {e}", task.path.display());
                    }
                }
            }
            drop(permit);
        });
    }

    log::info!("Import queue stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn write_cbz(path: &Path) {
        let file = File::create(path).expect("Failed to create zip");
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("notes.txt", SimpleFileOptions::default())
            .expect("Failed to start file");
        zip.write_all(b"no pages").expect("Failed to write entry");
        zip.finish().expect("Failed to finish zip");
    }

    fn write_cbz_with_page(path: &Path) {
        let img = image::RgbImage::from_pixel(40, 20, image::Rgb([200, 40, 40]));
        let mut png = std::io::Cursor::new(Vec::new());
        img.write_to(&mut png, image::ImageFormat::Png)
            .expect("Failed to encode png");

        let file = File::create(path).expect("Failed to create zip");
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("001.png", SimpleFileOptions::default())
            .expect("Failed to start file");
        zip.write_all(png.get_ref()).expect("Failed to write entry");
        zip.finish().expect("Failed to finish zip");
    }

    fn pipeline() -> ImportPipeline {
        ImportPipeline::new(&EngineConfig::default()).expect("pipeline")
    }

    #[test]
    fn ordering_is_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        for (sequence, priority) in [
            (0, Priority::Low),
            (1, Priority::Normal),
            (2, Priority::Critical),
            (3, Priority::High),
            (4, Priority::Normal),
        ] {
            heap.push(QueuedTask {
                task: ImportTask {
                    id: sequence.to_string(),
                    path: PathBuf::new(),
                    priority,
                },
                sequence,
                job: Job::Preload,
            });
        }

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|q| q.sequence)).collect();
        assert_eq!(order, vec![2, 3, 1, 4, 0]);
    }

    #[tokio::test]
    async fn single_slot_runs_tasks_in_priority_order() {
        let dir = tempdir().expect("Failed to create temp dir");
        let queue = ImportQueue::start(pipeline(), 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut done = Vec::new();

        for (name, priority) in [
            ("low", Priority::Low),
            ("normal", Priority::Normal),
            ("critical", Priority::Critical),
            ("high", Priority::High),
        ] {
            let path = dir.path().join(format!("{name}.cbz"));
            write_cbz(&path);
            let order = order.clone();
            let (tx, rx) = oneshot::channel();
            queue
                .submit(path, priority, move |result| {
                    assert!(result.is_ok());
                    order.lock().expect("order lock").push(name);
                    let _ = tx.send(());
                })
                .expect("submit");
            done.push(rx);
        }

        for rx in done {
            rx.await.expect("task finished");
        }
        assert_eq!(
            *order.lock().expect("order lock"),
            vec!["critical", "high", "normal", "low"]
        );
    }

    #[tokio::test]
    async fn import_waits_for_the_result() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("plain.cbz");
        write_cbz(&path);

        let queue = ImportQueue::start(pipeline(), 2);
        let metadata = queue
            .import(path, Priority::Normal)
            .await
            .expect("import");
        assert_eq!(metadata.title, "plain");

        let missing = queue
            .import(dir.path().join("missing.cbz"), Priority::High)
            .await;
        assert!(matches!(missing, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn preload_waits_behind_imports() {
        let dir = tempdir().expect("Failed to create temp dir");
        let mut config = EngineConfig::default();
        config.import.preview_edge = 10;
        let pipeline = ImportPipeline::new(&config).expect("pipeline");
        let queue = ImportQueue::start(pipeline.clone(), 1);

        let early = dir.path().join("early.cbz");
        let late = dir.path().join("late.cbz");
        write_cbz_with_page(&early);
        write_cbz_with_page(&late);

        let preload_id = queue.preload(early.clone()).expect("preload");
        let (tx, rx) = oneshot::channel();
        queue
            .submit(late, Priority::Low, move |result| {
                let _ = tx.send(result.is_ok());
            })
            .expect("submit");
        assert!(rx.await.expect("import finished"));
        assert!(!preload_id.is_empty());

        // Same priority, so the earlier preload ran first.
        let preloaded = pipeline.preloaded(&early).expect("preloaded");
        assert_eq!(preloaded.info.entry_count, 1);
        let preview = preloaded.cover_preview.expect("cover preview");
        assert_eq!((preview.width(), preview.height()), (10, 5));
        assert!(pipeline.preloaded(&dir.path().join("late.cbz")).is_none());
    }

    #[tokio::test]
    async fn cancelled_task_never_runs() {
        let dir = tempdir().expect("Failed to create temp dir");
        let queue = ImportQueue::start(pipeline(), 1);

        let first = dir.path().join("first.cbz");
        let second = dir.path().join("second.cbz");
        write_cbz(&first);
        write_cbz(&second);

        let ran = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel();
        let log_first = ran.clone();
        queue
            .submit(first, Priority::Normal, move |_| {
                log_first.lock().expect("ran lock").push("first");
                let _ = tx.send(());
            })
            .expect("submit");
        let log_second = ran.clone();
        let id = queue
            .submit(second, Priority::Low, move |_| {
                log_second.lock().expect("ran lock").push("second");
            })
            .expect("submit");
        assert!(queue.cancel(&id));

        rx.await.expect("first finished");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*ran.lock().expect("ran lock"), vec!["first"]);
    }
}
