//! Background thumbnail worker
//!
//! One dedicated thread drains a shared request queue. Requests are appended and
//! the worker pops from the end, so the most recently requested item (usually the
//! one scrolled into view) is served next. Re-requesting a path that is still
//! queued is a no-op.
//!
//! Results are delivered as [`ThumbnailEvent`]s on a crossbeam channel; the
//! enqueuing side never blocks on decode or disk I/O.

use crate::decode::DecodeChain;
use crate::disk::DiskThumbnailCache;
use crate::memory::MemoryThumbnailCache;
use crate::pipeline::{Outcome, RenderSettings, ThumbnailPipeline};
use crate::tags::TagStore;
use crate::{AssetRef, ThumbnailBitmap, ThumbnailConfig};
use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use crate::pipeline::CacheStatus;

/// Everything the worker reports back to its consumer
#[derive(Debug, Clone)]
pub enum ThumbnailEvent {
    Ready {
        path: PathBuf,
        bitmap: Arc<ThumbnailBitmap>,
    },
    Failed {
        path: PathBuf,
        message: String,
    },
    /// Not an error: the consumer draws a placeholder
    NoThumbnail {
        path: PathBuf,
        reason: Option<String>,
    },
    /// Password-protected document
    Encrypted { path: PathBuf },
    CacheStatus {
        path: PathBuf,
        status: CacheStatus,
    },
    /// Emitted on every dequeue; `total` counts requests since the queue was last drained
    Progress { done: usize, total: usize },
}

impl ThumbnailEvent {
    /// Events that end the processing of one request
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ThumbnailEvent::CacheStatus { .. } | ThumbnailEvent::Progress { .. }
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Sleep between empty-queue checks
    pub poll_interval: Duration,
    /// Pending request limit; 0 disables the bound
    pub max_queue_len: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            max_queue_len: 10_000,
        }
    }
}

impl From<&ThumbnailConfig> for WorkerOptions {
    fn from(config: &ThumbnailConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_queue_len: config.max_queue_len,
        }
    }
}

#[derive(Default)]
struct WorkQueue {
    items: Vec<AssetRef>,
    processed: usize,
    total: usize,
    dropped: u64,
}

struct Shared {
    pipeline: Arc<ThumbnailPipeline>,
    queue: Mutex<WorkQueue>,
    running: AtomicBool,
    events: Sender<ThumbnailEvent>,
    options: WorkerOptions,
}

pub struct ThumbnailWorker {
    shared: Arc<Shared>,
    thread_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ThumbnailWorker {
    /// Create an idle worker and the receiving end of its event channel
    pub fn new(pipeline: Arc<ThumbnailPipeline>, options: WorkerOptions) -> (Self, Receiver<ThumbnailEvent>) {
        let (events, receiver) = unbounded();
        let worker = Self {
            shared: Arc::new(Shared {
                pipeline,
                queue: Mutex::new(WorkQueue::default()),
                running: AtomicBool::new(false),
                events,
                options,
            }),
            thread_handle: Mutex::new(None),
        };
        (worker, receiver)
    }

    /// Build caches, decode chain and pipeline from a config
    pub fn with_config(
        config: &ThumbnailConfig,
        tags: Arc<dyn TagStore>,
    ) -> Result<(Self, Receiver<ThumbnailEvent>)> {
        let cache_dir = config.resolved_cache_dir()?;
        let disk = DiskThumbnailCache::new(&cache_dir, config.disk_cache_mb)
            .with_context(|| format!("Failed to open thumbnail cache at {}", cache_dir.display()))?;
        let pipeline = ThumbnailPipeline::new(
            DecodeChain::new(config.formats.clone(), tags),
            Arc::new(MemoryThumbnailCache::new(config.memory_cache_entries)),
            Arc::new(disk),
            RenderSettings::from(config),
        );
        Ok(Self::new(Arc::new(pipeline), WorkerOptions::from(config)))
    }

    pub fn pipeline(&self) -> &Arc<ThumbnailPipeline> {
        &self.shared.pipeline
    }

    /// Queue a request. Returns `false` when the path is already queued.
    ///
    /// With a bounded queue, a full queue drops its oldest request to make room.
    pub fn enqueue(&self, asset: AssetRef) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.items.iter().any(|item| item.path == asset.path) {
            return false;
        }

        if queue.items.is_empty() && queue.processed >= queue.total {
            queue.processed = 0;
            queue.total = 0;
        }

        let limit = self.shared.options.max_queue_len;
        if limit > 0 && queue.items.len() >= limit {
            let dropped = queue.items.remove(0);
            queue.total = queue.total.saturating_sub(1);
            queue.dropped += 1;
            debug!(path = %dropped.path.display(), "queue full, dropped oldest request");
        }

        queue.items.push(asset);
        queue.total += 1;
        true
    }

    /// Queue many requests in order; the last one is processed first
    pub fn enqueue_all(&self, assets: impl IntoIterator<Item = AssetRef>) -> usize {
        assets.into_iter().map(|asset| self.enqueue(asset)).filter(|added| *added).count()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    /// `(processed, total)` for the current batch
    pub fn progress(&self) -> (usize, usize) {
        let queue = self.shared.queue.lock();
        (queue.processed, queue.total)
    }

    /// Requests discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.shared.queue.lock().dropped
    }

    pub fn clear_queue(&self) {
        let mut queue = self.shared.queue.lock();
        queue.items.clear();
        queue.processed = 0;
        queue.total = 0;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Spawn the worker thread. Calling it on a running worker does nothing.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.thread_handle.lock();
        if self.is_running() {
            return Ok(());
        }
        // A stopped run may still be finishing its last item
        if let Some(previous) = handle.take() {
            let _ = previous.join();
        }
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("thumbnail-worker".into())
            .spawn(move || run(shared));
        match spawned {
            Ok(join) => {
                *handle = Some(join);
                info!("thumbnail worker started");
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(e).context("Failed to spawn thumbnail worker thread")
            }
        }
    }

    /// Stop accepting work: clears the queue and lets the in-flight item finish
    pub fn stop(&self) {
        let mut queue = self.shared.queue.lock();
        self.shared.running.store(false, Ordering::Release);
        queue.items.clear();
        queue.processed = 0;
        queue.total = 0;
    }

    /// Wait for the worker thread to exit
    pub fn join(&self) {
        if let Some(handle) = self.thread_handle.lock().take() {
            if handle.join().is_err() {
                warn!("thumbnail worker thread panicked");
            }
        }
    }

    /// Stop, then wait for the in-flight item
    pub fn shutdown(&self) {
        self.stop();
        self.join();
    }
}

impl Drop for ThumbnailWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut queue = shared.queue.lock();
            // stop() flips the flag under this lock, so nothing is popped after it
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            queue.items.pop().map(|asset| {
                queue.processed += 1;
                (asset, queue.processed, queue.total)
            })
        };

        let Some((asset, done, total)) = next else {
            thread::sleep(shared.options.poll_interval);
            continue;
        };

        if total > 0 {
            emit(&shared, ThumbnailEvent::Progress { done, total });
        }
        process_item(&shared, asset);
    }
    debug!("thumbnail worker stopped");
}

fn process_item(shared: &Shared, asset: AssetRef) {
    let path = asset.path.clone();
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        shared.pipeline.process(&asset, |status| {
            emit(
                shared,
                ThumbnailEvent::CacheStatus {
                    path: path.clone(),
                    status,
                },
            )
        })
    }));

    let event = match result {
        Ok(Outcome::Ready { bitmap, .. }) => ThumbnailEvent::Ready { path, bitmap },
        Ok(Outcome::NoThumbnail) => ThumbnailEvent::NoThumbnail { path, reason: None },
        Ok(Outcome::Unsupported(reason)) => ThumbnailEvent::NoThumbnail {
            path,
            reason: Some(reason),
        },
        Ok(Outcome::Encrypted) => ThumbnailEvent::Encrypted { path },
        Ok(Outcome::Failed(message)) => {
            warn!(path = %path.display(), %message, "thumbnail generation failed");
            ThumbnailEvent::Failed { path, message }
        }
        Err(_) => {
            warn!(path = %path.display(), "decoder panicked");
            ThumbnailEvent::Failed {
                path,
                message: "decoder panicked".into(),
            }
        }
    };
    emit(shared, event);
}

fn emit(shared: &Shared, event: ThumbnailEvent) {
    // The consumer may have gone away; the worker keeps filling the caches
    let _ = shared.events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::exr::tests::FakeExr;
    use crate::decode::{DecodeError, ExrBackend, ExrHeader, ExrPixels, ReducedScale};
    use crate::formats::FormatTable;
    use crate::pipeline::tests::fixture;
    use crate::tags::MemoryTagStore;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(10);

    fn options() -> WorkerOptions {
        WorkerOptions {
            poll_interval: Duration::from_millis(5),
            max_queue_len: 0,
        }
    }

    fn idle_worker() -> Result<(ThumbnailWorker, Receiver<ThumbnailEvent>, tempfile::TempDir)> {
        let fx = fixture(|store| DecodeChain::new(FormatTable::default(), store), 0.0)?;
        let (worker, events) = ThumbnailWorker::new(Arc::new(fx.pipeline), options());
        Ok((worker, events, fx.dir))
    }

    /// Wait for `n` terminal events, collecting everything seen
    fn collect(events: &Receiver<ThumbnailEvent>, n: usize) -> Vec<ThumbnailEvent> {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        let mut terminal = 0;
        while terminal < n {
            let left = deadline.saturating_duration_since(Instant::now());
            let Ok(event) = events.recv_timeout(left) else { break };
            if event.is_terminal() {
                terminal += 1;
            }
            seen.push(event);
        }
        seen
    }

    #[test]
    fn test_enqueue_coalesces_by_path() -> Result<()> {
        let (worker, _events, _dir) = idle_worker()?;
        assert!(worker.enqueue(AssetRef::new("/a.png", 1.0)));
        assert!(!worker.enqueue(AssetRef::new("/a.png", 2.0)));
        assert_eq!(worker.queue_len(), 1);
        assert_eq!(worker.progress(), (0, 1));
        Ok(())
    }

    #[test]
    fn test_full_queue_drops_oldest() -> Result<()> {
        let fx = fixture(|store| DecodeChain::new(FormatTable::default(), store), 0.0)?;
        let (worker, _events) = ThumbnailWorker::new(
            Arc::new(fx.pipeline),
            WorkerOptions {
                max_queue_len: 2,
                ..options()
            },
        );

        worker.enqueue(AssetRef::new("/a.png", 1.0));
        worker.enqueue(AssetRef::new("/b.png", 1.0));
        worker.enqueue(AssetRef::new("/c.png", 1.0));

        assert_eq!(worker.queue_len(), 2);
        assert_eq!(worker.dropped(), 1);
        assert_eq!(worker.progress(), (0, 2));
        // The dropped path may be requested again
        assert!(worker.enqueue(AssetRef::new("/a.png", 1.0)));
        Ok(())
    }

    #[test]
    fn test_lifo_order_and_progress() -> Result<()> {
        let (worker, events, dir) = idle_worker()?;
        let mut expected = Vec::new();
        for name in ["a", "b", "c"] {
            let path = dir.path().join(format!("{name}.png"));
            image::RgbImage::from_pixel(16, 16, image::Rgb([9, 9, 9])).save(&path)?;
            worker.enqueue(AssetRef::from_path(&path)?);
            expected.insert(0, path);
        }

        worker.start()?;
        let seen = collect(&events, 3);
        worker.shutdown();

        let ready: Vec<PathBuf> = seen
            .iter()
            .filter_map(|e| match e {
                ThumbnailEvent::Ready { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ready, expected);

        let progress: Vec<(usize, usize)> = seen
            .iter()
            .filter_map(|e| match e {
                ThumbnailEvent::Progress { done, total } => Some((*done, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);

        let generating = seen
            .iter()
            .filter(|e| matches!(e, ThumbnailEvent::CacheStatus { status: CacheStatus::Generating, .. }))
            .count();
        assert_eq!(generating, 3);
        Ok(())
    }

    #[test]
    fn test_repeat_request_served_from_cache() -> Result<()> {
        let (worker, events, dir) = idle_worker()?;
        let path = dir.path().join("plate.png");
        image::RgbImage::from_pixel(16, 16, image::Rgb([1, 2, 3])).save(&path)?;

        worker.start()?;
        worker.enqueue(AssetRef::from_path(&path)?);
        collect(&events, 1);
        worker.enqueue(AssetRef::from_path(&path)?);
        let seen = collect(&events, 1);
        worker.shutdown();

        assert!(seen
            .iter()
            .any(|e| matches!(e, ThumbnailEvent::CacheStatus { status: CacheStatus::Cache, .. })));
        // Second batch starts counting from one again
        assert!(seen
            .iter()
            .any(|e| matches!(e, ThumbnailEvent::Progress { done: 1, total: 1 })));
        Ok(())
    }

    #[test]
    fn test_outcomes_map_to_events() -> Result<()> {
        let (worker, events, dir) = idle_worker()?;
        worker.enqueue(AssetRef::new(dir.path().join("rig.ma"), 1.0));
        worker.enqueue(AssetRef::new(dir.path().join("missing.png"), 1.0));

        worker.start()?;
        let seen = collect(&events, 2);
        worker.shutdown();

        assert!(seen.iter().any(|e| matches!(e, ThumbnailEvent::Failed { .. })));
        assert!(seen
            .iter()
            .any(|e| matches!(e, ThumbnailEvent::NoThumbnail { reason: None, .. })));
        Ok(())
    }

    /// Blocks every channel read until the test opens the gate
    struct GatedExr {
        inner: FakeExr,
        gate: Receiver<()>,
        entered: Sender<()>,
        reads: AtomicUsize,
    }

    impl ExrBackend for GatedExr {
        fn read_header(&self, path: &Path) -> Result<ExrHeader, DecodeError> {
            self.inner.read_header(path)
        }

        fn read_channels(&self, path: &Path, scale: ReducedScale, target: u32) -> Result<ExrPixels, DecodeError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let _ = self.entered.send(());
            let _ = self.gate.recv_timeout(WAIT);
            self.inner.read_channels(path, scale, target)
        }
    }

    #[test]
    fn test_stop_lets_in_flight_item_finish() -> Result<()> {
        let (open, gate) = unbounded();
        let (entered_tx, entered) = unbounded();
        let backend = Arc::new(GatedExr {
            inner: FakeExr::new(64, 32, &["R", "G", "B"], 0.5),
            gate,
            entered: entered_tx,
            reads: AtomicUsize::new(0),
        });
        let exr = backend.clone();
        let fx = fixture(
            move |store: Arc<MemoryTagStore>| DecodeChain::new(FormatTable::default(), store).with_exr_backend(exr),
            0.0,
        )?;
        let (worker, events) = ThumbnailWorker::new(Arc::new(fx.pipeline), options());
        for i in 0..5 {
            worker.enqueue(AssetRef::new(fx.dir.path().join(format!("shot_{i}.exr")), 1.0));
        }

        worker.start()?;
        entered.recv_timeout(WAIT)?;
        worker.stop();
        assert_eq!(worker.queue_len(), 0);
        let before: Vec<_> = events.try_iter().collect();
        assert!(before.iter().all(|e| !e.is_terminal()));

        open.send(())?;
        worker.join();

        // Only the in-flight item reports after stop
        let in_flight = fx.dir.path().join("shot_4.exr");
        let after: Vec<_> = events.try_iter().collect();
        assert_eq!(after.len(), 1);
        assert!(matches!(&after[0], ThumbnailEvent::Ready { path, .. } if *path == in_flight));
        assert_eq!(backend.reads.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
        Ok(())
    }
}
