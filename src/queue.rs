//! Filesystem work queue: marker decoding and the polling monitor that
//! drains markers into a bounded pool of event processors.
//!
//! The camera daemon signals a completed raw event by touching a marker
//! file in `<base>/queue/`. Marker names encode the raw event directory
//! path with `_` standing in for the path separator. Each marker is
//! consumed at most once: the monitor deletes it before dispatching.

use crate::config::QueueConfig;
use crate::processor::ProcessEvent;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Stand-in for the path separator in marker names.
const MARKER_DELIMITER: char = '_';

/// Errors from the queue monitor.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue directory {0} does not exist (is the camera daemon running?)")]
    MissingQueueDir(PathBuf),

    #[error("Failed to read queue directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode a marker name into the raw event directory path relative to the
/// base directory.
///
/// Splits into at most three segments (camera, date, directory name), so
/// the raw directory name itself may contain the delimiter.
pub fn decode_marker(name: &str) -> PathBuf {
    name.splitn(3, MARKER_DELIMITER).collect()
}

/// Continuously drains the queue directory into a bounded pool of
/// concurrent event processor executions.
pub struct QueueMonitor<P> {
    base_dir: PathBuf,
    queue_dir: PathBuf,
    poll_interval: Duration,
    max_workers: usize,
    processor: Arc<P>,
}

impl<P: ProcessEvent + 'static> QueueMonitor<P> {
    /// Create a monitor over `<base>/queue/`. A missing queue directory is
    /// a startup-abort condition: the camera daemon is not running.
    pub fn new(
        base_dir: PathBuf,
        queue_dir: PathBuf,
        config: &QueueConfig,
        processor: Arc<P>,
    ) -> Result<Self, QueueError> {
        if !queue_dir.is_dir() {
            return Err(QueueError::MissingQueueDir(queue_dir));
        }
        Ok(Self {
            base_dir,
            queue_dir,
            poll_interval: config.poll_interval(),
            max_workers: config.worker_bound(),
            processor,
        })
    }

    /// Poll loop: sleep, reap finished workers, then dispatch markers while
    /// pool capacity remains. On cancellation, stop accepting markers and
    /// block until every in-flight worker has completed.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut workers: JoinSet<()> = JoinSet::new();

        info!(
            queue = %self.queue_dir.display(),
            max_workers = self.max_workers,
            "Queue monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            while workers.try_join_next().is_some() {}

            if let Err(e) = self.dispatch_ready(&mut workers) {
                warn!(error = %e, "Queue poll failed");
            }
        }

        info!(in_flight = workers.len(), "Queue monitor draining");
        while workers.join_next().await.is_some() {}
        info!("Queue monitor stopped");
    }

    /// Dispatch markers in directory-listing order until the pool is full
    /// or the queue is empty. Each marker is deleted before its work is
    /// submitted, so it is consumed at most once.
    fn dispatch_ready(&self, workers: &mut JoinSet<()>) -> Result<(), QueueError> {
        if workers.len() >= self.max_workers {
            return Ok(());
        }

        for marker in self.list_markers()? {
            if workers.len() >= self.max_workers {
                break;
            }

            let marker_path = self.queue_dir.join(&marker);
            if let Err(e) = fs::remove_file(&marker_path) {
                warn!(marker = %marker, error = %e, "Failed to remove marker");
                continue;
            }

            let raw_path = self.base_dir.join(decode_marker(&marker));
            if !raw_path.is_dir() {
                // The camera daemon never resends a marker; drop it.
                error!(marker = %marker, path = %raw_path.display(), "Marker does not decode to an event directory, dropping");
                continue;
            }

            let processor = Arc::clone(&self.processor);
            workers.spawn(async move {
                processor.process(raw_path).await;
            });
        }

        Ok(())
    }

    fn list_markers(&self) -> Result<Vec<String>, QueueError> {
        let mut markers: Vec<String> = fs::read_dir(&self.queue_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        markers.sort();
        Ok(markers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::fs::File;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Encode the inverse of [`decode_marker`], for fixtures.
    fn encode_marker(rel_path: &Path) -> String {
        rel_path
            .iter()
            .map(|c| c.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Records processed paths and tracks peak concurrency.
    struct TrackingProcessor {
        processed: Mutex<Vec<PathBuf>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        work_time: Duration,
    }

    impl TrackingProcessor {
        fn new(work_time: Duration) -> Self {
            Self {
                processed: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                work_time,
            }
        }

        fn processed_count(&self) -> usize {
            self.processed.lock().len()
        }
    }

    #[async_trait]
    impl ProcessEvent for TrackingProcessor {
        async fn process(&self, raw_path: PathBuf) {
            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_running, Ordering::SeqCst);
            tokio::time::sleep(self.work_time).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.processed.lock().push(raw_path);
        }
    }

    fn test_queue_config(max_workers: usize) -> QueueConfig {
        QueueConfig {
            poll_interval_secs: 1,
            max_workers,
            handoff_capacity: 16,
        }
    }

    fn setup(base: &Path) -> PathBuf {
        let queue_dir = base.join("queue");
        fs::create_dir_all(&queue_dir).unwrap();
        queue_dir
    }

    fn drop_marker(base: &Path, queue_dir: &Path, rel_event: &str) {
        fs::create_dir_all(base.join(rel_event)).unwrap();
        let marker = encode_marker(Path::new(rel_event));
        File::create(queue_dir.join(marker)).unwrap();
    }

    async fn wait_until(deadline_polls: u32, mut done: impl FnMut() -> bool) {
        for _ in 0..deadline_polls {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        panic!("condition not reached before timeout");
    }

    #[test]
    fn test_marker_round_trip() {
        let rel = Path::new("CameraA/2024-01-01/12-00-00_raw");
        let marker = encode_marker(rel);
        assert_eq!(marker, "CameraA_2024-01-01_12-00-00_raw");
        assert_eq!(decode_marker(&marker), rel);

        assert_eq!(
            decode_marker("Camera1_2024-01-01_33"),
            Path::new("Camera1/2024-01-01/33")
        );
    }

    #[test]
    fn test_missing_queue_dir_is_fatal() {
        let dir = tempdir().unwrap();
        let result = QueueMonitor::new(
            dir.path().to_path_buf(),
            dir.path().join("queue"),
            &test_queue_config(1),
            Arc::new(TrackingProcessor::new(Duration::ZERO)),
        );
        assert!(matches!(result, Err(QueueError::MissingQueueDir(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_dispatched_once() {
        let dir = tempdir().unwrap();
        let queue_dir = setup(dir.path());
        drop_marker(dir.path(), &queue_dir, "CameraA/2024-01-01/12-00-00_raw");

        let processor = Arc::new(TrackingProcessor::new(Duration::ZERO));
        let monitor = QueueMonitor::new(
            dir.path().to_path_buf(),
            queue_dir.clone(),
            &test_queue_config(2),
            processor.clone(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { monitor.run(cancel).await })
        };

        wait_until(100, || processor.processed_count() == 1).await;
        cancel.cancel();
        handle.await.unwrap();

        let processed = processor.processed.lock();
        assert_eq!(
            processed.as_slice(),
            &[dir.path().join("CameraA/2024-01-01/12-00-00_raw")]
        );
        assert_eq!(fs::read_dir(&queue_dir).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_marker_dropped() {
        let dir = tempdir().unwrap();
        let queue_dir = setup(dir.path());
        // Marker names an event directory that does not exist.
        File::create(queue_dir.join("CameraA_2024-01-01_99")).unwrap();
        drop_marker(dir.path(), &queue_dir, "CameraA/2024-01-01/33");

        let processor = Arc::new(TrackingProcessor::new(Duration::ZERO));
        let monitor = QueueMonitor::new(
            dir.path().to_path_buf(),
            queue_dir.clone(),
            &test_queue_config(2),
            processor.clone(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { monitor.run(cancel).await })
        };

        wait_until(100, || processor.processed_count() == 1).await;
        cancel.cancel();
        handle.await.unwrap();

        // Both markers consumed, only the valid one processed, no retry.
        assert_eq!(fs::read_dir(&queue_dir).unwrap().count(), 0);
        assert_eq!(processor.processed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bound_never_exceeded() {
        let dir = tempdir().unwrap();
        let queue_dir = setup(dir.path());
        for i in 0..6 {
            drop_marker(
                dir.path(),
                &queue_dir,
                &format!("Camera1/2024-01-01/{i:02}-00-00"),
            );
        }

        let processor = Arc::new(TrackingProcessor::new(Duration::from_secs(10)));
        let monitor = QueueMonitor::new(
            dir.path().to_path_buf(),
            queue_dir,
            &test_queue_config(2),
            processor.clone(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { monitor.run(cancel).await })
        };

        wait_until(1000, || processor.processed_count() == 6).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(processor.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(processor.processed_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_in_flight_work() {
        let dir = tempdir().unwrap();
        let queue_dir = setup(dir.path());
        drop_marker(dir.path(), &queue_dir, "Camera1/2024-01-01/33");

        let processor = Arc::new(TrackingProcessor::new(Duration::from_secs(30)));
        let monitor = QueueMonitor::new(
            dir.path().to_path_buf(),
            queue_dir,
            &test_queue_config(1),
            processor.clone(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { monitor.run(cancel).await })
        };

        // Wait for the worker to start, then cancel while it is in flight.
        wait_until(100, || processor.running.load(Ordering::SeqCst) == 1).await;
        cancel.cancel();
        handle.await.unwrap();

        // run() returned only after the worker finished.
        assert_eq!(processor.processed_count(), 1);
        assert_eq!(processor.running.load(Ordering::SeqCst), 0);
    }
}
