//! Event processing: one raw event directory in, one finished event out.
//!
//! Each step is independently fault-tolerant. A failed encode or thumbnail
//! is logged and leaves the event without that artifact; it never aborts
//! the remaining steps.

use crate::events::{frame_images, THUMBNAIL_FILE};
use crate::media::MediaTools;
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

/// Frame images named `HH-MM-SS-<frame>.jpg` by the camera daemon.
fn frame_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{2}-\d{2}-\d{2}-\d+\.jpg$").expect("valid regex"))
}

/// Unit of work dispatched by the queue monitor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessEvent: Send + Sync {
    /// Transform one raw event directory into a finished event and report
    /// its final path downstream.
    async fn process(&self, raw_path: PathBuf);
}

/// Turns a raw event directory into a finished, queryable event.
pub struct EventProcessor {
    tools: Arc<dyn MediaTools>,
    timelapse_threshold: usize,
    handoff: mpsc::Sender<PathBuf>,
}

impl EventProcessor {
    pub fn new(
        tools: Arc<dyn MediaTools>,
        timelapse_threshold: usize,
        handoff: mpsc::Sender<PathBuf>,
    ) -> Self {
        Self {
            tools,
            timelapse_threshold,
            handoff,
        }
    }

    /// Move the motion-marked `*m.jpg` frames into a `debug/` subdirectory.
    async fn split_debug_frames(&self, raw_path: &Path) -> std::io::Result<PathBuf> {
        let debug_dir = raw_path.join("debug");
        fs::create_dir_all(&debug_dir).await?;

        let mut entries = fs::read_dir(raw_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with("m.jpg") {
                fs::rename(entry.path(), debug_dir.join(&name)).await?;
            }
        }
        Ok(debug_dir)
    }

    /// Encode the primary and debug image sets, one video artifact each.
    async fn encode_videos(&self, raw_path: &Path, debug_dir: &Path) {
        let frame_count = frame_images(raw_path).map(|f| f.len()).unwrap_or(0);
        let timelapse = frame_count > self.timelapse_threshold;

        if let Err(e) = self.tools.encode_video(raw_path, timelapse).await {
            error!(path = %raw_path.display(), error = %e, "Failed to encode video");
        }
        if let Err(e) = self.tools.encode_video(debug_dir, timelapse).await {
            warn!(path = %debug_dir.display(), error = %e, "Failed to encode debug video");
        }
    }

    /// Pick the most representative frame: the one the analysis tool scores
    /// with the most changed pixels, or the quarter-point frame when no
    /// analysis is available.
    async fn best_frame(&self, raw_path: &Path) -> Option<PathBuf> {
        match self.tools.motion_scores(raw_path).await {
            Ok(scores) => {
                if let Some(best) = scores.into_iter().max_by_key(|s| s.changed) {
                    return Some(best.source);
                }
            }
            Err(e) => {
                warn!(path = %raw_path.display(), error = %e, "Motion analysis unavailable");
            }
        }

        let images = frame_images(raw_path).ok()?;
        if images.is_empty() {
            return None;
        }
        Some(raw_path.join(&images[images.len() / 4]))
    }

    async fn write_thumbnail(&self, raw_path: &Path) {
        let Some(source) = self.best_frame(raw_path).await else {
            warn!(path = %raw_path.display(), "No frame available for thumbnail");
            return;
        };
        let dest = raw_path.join(THUMBNAIL_FILE);
        if let Err(e) = self.tools.make_thumbnail(&source, &dest).await {
            error!(path = %raw_path.display(), error = %e, "Failed to create thumbnail");
        }
    }

    /// Rename the raw directory to its canonical `<parent>/<HH-MM-SS>` name,
    /// taken from the first frame's capture time. A destination collision
    /// means the event was already finalized and the rename is skipped.
    async fn finalize(&self, raw_path: &Path) -> Option<PathBuf> {
        let first_frame = frame_images(raw_path)
            .ok()?
            .into_iter()
            .find(|name| frame_name_re().is_match(name))?;
        let (capture_time, _) = first_frame.rsplit_once('-')?;

        let dest = raw_path.parent()?.join(capture_time);
        if dest.exists() {
            info!(dest = %dest.display(), "Event already finalized");
            return Some(dest);
        }

        match fs::rename(raw_path, &dest).await {
            Ok(()) => {
                info!(dest = %dest.display(), "Moved event to final location");
                Some(dest)
            }
            Err(e) => {
                error!(path = %raw_path.display(), error = %e, "Moving to destination failed");
                None
            }
        }
    }
}

#[async_trait]
impl ProcessEvent for EventProcessor {
    #[instrument(skip(self), fields(path = %raw_path.display()))]
    async fn process(&self, raw_path: PathBuf) {
        let debug_dir = match self.split_debug_frames(&raw_path).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(error = %e, "Failed to split debug frames");
                raw_path.join("debug")
            }
        };

        self.encode_videos(&raw_path, &debug_dir).await;
        self.write_thumbnail(&raw_path).await;

        if let Some(final_path) = self.finalize(&raw_path).await {
            if self.handoff.send(final_path).await.is_err() {
                warn!("Handoff channel closed, finished event not reported");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FrameMotion, MediaError, MockMediaTools};
    use std::fs::File;
    use tempfile::tempdir;

    fn create_raw_event(base: &Path) -> PathBuf {
        let raw = base.join("Camera1/2024-01-01/33");
        std::fs::create_dir_all(&raw).unwrap();
        for name in [
            "12-00-00-01.jpg",
            "12-00-00-02m.jpg",
            "12-00-02-03.jpg",
            "12-00-05-04m.jpg",
            "12-00-05-05.jpg",
        ] {
            File::create(raw.join(name)).unwrap();
        }
        raw
    }

    fn quiet_tools() -> MockMediaTools {
        let mut tools = MockMediaTools::new();
        tools.expect_encode_video().returning(|_, _| Ok(()));
        tools.expect_motion_scores().returning(|_| Ok(Vec::new()));
        tools.expect_make_thumbnail().returning(|_, _| Ok(()));
        tools
    }

    fn build_processor(tools: MockMediaTools) -> (EventProcessor, mpsc::Receiver<PathBuf>) {
        let (tx, rx) = mpsc::channel(4);
        (EventProcessor::new(Arc::new(tools), 1500, tx), rx)
    }

    #[tokio::test]
    async fn test_debug_frames_split() {
        let dir = tempdir().unwrap();
        let raw = create_raw_event(dir.path());
        let (processor, mut rx) = build_processor(quiet_tools());

        processor.process(raw.clone()).await;

        let final_path = rx.recv().await.unwrap();
        assert_eq!(final_path, dir.path().join("Camera1/2024-01-01/12-00-00"));
        assert!(final_path.join("debug/12-00-00-02m.jpg").exists());
        assert!(final_path.join("debug/12-00-05-04m.jpg").exists());
        assert!(!final_path.join("12-00-00-02m.jpg").exists());
        assert!(final_path.join("12-00-00-01.jpg").exists());
    }

    #[tokio::test]
    async fn test_finalize_collision_is_idempotent() {
        let dir = tempdir().unwrap();
        let raw = create_raw_event(dir.path());
        let dest = dir.path().join("Camera1/2024-01-01/12-00-00");
        std::fs::create_dir_all(&dest).unwrap();
        let (processor, mut rx) = build_processor(quiet_tools());

        processor.process(raw.clone()).await;

        // Destination existed: the raw directory stays put but the final
        // path is still reported.
        assert_eq!(rx.recv().await.unwrap(), dest);
        assert!(raw.exists());
    }

    #[tokio::test]
    async fn test_encoder_failure_does_not_abort() {
        let dir = tempdir().unwrap();
        let raw = create_raw_event(dir.path());

        let mut tools = MockMediaTools::new();
        tools.expect_encode_video().returning(|_, _| {
            Err(MediaError::ToolFailed {
                tool: "ffmpeg",
                status: "exit status: 1".to_string(),
                stderr: String::new(),
            })
        });
        tools.expect_motion_scores().returning(|_| Ok(Vec::new()));
        tools.expect_make_thumbnail().returning(|_, _| Ok(()));
        let (processor, mut rx) = build_processor(tools);

        processor.process(raw).await;

        // Still finalized and reported despite the failed encodes.
        let final_path = rx.recv().await.unwrap();
        assert_eq!(final_path, dir.path().join("Camera1/2024-01-01/12-00-00"));
    }

    #[tokio::test]
    async fn test_thumbnail_uses_highest_motion_frame() {
        let dir = tempdir().unwrap();
        let raw = create_raw_event(dir.path());
        let best = raw.join("12-00-02-03.jpg");

        let mut tools = MockMediaTools::new();
        tools.expect_encode_video().returning(|_, _| Ok(()));
        let scored = vec![
            FrameMotion {
                source: raw.join("12-00-00-01.jpg"),
                changed: 10,
                area: 100,
            },
            FrameMotion {
                source: best.clone(),
                changed: 420,
                area: 900,
            },
        ];
        tools
            .expect_motion_scores()
            .returning(move |_| Ok(scored.clone()));
        let expected = best.clone();
        tools
            .expect_make_thumbnail()
            .withf(move |source, _| source == expected)
            .times(1)
            .returning(|_, _| Ok(()));
        let (processor, mut rx) = build_processor(tools);

        processor.process(raw).await;
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_thumbnail_fallback_quarter_point() {
        let dir = tempdir().unwrap();
        let raw = create_raw_event(dir.path());

        let mut tools = MockMediaTools::new();
        tools.expect_encode_video().returning(|_, _| Ok(()));
        tools.expect_motion_scores().returning(|_| {
            Err(MediaError::ToolFailed {
                tool: "exiftool",
                status: "exit status: 1".to_string(),
                stderr: String::new(),
            })
        });
        // Debug frames are split off first, leaving three frames; 3 / 4 == 0.
        let expected = raw.join("12-00-00-01.jpg");
        tools
            .expect_make_thumbnail()
            .withf(move |source, _| source == expected)
            .times(1)
            .returning(|_, _| Ok(()));
        let (processor, mut rx) = build_processor(tools);

        processor.process(raw).await;
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_directory_not_reported() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("Camera1/2024-01-01/34");
        std::fs::create_dir_all(&raw).unwrap();
        let (processor, mut rx) = build_processor(quiet_tools());

        processor.process(raw).await;

        drop(processor);
        assert!(rx.recv().await.is_none());
    }
}
