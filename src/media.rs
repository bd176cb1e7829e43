//! External media tooling behind a mockable seam.
//!
//! The encoder, the motion-analysis tool, and the thumbnail resize are
//! opaque commands as far as the pipeline is concerned. The [`MediaTools`]
//! trait is the seam; [`FfmpegTools`] is the real implementation driving
//! `ffmpeg` and `exiftool` through `tokio::process`.

use crate::config::ProcessingConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from the external media tools.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        source: io::Error,
    },

    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: &'static str,
        status: String,
        stderr: String,
    },

    #[error("Analysis output is not valid JSON: {0}")]
    BadAnalysis(#[from] serde_json::Error),
}

/// Per-frame motion measurement extracted from the analysis tool.
#[derive(Debug, Clone)]
pub struct FrameMotion {
    /// Image the measurement belongs to
    pub source: PathBuf,
    /// Number of changed pixels
    pub changed: u64,
    /// Detected motion area (width * height of the bounding box)
    pub area: u64,
}

/// Seam over the external encoder, analyzer, and resize commands.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaTools: Send + Sync {
    /// Encode every frame image in `dir` into a `video.m4v` inside it.
    async fn encode_video(&self, dir: &Path, timelapse: bool) -> Result<(), MediaError>;

    /// Motion measurements for the frames in `dir`, unordered.
    async fn motion_scores(&self, dir: &Path) -> Result<Vec<FrameMotion>, MediaError>;

    /// Write a bounded-dimension thumbnail of `source` to `dest`.
    async fn make_thumbnail(&self, source: &Path, dest: &Path) -> Result<(), MediaError>;
}

/// Real tooling: `ffmpeg` for encoding and resizing, `exiftool` for the
/// motion descriptors the camera daemon embeds in each frame's EXIF data.
pub struct FfmpegTools {
    framerate: u32,
    video_width: u32,
    video_bitrate: String,
    thumbnail_width: u32,
    thumbnail_height: u32,
}

impl FfmpegTools {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            framerate: config.framerate,
            video_width: config.video_width,
            video_bitrate: config.video_bitrate.clone(),
            thumbnail_width: config.thumbnail_width,
            thumbnail_height: config.thumbnail_height,
        }
    }
}

async fn run(tool: &'static str, command: &mut Command) -> Result<Vec<u8>, MediaError> {
    let output = command
        .output()
        .await
        .map_err(|source| MediaError::Spawn { tool, source })?;
    if !output.status.success() {
        return Err(MediaError::ToolFailed {
            tool,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output.stdout)
}

#[async_trait]
impl MediaTools for FfmpegTools {
    async fn encode_video(&self, dir: &Path, timelapse: bool) -> Result<(), MediaError> {
        let mut filter = format!("scale={}:-2", self.video_width);
        if timelapse {
            filter.push_str(",setpts=0.0625*PTS");
        }

        let mut command = Command::new("ffmpeg");
        command
            .current_dir(dir)
            .arg("-f")
            .arg("image2")
            .arg("-pattern_type")
            .arg("glob")
            .arg("-framerate")
            .arg(self.framerate.to_string())
            .arg("-i")
            .arg("*.jpg")
            .arg("-vf")
            .arg(&filter)
            .arg("-c:v")
            .arg("h264")
            .arg("-b:v")
            .arg(&self.video_bitrate)
            .arg("video.m4v");

        debug!(dir = %dir.display(), timelapse, "Encoding video");
        run("ffmpeg", &mut command).await?;
        Ok(())
    }

    async fn motion_scores(&self, dir: &Path) -> Result<Vec<FrameMotion>, MediaError> {
        let mut command = Command::new("exiftool");
        command
            .arg("-json")
            .arg("-q")
            .arg("-ImageDescription")
            .arg(dir);

        let stdout = run("exiftool", &mut command).await?;
        let entries: Vec<DescribedImage> = serde_json::from_slice(&stdout)?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let descriptor = parse_descriptor(entry.image_description.as_deref()?);
                Some(FrameMotion {
                    source: entry.source_file,
                    changed: descriptor.0,
                    area: descriptor.1,
                })
            })
            .collect())
    }

    async fn make_thumbnail(&self, source: &Path, dest: &Path) -> Result<(), MediaError> {
        let filter = format!(
            "scale={}:{}:force_original_aspect_ratio=decrease",
            self.thumbnail_width, self.thumbnail_height
        );

        let mut command = Command::new("ffmpeg");
        command
            .arg("-y")
            .arg("-i")
            .arg(source)
            .arg("-vf")
            .arg(&filter)
            .arg(dest);

        debug!(source = %source.display(), dest = %dest.display(), "Writing thumbnail");
        run("ffmpeg", &mut command).await?;
        Ok(())
    }
}

/// One entry of the analysis tool's JSON output.
#[derive(Debug, Deserialize)]
struct DescribedImage {
    #[serde(rename = "SourceFile")]
    source_file: PathBuf,
    #[serde(rename = "ImageDescription")]
    image_description: Option<String>,
}

/// Split a `<changed>-<noise>-<width>-<height>-<X>-<Y>` motion descriptor
/// into (changed, area). A malformed descriptor counts as no motion.
fn parse_descriptor(description: &str) -> (u64, u64) {
    let fields = description
        .split('-')
        .map(str::parse::<u64>)
        .collect::<Result<Vec<_>, _>>();
    match fields.as_deref() {
        Ok([changed, _noise, width, height, _x, _y]) => (*changed, width * height),
        _ => (0, 0),
    }
}
