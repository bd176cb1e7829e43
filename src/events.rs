//! Event data model and per-event detail persistence.
//!
//! A finished event is a directory `<base>/<camera>/<date>/<time>/` holding
//! the captured frame images plus the derived artifacts (encoded video,
//! thumbnail). Its metadata is persisted next to the frames as a hidden
//! `.details.json` file so the cache can cold-load it after a restart.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Detail file name inside an event directory.
pub const DETAILS_FILE: &str = ".details.json";

/// Presence marker for user-pinned events.
pub const SAVED_FILE: &str = ".saved";

/// Thumbnail artifact name inside an event directory.
pub const THUMBNAIL_FILE: &str = "thumbnail.jpg";

/// Video container extensions probed when scanning, in preference order.
pub const VIDEO_EXTENSIONS: &[&str] = &["m4v", "webm", "mp4", "ogg"];

/// Sentinel reference served for an artifact that was never produced.
const MISSING_ARTIFACT: &str = "images/missing.jpg";

/// Errors that can occur while reading or deriving event details.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Event path does not decompose into camera/date/time: {0}")]
    InvalidPath(PathBuf),

    #[error("Image name carries no capture time: {0}")]
    InvalidImageName(String),

    #[error("Detail file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Detail file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reference to a derived artifact, either present (path relative to the
/// base directory) or the explicit missing sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Artifact {
    Present(String),
    Missing,
}

impl Artifact {
    pub fn is_missing(&self) -> bool {
        matches!(self, Artifact::Missing)
    }
}

impl From<String> for Artifact {
    fn from(s: String) -> Self {
        if s == MISSING_ARTIFACT {
            Artifact::Missing
        } else {
            Artifact::Present(s)
        }
    }
}

impl From<Artifact> for String {
    fn from(a: Artifact) -> Self {
        match a {
            Artifact::Present(s) => s,
            Artifact::Missing => MISSING_ARTIFACT.to_string(),
        }
    }
}

/// One finished motion-capture episode.
///
/// Serializes to the on-disk `.details.json` shape; timestamps are ISO-8601
/// strings on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Capture time of the first frame
    pub start: DateTime<Utc>,

    /// Capture time of the last frame
    pub end: DateTime<Utc>,

    /// Primary encoded video
    pub video: Artifact,

    /// Video encoded from the motion-marked debug frames
    pub debug_video: Artifact,

    /// Representative still image
    pub thumbnail: Artifact,

    /// Reserved frame listing, persisted as an empty list
    #[serde(default)]
    pub images: Vec<String>,

    /// User pinned the event
    #[serde(default)]
    pub saved: bool,

    /// Absolute event directory path, the cache key
    pub event_path: PathBuf,
}

impl Event {
    /// Clamp the timestamps so `start <= end` holds.
    pub fn normalize(&mut self) {
        if self.end < self.start {
            std::mem::swap(&mut self.start, &mut self.end);
        }
    }
}

/// Decompose an event path into its `(camera, date, time)` tail segments.
pub fn path_components(path: &Path) -> Result<(String, String, String), EventError> {
    let mut tail = path.iter().rev().map(|c| c.to_string_lossy().into_owned());
    let (Some(time), Some(date), Some(camera)) = (tail.next(), tail.next(), tail.next()) else {
        return Err(EventError::InvalidPath(path.to_path_buf()));
    };
    Ok((camera, date, time))
}

/// Capture time encoded in an event path's `<date>/<time>` tail.
pub fn path_timestamp(path: &Path) -> Result<DateTime<Utc>, EventError> {
    let (_, date, time) = path_components(path)?;
    let dt = NaiveDateTime::parse_from_str(
        &format!("{} {}", date, time.replace('-', ":")),
        "%Y-%m-%d %H:%M:%S",
    )
    .map_err(|_| EventError::InvalidPath(path.to_path_buf()))?;
    Ok(dt.and_utc())
}

/// Capture time of a frame image, from the event date and the image's
/// `HH-MM-SS-<frame>` name.
pub fn image_timestamp(event_date: NaiveDate, image: &str) -> Result<DateTime<Utc>, EventError> {
    let stem = image
        .rsplit_once('-')
        .map(|(prefix, _)| prefix)
        .ok_or_else(|| EventError::InvalidImageName(image.to_string()))?;
    let time = NaiveTime::parse_from_str(stem, "%H-%M-%S")
        .map_err(|_| EventError::InvalidImageName(image.to_string()))?;
    Ok(event_date.and_time(time).and_utc())
}

/// Read the persisted detail file, if one exists.
///
/// A corrupt detail file is not fatal; the caller recomputes the details.
pub fn read_details(event_path: &Path) -> Option<Event> {
    let details_path = event_path.join(DETAILS_FILE);
    let contents = match fs::read_to_string(&details_path) {
        Ok(contents) => contents,
        Err(_) => return None,
    };
    match serde_json::from_str(&contents) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(path = %details_path.display(), error = %e, "Unreadable detail file, recomputing");
            None
        }
    }
}

/// Persist the detail file next to the event's frames.
pub fn write_details(event: &Event) -> Result<(), EventError> {
    let details_path = event.event_path.join(DETAILS_FILE);
    let contents = serde_json::to_string(event)?;
    fs::write(&details_path, contents)?;
    Ok(())
}

/// Sorted frame images directly inside an event directory, thumbnail excluded.
pub fn frame_images(event_path: &Path) -> Result<Vec<String>, EventError> {
    let mut images = Vec::new();
    for entry in fs::read_dir(event_path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".jpg") && name != THUMBNAIL_FILE {
            images.push(name);
        }
    }
    images.sort();
    Ok(images)
}

/// Derive an event's details by scanning its directory.
///
/// Used when neither the cache nor the detail file has the event; the result
/// is persisted so the next cold lookup is a single file read.
pub fn scan_event(base_dir: &Path, event_path: &Path) -> Result<Event, EventError> {
    let (_, date, _) = path_components(event_path)?;
    let event_date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|_| EventError::InvalidPath(event_path.to_path_buf()))?;

    let rel = event_path.strip_prefix(base_dir).unwrap_or(event_path);
    let rel_ref = |name: &str| rel.join(name).to_string_lossy().into_owned();

    let images = frame_images(event_path)?;

    let thumbnail = if event_path.join(THUMBNAIL_FILE).exists() {
        Artifact::Present(rel_ref(THUMBNAIL_FILE))
    } else if !images.is_empty() {
        // No derived thumbnail yet; fall back to the quarter-point frame
        Artifact::Present(rel_ref(&images[images.len() / 4]))
    } else {
        Artifact::Missing
    };

    // Capture window from the first and last frame that carry a time
    let mut timestamps = images
        .iter()
        .filter_map(|img| image_timestamp(event_date, img).ok());
    let (start, end) = match (timestamps.next(), timestamps.last()) {
        (Some(first), Some(last)) => (first, last),
        (Some(first), None) => (first, first),
        _ => {
            debug!(path = %event_path.display(), "No timestamped frames, using current time");
            let now = Utc::now();
            (now, now)
        }
    };

    let mut videos = [Artifact::Missing, Artifact::Missing];
    for (slot, subdir) in videos.iter_mut().zip([None, Some("debug")]) {
        let dir = match subdir {
            Some(sub) => event_path.join(sub),
            None => event_path.to_path_buf(),
        };
        for ext in VIDEO_EXTENSIONS {
            let name = format!("video.{ext}");
            if dir.join(&name).exists() {
                let rel_name = match subdir {
                    Some(sub) => format!("{sub}/{name}"),
                    None => name,
                };
                *slot = Artifact::Present(rel_ref(&rel_name));
                break;
            }
        }
    }
    let [video, debug_video] = videos;

    Ok(Event {
        start,
        end,
        video,
        debug_video,
        thumbnail,
        images: Vec::new(),
        saved: event_path.join(SAVED_FILE).exists(),
        event_path: event_path.to_path_buf(),
    })
}
