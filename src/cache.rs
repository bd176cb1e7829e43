//! Concurrency-safe index of finished events with time-based eviction.
//!
//! The cache is the single shared instance the whole process reads event
//! metadata through. Every operation, including the expiration sweep that
//! `set` may trigger, runs under one exclusive lock so the index never
//! observes a torn intermediate state. Expired events are evicted with a
//! two-phase delete: a fast staging rename under the lock, then a detached
//! background task purges the staging area off the request path.

use crate::config::CacheConfig;
use crate::events::{self, Event};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Staging area for evicted events pending background deletion.
pub const DELETE_QUEUE_DIR: &str = "delete_queue";

/// Per-camera directories are named `Camera<N>` by the camera daemon.
fn camera_segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Camera\d+$").expect("valid regex"))
}

fn date_dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid regex"))
}

fn time_dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{2}-\d{2}-\d{2}$").expect("valid regex"))
}

struct CacheInner {
    index: BTreeMap<PathBuf, Event>,
    base_dir: PathBuf,
    keep_window: Duration,
    check_interval: Duration,
    last_check: DateTime<Utc>,
}

/// Process-wide index of finished events, keyed by event directory path.
pub struct EventCache {
    inner: Mutex<CacheInner>,
}

impl EventCache {
    pub fn new(base_dir: PathBuf, config: &CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                index: BTreeMap::new(),
                base_dir,
                keep_window: config.keep_window(),
                check_interval: config.check_interval(),
                // Epoch start so the first insert after startup sweeps
                last_check: DateTime::<Utc>::UNIX_EPOCH,
            }),
        }
    }

    /// Replace the base directory. Startup-time only.
    pub fn set_base_dir(&self, base_dir: PathBuf) {
        self.inner.lock().base_dir = base_dir;
    }

    /// Replace the retention window. Startup-time only.
    pub fn set_keep_days(&self, days: i64) {
        self.inner.lock().keep_window = Duration::days(days);
    }

    /// Replace the sweep check interval. Startup-time only.
    pub fn set_check_interval_mins(&self, minutes: i64) {
        self.inner.lock().check_interval = Duration::minutes(minutes);
    }

    /// Cached entry for `path`, if present. Never falls through to disk.
    pub fn get(&self, path: &Path) -> Option<Event> {
        self.inner.lock().index.get(path).cloned()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or overwrite an entry, then run the interval-gated expiration
    /// check. Returns whether the key is still present afterwards; a stale
    /// event can be evicted by the very sweep its own insertion triggered.
    pub fn set(&self, mut event: Event) -> bool {
        event.normalize();
        let path = event.event_path.clone();

        let mut inner = self.inner.lock();
        inner.index.insert(path.clone(), event);
        Self::maybe_sweep(&mut inner);
        inner.index.contains_key(&path)
    }

    /// Look up an event, falling back to the detail file and then to a full
    /// directory scan. Returns `None` only when the event cannot be read at
    /// all or is already past the retention window (never resurrected).
    pub fn resolve(&self, path: &Path) -> Option<Event> {
        if let Some(event) = self.get(path) {
            return Some(event);
        }

        let base_dir = self.inner.lock().base_dir.clone();
        let event = match events::read_details(path) {
            Some(event) => event,
            None => {
                let event = match events::scan_event(&base_dir, path) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "Event not resolvable");
                        return None;
                    }
                };
                if let Err(e) = events::write_details(&event) {
                    warn!(path = %path.display(), error = %e, "Failed to persist detail file");
                }
                event
            }
        };

        if self.set(event) {
            self.get(path)
        } else {
            None
        }
    }

    /// All cached event paths in lexical (== chronological) order,
    /// optionally filtered to one camera, optionally newest first.
    pub fn list(&self, camera: Option<&str>, reverse: bool) -> Vec<PathBuf> {
        let inner = self.inner.lock();
        let mut paths: Vec<PathBuf> = match camera {
            Some(camera) => {
                let prefix = inner.base_dir.join(camera);
                inner
                    .index
                    .keys()
                    .filter(|path| path.starts_with(&prefix))
                    .cloned()
                    .collect()
            }
            None => inner.index.keys().cloned().collect(),
        };
        if reverse {
            paths.reverse();
        }
        paths
    }

    /// Walk the event tree and resolve every finished event so the index is
    /// warm before the first lookup. Returns the number of cached events.
    #[instrument(skip(self))]
    pub fn preload(&self) -> usize {
        let base_dir = self.inner.lock().base_dir.clone();
        let mut count = 0;

        for camera_dir in matching_dirs(&base_dir, camera_segment_re()) {
            for date_dir in matching_dirs(&camera_dir, date_dir_re()) {
                for event_dir in matching_dirs(&date_dir, time_dir_re()) {
                    if self.resolve(&event_dir).is_some() {
                        count += 1;
                    }
                }
            }
        }

        info!(events = count, "Event cache preloaded");
        count
    }

    /// Run the expiration sweep immediately, regardless of the check
    /// interval.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock();
        Self::sweep_locked(&mut inner, Utc::now());
    }

    /// Interval-gated sweep, called at the end of every `set`. A no-op
    /// unless `check_interval` has elapsed since the last sweep.
    fn maybe_sweep(inner: &mut CacheInner) {
        let now = Utc::now();
        if now - inner.last_check <= inner.check_interval {
            return;
        }
        Self::sweep_locked(inner, now);
    }

    /// Evict every entry older than the retention window: group by calendar
    /// day, stage each expired event directory into a fresh area under
    /// `delete_queue/`, drop the entries from the index, then hand the
    /// staging area to a detached deletion task.
    fn sweep_locked(inner: &mut CacheInner, now: DateTime<Utc>) {
        inner.last_check = now;
        let cutoff = now - inner.keep_window;

        // Group expired events by their calendar-day directory. A day may
        // hold both expired and retained events, so moves are per-event.
        let mut by_day: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
        for (path, event) in &inner.index {
            if event.start < cutoff {
                if let Some(day) = path.parent() {
                    by_day.entry(day.to_path_buf()).or_default().push(path.clone());
                }
            }
        }
        if by_day.is_empty() {
            return;
        }

        let staging_root = inner
            .base_dir
            .join(DELETE_QUEUE_DIR)
            .join(Uuid::new_v4().to_string());

        for (day, expired) in by_day {
            let Some(camera) = day.iter().rev().find_map(|segment| {
                let segment = segment.to_string_lossy();
                camera_segment_re()
                    .is_match(&segment)
                    .then(|| segment.into_owned())
            }) else {
                // Never guess a deletion target; these entries stay cached
                // and are reconsidered next sweep.
                error!(day = %day.display(), "No camera segment in day path, skipping");
                continue;
            };
            let Some(day_name) = day.file_name().map(|name| name.to_owned()) else {
                error!(day = %day.display(), "Day path has no final segment, skipping");
                continue;
            };

            let staging_day = staging_root.join(&camera).join(&day_name);
            if let Err(e) = fs::create_dir_all(&staging_day) {
                error!(day = %staging_day.display(), error = %e, "Failed to create staging directory");
                continue;
            }

            for event_path in expired {
                let Some(name) = event_path.file_name().map(|name| name.to_owned()) else {
                    continue;
                };
                match fs::rename(&event_path, staging_day.join(&name)) {
                    Ok(()) => {
                        inner.index.remove(&event_path);
                        info!(path = %event_path.display(), "Expired event staged for deletion");
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        // Directory already gone externally; the index entry
                        // is all that is left to clean up.
                        warn!(path = %event_path.display(), "Expired event directory missing, dropping entry");
                        inner.index.remove(&event_path);
                    }
                    Err(e) => {
                        error!(path = %event_path.display(), error = %e, "Failed to stage expired event");
                    }
                }
            }
        }

        // The slow recursive delete runs outside the lock and off the
        // request path; errors are ignored, a leftover staging directory is
        // re-deleted by a later sweep's task at worst.
        if staging_root.exists() {
            tokio::spawn(async move {
                let _ = tokio::fs::remove_dir_all(&staging_root).await;
            });
        }
    }
}

fn matching_dirs(parent: &Path, pattern: &Regex) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(parent) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.path().is_dir() && pattern.is_match(&entry.file_name().to_string_lossy())
        })
        .map(|entry| entry.path())
        .collect();
    dirs.sort();
    dirs
}
