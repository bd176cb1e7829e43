//! Camtrap Event Service
//!
//! Queue-driven processing pipeline and expiring event cache for
//! motion-detection cameras. The camera daemon writes raw image sequences
//! into per-camera directories and touches a marker file per completed
//! event; this service turns those raw directories into finished,
//! queryable events and ages old events out under a retention policy.
//!
//! ## Architecture
//!
//! ```text
//! <base>/queue/                <base>/CameraN/date/time/
//! ┌──────────────┐            ┌──────────────────────────┐
//! │ Marker files │───────────▶│ Raw event directories    │
//! └──────────────┘            └──────────────────────────┘
//!        │                               │
//!        ▼                               ▼
//! ┌──────────────┐            ┌──────────────────────────┐
//! │ Queue        │  bounded   │ Event Processor          │
//! │ Monitor      │──────────▶ │ debug split, encode,     │
//! └──────────────┘  pool      │ thumbnail, finalize      │
//!                             └──────────────────────────┘
//!                                        │ final path
//!                                        ▼
//!                             ┌──────────────────────────┐
//!                             │ Event Cache              │
//!                             │ index + .details.json    │
//!                             │ expiration janitor       │
//!                             └──────────────────────────┘
//!                                        │ expired
//!                                        ▼
//!                             <base>/delete_queue/<sweep>/
//!                             (background deletion)
//! ```

pub mod cache;
pub mod config;
pub mod events;
pub mod media;
pub mod processor;
pub mod queue;

pub use cache::EventCache;
pub use config::ServiceConfig;
pub use events::{Artifact, Event};
pub use media::{FfmpegTools, MediaTools};
pub use processor::{EventProcessor, ProcessEvent};
pub use queue::{QueueError, QueueMonitor};
