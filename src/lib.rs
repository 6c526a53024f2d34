//! Offline-first synchronization engine for emotion journal records.
//!
//! Records are validated, stored locally, cached, and delivered to a remote
//! document store through a persistent operation queue. Divergent versions
//! are settled by the conflict resolver, and every record's progress is
//! tracked and published as status events.

pub mod cache;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod model;
pub mod queue;
pub mod records;
pub mod remote;
pub mod status;
pub mod validation;

pub use engine::{PullReport, SaveOutcome, SyncEngine, SyncReport, SyncSettings};
pub use error::{RemoteError, Result, SyncError};
pub use model::{EmotionRecord, EmotionType, SyncStatus, UserProfile};
