//! Domain records exchanged between the device and the remote store.

mod profile;
mod record;

pub use profile::UserProfile;
pub use record::{EmotionRecord, EmotionType, SyncStatus};
