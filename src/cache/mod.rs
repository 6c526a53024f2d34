//! Generic caching layer for data persistence and offline support.
//!
//! This module provides a two-tier cache that:
//! - Serves fresh entries from memory
//! - Writes every mutation through to a persistent key/value repository
//! - Degrades to disk, then to stale memory, when a fetch fails

mod manager;
mod storage;
mod traits;

pub use manager::CacheManager;
pub use storage::{KeyValueRepository, MemoryRepository, SqliteRepository};
pub use traits::{CacheEntry, CacheResult, CacheSource};
