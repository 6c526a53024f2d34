//! Conflict resolution between local and remote versions of a record.

mod resolver;
mod strategy;

pub use resolver::{
  is_conflict, merge_records, ConflictChoice, ConflictDecision, ConflictRequest, ConflictResolver,
  Resolution,
};
pub use strategy::ConflictStrategy;
