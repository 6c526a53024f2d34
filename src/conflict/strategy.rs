use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a divergent local/remote pair is resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
  /// Keep the local version
  ClientWins,
  /// Keep the remote version
  #[default]
  ServerWins,
  /// Keep whichever version has the later timestamp, local on ties
  MostRecent,
  /// Remote version with both notes combined
  Merge,
  /// Remote version for the record, local version kept as a new record
  KeepBoth,
  /// Ask the user
  Manual,
}

impl ConflictStrategy {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::ClientWins => "client_wins",
      Self::ServerWins => "server_wins",
      Self::MostRecent => "most_recent",
      Self::Merge => "merge",
      Self::KeepBoth => "keep_both",
      Self::Manual => "manual",
    }
  }
}

impl fmt::Display for ConflictStrategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ConflictStrategy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
      "client_wins" => Ok(Self::ClientWins),
      "server_wins" => Ok(Self::ServerWins),
      "most_recent" => Ok(Self::MostRecent),
      "merge" => Ok(Self::Merge),
      "keep_both" => Ok(Self::KeepBoth),
      "manual" => Ok(Self::Manual),
      other => Err(format!("unknown conflict strategy '{}'", other)),
    }
  }
}
