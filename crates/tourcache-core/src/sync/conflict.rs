use serde::Serialize;
use tracing::debug;

use crate::config::ConflictStrategy;
use crate::models::Cacheable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Resolution {
    ClientWins,
    ServerWins,
    Merged,
    ManualRequired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution<T> {
    pub resolved: bool,
    pub resolution: Resolution,
    /// The winning record; `None` when manual resolution is required
    pub data: Option<T>,
}

impl<T> ConflictResolution<T> {
    fn winner(resolution: Resolution, data: T) -> Self {
        Self {
            resolved: true,
            resolution,
            data: Some(data),
        }
    }

    fn manual() -> Self {
        Self {
            resolved: false,
            resolution: Resolution::ManualRequired,
            data: None,
        }
    }
}

/// Last-writer-wins: the remote copy is newer only if its timestamp is
/// strictly later. A missing timestamp sorts before any real one.
fn remote_is_newer<T: Cacheable>(local: &T, remote: &T) -> bool {
    remote.modified_at() > local.modified_at()
}

/// Decide between two divergent copies of the same record.
pub fn resolve_conflict<T: Cacheable>(
    local: &T,
    remote: &T,
    strategy: ConflictStrategy,
) -> ConflictResolution<T> {
    let resolution = match strategy {
        ConflictStrategy::Client => ConflictResolution::winner(Resolution::ClientWins, local.clone()),
        ConflictStrategy::Server => ConflictResolution::winner(Resolution::ServerWins, remote.clone()),
        ConflictStrategy::Smart => {
            if remote_is_newer(local, remote) {
                ConflictResolution::winner(Resolution::ServerWins, remote.clone())
            } else {
                ConflictResolution::winner(Resolution::ClientWins, local.clone())
            }
        }
        ConflictStrategy::Merge => {
            let merged = if remote_is_newer(local, remote) {
                local.merge(remote)
            } else {
                remote.merge(local)
            };
            match merged {
                Some(data) => ConflictResolution::winner(Resolution::Merged, data),
                None => ConflictResolution::manual(),
            }
        }
        ConflictStrategy::Manual => ConflictResolution::manual(),
    };

    debug!(
        id = local.record_id(),
        strategy = strategy.as_str(),
        resolution = ?resolution.resolution,
        "Conflict resolved"
    );
    resolution
}
