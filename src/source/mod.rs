//! Routing-spec sources (spec.md §4.6.1). Both the ConfigMap source and the
//! file source satisfy the same contract: "emit current spec on start via
//! `initial_get`; emit replacements on change; emit fatal-source-gone on
//! delete" over a shared `SourceEvent` channel.

pub mod configmap;
pub mod file;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::err::SourceError;

/// One observed change from a routing-spec source.
#[derive(Debug)]
pub enum SourceEvent {
    /// The spec's raw bytes changed (or were observed for the first time),
    /// together with an opaque resource-version-like token used for the
    /// cheap dedup check in spec.md §4.6.3. `None` for sources with no such
    /// concept (the file source has no resource version).
    Updated {
        raw: Vec<u8>,
        resource_version: Option<String>,
    },
    /// The source's initial cache listing has completed (spec.md §4.6.2
    /// step 4: wait for the informer cache to reach its initial-synced
    /// state). The file source emits this immediately, since a plain file
    /// read has no separate "cache sync" phase.
    Synced,
    /// The source was deleted; fatal (spec.md §4.6.3).
    Deleted,
}

/// Picks one of the two source strategies described in spec.md §4.6.1.
pub enum SpecSource {
    ConfigMap(configmap::ConfigMapSource),
    File(file::FileSource),
}

impl SpecSource {
    /// Synchronous initial fetch (spec.md §4.6.2 step 2). MUST be awaited
    /// and its watch set populated before the corresponding watcher/file
    /// subscription is started.
    pub async fn initial_get(&self) -> Result<Vec<u8>, SourceError> {
        match self {
            SpecSource::ConfigMap(source) => source.initial_get().await,
            SpecSource::File(source) => source.initial_get().await,
        }
    }

    /// Start the background subscription, forwarding events to `tx` until
    /// `cancel` fires.
    pub fn spawn(self, tx: mpsc::UnboundedSender<SourceEvent>, cancel: CancellationToken) {
        match self {
            SpecSource::ConfigMap(source) => source.spawn(tx, cancel),
            SpecSource::File(source) => source.spawn(tx, cancel),
        }
    }
}
