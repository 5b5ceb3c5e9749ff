// NOTE: engram Schema Rationale
//
// Why deterministic node ids (not UUIDs)?
// - A node is the analysis of one (session_file, segment_boundary) pair
// - Reanalysis must UPDATE the node, never duplicate it
// - Hashing the pair gives idempotency for free across daemon restarts
// - Trade-off: renaming a session file orphans its nodes (acceptable; session
//   files are append-only and never renamed by the producer)
//
// Why canonical JSON files + relational index (not index-only)?
// - The full node is a deep document; flattening it into columns loses shape
// - JSON files survive index rebuilds and are readable without the daemon
// - The index holds only what queries filter/sort on
//
// Why per-crate error enums (not one global error type)?
// - Each layer names exactly the failures it can produce
// - Callers match on what they can handle and wrap the rest

mod error;

pub mod edge;
pub mod event;
pub mod insight;
pub mod job;
pub mod node;
pub mod prompt;

pub use edge::{Edge, EdgeKind};
pub use error::{Error, Result};
pub use event::{BusEvent, Channel};
pub use insight::{Decision, EffectivenessEntry, Insight, InsightType, UserFeedback};
pub use job::{ErrorCategory, Job, JobKind, JobOutcome, JobState};
pub use node::{
    Classification, Content, DaemonMeta, FrictionSignal, Lessons, Node, NodeMetadata, Outcome,
    Semantic,
};
pub use prompt::{PromptVersion, content_hash, normalize_prompt, version_label};

use sha2::{Digest, Sha256};

/// Stable 16-hex node identifier.
///
/// Derived from the source session file and segment boundary, so the same
/// segment always maps to the same node regardless of when or how often it is
/// analyzed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Boundary key used for the segment that opens at session start.
    pub const START_BOUNDARY: &'static str = "start";

    pub fn derive(session_file: &str, segment_boundary: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(session_file.as_bytes());
        hasher.update(b"\n");
        hasher.update(segment_boundary.as_bytes());
        let hash = hasher.finalize();

        Self(format!(
            "{:016x}",
            u64::from_be_bytes([
                hash[0], hash[1], hash[2], hash[3], hash[4], hash[5], hash[6], hash[7]
            ])
        ))
    }

    /// Wrap an id that was read back from storage.
    pub fn from_stored(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.len() != 16 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_deterministic() {
        let a = NodeId::derive("/s/p/session.jsonl", "entry-42");
        let b = NodeId::derive("/s/p/session.jsonl", "entry-42");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn node_id_differs_per_boundary() {
        let a = NodeId::derive("/s/p/session.jsonl", "entry-42");
        let b = NodeId::derive("/s/p/session.jsonl", "entry-43");
        assert_ne!(a, b);
    }

    #[test]
    fn node_id_rejects_bad_stored_values() {
        assert!(NodeId::from_stored("not-hex-at-all!").is_err());
        assert!(NodeId::from_stored("abcd").is_err());
        assert!(NodeId::from_stored("00112233445566aa").is_ok());
    }
}
