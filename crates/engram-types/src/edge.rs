use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Semantic,
    FileOverlap,
    Temporal,
    Compaction,
    Fork,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Semantic => "semantic",
            EdgeKind::FileOverlap => "file_overlap",
            EdgeKind::Temporal => "temporal",
            EdgeKind::Compaction => "compaction",
            EdgeKind::Fork => "fork",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "semantic" => Some(EdgeKind::Semantic),
            "file_overlap" => Some(EdgeKind::FileOverlap),
            "temporal" => Some(EdgeKind::Temporal),
            "compaction" => Some(EdgeKind::Compaction),
            "fork" => Some(EdgeKind::Fork),
            _ => None,
        }
    }
}

/// Directed relation between two nodes.
///
/// Duplicates on (source, target, kind) are disallowed; re-discovery updates
/// weight and created_at in place. `node_version` records which version of
/// the source node the edge was derived from - readers may observe a newer
/// node before discovery catches up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
    pub weight: f64,
    pub evidence: Option<String>,
    pub node_version: u32,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new(source: NodeId, target: NodeId, kind: EdgeKind, weight: f64) -> Self {
        Self {
            source,
            target,
            kind,
            weight: weight.clamp(0.0, 1.0),
            evidence: None,
            node_version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }

    pub fn derived_from_version(mut self, version: u32) -> Self {
        self.node_version = version;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_is_clamped() {
        let a = NodeId::derive("/a", "start");
        let b = NodeId::derive("/b", "start");
        let edge = Edge::new(a.clone(), b.clone(), EdgeKind::Semantic, 1.7);
        assert_eq!(edge.weight, 1.0);
        let edge = Edge::new(a, b, EdgeKind::Semantic, -0.2);
        assert_eq!(edge.weight, 0.0);
    }

    #[test]
    fn kind_round_trips() {
        for kind in [
            EdgeKind::Semantic,
            EdgeKind::FileOverlap,
            EdgeKind::Temporal,
            EdgeKind::Compaction,
            EdgeKind::Fork,
        ] {
            assert_eq!(EdgeKind::parse(kind.as_str()), Some(kind));
        }
    }
}
