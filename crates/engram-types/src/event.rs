use serde::{Deserialize, Serialize};

use crate::{ErrorCategory, NodeId};

/// Named bus channel. Subscribers pick channels; ordering is FIFO per
/// channel only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Daemon,
    Analysis,
    Node,
    Queue,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Daemon, Channel::Analysis, Channel::Node, Channel::Queue];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Daemon => "daemon",
            Channel::Analysis => "analysis",
            Channel::Node => "node",
            Channel::Queue => "queue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daemon" => Some(Channel::Daemon),
            "analysis" => Some(Channel::Analysis),
            "node" => Some(Channel::Node),
            "queue" => Some(Channel::Queue),
            _ => None,
        }
    }
}

/// Event published on the in-process bus and fanned out to WebSocket
/// subscribers as `{type, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BusEvent {
    #[serde(rename = "daemon.status")]
    DaemonStatus { state: String, message: String },
    #[serde(rename = "daemon.config_changed")]
    ConfigChanged,
    #[serde(rename = "analysis.started")]
    AnalysisStarted { job_id: i64, session_file: String },
    #[serde(rename = "analysis.completed")]
    AnalysisCompleted {
        job_id: i64,
        node_id: NodeId,
        version: u32,
    },
    #[serde(rename = "analysis.failed")]
    AnalysisFailed {
        job_id: i64,
        category: ErrorCategory,
        message: String,
    },
    #[serde(rename = "node.created")]
    NodeCreated { node_id: NodeId, version: u32 },
    #[serde(rename = "queue.changed")]
    QueueChanged { pending: u64, leased: u64 },
}

impl BusEvent {
    pub fn channel(&self) -> Channel {
        match self {
            BusEvent::DaemonStatus { .. } | BusEvent::ConfigChanged => Channel::Daemon,
            BusEvent::AnalysisStarted { .. }
            | BusEvent::AnalysisCompleted { .. }
            | BusEvent::AnalysisFailed { .. } => Channel::Analysis,
            BusEvent::NodeCreated { .. } => Channel::Node,
            BusEvent::QueueChanged { .. } => Channel::Queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_dotted_type_names() {
        let event = BusEvent::NodeCreated {
            node_id: NodeId::derive("/s", "start"),
            version: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node.created");
        assert_eq!(json["data"]["version"], 1);
    }

    #[test]
    fn channel_routing() {
        let event = BusEvent::QueueChanged {
            pending: 3,
            leased: 1,
        };
        assert_eq!(event.channel(), Channel::Queue);
        assert_eq!(Channel::parse("queue"), Some(Channel::Queue));
        assert_eq!(Channel::parse("nope"), None);
    }
}
