use chrono::{DateTime, Duration, Utc};

use crate::schema::{Entry, EntryPayload, Role};
use crate::reader::ParsedSession;

/// Thresholds for readiness and the minimum-size gate.
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    /// Tail entries older than this make the segment ready (Idle)
    pub idle_timeout: Duration,
    /// File mtime static for this long makes the segment ready (Stability)
    pub stability_threshold: Duration,
    pub min_entries: usize,
    pub min_estimated_tokens: usize,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::minutes(10),
            stability_threshold: Duration::seconds(5),
            min_entries: 3,
            min_estimated_tokens: 100,
        }
    }
}

/// Why a segment became ready for analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyReason {
    Idle,
    Boundary,
    Stability,
}

/// A contiguous slice of the session's linear history.
///
/// The boundary entry that closes a segment also opens the next one: it is
/// the tail of the closing segment and the initial context of the opening
/// segment. `boundary_key` is the stable identifier used for node-id
/// derivation; once an analysis of the segment is committed it is never
/// relabeled.
#[derive(Debug, Clone)]
pub struct Segment {
    pub boundary_key: String,
    pub entries: Vec<Entry>,
    /// Id of the boundary entry that closed this segment, if any
    pub closing_boundary: Option<String>,
}

impl Segment {
    pub fn is_closed(&self) -> bool {
        self.closing_boundary.is_some()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.entries.iter().map(|e| e.estimated_tokens()).sum()
    }

    pub fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|e| e.timestamp)
    }

    fn message_counts(&self) -> (usize, usize) {
        let mut user = 0;
        let mut assistant = 0;
        for entry in &self.entries {
            match &entry.payload {
                EntryPayload::Message {
                    role: Role::User, ..
                } => user += 1,
                EntryPayload::Message {
                    role: Role::Assistant,
                    ..
                } => assistant += 1,
                _ => {}
            }
        }
        (user, assistant)
    }
}

/// Split a session's linear history on boundary entries.
///
/// The last segment is the tail (open) segment; every earlier one is closed
/// by the boundary that opened its successor.
pub fn split_segments(session: &ParsedSession) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = Segment {
        boundary_key: engram_types::NodeId::START_BOUNDARY.to_string(),
        entries: Vec::new(),
        closing_boundary: None,
    };

    for entry in &session.entries {
        current.entries.push(entry.clone());

        if entry.payload.is_boundary() {
            current.closing_boundary = Some(entry.id.clone());
            let next = Segment {
                boundary_key: entry.id.clone(),
                entries: vec![entry.clone()],
                closing_boundary: None,
            };
            segments.push(std::mem::replace(&mut current, next));
        }
    }

    segments.push(current);
    segments
}

/// Minimum-size gate: at least `min_entries` entries, one user plus one
/// assistant message, and the token estimate above the floor. Segments below
/// threshold are skipped; they may qualify later as the session grows.
pub fn worth_analyzing(segment: &Segment, opts: &SegmentOptions) -> bool {
    if segment.entries.len() < opts.min_entries {
        return false;
    }
    let (user, assistant) = segment.message_counts();
    if user < 1 || assistant < 1 {
        return false;
    }
    segment.estimated_tokens() >= opts.min_estimated_tokens
}

/// Readiness of the open tail segment. Closed segments are always ready
/// (ReadyReason::Boundary) and are handled by the caller.
pub fn evaluate_tail_readiness(
    newest_entry: Option<DateTime<Utc>>,
    file_modified: DateTime<Utc>,
    now: DateTime<Utc>,
    opts: &SegmentOptions,
) -> Option<ReadyReason> {
    if let Some(ts) = newest_entry {
        if now.signed_duration_since(ts) >= opts.idle_timeout {
            return Some(ReadyReason::Idle);
        }
    }

    if now.signed_duration_since(file_modified) >= opts.stability_threshold {
        return Some(ReadyReason::Stability);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SessionHeader;

    fn message(id: &str, role: Role, text: &str, minute: i64) -> Entry {
        Entry {
            id: id.to_string(),
            parent_id: None,
            timestamp: ts(minute),
            payload: EntryPayload::Message {
                role,
                text: text.to_string(),
            },
        }
    }

    fn compaction(id: &str, minute: i64) -> Entry {
        Entry {
            id: id.to_string(),
            parent_id: None,
            timestamp: ts(minute),
            payload: EntryPayload::Compaction {
                summary: Some("earlier work".to_string()),
            },
        }
    }

    fn ts(minute: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(minute)
    }

    fn session_with(entries: Vec<Entry>) -> ParsedSession {
        ParsedSession {
            header: SessionHeader {
                version: 1,
                id: "s".to_string(),
                timestamp: ts(0),
                cwd: "/home/u/proj".to_string(),
                parent_session: None,
            },
            entries,
            skipped_lines: 0,
        }
    }

    const LONG: &str = "a reasonably long message that contributes a meaningful number of estimated tokens to the segment under the four characters per token heuristic used by the gate";

    #[test]
    fn single_segment_without_boundaries() {
        let session = session_with(vec![
            message("e1", Role::User, "hi", 0),
            message("e2", Role::Assistant, "hello", 1),
        ]);
        let segments = split_segments(&session);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].boundary_key, "start");
        assert!(!segments[0].is_closed());
    }

    #[test]
    fn boundary_belongs_to_both_segments() {
        let session = session_with(vec![
            message("e1", Role::User, "hi", 0),
            message("e2", Role::Assistant, "hello", 1),
            compaction("e3", 2),
            message("e4", Role::User, "continue", 3),
        ]);

        let segments = split_segments(&session);
        assert_eq!(segments.len(), 2);

        // Closing segment ends with the boundary
        assert_eq!(segments[0].closing_boundary.as_deref(), Some("e3"));
        assert_eq!(segments[0].entries.last().unwrap().id, "e3");

        // Opening segment starts with the same boundary as context
        assert_eq!(segments[1].boundary_key, "e3");
        assert_eq!(segments[1].entries.first().unwrap().id, "e3");
        assert!(!segments[1].is_closed());
    }

    #[test]
    fn multi_compaction_yields_one_segment_per_span() {
        let session = session_with(vec![
            message("e1", Role::User, "hi", 0),
            compaction("c1", 1),
            message("e2", Role::Assistant, "more", 2),
            compaction("c2", 3),
            message("e3", Role::User, "tail", 4),
        ]);

        let segments = split_segments(&session);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].boundary_key, "start");
        assert_eq!(segments[1].boundary_key, "c1");
        assert_eq!(segments[2].boundary_key, "c2");
    }

    #[test]
    fn minimum_size_gate() {
        let opts = SegmentOptions::default();

        // Too few entries
        let small = Segment {
            boundary_key: "start".to_string(),
            entries: vec![message("e1", Role::User, LONG, 0)],
            closing_boundary: None,
        };
        assert!(!worth_analyzing(&small, &opts));

        // Enough entries but no assistant reply
        let one_sided = Segment {
            boundary_key: "start".to_string(),
            entries: vec![
                message("e1", Role::User, LONG, 0),
                message("e2", Role::User, LONG, 1),
                message("e3", Role::User, LONG, 2),
            ],
            closing_boundary: None,
        };
        assert!(!worth_analyzing(&one_sided, &opts));

        // Proper conversation over the token floor
        let ok = Segment {
            boundary_key: "start".to_string(),
            entries: vec![
                message("e1", Role::User, LONG, 0),
                message("e2", Role::Assistant, LONG, 1),
                message("e3", Role::User, LONG, 2),
            ],
            closing_boundary: None,
        };
        assert!(worth_analyzing(&ok, &opts));
    }

    #[test]
    fn tiny_token_count_fails_gate() {
        let opts = SegmentOptions::default();
        let tiny = Segment {
            boundary_key: "start".to_string(),
            entries: vec![
                message("e1", Role::User, "hi", 0),
                message("e2", Role::Assistant, "yo", 1),
                message("e3", Role::User, "ok", 2),
            ],
            closing_boundary: None,
        };
        assert!(!worth_analyzing(&tiny, &opts));
    }

    #[test]
    fn idle_readiness() {
        let opts = SegmentOptions::default();
        let now = ts(15);
        // Newest entry 12 minutes old, file written 1s ago: idle wins
        let reason = evaluate_tail_readiness(Some(ts(3)), now - Duration::seconds(1), now, &opts);
        assert_eq!(reason, Some(ReadyReason::Idle));
    }

    #[test]
    fn stability_readiness() {
        let opts = SegmentOptions::default();
        let now = ts(5);
        // Newest entry 2 minutes old (not idle) but mtime static for 10s
        let reason = evaluate_tail_readiness(Some(ts(3)), now - Duration::seconds(10), now, &opts);
        assert_eq!(reason, Some(ReadyReason::Stability));
    }

    #[test]
    fn fresh_file_is_not_ready() {
        let opts = SegmentOptions::default();
        let now = ts(5);
        let reason = evaluate_tail_readiness(Some(ts(4)), now - Duration::seconds(2), now, &opts);
        assert_eq!(reason, None);
    }
}
