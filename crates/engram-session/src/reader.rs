use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::schema::{
    Entry, EntryPayload, Role, SessionHeader, SessionRecord, flatten_content,
};
use crate::{Error, Result};

/// A session file read into its header and linear history.
#[derive(Debug, Clone)]
pub struct ParsedSession {
    pub header: SessionHeader,
    pub entries: Vec<Entry>,
    /// Lines that failed to parse or carried an unknown type
    pub skipped_lines: usize,
}

impl ParsedSession {
    pub fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|e| e.timestamp)
    }

    pub fn user_message_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.payload, EntryPayload::Message { role: Role::User, .. }))
            .count()
    }

    pub fn assistant_message_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    e.payload,
                    EntryPayload::Message {
                        role: Role::Assistant,
                        ..
                    }
                )
            })
            .count()
    }
}

fn parse_timestamp(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Read a session file linearly. Malformed entry lines and unknown record
/// types are skipped; a missing or malformed header is an error so the
/// caller can classify it as permanent.
pub fn read_session(path: &Path) -> Result<ParsedSession> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    let header_line = loop {
        match lines.next() {
            Some(line) => {
                let line = line?;
                if !line.trim().is_empty() {
                    break line;
                }
            }
            None => return Err(Error::EmptySession(path.to_path_buf())),
        }
    };

    let header = match serde_json::from_str::<SessionRecord>(&header_line) {
        Ok(SessionRecord::Session(h)) => SessionHeader {
            version: h.version,
            id: h.id,
            timestamp: parse_timestamp(&h.timestamp),
            cwd: h.cwd,
            parent_session: h.parent_session,
        },
        Ok(_) => {
            return Err(Error::MalformedHeader {
                path: path.to_path_buf(),
                detail: "first record is not a session header".to_string(),
            });
        }
        Err(e) => {
            return Err(Error::MalformedHeader {
                path: path.to_path_buf(),
                detail: e.to_string(),
            });
        }
    };

    let mut entries = Vec::new();
    let mut skipped_lines = 0;

    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let record = match serde_json::from_str::<SessionRecord>(&line) {
            Ok(record) => record,
            Err(_) => {
                skipped_lines += 1;
                continue;
            }
        };

        match record {
            SessionRecord::Message(m) => {
                let Some(role) = Role::parse(&m.role) else {
                    skipped_lines += 1;
                    continue;
                };
                entries.push(Entry {
                    id: m.id,
                    parent_id: m.parent_id,
                    timestamp: parse_timestamp(&m.timestamp),
                    payload: EntryPayload::Message {
                        role,
                        text: flatten_content(m.content.as_ref()),
                    },
                });
            }
            SessionRecord::Compaction(m) => {
                entries.push(Entry {
                    id: m.id,
                    parent_id: m.parent_id,
                    timestamp: parse_timestamp(&m.timestamp),
                    payload: EntryPayload::Compaction { summary: m.summary },
                });
            }
            SessionRecord::BranchSummary(m) => {
                entries.push(Entry {
                    id: m.id,
                    parent_id: m.parent_id,
                    timestamp: parse_timestamp(&m.timestamp),
                    payload: EntryPayload::BranchSummary { summary: m.summary },
                });
            }
            SessionRecord::ModelChange(m)
            | SessionRecord::ThinkingLevelChange(m)
            | SessionRecord::Custom(m)
            | SessionRecord::CustomMessage(m)
            | SessionRecord::Label(m)
            | SessionRecord::SessionInfo(m) => {
                entries.push(Entry {
                    id: m.id,
                    parent_id: m.parent_id,
                    timestamp: parse_timestamp(&m.timestamp),
                    payload: EntryPayload::Meta,
                });
            }
            SessionRecord::Session(_) => {
                // A second header mid-file is producer misbehavior; keep going
                skipped_lines += 1;
            }
            SessionRecord::Unknown => {
                skipped_lines += 1;
            }
        }
    }

    Ok(ParsedSession {
        header,
        entries,
        skipped_lines,
    })
}
