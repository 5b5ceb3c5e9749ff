use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One version of the analyzer prompt, identified by its normalized content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
    /// Label of the form `v{n}-{hash8}`
    pub label: String,
    /// Sequential counter across all versions
    pub sequence: u32,
    /// First 8 hex of SHA-256 over the normalized prompt
    pub content_hash: String,
    /// Where the prompt text was archived when the version was created
    pub archived_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Normalize a prompt for hashing: trim, collapse runs of whitespace to a
/// single space, and strip HTML-style comments.
///
/// Whitespace-only and HTML-comment-only edits never bump the version; a
/// forced bump appends a visible `[version-bump]` marker line, which
/// survives normalization.
pub fn normalize_prompt(raw: &str) -> String {
    let without_comments = strip_html_comments(raw);

    let mut out = String::with_capacity(without_comments.len());
    let mut in_whitespace = false;
    for ch in without_comments.trim().chars() {
        if ch.is_whitespace() {
            if !in_whitespace {
                out.push(' ');
                in_whitespace = true;
            }
        } else {
            out.push(ch);
            in_whitespace = false;
        }
    }
    out
}

fn strip_html_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start..].find("-->") {
            Some(end) => rest = &rest[start + end + 3..],
            None => {
                // Unterminated comment swallows the remainder
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// First 8 hex chars of SHA-256 over the normalized content.
pub fn content_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let hash = hasher.finalize();
    format!("{:02x}{:02x}{:02x}{:02x}", hash[0], hash[1], hash[2], hash[3])
}

pub fn version_label(sequence: u32, hash8: &str) -> String {
    format!("v{}-{}", sequence, hash8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_edits_do_not_change_hash() {
        let a = normalize_prompt("Analyze the   session.\n\nReport  lessons.");
        let b = normalize_prompt("  Analyze the session. Report lessons.  ");
        assert_eq!(a, b);
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn comments_are_stripped() {
        let a = normalize_prompt("Analyze. <!-- internal note --> Report.");
        let b = normalize_prompt("Analyze. Report.");
        assert_eq!(a, b);
    }

    #[test]
    fn unterminated_comment_drops_tail() {
        let a = normalize_prompt("Analyze. <!-- runaway");
        assert_eq!(a, "Analyze.");
    }

    #[test]
    fn content_changes_change_hash() {
        let a = content_hash(&normalize_prompt("Analyze the session."));
        let b = content_hash(&normalize_prompt("Analyze the session carefully."));
        assert_ne!(a, b);
    }

    #[test]
    fn label_format() {
        assert_eq!(version_label(3, "deadbeef"), "v3-deadbeef");
    }

    #[test]
    fn hash_is_eight_hex() {
        let h = content_hash("anything");
        assert_eq!(h.len(), 8);
        assert!(h.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
