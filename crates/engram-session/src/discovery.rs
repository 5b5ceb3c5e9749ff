use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Session layout: <sessions_root>/--<encoded_cwd>--/<timestamp>_<uuid>.jsonl
// where encoded_cwd replaces '/' with '-'. Decoding is lossy for paths that
// themselves contain '-'; the header's cwd field is authoritative and the
// decoded value is only used for display before a file is first parsed.

/// Encode a working directory into its session directory name.
pub fn encode_cwd(cwd: &str) -> String {
    format!("--{}--", cwd.replace('/', "-"))
}

/// Best-effort inverse of [`encode_cwd`].
pub fn decode_cwd(dir_name: &str) -> Option<String> {
    let inner = dir_name.strip_prefix("--")?.strip_suffix("--")?;
    Some(inner.replace('-', "/"))
}

/// Whether a path matches the `<timestamp>_<uuid>.jsonl` naming convention.
pub fn is_session_file(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return false;
    }
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    let Some((timestamp, uuid)) = stem.split_once('_') else {
        return false;
    };
    !timestamp.is_empty() && uuid::Uuid::parse_str(uuid).is_ok()
}

/// Extract the session uuid from a file name.
pub fn session_uuid(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let (_, uuid) = stem.split_once('_')?;
    uuid::Uuid::parse_str(uuid).ok().map(|u| u.to_string())
}

/// Recursively discover session files under a root.
pub fn discover_session_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file() && is_session_file(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_for_plain_paths() {
        let encoded = encode_cwd("/home/u/proj");
        assert_eq!(encoded, "---home-u-proj--");
        assert_eq!(decode_cwd(&encoded).unwrap(), "/home/u/proj");
    }

    #[test]
    fn session_file_naming() {
        assert!(is_session_file(Path::new(
            "/root/--x--/20260101T100000_7f2abd2d-7cfc-4447-9ddd-3ca8d14e02e9.jsonl"
        )));
        assert!(!is_session_file(Path::new("/root/--x--/notes.jsonl")));
        assert!(!is_session_file(Path::new(
            "/root/--x--/20260101T100000_7f2abd2d-7cfc-4447-9ddd-3ca8d14e02e9.json"
        )));
    }

    #[test]
    fn extracts_session_uuid() {
        let uuid = session_uuid(Path::new(
            "20260101T100000_7f2abd2d-7cfc-4447-9ddd-3ca8d14e02e9.jsonl",
        ));
        assert_eq!(
            uuid.as_deref(),
            Some("7f2abd2d-7cfc-4447-9ddd-3ca8d14e02e9")
        );
    }

    #[test]
    fn discovery_walks_nested_roots() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("---home-u-proj--");
        std::fs::create_dir_all(&dir).unwrap();
        let keep = dir.join("20260101T100000_7f2abd2d-7cfc-4447-9ddd-3ca8d14e02e9.jsonl");
        std::fs::write(&keep, "{}").unwrap();
        std::fs::write(dir.join("README.md"), "ignored").unwrap();

        let found = discover_session_files(tmp.path());
        assert_eq!(found, vec![keep]);
    }
}
