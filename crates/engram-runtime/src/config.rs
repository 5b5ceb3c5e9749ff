use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use engram_types::JobKind;

use crate::{Error, Result};

/// Resolve the daemon data directory:
/// 1. Explicit path
/// 2. ENGRAM_DATA_DIR environment variable
/// 3. XDG data directory
/// 4. ~/.engram fallback
pub fn resolve_data_dir(explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(expand_tilde(path));
    }
    if let Ok(env_path) = std::env::var("ENGRAM_DATA_DIR") {
        return Ok(expand_tilde(&env_path));
    }
    if let Some(data_dir) = dirs::data_dir() {
        return Ok(data_dir.join("engram"));
    }
    if let Some(home) = std::env::var_os("HOME") {
        return Ok(PathBuf::from(home).join(".engram"));
    }
    Err(Error::Config(
        "Could not determine data directory: no HOME or XDG data directory".to_string(),
    ))
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(stripped);
    }
    PathBuf::from(path)
}

fn default_idle_timeout_minutes() -> u64 {
    10
}
fn default_stability_threshold_ms() -> u64 {
    5_000
}
fn default_sync_stability_threshold_ms() -> u64 {
    30_000
}
fn default_debounce_ms() -> u64 {
    250
}
fn default_poll_interval_seconds() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_seconds() -> u64 {
    5
}
fn default_retry_delay_cap_seconds() -> u64 {
    60
}
fn default_analysis_timeout_minutes() -> u64 {
    10
}
fn default_max_queue_size() -> u64 {
    500
}
fn default_parallel_workers() -> usize {
    1
}
fn default_lease_seconds() -> u64 {
    900
}
fn default_connection_discovery_threshold() -> f64 {
    0.6
}
fn default_connection_discovery_cooldown_hours() -> u64 {
    24
}
fn default_temporal_window_days() -> u64 {
    7
}
fn default_min_file_overlap() -> f64 {
    0.2
}
fn default_semantic_search_threshold() -> f64 {
    0.6
}
fn default_embedding_provider() -> String {
    "local".to_string()
}
fn default_embedding_model() -> String {
    "all-minilm-l6-v2".to_string()
}
fn default_embedding_base_url() -> String {
    "http://127.0.0.1:8090".to_string()
}
fn default_embedding_dimensions() -> usize {
    384
}
fn default_schedule_reanalysis() -> String {
    "0 3 * * *".to_string()
}
fn default_schedule_connection_discovery() -> String {
    "15 */6 * * *".to_string()
}
fn default_schedule_pattern_aggregation() -> String {
    "30 4 * * *".to_string()
}
fn default_schedule_clustering() -> String {
    "45 4 * * 0".to_string()
}
fn default_schedule_embedding_backfill() -> String {
    "*/30 * * * *".to_string()
}
fn default_api_port() -> u16 {
    8767
}
fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
fn default_retention_max_versions() -> u32 {
    5
}
fn default_retention_archive_after_days() -> u64 {
    90
}
fn default_analyzer_binary() -> String {
    "brain-agent".to_string()
}
fn default_analyzer_provider() -> String {
    "anthropic".to_string()
}
fn default_analyzer_model() -> String {
    "default".to_string()
}
fn default_required_skills() -> Vec<String> {
    vec!["analysis".to_string()]
}
fn default_optional_skills() -> Vec<String> {
    vec!["lessons".to_string(), "friction".to_string()]
}
fn default_query_timeout_minutes() -> u64 {
    2
}
fn default_query_context_tokens() -> usize {
    4_000
}
fn default_http_timeout_seconds() -> u64 {
    60
}
fn default_drain_grace_seconds() -> u64 {
    30
}

/// Daemon configuration, persisted as snake_case YAML.
///
/// Cron strings are validated at load; an invalid schedule fails startup
/// rather than a 3 a.m. fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Roots scanned for session files. Empty means the conventional
    /// location under the user's home.
    #[serde(default)]
    pub sessions_dirs: Vec<PathBuf>,

    /// Roots whose files arrive via external sync; these get the longer
    /// stability threshold before a tail segment is considered settled.
    #[serde(default)]
    pub sessions_sync_dirs: Vec<PathBuf>,

    // Extraction
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u64,
    #[serde(default = "default_stability_threshold_ms")]
    pub stability_threshold_ms: u64,
    #[serde(default = "default_sync_stability_threshold_ms")]
    pub sync_stability_threshold_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub watch_debounce_ms: u64,
    #[serde(default = "default_poll_interval_seconds")]
    pub watch_poll_interval_seconds: u64,

    // Queue / workers
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_retry_delay_cap_seconds")]
    pub retry_delay_cap_seconds: u64,
    #[serde(default = "default_analysis_timeout_minutes")]
    pub analysis_timeout_minutes: u64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u64,
    /// Cap on concurrent analyzer subprocesses, independent of worker count
    #[serde(default = "default_parallel_workers")]
    pub max_concurrent_analysis: usize,
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    // Connection discovery
    #[serde(default = "default_connection_discovery_threshold")]
    pub connection_discovery_threshold: f64,
    #[serde(default = "default_connection_discovery_cooldown_hours")]
    pub connection_discovery_cooldown_hours: u64,
    #[serde(default = "default_temporal_window_days")]
    pub connection_discovery_temporal_window_days: u64,
    #[serde(default = "default_min_file_overlap")]
    pub connection_discovery_min_file_overlap: f64,
    #[serde(default = "default_semantic_search_threshold")]
    pub semantic_search_threshold: f64,

    // Embeddings
    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_api_key: Option<String>,
    #[serde(default = "default_embedding_base_url")]
    pub embedding_base_url: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,

    // Schedules (standard 5-field cron)
    #[serde(default = "default_schedule_reanalysis")]
    pub schedule_reanalysis: String,
    #[serde(default = "default_schedule_connection_discovery")]
    pub schedule_connection_discovery: String,
    #[serde(default = "default_schedule_pattern_aggregation")]
    pub schedule_pattern_aggregation: String,
    #[serde(default = "default_schedule_clustering")]
    pub schedule_clustering: String,
    #[serde(default = "default_schedule_embedding_backfill")]
    pub schedule_embedding_backfill: String,

    // API
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default)]
    pub api_cors_origins: Vec<String>,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_drain_grace_seconds")]
    pub drain_grace_seconds: u64,

    // Retention
    #[serde(default = "default_retention_max_versions")]
    pub retention_max_versions: u32,
    #[serde(default = "default_retention_archive_after_days")]
    pub retention_archive_after_days: u64,

    // Analyzer
    #[serde(default = "default_analyzer_binary")]
    pub analyzer_binary: String,
    #[serde(default = "default_analyzer_provider")]
    pub analyzer_provider: String,
    #[serde(default = "default_analyzer_model")]
    pub analyzer_model: String,
    #[serde(default)]
    pub analyzer_prompt_path: Option<PathBuf>,
    #[serde(default)]
    pub analyzer_skills_dir: Option<PathBuf>,
    #[serde(default = "default_required_skills")]
    pub analyzer_required_skills: Vec<String>,
    #[serde(default = "default_optional_skills")]
    pub analyzer_optional_skills: Vec<String>,

    // Query engine
    #[serde(default = "default_analyzer_model")]
    pub query_model: String,
    #[serde(default)]
    pub query_prompt_path: Option<PathBuf>,
    #[serde(default = "default_query_timeout_minutes")]
    pub query_timeout_minutes: u64,
    #[serde(default = "default_query_context_tokens")]
    pub query_context_tokens: usize,
}

impl Default for Config {
    fn default() -> Self {
        // Serde's field defaults are the single source of truth
        serde_yaml::from_str("{}").unwrap_or_else(|_| unreachable!("empty config must parse"))
    }
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Config file location: ENGRAM_CONFIG override, else
    /// `<data_dir>/config.yaml`.
    pub fn default_path(data_dir: &Path) -> PathBuf {
        if let Ok(env_path) = std::env::var("ENGRAM_CONFIG") {
            return expand_tilde(&env_path);
        }
        data_dir.join("config.yaml")
    }

    /// Session roots: ENGRAM_SESSIONS_DIR override, configured list, or the
    /// conventional `~/.sessions` location.
    pub fn session_roots(&self) -> Vec<PathBuf> {
        if let Ok(env_path) = std::env::var("ENGRAM_SESSIONS_DIR") {
            return vec![expand_tilde(&env_path)];
        }
        if !self.sessions_dirs.is_empty() {
            return self.sessions_dirs.clone();
        }
        std::env::var_os("HOME")
            .map(|home| vec![PathBuf::from(home).join(".sessions")])
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        for (name, expr) in self.schedules() {
            parse_cron(&expr)
                .map_err(|e| Error::Config(format!("invalid {} '{}': {}", name, expr, e)))?;
        }
        if self.parallel_workers == 0 {
            return Err(Error::Config("parallel_workers must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.connection_discovery_threshold) {
            return Err(Error::Config(
                "connection_discovery_threshold must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    pub fn schedules(&self) -> Vec<(&'static str, String)> {
        vec![
            ("schedule_reanalysis", self.schedule_reanalysis.clone()),
            (
                "schedule_connection_discovery",
                self.schedule_connection_discovery.clone(),
            ),
            (
                "schedule_pattern_aggregation",
                self.schedule_pattern_aggregation.clone(),
            ),
            ("schedule_clustering", self.schedule_clustering.clone()),
            (
                "schedule_embedding_backfill",
                self.schedule_embedding_backfill.clone(),
            ),
        ]
    }

    pub fn schedule_for(&self, kind: JobKind) -> Option<&str> {
        match kind {
            JobKind::Reanalysis => Some(&self.schedule_reanalysis),
            JobKind::ConnectionDiscovery => Some(&self.schedule_connection_discovery),
            JobKind::PatternAggregation => Some(&self.schedule_pattern_aggregation),
            JobKind::Clustering => Some(&self.schedule_clustering),
            JobKind::EmbeddingBackfill => Some(&self.schedule_embedding_backfill),
            JobKind::Initial => None,
        }
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.idle_timeout_minutes as i64)
    }

    pub fn stability_threshold(&self, synced: bool) -> chrono::Duration {
        let ms = if synced {
            self.sync_stability_threshold_ms
        } else {
            self.stability_threshold_ms
        };
        chrono::Duration::milliseconds(ms as i64)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_minutes * 60)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_minutes * 60)
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_seconds as i64)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn retry_delay_cap(&self) -> Duration {
        Duration::from_secs(self.retry_delay_cap_seconds)
    }

    pub fn prompt_path(&self, data_dir: &Path) -> PathBuf {
        self.analyzer_prompt_path
            .clone()
            .unwrap_or_else(|| data_dir.join("prompts/analysis.md"))
    }

    pub fn query_prompt(&self, data_dir: &Path) -> PathBuf {
        self.query_prompt_path
            .clone()
            .unwrap_or_else(|| data_dir.join("prompts/query.md"))
    }

    pub fn skills_dir(&self, data_dir: &Path) -> PathBuf {
        self.analyzer_skills_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("skills"))
    }
}

/// Parse a standard 5-field cron string. The cron crate wants a seconds
/// field, so a 5-field expression is normalized by prepending `0`.
pub fn parse_cron(expr: &str) -> std::result::Result<cron::Schedule, String> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expr),
        6 | 7 => expr.to_string(),
        n => return Err(format!("expected 5 cron fields, found {}", n)),
    };
    cron::Schedule::from_str(&normalized).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.idle_timeout_minutes, 10);
        assert_eq!(config.parallel_workers, 1);
        assert_eq!(config.max_queue_size, 500);
    }

    #[test]
    fn round_trips_through_yaml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.parallel_workers = 4;
        config.api_cors_origins = vec!["http://localhost:5173".to_string()];
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.parallel_workers, 4);
        assert_eq!(loaded.api_cors_origins.len(), 1);
    }

    #[test]
    fn missing_file_returns_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn invalid_cron_is_rejected_at_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "schedule_reanalysis: \"not a cron\"\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "idle_timeout_mins: 5\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn five_field_cron_is_normalized() {
        assert!(parse_cron("*/30 * * * *").is_ok());
        assert!(parse_cron("0 3 * * *").is_ok());
        assert!(parse_cron("* * *").is_err());
    }

    #[test]
    fn stability_threshold_distinguishes_sync_origin() {
        let config = Config::default();
        assert!(config.stability_threshold(true) > config.stability_threshold(false));
    }
}
