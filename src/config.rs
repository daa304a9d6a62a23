//! Pipeline configuration: defaults, TOML file overlay, environment overrides
//! and validation.
//!
//! Layering, lowest to highest priority:
//! 1. Built-in defaults ([`PipelineConfig::default`])
//! 2. Config file (`$XDG_CONFIG_HOME/bibp/config.toml` or `~/.config/bibp/config.toml`)
//! 3. Environment variables (`BIBP_*`, `SEMANTIC_SCHOLAR_API_KEY`, `CORE_API_KEY`)
//! 4. CLI flags (applied by the binary)
//!
//! The resulting value is immutable for the rest of the run.
//!
//! # File format
//!
//! ```toml
//! max_threads = 8
//! contact_email = "me@university.edu"
//!
//! [sources.core]
//! enabled = true
//! auth_token = "..."
//!
//! [sources.semantic_scholar]
//! rate_limit = 1.0
//! ```

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::download::{DEFAULT_DOWNLOAD_TIMEOUT, DEFAULT_MAX_PDF_SIZE, DEFAULT_MIN_PDF_SIZE, RetryPolicy};
use crate::source::matching::{DEFAULT_MIN_TITLE_LENGTH, DEFAULT_MIN_TITLE_SIMILARITY};
use crate::source::{ClientSettings, MatchPolicy, SourceKind};

/// Default worker count.
pub const DEFAULT_MAX_THREADS: usize = 4;
/// Accepted worker counts.
pub const MAX_THREADS_RANGE: std::ops::RangeInclusive<usize> = 1..=100;
/// Default per-request timeout for source lookups.
pub const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 15;
/// Default wait bound for a rate-limiter token.
pub const DEFAULT_RATE_LIMIT_WAIT_MS: u64 = 30_000;
/// Default cap on generated filenames.
pub const DEFAULT_MAX_FILENAME_LENGTH: usize = 150;

/// Fewer active sources than this triggers a warning.
const MIN_RECOMMENDED_SOURCES: usize = 3;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML or has unknown keys.
    #[error("failed to parse config file '{origin}': {source}")]
    Parse {
        /// File path or `<string>`.
        origin: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value {value:?} for environment variable {name}: expected {expected}")]
    InvalidEnv {
        /// Variable name.
        name: String,
        /// Raw value.
        value: String,
        /// What was expected.
        expected: &'static str,
    },

    /// A value is out of range.
    #[error("invalid config value for `{field}`: {message}")]
    InvalidValue {
        /// Offending field.
        field: String,
        /// What is wrong and what is accepted.
        message: String,
    },

    /// A `[sources.<name>]` table names no known source.
    #[error("unknown source '{name}' (known: arxiv, unpaywall, openalex, semantic_scholar, crossref, pubmed, core)")]
    UnknownSource {
        /// Name as written.
        name: String,
    },

    /// Two sources share a priority.
    #[error("sources {first} and {second} share priority {priority}; priorities must be unique")]
    DuplicatePriority {
        /// Shared priority.
        priority: u32,
        /// First source with it.
        first: SourceKind,
        /// Second source with it.
        second: SourceKind,
    },

    /// A source is configured twice.
    #[error("source {name} is configured more than once")]
    DuplicateSource {
        /// Repeated source.
        name: SourceKind,
    },

    /// Nothing left to query.
    #[error("no sources are enabled (after dropping sources with missing credentials); enable at least one source")]
    NoEnabledSources,
}

/// Per-source settings.
#[derive(Clone, PartialEq)]
pub struct SourceConfig {
    /// Which source.
    pub name: SourceKind,
    /// Cascade position; lower runs first. Unique across sources.
    pub priority: u32,
    /// Sustained requests per second.
    pub rate_limit: f64,
    /// Token bucket capacity.
    pub burst_capacity: u32,
    /// Bearer token / API key.
    pub auth_token: Option<String>,
    /// Whether the source takes part in the cascade.
    pub enabled: bool,
    /// Per-request timeout.
    pub timeout: Duration,
    /// API base URL override.
    pub base_url: Option<String>,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("rate_limit", &self.rate_limit)
            .field("burst_capacity", &self.burst_capacity)
            .field("has_auth_token", &self.auth_token.is_some())
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl SourceConfig {
    /// Default settings for one source.
    #[must_use]
    pub fn default_for(name: SourceKind) -> Self {
        let (priority, rate_limit, enabled) = match name {
            SourceKind::Arxiv => (1, 10.0, true),
            SourceKind::Unpaywall => (2, 5.0, true),
            SourceKind::OpenAlex => (3, 10.0, true),
            SourceKind::SemanticScholar => (4, 0.8, true),
            SourceKind::Crossref => (5, 2.0, true),
            SourceKind::PubMed => (6, 3.0, true),
            SourceKind::Core => (7, 1.0, false),
        };
        Self {
            name,
            priority,
            rate_limit,
            burst_capacity: default_burst(rate_limit),
            auth_token: None,
            enabled,
            timeout: Duration::from_secs(DEFAULT_SOURCE_TIMEOUT_SECS),
            base_url: None,
        }
    }

    /// Why this source cannot run with the given contact e-mail, if it cannot.
    #[must_use]
    pub fn missing_requirement(&self, contact_email: Option<&str>) -> Option<&'static str> {
        match self.name {
            SourceKind::Core if self.auth_token.is_none() => {
                Some("CORE requires an API key (set CORE_API_KEY or sources.core.auth_token)")
            }
            SourceKind::Unpaywall if contact_email.is_none() => {
                Some("Unpaywall requires a contact e-mail (set BIBP_EMAIL or contact_email)")
            }
            _ => None,
        }
    }
}

/// Default burst for a rate: two seconds' worth of tokens, at least 2.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn default_burst(rate_limit: f64) -> u32 {
    let burst = (rate_limit * 2.0).floor();
    if burst.is_finite() && burst > 2.0 {
        burst.min(f64::from(u32::MAX)) as u32
    } else {
        2
    }
}

/// Immutable run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Concurrent citations.
    pub max_threads: usize,
    /// Smallest acceptable PDF in bytes.
    pub min_pdf_size: u64,
    /// Largest accepted download in bytes.
    pub max_pdf_size: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff base.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Longest wait for a rate-limiter token.
    pub rate_limit_wait: Duration,
    /// Per-download timeout.
    pub download_timeout: Duration,
    /// Contact e-mail for polite pools.
    pub contact_email: Option<String>,
    /// Minimum fuzzy title similarity.
    pub min_title_similarity: f64,
    /// Citations scoring below this are skipped.
    pub min_quality_score: f64,
    /// Shortest title worth searching for.
    pub min_title_length: usize,
    /// Filename length cap.
    pub max_filename_length: usize,
    /// Skip citations whose target file already exists.
    pub skip_existing: bool,
    /// Upgrade candidate URLs to HTTPS and require HTTPS base URLs.
    pub https_only: bool,
    /// Log filter used when neither `RUST_LOG` nor CLI flags decide.
    pub log_level: Option<String>,
    /// Per-source settings.
    pub sources: Vec<SourceConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            min_pdf_size: DEFAULT_MIN_PDF_SIZE,
            max_pdf_size: DEFAULT_MAX_PDF_SIZE,
            max_retries: crate::download::DEFAULT_MAX_RETRIES,
            base_delay: crate::download::DEFAULT_BASE_DELAY,
            max_delay: crate::download::DEFAULT_MAX_DELAY,
            rate_limit_wait: Duration::from_millis(DEFAULT_RATE_LIMIT_WAIT_MS),
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            contact_email: None,
            min_title_similarity: DEFAULT_MIN_TITLE_SIMILARITY,
            min_quality_score: 0.0,
            min_title_length: DEFAULT_MIN_TITLE_LENGTH,
            max_filename_length: DEFAULT_MAX_FILENAME_LENGTH,
            skip_existing: false,
            https_only: true,
            log_level: None,
            sources: SourceKind::ALL.into_iter().map(SourceConfig::default_for).collect(),
        }
    }
}

// ==================== File layer ====================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    max_threads: Option<usize>,
    min_pdf_size: Option<u64>,
    max_pdf_size: Option<u64>,
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    rate_limit_wait_ms: Option<u64>,
    download_timeout_secs: Option<u64>,
    contact_email: Option<String>,
    min_title_similarity: Option<f64>,
    min_quality_score: Option<f64>,
    min_title_length: Option<usize>,
    max_filename_length: Option<usize>,
    skip_existing: Option<bool>,
    https_only: Option<bool>,
    log_level: Option<String>,
    #[serde(default)]
    sources: BTreeMap<String, FileSourceConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSourceConfig {
    priority: Option<u32>,
    rate_limit: Option<f64>,
    burst_capacity: Option<u32>,
    auth_token: Option<String>,
    enabled: Option<bool>,
    timeout_secs: Option<u64>,
    base_url: Option<String>,
}

impl PipelineConfig {
    /// Parses a TOML document and overlays it on the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for syntax errors or unknown keys and
    /// [`ConfigError::UnknownSource`] for unknown `[sources.*]` tables.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.overlay_toml(raw, "<string>")?;
        Ok(config)
    }

    fn overlay_toml(&mut self, raw: &str, origin: &str) -> Result<(), ConfigError> {
        let file: FileConfig = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            origin: origin.to_string(),
            source,
        })?;
        self.apply_file(file)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        set(&mut self.max_threads, file.max_threads);
        set(&mut self.min_pdf_size, file.min_pdf_size);
        set(&mut self.max_pdf_size, file.max_pdf_size);
        set(&mut self.max_retries, file.max_retries);
        set(&mut self.base_delay, file.base_delay_ms.map(Duration::from_millis));
        set(&mut self.max_delay, file.max_delay_ms.map(Duration::from_millis));
        set(&mut self.rate_limit_wait, file.rate_limit_wait_ms.map(Duration::from_millis));
        set(&mut self.download_timeout, file.download_timeout_secs.map(Duration::from_secs));
        if file.contact_email.is_some() {
            self.contact_email = non_empty(file.contact_email);
        }
        set(&mut self.min_title_similarity, file.min_title_similarity);
        set(&mut self.min_quality_score, file.min_quality_score);
        set(&mut self.min_title_length, file.min_title_length);
        set(&mut self.max_filename_length, file.max_filename_length);
        set(&mut self.skip_existing, file.skip_existing);
        set(&mut self.https_only, file.https_only);
        if file.log_level.is_some() {
            self.log_level = non_empty(file.log_level);
        }

        for (name, overlay) in file.sources {
            let kind = SourceKind::from_name(&name)
                .ok_or_else(|| ConfigError::UnknownSource { name: name.clone() })?;
            let source = self.source_mut(kind);
            if let Some(rate_limit) = overlay.rate_limit {
                source.rate_limit = rate_limit;
                if overlay.burst_capacity.is_none() {
                    source.burst_capacity = default_burst(rate_limit);
                }
            }
            set(&mut source.priority, overlay.priority);
            set(&mut source.burst_capacity, overlay.burst_capacity);
            set(&mut source.enabled, overlay.enabled);
            set(&mut source.timeout, overlay.timeout_secs.map(Duration::from_secs));
            if overlay.auth_token.is_some() {
                source.auth_token = non_empty(overlay.auth_token);
            }
            if overlay.base_url.is_some() {
                source.base_url = non_empty(overlay.base_url);
            }
        }
        Ok(())
    }

    /// Mutable access to a source, inserting its defaults if absent.
    pub fn source_mut(&mut self, kind: SourceKind) -> &mut SourceConfig {
        let index = match self.sources.iter().position(|s| s.name == kind) {
            Some(index) => index,
            None => {
                self.sources.push(SourceConfig::default_for(kind));
                self.sources.len() - 1
            }
        };
        &mut self.sources[index]
    }

    /// Settings for one source, if configured.
    #[must_use]
    pub fn source(&self, kind: SourceKind) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == kind)
    }

    // ==================== Environment layer ====================

    /// Applies environment overrides read through `lookup`.
    ///
    /// Recognized: `BIBP_MAX_THREADS`, `BIBP_EMAIL`, `BIBP_LOG_LEVEL`,
    /// `SEMANTIC_SCHOLAR_API_KEY`, `CORE_API_KEY`, `BIBP_<SOURCE>_RATE` and
    /// `BIBP_<SOURCE>_ENABLED` (e.g. `BIBP_CROSSREF_RATE=1.5`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] when a value does not parse.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(value) = get("BIBP_MAX_THREADS") {
            self.max_threads = parse_env("BIBP_MAX_THREADS", &value, "a positive integer")?;
        }
        if let Some(value) = get("BIBP_EMAIL") {
            self.contact_email = Some(value);
        }
        if let Some(value) = get("BIBP_LOG_LEVEL") {
            self.log_level = Some(value);
        }
        if let Some(value) = get("SEMANTIC_SCHOLAR_API_KEY") {
            self.source_mut(SourceKind::SemanticScholar).auth_token = Some(value);
        }
        if let Some(value) = get("CORE_API_KEY") {
            let core = self.source_mut(SourceKind::Core);
            core.auth_token = Some(value);
            core.enabled = true;
        }
        for kind in SourceKind::ALL {
            let prefix = format!("BIBP_{}", kind.as_str().to_ascii_uppercase());
            let rate_var = format!("{prefix}_RATE");
            if let Some(value) = get(&rate_var) {
                self.source_mut(kind).rate_limit =
                    parse_env(&rate_var, &value, "requests per second")?;
            }
            let enabled_var = format!("{prefix}_ENABLED");
            if let Some(value) = get(&enabled_var) {
                self.source_mut(kind).enabled = parse_env_bool(&enabled_var, &value)?;
            }
        }
        Ok(())
    }

    /// Loads defaults, then the config file, then the process environment.
    ///
    /// An explicit `path` must exist; the default path is used only when present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed, or an
    /// environment value is invalid. Call [`PipelineConfig::validate`] next.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let file_path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => resolve_default_config_path().filter(|p| p.exists()),
        };
        if let Some(file_path) = file_path {
            debug!(path = %file_path.display(), "loading config file");
            let raw = fs::read_to_string(&file_path).map_err(|source| ConfigError::Read {
                path: file_path.clone(),
                source,
            })?;
            config.overlay_toml(&raw, &file_path.display().to_string())?;
        }
        config.apply_env_overrides(|name| env::var(name).ok())?;
        Ok(config)
    }

    // ==================== Validation ====================

    /// Checks ranges and cross-field rules.
    ///
    /// Returns non-fatal warnings on success.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`ConfigError`].
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        if !MAX_THREADS_RANGE.contains(&self.max_threads) {
            return Err(invalid(
                "max_threads",
                format!("{} is out of range; expected 1..=100", self.max_threads),
            ));
        }
        if self.min_pdf_size >= self.max_pdf_size {
            return Err(invalid(
                "min_pdf_size",
                format!(
                    "{} must be smaller than max_pdf_size ({})",
                    self.min_pdf_size, self.max_pdf_size
                ),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(invalid(
                "base_delay_ms",
                format!(
                    "{}ms must not exceed max_delay_ms ({}ms)",
                    self.base_delay.as_millis(),
                    self.max_delay.as_millis()
                ),
            ));
        }
        if self.download_timeout.is_zero() {
            return Err(invalid("download_timeout_secs", "must be at least 1".to_string()));
        }
        check_unit_interval("min_title_similarity", self.min_title_similarity)?;
        check_unit_interval("min_quality_score", self.min_quality_score)?;
        if self.max_filename_length < 40 {
            return Err(invalid(
                "max_filename_length",
                format!("{} is too short; expected at least 40", self.max_filename_length),
            ));
        }

        let mut seen_names = HashSet::new();
        let mut seen_priorities: BTreeMap<u32, SourceKind> = BTreeMap::new();
        for source in &self.sources {
            if !seen_names.insert(source.name) {
                return Err(ConfigError::DuplicateSource { name: source.name });
            }
            let field = |suffix: &str| format!("sources.{}.{suffix}", source.name);
            if !source.rate_limit.is_finite() || source.rate_limit <= 0.0 {
                return Err(invalid(
                    &field("rate_limit"),
                    format!("{} must be a positive number", source.rate_limit),
                ));
            }
            if source.burst_capacity == 0 {
                return Err(invalid(&field("burst_capacity"), "must be at least 1".to_string()));
            }
            if source.timeout.is_zero() {
                return Err(invalid(&field("timeout_secs"), "must be at least 1".to_string()));
            }
            if let Some(base_url) = &source.base_url {
                let parsed = url::Url::parse(base_url)
                    .map_err(|e| invalid(&field("base_url"), format!("{base_url:?} is not a URL: {e}")))?;
                if self.https_only && parsed.scheme() != "https" {
                    return Err(invalid(
                        &field("base_url"),
                        format!("{base_url:?} must use https (or set https_only = false)"),
                    ));
                }
            }
            if let Some(first) = seen_priorities.insert(source.priority, source.name) {
                return Err(ConfigError::DuplicatePriority {
                    priority: source.priority,
                    first,
                    second: source.name,
                });
            }
        }

        let active = self.active_sources();
        if active.is_empty() {
            return Err(ConfigError::NoEnabledSources);
        }

        let mut warnings = Vec::new();
        for (source, reason) in self.dropped_sources() {
            warnings.push(format!("source {} disabled: {reason}", source.name));
        }
        if active.len() < MIN_RECOMMENDED_SOURCES {
            warnings.push(format!(
                "only {} source(s) enabled; success rates improve with at least {MIN_RECOMMENDED_SOURCES}",
                active.len()
            ));
        }
        if active
            .iter()
            .any(|s| s.name == SourceKind::SemanticScholar && s.auth_token.is_none())
        {
            warnings.push(
                "no Semantic Scholar API key configured; anonymous requests are heavily throttled"
                    .to_string(),
            );
        }
        Ok(warnings)
    }

    /// Enabled sources whose credentials are present, in priority order.
    #[must_use]
    pub fn active_sources(&self) -> Vec<&SourceConfig> {
        let mut active: Vec<&SourceConfig> = self
            .sources
            .iter()
            .filter(|s| s.enabled && s.missing_requirement(self.contact_email.as_deref()).is_none())
            .collect();
        active.sort_by_key(|s| s.priority);
        active
    }

    /// Enabled sources excluded for missing credentials, with the reason.
    #[must_use]
    pub fn dropped_sources(&self) -> Vec<(&SourceConfig, &'static str)> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .filter_map(|s| {
                s.missing_requirement(self.contact_email.as_deref())
                    .map(|reason| (s, reason))
            })
            .collect()
    }

    /// Retry policy shared by queries and downloads.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.base_delay, self.max_delay)
    }

    /// Title matching thresholds.
    #[must_use]
    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            min_title_similarity: self.min_title_similarity,
            min_title_length: self.min_title_length,
        }
    }

    /// Client construction settings for one source.
    #[must_use]
    pub fn client_settings(&self, source: &SourceConfig) -> ClientSettings {
        let mut settings = ClientSettings::for_kind(source.name);
        if let Some(base_url) = &source.base_url {
            settings = settings.with_base_url(base_url.clone());
        }
        settings.timeout = source.timeout;
        settings.auth_token.clone_from(&source.auth_token);
        settings.contact_email.clone_from(&self.contact_email);
        settings.match_policy = self.match_policy();
        settings.https_only = self.https_only;
        settings
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/bibp/config.toml`
/// 2. `$HOME/.config/bibp/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join("bibp").join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(PathBuf::from(home).join(".config").join("bibp").join("config.toml"))
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn invalid(field: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message,
    }
}

fn check_unit_interval(field: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("{value} is out of range; expected 0.0..=1.0")))
    }
}

fn parse_env<T: std::str::FromStr>(
    name: &str,
    value: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
        expected,
    })
}

fn parse_env_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name: name.to_string(),
            value: value.to_string(),
            expected: "true or false",
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_source_table() {
        let config = PipelineConfig::default();
        let crossref = config.source(SourceKind::Crossref).unwrap();
        assert_eq!(crossref.priority, 5);
        assert!((crossref.rate_limit - 2.0).abs() < f64::EPSILON);
        assert_eq!(crossref.burst_capacity, 4);
        let s2 = config.source(SourceKind::SemanticScholar).unwrap();
        assert_eq!(s2.burst_capacity, 2);
        assert!(!config.source(SourceKind::Core).unwrap().enabled);
    }

    #[test]
    fn test_default_config_is_valid_and_drops_unpaywall_without_email() {
        let config = PipelineConfig::default();
        let warnings = config.validate().unwrap();
        let names: Vec<SourceKind> = config.active_sources().iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                SourceKind::Arxiv,
                SourceKind::OpenAlex,
                SourceKind::SemanticScholar,
                SourceKind::Crossref,
                SourceKind::PubMed
            ]
        );
        assert!(warnings.iter().any(|w| w.contains("unpaywall")), "{warnings:?}");
        assert!(warnings.iter().any(|w| w.contains("Semantic Scholar")), "{warnings:?}");
    }

    #[test]
    fn test_default_burst() {
        assert_eq!(default_burst(10.0), 20);
        assert_eq!(default_burst(0.8), 2);
        assert_eq!(default_burst(3.0), 6);
    }

    #[test]
    fn test_toml_overlay_partial_fields() {
        let config = PipelineConfig::from_toml_str(
            r#"
            max_threads = 8
            contact_email = "me@uni.edu"
            base_delay_ms = 250

            [sources.crossref]
            rate_limit = 5.0

            [sources.core]
            enabled = true
            auth_token = "core-key"
            priority = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.max_threads, 8);
        assert_eq!(config.contact_email.as_deref(), Some("me@uni.edu"));
        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert_eq!(config.source(SourceKind::Crossref).unwrap().burst_capacity, 10);
        assert_eq!(config.active_sources()[0].name, SourceKind::Core);
        assert_eq!(config.min_pdf_size, DEFAULT_MIN_PDF_SIZE);
    }

    #[test]
    fn test_toml_rejects_unknown_keys_and_sources() {
        assert!(matches!(
            PipelineConfig::from_toml_str("concurrency = 3"),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            PipelineConfig::from_toml_str("[sources.scihub]\nenabled = true"),
            Err(ConfigError::UnknownSource { .. })
        ));
        assert!(matches!(
            PipelineConfig::from_toml_str("max_threads = \"many\""),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PipelineConfig::default();
        config
            .apply_env_overrides(env_from(&[
                ("BIBP_MAX_THREADS", "12"),
                ("BIBP_EMAIL", "env@uni.edu"),
                ("CORE_API_KEY", "k"),
                ("BIBP_ARXIV_ENABLED", "false"),
                ("BIBP_SEMANTIC_SCHOLAR_RATE", "0.5"),
            ]))
            .unwrap();
        assert_eq!(config.max_threads, 12);
        assert_eq!(config.contact_email.as_deref(), Some("env@uni.edu"));
        assert!(config.source(SourceKind::Core).unwrap().enabled);
        assert!(!config.source(SourceKind::Arxiv).unwrap().enabled);
        assert!(
            (config.source(SourceKind::SemanticScholar).unwrap().rate_limit - 0.5).abs()
                < f64::EPSILON
        );
        let names: Vec<SourceKind> = config.active_sources().iter().map(|s| s.name).collect();
        assert!(names.contains(&SourceKind::Unpaywall));
        assert!(names.contains(&SourceKind::Core));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_env_overrides(env_from(&[("BIBP_MAX_THREADS", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("BIBP_MAX_THREADS"));
        let err = config
            .apply_env_overrides(env_from(&[("BIBP_CROSSREF_ENABLED", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = PipelineConfig {
            max_threads: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("max_threads"));

        config.max_threads = 4;
        config.base_delay = Duration::from_secs(60);
        assert!(config.validate().unwrap_err().to_string().contains("base_delay_ms"));

        config.base_delay = Duration::from_secs(1);
        config.min_pdf_size = config.max_pdf_size;
        assert!(config.validate().unwrap_err().to_string().contains("min_pdf_size"));

        config.min_pdf_size = 1000;
        config.source_mut(SourceKind::Crossref).burst_capacity = 0;
        assert!(config.validate().unwrap_err().to_string().contains("burst_capacity"));

        config.source_mut(SourceKind::Crossref).burst_capacity = 4;
        config.source_mut(SourceKind::Crossref).rate_limit = 0.0;
        assert!(config.validate().unwrap_err().to_string().contains("rate_limit"));
    }

    #[test]
    fn test_validate_rejects_duplicate_priority() {
        let mut config = PipelineConfig::default();
        config.source_mut(SourceKind::PubMed).priority = 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePriority { priority: 1, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_source() {
        let mut config = PipelineConfig::default();
        let mut copy = SourceConfig::default_for(SourceKind::Arxiv);
        copy.priority = 99;
        config.sources.push(copy);
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateSource { .. })));
    }

    #[test]
    fn test_validate_rejects_no_enabled_sources() {
        let mut config = PipelineConfig::default();
        for source in &mut config.sources {
            source.enabled = false;
        }
        // CORE enabled without a key is dropped, so still nothing to run.
        config.source_mut(SourceKind::Core).enabled = true;
        assert!(matches!(config.validate(), Err(ConfigError::NoEnabledSources)));
    }

    #[test]
    fn test_validate_requires_https_base_url() {
        let mut config = PipelineConfig::default();
        config.source_mut(SourceKind::Arxiv).base_url = Some("http://127.0.0.1:8080".into());
        assert!(config.validate().unwrap_err().to_string().contains("https"));
        config.https_only = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bibp.toml");
        std::fs::write(&path, "max_retries = 1\nskip_existing = true\n").unwrap();
        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.max_retries, 1);
        assert!(config.skip_existing);
    }

    #[test]
    fn test_load_missing_explicit_file_is_error() {
        let dir = TempDir::new().unwrap();
        let err = PipelineConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_client_settings_carry_source_values() {
        let mut config = PipelineConfig {
            contact_email: Some("me@uni.edu".into()),
            https_only: false,
            ..PipelineConfig::default()
        };
        let source = config.source_mut(SourceKind::Crossref);
        source.base_url = Some("http://localhost:1234/".into());
        source.timeout = Duration::from_secs(3);
        let source = config.source(SourceKind::Crossref).unwrap().clone();
        let settings = config.client_settings(&source);
        assert_eq!(settings.base_url, "http://localhost:1234");
        assert_eq!(settings.timeout, Duration::from_secs(3));
        assert_eq!(settings.contact_email.as_deref(), Some("me@uni.edu"));
        assert!(!settings.https_only);
    }

    #[test]
    fn test_source_config_debug_redacts_token() {
        let mut source = SourceConfig::default_for(SourceKind::Core);
        source.auth_token = Some("secret-token".into());
        let debug = format!("{source:?}");
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("has_auth_token: true"));
    }
}
