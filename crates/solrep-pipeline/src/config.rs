//! Environment configuration and the per-section prompt catalog.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use solrep_core::SectionName;
use tokio::fs;

use crate::source::SourceTextLimits;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub objects_dir: PathBuf,
    pub model_endpoint: String,
    pub model_api_key: Option<String>,
    pub model_id: String,
    pub model_timeout_secs: u64,
    pub worker_batch_size: usize,
    pub worker_poll_ms: u64,
    pub visibility_timeout_secs: u64,
    pub source_char_budget: usize,
    pub source_min_chars: usize,
    pub sections_file: Option<PathBuf>,
    pub auto_dispatch: bool,
    pub web_port: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        Self {
            database_url: non_empty("DATABASE_URL"),
            objects_dir: non_empty("SOLREP_OBJECTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./objects")),
            model_endpoint: non_empty("SOLREP_MODEL_ENDPOINT")
                .unwrap_or_else(|| "http://localhost:8080/v1/messages".to_string()),
            model_api_key: non_empty("SOLREP_MODEL_API_KEY"),
            model_id: non_empty("SOLREP_MODEL_ID").unwrap_or_else(|| "solrep-analyst".to_string()),
            model_timeout_secs: parse_or(var("SOLREP_MODEL_TIMEOUT_SECS"), 120),
            worker_batch_size: parse_or(var("SOLREP_WORKER_BATCH_SIZE"), 10),
            worker_poll_ms: parse_or(var("SOLREP_WORKER_POLL_MS"), 1000),
            visibility_timeout_secs: parse_or(var("SOLREP_VISIBILITY_TIMEOUT_SECS"), 900),
            source_char_budget: parse_or(var("SOLREP_SOURCE_CHAR_BUDGET"), 180_000),
            source_min_chars: parse_or(var("SOLREP_SOURCE_MIN_CHARS"), 100),
            sections_file: non_empty("SOLREP_SECTIONS_FILE").map(PathBuf::from),
            auto_dispatch: var("SOLREP_AUTO_DISPATCH")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(true),
            web_port: parse_or(var("SOLREP_WEB_PORT"), 8000),
        }
    }

    pub fn source_limits(&self) -> SourceTextLimits {
        SourceTextLimits {
            char_budget: self.source_char_budget,
            min_chars: self.source_min_chars,
        }
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms)
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectionSettings {
    pub system: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SectionOverride {
    system: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

/// System instructions and generation limits per section.
#[derive(Debug, Clone, Default)]
pub struct SectionCatalog {
    overrides: BTreeMap<SectionName, SectionSettings>,
}

impl SectionCatalog {
    pub fn builtin() -> Self {
        Self::default()
    }

    /// Overlays a YAML mapping of `section -> {system, max_tokens, temperature}` on
    /// the built-in settings. Omitted keys keep their built-in value.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let parsed: BTreeMap<SectionName, SectionOverride> =
            serde_yaml::from_str(text).context("parsing section catalog")?;
        let overrides = parsed
            .into_iter()
            .map(|(section, patch)| {
                let base = builtin_settings(section);
                let settings = SectionSettings {
                    system: patch.system.unwrap_or(base.system),
                    max_tokens: patch.max_tokens.unwrap_or(base.max_tokens),
                    temperature: patch.temperature.unwrap_or(base.temperature),
                };
                (section, settings)
            })
            .collect();
        Ok(Self { overrides })
    }

    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::builtin());
        };
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn settings(&self, section: SectionName) -> SectionSettings {
        self.overrides
            .get(&section)
            .cloned()
            .unwrap_or_else(|| builtin_settings(section))
    }
}

const JSON_ONLY: &str = "Respond with a single JSON object and nothing else.";

fn builtin_settings(section: SectionName) -> SectionSettings {
    let (task, max_tokens) = match section {
        SectionName::Summary => (
            "Summarize the solicitation. Fields: overview (string, required), title, agency.",
            4_000,
        ),
        SectionName::Deadlines => (
            "List every dated milestone. Fields: submissionDeadline (ISO-8601 or null), \
             deadlines (array of {label, date}).",
            4_000,
        ),
        SectionName::Requirements => (
            "List the submission and eligibility requirements. Fields: requirements \
             (array of {text, category, mandatory}).",
            8_000,
        ),
        SectionName::Contacts => (
            "List points of contact. Fields: contacts (array of {name, role, email, phone}).",
            2_000,
        ),
        SectionName::Risks => (
            "Identify bid risks. Fields: risks (array of {title, severity: LOW|MEDIUM|HIGH|CRITICAL, \
             impactsScore, mitigation}).",
            6_000,
        ),
        SectionName::Scoring => (
            "Score the opportunity from the completed analysis. Fields: compositeScore (0-100, \
             required), recommendation, decision (BID|NO_BID|REVIEW), confidence (0-1), criteria.",
            4_000,
        ),
    };
    SectionSettings {
        system: format!("You analyze government solicitations. {task} {JSON_ONLY}"),
        max_tokens,
        temperature: 0.1,
    }
}
