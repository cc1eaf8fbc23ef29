//! Core domain model for the solicitation report section pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod controller;

pub use controller::{
    check_prerequisites, dependents_of, prerequisites_of, ready_dependents, reduce_overall_status,
};

pub const CRATE_NAME: &str = "solrep-core";

/// One named unit of analysis within a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionName {
    Summary,
    Deadlines,
    Requirements,
    Contacts,
    Risks,
    Scoring,
}

impl SectionName {
    pub const ALL: [SectionName; 6] = [
        SectionName::Summary,
        SectionName::Deadlines,
        SectionName::Requirements,
        SectionName::Contacts,
        SectionName::Risks,
        SectionName::Scoring,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Deadlines => "deadlines",
            Self::Requirements => "requirements",
            Self::Contacts => "contacts",
            Self::Risks => "risks",
            Self::Scoring => "scoring",
        }
    }
}

impl fmt::Display for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown section `{0}`")]
pub struct UnknownSection(pub String);

impl FromStr for SectionName {
    type Err = UnknownSection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|section| section.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownSection(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SectionStatus {
    #[default]
    Idle,
    InProgress,
    Complete,
    Failed,
}

impl SectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one section within a report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionRecord {
    #[serde(default)]
    pub status: SectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SectionRecord {
    pub fn idle(now: DateTime<Utc>) -> Self {
        Self {
            status: SectionStatus::Idle,
            updated_at: Some(now),
            ..Default::default()
        }
    }

    /// True when the section already holds a result computed for `input_hash`.
    pub fn is_satisfied_by(&self, input_hash: &str) -> bool {
        self.status == SectionStatus::Complete && self.input_hash.as_deref() == Some(input_hash)
    }
}

/// The aggregate entity holding all sections for one project/opportunity pair.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunity_id: Option<String>,
    #[serde(default)]
    pub sections: BTreeMap<SectionName, SectionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Written only with the scoring aggregates: COMPLETE means scoring finished
    /// and the fields above are current. Later section changes do not touch it;
    /// `overall_status` is the live reduction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SectionStatus>,
    #[serde(default)]
    pub source_text_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Report {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        opportunity_id: impl Into<String>,
        source_text_keys: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: Some(project_id.into()),
            opportunity_id: Some(opportunity_id.into()),
            source_text_keys,
            status: Some(SectionStatus::Idle),
            created_at: Some(now),
            updated_at: Some(now),
            ..Default::default()
        }
    }

    pub fn section(&self, section: SectionName) -> Option<&SectionRecord> {
        self.sections.get(&section)
    }

    /// Status of a section, treating an absent record as IDLE.
    pub fn section_status(&self, section: SectionName) -> SectionStatus {
        self.section(section)
            .map(|record| record.status)
            .unwrap_or_default()
    }

    /// Fingerprint of the inputs `section` would be computed from right now.
    pub fn input_hash(&self, section: SectionName) -> String {
        section_input_hash(&self.id, section, &self.source_text_keys)
    }

    pub fn overall_status(&self) -> SectionStatus {
        reduce_overall_status(SectionName::ALL.into_iter().map(|s| self.section_status(s)))
    }
}

/// Digest over `reportId:section:sortedJoinedKeys`.
pub fn section_input_hash(report_id: &str, section: SectionName, source_keys: &[String]) -> String {
    let mut keys: Vec<&str> = source_keys.iter().map(String::as_str).collect();
    keys.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(report_id.as_bytes());
    hasher.update(b":");
    hasher.update(section.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(keys.join(",").as_bytes());
    hex::encode(hasher.finalize())
}

/// A queued instruction to compute one section of one report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub report_id: String,
    pub section: SectionName,
    pub input_hash: String,
    pub dispatched_at: DateTime<Utc>,
    #[serde(default)]
    pub force: bool,
}

/// Top-level aggregate fields written together with a completed section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopLevelPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SectionStatus>,
}

impl TopLevelPatch {
    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Attribute name and value for every field present in the patch.
    pub fn fields(&self) -> Vec<(&'static str, JsonValue)> {
        let mut out = Vec::new();
        if let Some(score) = self.composite_score {
            out.push(("compositeScore", JsonValue::from(score)));
        }
        if let Some(recommendation) = &self.recommendation {
            out.push(("recommendation", JsonValue::from(recommendation.clone())));
        }
        if let Some(decision) = &self.decision {
            out.push(("decision", JsonValue::from(decision.clone())));
        }
        if let Some(confidence) = self.confidence {
            out.push(("confidence", JsonValue::from(confidence)));
        }
        if let Some(status) = self.status {
            out.push(("status", JsonValue::from(status.as_str())));
        }
        out
    }
}

/// Error taxonomy of the section pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("report {report_id} not found")]
    ReportNotFound { report_id: String },
    #[error("prerequisites not met for {section}: missing {}", join_sections(.missing))]
    PrerequisitesNotMet {
        section: SectionName,
        missing: Vec<SectionName>,
    },
    #[error("no source text available for report {report_id}: {reason}")]
    SourceTextUnavailable { report_id: String, reason: String },
    #[error("source text too short to analyze: {length} characters (minimum {minimum})")]
    SourceTextTooShort { length: usize, minimum: usize },
    #[error("{0}")]
    ModelInvocationFailed(String),
    #[error("no JSON object found in model output (length {length}, tail {tail:?})")]
    ModelOutputNotJson { length: usize, tail: String },
    #[error("could not close or parse JSON in model output (length {length}, tail {tail:?}): {reason}")]
    ModelOutputTruncated {
        length: usize,
        tail: String,
        reason: String,
    },
    #[error("{section} output failed validation: {reason}; raw output: {raw}")]
    ModelOutputSchemaInvalid {
        section: SectionName,
        reason: String,
        raw: String,
    },
    #[error("{0}")]
    Storage(String),
    #[error("{0}")]
    Queue(String),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReportNotFound { .. } => "ReportNotFound",
            Self::PrerequisitesNotMet { .. } => "PrerequisitesNotMet",
            Self::SourceTextUnavailable { .. } => "SourceTextUnavailable",
            Self::SourceTextTooShort { .. } => "SourceTextTooShort",
            Self::ModelInvocationFailed(_) => "ModelInvocationFailed",
            Self::ModelOutputNotJson { .. } => "ModelOutputNotJSON",
            Self::ModelOutputTruncated { .. } => "ModelOutputTruncated",
            Self::ModelOutputSchemaInvalid { .. } => "ModelOutputSchemaInvalid",
            Self::Storage(_) => "StorageError",
            Self::Queue(_) => "QueueError",
        }
    }

    /// Sequencing errors belong to the caller and are never retried by the queue.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ReportNotFound { .. } | Self::PrerequisitesNotMet { .. }
        )
    }

    pub fn failure_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

/// Text recorded on a FAILED section for an arbitrary error.
pub fn format_failure(err: &(dyn std::error::Error + 'static)) -> String {
    if let Some(typed) = err.downcast_ref::<PipelineError>() {
        return typed.failure_message();
    }
    let message = err.to_string();
    if message.trim().is_empty() {
        "Unknown error".to_string()
    } else {
        message
    }
}

fn join_sections(sections: &[SectionName]) -> String {
    sections
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).single().unwrap()
    }

    #[test]
    fn input_hash_is_stable_and_order_independent() {
        let a = section_input_hash(
            "r-1",
            SectionName::Summary,
            &["b.txt".to_string(), "a.txt".to_string()],
        );
        let b = section_input_hash(
            "r-1",
            SectionName::Summary,
            &["a.txt".to_string(), "b.txt".to_string()],
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn input_hash_changes_with_keys_and_section() {
        let keys = vec!["a.txt".to_string()];
        let base = section_input_hash("r-1", SectionName::Risks, &keys);
        let more = section_input_hash(
            "r-1",
            SectionName::Risks,
            &["a.txt".to_string(), "addendum.txt".to_string()],
        );
        let other_section = section_input_hash("r-1", SectionName::Contacts, &keys);
        assert_ne!(base, more);
        assert_ne!(base, other_section);
    }

    #[test]
    fn section_names_parse_and_display() {
        for section in SectionName::ALL {
            assert_eq!(section.as_str().parse::<SectionName>().unwrap(), section);
        }
        assert_eq!("Scoring".parse::<SectionName>().unwrap(), SectionName::Scoring);
        assert!("pricing".parse::<SectionName>().is_err());
    }

    #[test]
    fn report_serializes_with_camel_case_and_screaming_status() {
        let mut report = Report::new("r-1", "p-1", "o-1", vec!["k".into()], ts());
        report.sections.insert(
            SectionName::Deadlines,
            SectionRecord {
                status: SectionStatus::InProgress,
                input_hash: Some("abc".into()),
                updated_at: Some(ts()),
                ..Default::default()
            },
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["sourceTextKeys"][0], "k");
        assert_eq!(value["sections"]["deadlines"]["status"], "IN_PROGRESS");
        assert_eq!(value["sections"]["deadlines"]["inputHash"], "abc");
        assert!(value["sections"]["deadlines"].get("data").is_none());

        let back: Report = serde_json::from_value(value).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn satisfied_requires_complete_and_matching_hash() {
        let mut record = SectionRecord::idle(ts());
        record.input_hash = Some("h".into());
        assert!(!record.is_satisfied_by("h"));
        record.status = SectionStatus::Complete;
        assert!(record.is_satisfied_by("h"));
        assert!(!record.is_satisfied_by("other"));
    }

    #[test]
    fn failure_message_prefixes_kind_for_typed_errors() {
        let err = PipelineError::SourceTextTooShort {
            length: 30,
            minimum: 100,
        };
        assert_eq!(
            format_failure(&err),
            "SourceTextTooShort: source text too short to analyze: 30 characters (minimum 100)"
        );

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        assert_eq!(format_failure(&io), "disk on fire");

        let blank = std::io::Error::new(std::io::ErrorKind::Other, "");
        assert_eq!(format_failure(&blank), "Unknown error");
    }

    #[test]
    fn prerequisite_errors_are_not_retryable() {
        let err = PipelineError::PrerequisitesNotMet {
            section: SectionName::Scoring,
            missing: vec![SectionName::Risks, SectionName::Contacts],
        };
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "prerequisites not met for scoring: missing risks, contacts"
        );
        assert!(PipelineError::ModelInvocationFailed("503".into()).is_retryable());
    }

    #[test]
    fn top_level_patch_lists_present_fields() {
        let patch = TopLevelPatch {
            composite_score: Some(72.5),
            decision: Some("BID".into()),
            status: Some(SectionStatus::Complete),
            ..Default::default()
        };
        let names: Vec<_> = patch.fields().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["compositeScore", "decision", "status"]);
        assert!(TopLevelPatch::default().is_empty());
    }
}
