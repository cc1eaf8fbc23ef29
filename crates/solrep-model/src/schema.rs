//! Per-section output schemas and post-validation normalization.
//!
//! Only the fields the pipeline reasons about are typed; everything else the
//! model returns is carried through untouched in `extra`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use solrep_core::{SectionName, SectionStatus, TopLevelPatch};

/// Validated, normalized section payload plus any aggregates it contributes.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSection {
    pub data: JsonValue,
    pub top_level: Option<TopLevelPatch>,
}

pub trait SectionSchema: DeserializeOwned + Serialize {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    fn normalize(&mut self) {}

    fn top_level_patch(&self) -> Option<TopLevelPatch> {
        None
    }
}

pub fn validate_section(section: SectionName, value: JsonValue) -> Result<ValidatedSection, String> {
    match section {
        SectionName::Summary => validate_as::<SummarySection>(value),
        SectionName::Deadlines => validate_as::<DeadlinesSection>(value),
        SectionName::Requirements => validate_as::<RequirementsSection>(value),
        SectionName::Contacts => validate_as::<ContactsSection>(value),
        SectionName::Risks => validate_as::<RisksSection>(value),
        SectionName::Scoring => validate_as::<ScoringSection>(value),
    }
}

fn validate_as<T: SectionSchema>(value: JsonValue) -> Result<ValidatedSection, String> {
    let mut parsed: T = serde_json::from_value(value).map_err(|err| err.to_string())?;
    parsed.validate()?;
    parsed.normalize();
    let data = serde_json::to_value(&parsed).map_err(|err| err.to_string())?;
    Ok(ValidatedSection {
        top_level: parsed.top_level_patch(),
        data,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarySection {
    pub overview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl SectionSchema for SummarySection {
    fn validate(&self) -> Result<(), String> {
        if self.overview.trim().is_empty() {
            return Err("overview must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlinesSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_deadline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_submission_deadline: Option<bool>,
    #[serde(default)]
    pub deadlines: Vec<DeadlineItem>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlineItem {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl SectionSchema for DeadlinesSection {
    fn normalize(&mut self) {
        if self
            .submission_deadline
            .as_deref()
            .is_some_and(|d| d.trim().is_empty())
        {
            self.submission_deadline = None;
        }
        if self.has_submission_deadline.is_none() {
            self.has_submission_deadline = Some(self.submission_deadline.is_some());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementsSection {
    #[serde(default)]
    pub requirements: Vec<RequirementItem>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementItem {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandatory: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl SectionSchema for RequirementsSection {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactsSection {
    #[serde(default)]
    pub contacts: Vec<ContactItem>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl SectionSchema for ContactsSection {
    fn validate(&self) -> Result<(), String> {
        match self
            .contacts
            .iter()
            .position(|c| c.name.is_none() && c.email.is_none() && c.phone.is_none())
        {
            Some(index) => Err(format!("contacts[{index}] has no name, email, or phone")),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[serde(alias = "low", alias = "Low")]
    Low,
    #[serde(alias = "medium", alias = "Medium")]
    Medium,
    #[serde(alias = "high", alias = "High")]
    High,
    #[serde(alias = "critical", alias = "Critical")]
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RisksSection {
    #[serde(default)]
    pub risks: Vec<RiskItem>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskItem {
    pub title: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impacts_score: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitigation: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl SectionSchema for RisksSection {
    fn normalize(&mut self) {
        for risk in &mut self.risks {
            if risk.impacts_score.is_none()
                && matches!(risk.severity, Severity::High | Severity::Critical)
            {
                risk.impacts_score = Some(true);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringSection {
    pub composite_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub criteria: Vec<JsonValue>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl SectionSchema for ScoringSection {
    fn validate(&self) -> Result<(), String> {
        if !(0.0..=100.0).contains(&self.composite_score) {
            return Err(format!(
                "compositeScore {} outside 0..=100",
                self.composite_score
            ));
        }
        if let Some(confidence) = self.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(format!("confidence {confidence} outside 0..=1"));
            }
        }
        Ok(())
    }

    fn normalize(&mut self) {
        if let Some(decision) = self.decision.as_mut() {
            *decision = decision.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        }
    }

    /// Scoring runs last, so its completion also completes the report.
    fn top_level_patch(&self) -> Option<TopLevelPatch> {
        Some(TopLevelPatch {
            composite_score: Some(self.composite_score),
            recommendation: self.recommendation.clone(),
            decision: self.decision.clone(),
            confidence: self.confidence,
            status: Some(SectionStatus::Complete),
        })
    }
}
