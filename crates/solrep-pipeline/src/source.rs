//! Loading and merging a report's source documents into model input.

use solrep_core::{PipelineError, Report};
use solrep_storage::ObjectStore;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceTextLimits {
    pub char_budget: usize,
    pub min_chars: usize,
}

impl Default for SourceTextLimits {
    fn default() -> Self {
        Self {
            char_budget: 180_000,
            min_chars: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceText {
    pub text: String,
    pub documents: usize,
    /// Meaningful characters before boundary markers and truncation.
    pub content_chars: usize,
    pub truncated: bool,
}

pub async fn load_source_text(
    objects: &dyn ObjectStore,
    report: &Report,
    limits: SourceTextLimits,
) -> Result<SourceText, PipelineError> {
    if report.source_text_keys.is_empty() {
        return Err(PipelineError::SourceTextUnavailable {
            report_id: report.id.clone(),
            reason: "report has no source documents".to_string(),
        });
    }

    let mut documents = Vec::with_capacity(report.source_text_keys.len());
    for key in &report.source_text_keys {
        let text = objects
            .get_text(key)
            .await
            .map_err(|err| PipelineError::SourceTextUnavailable {
                report_id: report.id.clone(),
                reason: format!("{key}: {err}"),
            })?;
        documents.push((key.as_str(), text));
    }

    let source = merge_documents(&documents, limits.char_budget);
    debug!(
        report_id = %report.id,
        documents = source.documents,
        content_chars = source.content_chars,
        truncated = source.truncated,
        "loaded source text"
    );
    if source.documents == 0 {
        return Err(PipelineError::SourceTextUnavailable {
            report_id: report.id.clone(),
            reason: "every source document is empty".to_string(),
        });
    }
    if source.content_chars < limits.min_chars {
        return Err(PipelineError::SourceTextTooShort {
            length: source.content_chars,
            minimum: limits.min_chars,
        });
    }
    Ok(source)
}

/// Joins documents with boundary markers (only when there is more than one) and
/// cuts the result at `char_budget` with a visible marker.
pub fn merge_documents(documents: &[(&str, String)], char_budget: usize) -> SourceText {
    let present: Vec<(&str, &str)> = documents
        .iter()
        .map(|(key, text)| (*key, text.trim()))
        .filter(|(_, text)| !text.is_empty())
        .collect();
    let multiple = present.len() > 1;

    let (merged, content_chars) = present.iter().enumerate().fold(
        (String::new(), 0usize),
        |(mut merged, chars), (index, (key, text))| {
            if multiple {
                if index > 0 {
                    merged.push_str("\n\n");
                }
                merged.push_str(&document_boundary(index + 1, key));
            }
            merged.push_str(text);
            (merged, chars + text.chars().count())
        },
    );

    let total_chars = merged.chars().count();
    let truncated = total_chars > char_budget;
    let text = if truncated {
        let mut head: String = merged.chars().take(char_budget).collect();
        head.push_str(&truncation_marker(char_budget, total_chars));
        head
    } else {
        merged
    };

    SourceText {
        text,
        documents: present.len(),
        content_chars,
        truncated,
    }
}

fn document_boundary(index: usize, key: &str) -> String {
    format!("===== DOCUMENT {index}: {key} =====\n")
}

fn truncation_marker(budget: usize, total: usize) -> String {
    format!("\n\n[... truncated: showing first {budget} of {total} characters ...]")
}
