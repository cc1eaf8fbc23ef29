//! User prompt assembly.

use solrep_core::{prerequisites_of, Report, SectionName};

use crate::source::SourceText;

/// Builds the user content for `section`. Sections with prerequisites also get
/// the completed prerequisite payloads ahead of the source text.
pub fn build_user_prompt(section: SectionName, report: &Report, source: &SourceText) -> String {
    let mut prompt = String::new();
    let prerequisites = prerequisites_of(section);
    if !prerequisites.is_empty() {
        prompt.push_str("Completed analysis sections:\n\n");
        for prerequisite in prerequisites {
            let data = report
                .section(*prerequisite)
                .and_then(|record| record.data.as_ref())
                .and_then(|data| serde_json::to_string_pretty(data).ok())
                .unwrap_or_else(|| "null".to_string());
            prompt.push_str(&format!("## {prerequisite}\n{data}\n\n"));
        }
    }
    if source.truncated {
        prompt.push_str("Note: the source text below was truncated.\n\n");
    }
    prompt.push_str("Solicitation text:\n\n");
    prompt.push_str(&source.text);
    prompt
}
