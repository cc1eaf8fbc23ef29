//! Update descriptors: one atomic partial update of a report document.
//!
//! Attribute names are never spliced into an expression directly. Every clause is
//! bound to a placeholder whose prefix encodes its nesting level (`#t_` for the
//! report itself, `#s_<section>_` for a section subtree), so `status` at the top
//! level and `status` inside a section always occupy distinct slots even when
//! both are written by the same update.

use std::collections::BTreeMap;

use serde_json::{Map, Value as JsonValue};
use solrep_core::SectionName;

use crate::StoreError;

const SECTIONS_ATTR: &str = "sections";

/// Nesting level a clause addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Report,
    Section(SectionName),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(JsonValue),
    SetIfAbsent(JsonValue),
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateClause {
    pub placeholder: String,
    pub scope: Scope,
    /// `None` addresses the whole section subtree.
    pub attribute: Option<String>,
    pub op: UpdateOp,
}

impl UpdateClause {
    pub fn path(&self) -> Vec<String> {
        match (self.scope, &self.attribute) {
            (Scope::Report, Some(attr)) => vec![attr.clone()],
            (Scope::Report, None) => Vec::new(),
            (Scope::Section(section), None) => {
                vec![SECTIONS_ATTR.to_string(), section.as_str().to_string()]
            }
            (Scope::Section(section), Some(attr)) => vec![
                SECTIONS_ATTR.to_string(),
                section.as_str().to_string(),
                attr.clone(),
            ],
        }
    }

    fn placeholder_path(&self) -> String {
        match self.scope {
            Scope::Report => self.placeholder.clone(),
            Scope::Section(section) => {
                let subtree = section_placeholder(section, None);
                if self.attribute.is_none() {
                    format!("#{SECTIONS_ATTR}.{subtree}")
                } else {
                    format!("#{SECTIONS_ATTR}.{subtree}.{}", self.placeholder)
                }
            }
        }
    }

    fn value_placeholder(&self) -> String {
        format!(":{}", &self.placeholder[1..])
    }
}

fn report_placeholder(attribute: &str) -> String {
    format!("#t_{attribute}")
}

fn section_placeholder(section: SectionName, attribute: Option<&str>) -> String {
    match attribute {
        Some(attr) => format!("#s_{}_{attr}", section.as_str()),
        None => format!("#s_{}", section.as_str()),
    }
}

/// Builder that assigns a disjoint placeholder to every clause.
#[derive(Debug, Clone, Default)]
pub struct UpdateBuilder {
    clauses: Vec<UpdateClause>,
}

impl UpdateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_report(self, attribute: &str, value: JsonValue) -> Self {
        self.push(Scope::Report, Some(attribute), UpdateOp::Set(value))
    }

    pub fn set_section(self, section: SectionName, attribute: &str, value: JsonValue) -> Self {
        self.push(Scope::Section(section), Some(attribute), UpdateOp::Set(value))
    }

    pub fn remove_section(self, section: SectionName, attribute: &str) -> Self {
        self.push(Scope::Section(section), Some(attribute), UpdateOp::Remove)
    }

    /// Creates the section subtree only when it does not exist yet.
    pub fn init_section_if_absent(self, section: SectionName, value: JsonValue) -> Self {
        self.push(Scope::Section(section), None, UpdateOp::SetIfAbsent(value))
    }

    fn push(mut self, scope: Scope, attribute: Option<&str>, op: UpdateOp) -> Self {
        let placeholder = match scope {
            Scope::Report => report_placeholder(attribute.unwrap_or_default()),
            Scope::Section(section) => section_placeholder(section, attribute),
        };
        let clause = UpdateClause {
            placeholder,
            scope,
            attribute: attribute.map(str::to_string),
            op,
        };
        // A later clause for the same slot replaces the earlier one.
        match self
            .clauses
            .iter_mut()
            .find(|existing| existing.placeholder == clause.placeholder)
        {
            Some(existing) => *existing = clause,
            None => self.clauses.push(clause),
        }
        self
    }

    pub fn build(self) -> UpdateDescriptor {
        UpdateDescriptor {
            clauses: self.clauses,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateDescriptor {
    clauses: Vec<UpdateClause>,
}

impl UpdateDescriptor {
    pub fn clauses(&self) -> &[UpdateClause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Placeholder → attribute name table, including the shared `#sections` name.
    pub fn names(&self) -> BTreeMap<String, String> {
        let mut names = BTreeMap::new();
        for clause in &self.clauses {
            if let Scope::Section(section) = clause.scope {
                names.insert(format!("#{SECTIONS_ATTR}"), SECTIONS_ATTR.to_string());
                names.insert(
                    section_placeholder(section, None),
                    section.as_str().to_string(),
                );
            }
            if let Some(attr) = &clause.attribute {
                names.insert(clause.placeholder.clone(), attr.clone());
            }
        }
        names
    }

    /// Placeholder → value table for every clause that carries a value.
    pub fn values(&self) -> BTreeMap<String, JsonValue> {
        self.clauses
            .iter()
            .filter_map(|clause| match &clause.op {
                UpdateOp::Set(value) | UpdateOp::SetIfAbsent(value) => {
                    Some((clause.value_placeholder(), value.clone()))
                }
                UpdateOp::Remove => None,
            })
            .collect()
    }

    /// Renders the update as a placeholder expression, for logging.
    pub fn expression(&self) -> String {
        let mut sets = Vec::new();
        let mut removes = Vec::new();
        for clause in &self.clauses {
            let path = clause.placeholder_path();
            match clause.op {
                UpdateOp::Set(_) => sets.push(format!("{path} = {}", clause.value_placeholder())),
                UpdateOp::SetIfAbsent(_) => sets.push(format!(
                    "{path} = if_not_exists({path}, {})",
                    clause.value_placeholder()
                )),
                UpdateOp::Remove => removes.push(path),
            }
        }
        let mut out = Vec::new();
        if !sets.is_empty() {
            out.push(format!("SET {}", sets.join(", ")));
        }
        if !removes.is_empty() {
            out.push(format!("REMOVE {}", removes.join(", ")));
        }
        out.join(" ")
    }

    /// Applies every clause to `doc`. Callers hold whatever lock makes this atomic.
    pub fn apply(&self, doc: &mut JsonValue) -> Result<(), StoreError> {
        for clause in &self.clauses {
            let path = clause.path();
            let Some((leaf, parents)) = path.split_last() else {
                return Err(StoreError::InvalidDocument(
                    "update clause without a path".to_string(),
                ));
            };
            match &clause.op {
                UpdateOp::Set(value) => {
                    let parent = object_at_path(doc, parents, true)?
                        .ok_or_else(|| missing_parent(&path))?;
                    parent.insert(leaf.clone(), value.clone());
                }
                UpdateOp::SetIfAbsent(value) => {
                    let parent = object_at_path(doc, parents, true)?
                        .ok_or_else(|| missing_parent(&path))?;
                    parent.entry(leaf.clone()).or_insert_with(|| value.clone());
                }
                UpdateOp::Remove => {
                    if let Some(parent) = object_at_path(doc, parents, false)? {
                        parent.remove(leaf);
                    }
                }
            }
        }
        Ok(())
    }
}

fn missing_parent(path: &[String]) -> StoreError {
    StoreError::InvalidDocument(format!("no parent object for {}", path.join(".")))
}

fn object_at_path<'a>(
    doc: &'a mut JsonValue,
    path: &[String],
    create: bool,
) -> Result<Option<&'a mut Map<String, JsonValue>>, StoreError> {
    let mut current = doc;
    for segment in path {
        let map = current.as_object_mut().ok_or_else(|| {
            StoreError::InvalidDocument(format!("`{segment}` parent is not an object"))
        })?;
        if !map.contains_key(segment) {
            if !create {
                return Ok(None);
            }
            map.insert(segment.clone(), JsonValue::Object(Map::new()));
        }
        current = map
            .get_mut(segment)
            .ok_or_else(|| StoreError::InvalidDocument(format!("`{segment}` vanished")))?;
    }
    current
        .as_object_mut()
        .map(Some)
        .ok_or_else(|| StoreError::InvalidDocument(format!("{} is not an object", path.join("."))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn top_and_section_status_get_distinct_placeholders() {
        let update = UpdateBuilder::new()
            .set_section(SectionName::Scoring, "status", json!("COMPLETE"))
            .set_section(SectionName::Scoring, "updatedAt", json!("t1"))
            .set_report("status", json!("COMPLETE"))
            .set_report("updatedAt", json!("t1"))
            .build();

        let placeholders: Vec<_> = update.clauses().iter().map(|c| c.placeholder.as_str()).collect();
        assert_eq!(
            placeholders,
            vec!["#s_scoring_status", "#s_scoring_updatedAt", "#t_status", "#t_updatedAt"]
        );
        let names = update.names();
        assert_eq!(names["#t_status"], "status");
        assert_eq!(names["#s_scoring_status"], "status");
        assert_eq!(update.values().len(), 4);
        assert_eq!(
            update.expression(),
            "SET #sections.#s_scoring.#s_scoring_status = :s_scoring_status, \
             #sections.#s_scoring.#s_scoring_updatedAt = :s_scoring_updatedAt, \
             #t_status = :t_status, #t_updatedAt = :t_updatedAt"
        );
    }

    #[test]
    fn apply_writes_both_levels_without_collision() {
        let mut doc = json!({"id": "r-1", "status": "IDLE", "sections": {}});
        UpdateBuilder::new()
            .set_section(SectionName::Scoring, "status", json!("COMPLETE"))
            .set_report("status", json!("COMPLETE"))
            .set_report("compositeScore", json!(81.0))
            .build()
            .apply(&mut doc)
            .unwrap();
        assert_eq!(doc["status"], "COMPLETE");
        assert_eq!(doc["compositeScore"], 81.0);
        assert_eq!(doc["sections"]["scoring"]["status"], "COMPLETE");
    }

    #[test]
    fn set_if_absent_never_overwrites() {
        let mut doc = json!({"id": "r-1", "sections": {"summary": {"status": "COMPLETE"}}});
        UpdateBuilder::new()
            .init_section_if_absent(SectionName::Summary, json!({"status": "IDLE"}))
            .init_section_if_absent(SectionName::Risks, json!({"status": "IDLE"}))
            .build()
            .apply(&mut doc)
            .unwrap();
        assert_eq!(doc["sections"]["summary"]["status"], "COMPLETE");
        assert_eq!(doc["sections"]["risks"]["status"], "IDLE");
    }

    #[test]
    fn section_set_creates_missing_parents_and_remove_tolerates_absence() {
        let mut doc = json!({"id": "r-1"});
        UpdateBuilder::new()
            .set_section(SectionName::Contacts, "status", json!("FAILED"))
            .remove_section(SectionName::Contacts, "data")
            .remove_section(SectionName::Deadlines, "error")
            .build()
            .apply(&mut doc)
            .unwrap();
        assert_eq!(doc["sections"]["contacts"], json!({"status": "FAILED"}));
        assert!(doc["sections"].get("deadlines").is_none());
    }

    #[test]
    fn later_clause_for_same_slot_wins() {
        let update = UpdateBuilder::new()
            .set_section(SectionName::Risks, "status", json!("IN_PROGRESS"))
            .set_section(SectionName::Risks, "status", json!("FAILED"))
            .build();
        assert_eq!(update.clauses().len(), 1);
        assert_eq!(update.values()[":s_risks_status"], json!("FAILED"));
    }

    #[test]
    fn non_object_parent_is_rejected() {
        let mut doc = json!({"id": "r-1", "sections": []});
        let err = UpdateBuilder::new()
            .set_section(SectionName::Summary, "status", json!("IDLE"))
            .build()
            .apply(&mut doc)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument(_)));
    }
}
