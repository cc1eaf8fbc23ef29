//! Prerequisite gating and overall-status reduction across sections.

use crate::{PipelineError, Report, SectionName, SectionStatus};

const SCORING_PREREQUISITES: &[SectionName] = &[
    SectionName::Summary,
    SectionName::Deadlines,
    SectionName::Requirements,
    SectionName::Contacts,
    SectionName::Risks,
];

pub fn prerequisites_of(section: SectionName) -> &'static [SectionName] {
    match section {
        SectionName::Scoring => SCORING_PREREQUISITES,
        _ => &[],
    }
}

/// Sections that list `section` among their prerequisites.
pub fn dependents_of(section: SectionName) -> Vec<SectionName> {
    SectionName::ALL
        .into_iter()
        .filter(|candidate| prerequisites_of(*candidate).contains(&section))
        .collect()
}

/// Fails with `PrerequisitesNotMet` naming every prerequisite that is not COMPLETE.
pub fn check_prerequisites(report: &Report, section: SectionName) -> Result<(), PipelineError> {
    let missing: Vec<SectionName> = prerequisites_of(section)
        .iter()
        .copied()
        .filter(|prereq| report.section_status(*prereq) != SectionStatus::Complete)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::PrerequisitesNotMet { section, missing })
    }
}

/// Dependents of `completed` that are now unblocked and not already running or
/// satisfied for their current input hash.
pub fn ready_dependents(report: &Report, completed: SectionName) -> Vec<SectionName> {
    dependents_of(completed)
        .into_iter()
        .filter(|dependent| check_prerequisites(report, *dependent).is_ok())
        .filter(|dependent| {
            let hash = report.input_hash(*dependent);
            match report.section(*dependent) {
                None => true,
                Some(record) => {
                    record.status != SectionStatus::InProgress && !record.is_satisfied_by(&hash)
                }
            }
        })
        .collect()
}

/// FAILED beats everything, then all-COMPLETE, then any IN_PROGRESS, else IDLE.
pub fn reduce_overall_status<I>(statuses: I) -> SectionStatus
where
    I: IntoIterator<Item = SectionStatus>,
{
    let mut seen = 0usize;
    let mut complete = 0usize;
    let mut in_progress = false;
    let mut failed = false;
    for status in statuses {
        seen += 1;
        match status {
            SectionStatus::Failed => failed = true,
            SectionStatus::Complete => complete += 1,
            SectionStatus::InProgress => in_progress = true,
            SectionStatus::Idle => {}
        }
    }

    if failed {
        SectionStatus::Failed
    } else if seen > 0 && complete == seen {
        SectionStatus::Complete
    } else if in_progress {
        SectionStatus::InProgress
    } else {
        SectionStatus::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SectionRecord;
    use chrono::Utc;

    const ALL_STATUSES: [SectionStatus; 4] = [
        SectionStatus::Idle,
        SectionStatus::InProgress,
        SectionStatus::Complete,
        SectionStatus::Failed,
    ];

    fn report_with(statuses: &[(SectionName, SectionStatus)]) -> Report {
        let mut report = Report::new("r-1", "p", "o", vec!["doc.txt".into()], Utc::now());
        for (section, status) in statuses {
            let hash = report.input_hash(*section);
            report.sections.insert(
                *section,
                SectionRecord {
                    status: *status,
                    input_hash: Some(hash),
                    ..Default::default()
                },
            );
        }
        report
    }

    #[test]
    fn any_failed_wins_for_every_combination() {
        // Enumerate every assignment of {FAILED, other} across four sections, with
        // "other" cycling through the remaining statuses.
        for filler in [SectionStatus::Idle, SectionStatus::InProgress, SectionStatus::Complete] {
            for mask in 0u8..16 {
                let statuses: Vec<_> = (0..4)
                    .map(|bit| {
                        if mask & (1 << bit) != 0 {
                            SectionStatus::Failed
                        } else {
                            filler
                        }
                    })
                    .collect();
                let overall = reduce_overall_status(statuses);
                if mask != 0 {
                    assert_eq!(overall, SectionStatus::Failed, "mask {mask:04b}");
                } else {
                    assert_eq!(overall, filler);
                }
            }
        }
    }

    #[test]
    fn reduction_precedence_over_mixed_statuses() {
        for a in ALL_STATUSES {
            for b in ALL_STATUSES {
                for c in ALL_STATUSES {
                    let set = [a, b, c];
                    let expected = if set.contains(&SectionStatus::Failed) {
                        SectionStatus::Failed
                    } else if set.iter().all(|s| *s == SectionStatus::Complete) {
                        SectionStatus::Complete
                    } else if set.contains(&SectionStatus::InProgress) {
                        SectionStatus::InProgress
                    } else {
                        SectionStatus::Idle
                    };
                    assert_eq!(reduce_overall_status(set), expected, "{set:?}");
                }
            }
        }
    }

    #[test]
    fn empty_reduction_is_idle() {
        assert_eq!(reduce_overall_status(Vec::new()), SectionStatus::Idle);
    }

    #[test]
    fn only_scoring_has_prerequisites() {
        assert_eq!(prerequisites_of(SectionName::Scoring).len(), 5);
        for section in SectionName::ALL {
            if section != SectionName::Scoring {
                assert!(prerequisites_of(section).is_empty());
                assert_eq!(dependents_of(section), vec![SectionName::Scoring]);
            }
        }
        assert!(dependents_of(SectionName::Scoring).is_empty());
    }

    #[test]
    fn gate_names_missing_sections() {
        let report = report_with(&[
            (SectionName::Summary, SectionStatus::Complete),
            (SectionName::Deadlines, SectionStatus::Complete),
            (SectionName::Requirements, SectionStatus::Failed),
            (SectionName::Contacts, SectionStatus::Complete),
        ]);
        let err = check_prerequisites(&report, SectionName::Scoring).unwrap_err();
        assert_eq!(
            err,
            PipelineError::PrerequisitesNotMet {
                section: SectionName::Scoring,
                missing: vec![SectionName::Requirements, SectionName::Risks],
            }
        );
        assert!(check_prerequisites(&report, SectionName::Summary).is_ok());
    }

    #[test]
    fn scoring_becomes_ready_when_last_prerequisite_completes() {
        let mut statuses: Vec<_> = SCORING_PREREQUISITES
            .iter()
            .map(|s| (*s, SectionStatus::Complete))
            .collect();
        let report = report_with(&statuses);
        assert_eq!(
            ready_dependents(&report, SectionName::Risks),
            vec![SectionName::Scoring]
        );

        statuses.push((SectionName::Scoring, SectionStatus::Complete));
        let done = report_with(&statuses);
        assert!(ready_dependents(&done, SectionName::Risks).is_empty());

        statuses.pop();
        statuses.push((SectionName::Scoring, SectionStatus::InProgress));
        let running = report_with(&statuses);
        assert!(ready_dependents(&running, SectionName::Risks).is_empty());
    }
}
