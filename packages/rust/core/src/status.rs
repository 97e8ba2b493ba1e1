//! Project progress reporting against the methodology.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{Days, NaiveDate};
use regex::Regex;
use serde::Serialize;

use playbook_shared::{Document, EnrichmentRecord, ExternalTask};

static TITLE_PHASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*phase\s+(\d+)\b").expect("title phase regex"));

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusTotals {
    pub total: usize,
    pub completed: usize,
    pub incomplete: usize,
    /// Open tasks with no assignee.
    pub unassigned: usize,
    /// Open tasks whose due date has passed.
    pub overdue: usize,
    pub percent_complete: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseStatus {
    pub index: u32,
    pub title: String,
    pub total: usize,
    pub completed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub totals: StatusTotals,
    /// One entry per phase in document order.
    pub phases: Vec<PhaseStatus>,
    /// Tasks that could not be tied to any phase of the document.
    pub unattributed: usize,
}

fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        done as f64 * 100.0 / total as f64
    }
}

/// The phase a task belongs to: a `PHASE <n>` title prefix, else its enrichment record.
fn attributed_phase(task: &ExternalTask, records: &HashMap<&str, u32>) -> Option<u32> {
    TITLE_PHASE_RE
        .captures(&task.title)
        .and_then(|caps| caps[1].parse().ok())
        .or_else(|| records.get(task.id.as_str()).copied())
}

/// Summarize `tasks` as of `today`.
pub fn status_report(
    tasks: &[ExternalTask],
    document: &Document,
    records: &[EnrichmentRecord],
    today: NaiveDate,
) -> StatusReport {
    let by_task: HashMap<&str, u32> = records
        .iter()
        .map(|r| (r.task_id.as_str(), r.matched_phase_index))
        .collect();

    let mut phases: Vec<PhaseStatus> = Vec::new();
    for phase in &document.phases {
        if phases.iter().all(|p| p.index != phase.index) {
            phases.push(PhaseStatus {
                index: phase.index,
                title: phase.title.clone(),
                total: 0,
                completed: 0,
            });
        }
    }

    let mut totals = StatusTotals {
        total: tasks.len(),
        ..Default::default()
    };
    let mut unattributed = 0;

    for task in tasks {
        if task.completed {
            totals.completed += 1;
        } else {
            if task.assignee.is_none() {
                totals.unassigned += 1;
            }
            if task.due_on.is_some_and(|due| due < today) {
                totals.overdue += 1;
            }
        }

        let slot = attributed_phase(task, &by_task)
            .and_then(|index| phases.iter_mut().find(|p| p.index == index));
        match slot {
            Some(phase) => {
                phase.total += 1;
                if task.completed {
                    phase.completed += 1;
                }
            }
            None => unattributed += 1,
        }
    }

    totals.incomplete = totals.total - totals.completed;
    totals.percent_complete = percent(totals.completed, totals.total);

    StatusReport {
        totals,
        phases,
        unattributed,
    }
}

/// Open tasks due on or before `today + days`, soonest first.
pub fn upcoming_tasks(tasks: &[ExternalTask], today: NaiveDate, days: u32) -> Vec<&ExternalTask> {
    let horizon = today
        .checked_add_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MAX);
    let mut upcoming: Vec<&ExternalTask> = tasks
        .iter()
        .filter(|t| !t.completed)
        .filter(|t| t.due_on.is_some_and(|due| due <= horizon))
        .collect();
    upcoming.sort_by(|a, b| a.due_on.cmp(&b.due_on).then_with(|| a.title.cmp(&b.title)));
    upcoming
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use playbook_shared::Phase;

    fn date(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, month, day).expect("valid date")
    }

    fn task(id: &str, title: &str, completed: bool) -> ExternalTask {
        ExternalTask {
            completed,
            ..ExternalTask::new(id, title)
        }
    }

    fn document() -> Document {
        Document {
            phases: vec![
                Phase::new(1, "Planning & Setup", None),
                Phase::new(2, "Configuration & Development", None),
            ],
            ..Default::default()
        }
    }

    fn record(task_id: &str, phase: u32) -> EnrichmentRecord {
        EnrichmentRecord {
            task_id: task_id.into(),
            matched_phase_index: phase,
            content_fingerprint: "fp".into(),
            generated_text: "text".into(),
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn totals_and_breakdown() {
        let today = date(10, 19);
        let mut overdue = task("t3", "Configure SSO", false);
        overdue.due_on = Some(date(10, 1));
        overdue.assignee = Some("sam".into());
        let tasks = vec![
            task("t1", "PHASE 1: Kickoff", true),
            task("t2", "phase 2 - integrate API credentials", false),
            overdue,
            task("t4", "Order swag", false),
        ];
        let records = vec![record("t3", 2)];

        let report = status_report(&tasks, &document(), &records, today);
        assert_eq!(report.totals.total, 4);
        assert_eq!(report.totals.completed, 1);
        assert_eq!(report.totals.incomplete, 3);
        assert_eq!(report.totals.unassigned, 2);
        assert_eq!(report.totals.overdue, 1);
        assert!((report.totals.percent_complete - 25.0).abs() < f64::EPSILON);

        assert_eq!(report.phases.len(), 2);
        assert_eq!((report.phases[0].total, report.phases[0].completed), (1, 1));
        assert_eq!((report.phases[1].total, report.phases[1].completed), (2, 0));
        assert_eq!(report.unattributed, 1);
    }

    #[test]
    fn title_prefix_beats_record() {
        let tasks = vec![task("t1", "Phase 1 wrap-up", false)];
        let report = status_report(&tasks, &document(), &[record("t1", 2)], date(10, 19));
        assert_eq!(report.phases[0].total, 1);
        assert_eq!(report.phases[1].total, 0);
    }

    #[test]
    fn phase_missing_from_document_is_unattributed() {
        let tasks = vec![task("t1", "PHASE 9: Hypercare", false)];
        let report = status_report(&tasks, &document(), &[], date(10, 19));
        assert_eq!(report.unattributed, 1);
    }

    #[test]
    fn empty_project() {
        let report = status_report(&[], &Document::default(), &[], date(10, 19));
        assert_eq!(report.totals, StatusTotals::default());
        assert!(report.phases.is_empty());
    }

    #[test]
    fn upcoming_is_sorted_and_bounded() {
        let today = date(10, 19);
        let mut a = task("a", "Go-live", false);
        a.due_on = Some(date(10, 25));
        let mut b = task("b", "UAT", false);
        b.due_on = Some(date(10, 20));
        let mut c = task("c", "Hypercare", false);
        c.due_on = Some(date(11, 30));
        let mut d = task("d", "Done already", true);
        d.due_on = Some(date(10, 20));
        let e = task("e", "No date", false);
        let tasks = vec![a, b, c, d, e];

        let ids: Vec<&str> = upcoming_tasks(&tasks, today, 7)
            .into_iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ids, ["b", "a"]);
    }
}
