//! Idempotent task enrichment.
//!
//! Each open task is matched to its best phase. A task is enriched only when
//! it has never been enriched, its matched phase changed, or that phase's
//! content fingerprint changed since the last applied enrichment. The
//! decide-then-apply sequence runs under a durable per-task lease so that
//! overlapping runs never both apply to one task.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use playbook_shared::{
    AppConfig, Document, EnrichmentRecord, ExternalTask, Phase, PlaybookError, Result,
};
use playbook_storage::Storage;

use crate::description::{compose_description, render_block, strip_block};
use crate::generation::{TextGenerator, generate_with_timeout, task_guidance_request};
use crate::matcher::{MatchOptions, Matcher};
use crate::store::EnrichmentStore;
use crate::tracker::TaskTracker;

// ---------------------------------------------------------------------------
// Policy & cancellation
// ---------------------------------------------------------------------------

/// Tunables for one pipeline.
#[derive(Debug, Clone)]
pub struct EnrichmentPolicy {
    pub model: String,
    pub assistant_name: String,
    pub generation_timeout: Duration,
    pub retry_backoff: Duration,
    pub task_delay: Duration,
    pub lease_ttl: Duration,
    pub match_options: MatchOptions,
}

impl Default for EnrichmentPolicy {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl EnrichmentPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.generation.model.clone(),
            assistant_name: config.defaults.assistant_name.clone(),
            generation_timeout: config.generation.timeout(),
            retry_backoff: Duration::from_millis(config.enrichment.retry_backoff_ms),
            task_delay: Duration::from_millis(config.enrichment.task_delay_ms),
            lease_ttl: Duration::from_secs(config.enrichment.lease_ttl_secs),
            match_options: MatchOptions::from(&config.matching),
        }
    }
}

/// Cooperative cancellation, checked between tasks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// A description update that reached the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedUpdate {
    pub task_id: String,
    pub phase_index: u32,
    pub applied_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Generation,
    Tracker,
}

/// A task that was due but could not be enriched this run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task_id: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one [`EnrichmentPipeline::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentReport {
    pub applied: Vec<AppliedUpdate>,
    pub skipped_no_match: Vec<String>,
    pub skipped_up_to_date: Vec<String>,
    pub busy: Vec<String>,
    pub failures: Vec<TaskFailure>,
    pub cancelled: bool,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

// ---------------------------------------------------------------------------
// Progress trait
// ---------------------------------------------------------------------------

/// Progress callback for enrichment runs.
pub trait EnrichmentProgress: Send + Sync {
    /// Called before each task is considered.
    fn task_progress(&self, current: usize, total: usize, detail: &str);
    /// Called once with the final report.
    fn finished(&self, report: &EnrichmentReport);
}

/// No-op enrichment progress.
pub struct SilentEnrichmentProgress;

impl EnrichmentProgress for SilentEnrichmentProgress {
    fn task_progress(&self, _current: usize, _total: usize, _detail: &str) {}
    fn finished(&self, _report: &EnrichmentReport) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

enum TaskOutcome {
    Applied {
        update: AppliedUpdate,
        tokens_in: u64,
        tokens_out: u64,
    },
    UpToDate,
    Failed(TaskFailure),
}

/// Whether a task must be (re-)enriched against `phase_index` / `fingerprint`.
pub fn is_due(record: Option<&EnrichmentRecord>, phase_index: u32, fingerprint: &str) -> bool {
    match record {
        None => true,
        Some(r) => r.matched_phase_index != phase_index || r.content_fingerprint != fingerprint,
    }
}

pub struct EnrichmentPipeline<'a> {
    generator: &'a dyn TextGenerator,
    tracker: &'a dyn TaskTracker,
    store: &'a dyn EnrichmentStore,
    matcher: Matcher,
    policy: EnrichmentPolicy,
}

impl<'a> EnrichmentPipeline<'a> {
    pub fn new(
        generator: &'a dyn TextGenerator,
        tracker: &'a dyn TaskTracker,
        store: &'a dyn EnrichmentStore,
        policy: EnrichmentPolicy,
    ) -> Self {
        Self {
            generator,
            tracker,
            store,
            matcher: Matcher::new(policy.match_options.clone()),
            policy,
        }
    }

    /// Enrich the first `limit` open tasks, or all of them when `limit` is
    /// `None` or zero.
    ///
    /// Each call takes leases under its own holder id, so overlapping runs
    /// exclude each other even when they share a pipeline.
    /// Per-task generation and tracker failures are collected in the report.
    /// A store failure aborts the run with [`PlaybookError::Storage`].
    #[instrument(skip_all, fields(tasks = tasks.len(), limit = ?limit))]
    pub async fn run(
        &self,
        tasks: &[ExternalTask],
        document: &Document,
        limit: Option<usize>,
        cancel: &CancelFlag,
        progress: &dyn EnrichmentProgress,
    ) -> Result<EnrichmentReport> {
        let holder = format!("run-{}", Uuid::now_v7());
        let cap = limit.filter(|&n| n > 0).unwrap_or(usize::MAX);
        let open: Vec<&ExternalTask> = tasks
            .iter()
            .filter(|t| !t.completed)
            .take(cap)
            .collect();
        let total = open.len();
        let mut report = EnrichmentReport::default();
        let mut generations = 0usize;

        info!(open = total, %holder, "starting enrichment run");

        for (i, task) in open.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!(processed = i, "enrichment cancelled");
                report.cancelled = true;
                break;
            }
            progress.task_progress(i + 1, total, &task.title);

            // Guidance written by earlier runs must not feed back into matching.
            let user_text = strip_block(&task.description);
            let query = format!("{}\n{user_text}", task.title);
            let Some(best) = self
                .matcher
                .match_phases(&query, document, 1, None)
                .into_iter()
                .next()
            else {
                debug!(task_id = %task.id, "no matching phase");
                report.skipped_no_match.push(task.id.clone());
                continue;
            };

            if !self
                .store
                .try_acquire_lease(&task.id, &holder, self.policy.lease_ttl)
                .await
                .inspect_err(|e| error!(error = %e, "state store unavailable"))?
            {
                info!(task_id = %task.id, "task leased by another run");
                report.busy.push(task.id.clone());
                continue;
            }

            let outcome = self
                .enrich_leased(task, best.phase, &best.excerpt, &mut generations)
                .await;

            if let Err(e) = self.store.release_lease(&task.id, &holder).await {
                warn!(task_id = %task.id, error = %e, "failed to release lease");
            }

            match outcome.inspect_err(|e| error!(error = %e, "aborting enrichment run"))? {
                TaskOutcome::Applied {
                    update,
                    tokens_in,
                    tokens_out,
                } => {
                    info!(task_id = %update.task_id, phase = update.phase_index, "task enriched");
                    report.tokens_in += tokens_in;
                    report.tokens_out += tokens_out;
                    report.applied.push(update);
                }
                TaskOutcome::UpToDate => report.skipped_up_to_date.push(task.id.clone()),
                TaskOutcome::Failed(failure) => {
                    warn!(
                        task_id = %failure.task_id,
                        kind = ?failure.kind,
                        error = %failure.message,
                        "task enrichment failed"
                    );
                    report.failures.push(failure);
                }
            }
        }

        info!(
            applied = report.applied.len(),
            up_to_date = report.skipped_up_to_date.len(),
            no_match = report.skipped_no_match.len(),
            busy = report.busy.len(),
            failed = report.failures.len(),
            cancelled = report.cancelled,
            "enrichment run complete"
        );
        progress.finished(&report);
        Ok(report)
    }

    /// Decide and apply for one task while holding its lease.
    /// `Err` is reserved for failures that must abort the run.
    async fn enrich_leased(
        &self,
        task: &ExternalTask,
        phase: &Phase,
        excerpt: &str,
        generations: &mut usize,
    ) -> Result<TaskOutcome> {
        let fingerprint = phase.fingerprint();
        let record = self.store.get_record(&task.id).await?;
        if !is_due(record.as_ref(), phase.index, &fingerprint) {
            debug!(task_id = %task.id, phase = phase.index, "already enriched");
            return Ok(TaskOutcome::UpToDate);
        }

        if *generations > 0 && !self.policy.task_delay.is_zero() {
            tokio::time::sleep(self.policy.task_delay).await;
        }
        *generations += 1;

        let request = task_guidance_request(&task.title, excerpt, &self.policy.model);
        let generated = match generate_with_timeout(
            self.generator,
            &request,
            self.policy.generation_timeout,
        )
        .await
        {
            Ok(generated) => generated,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return Ok(failed(task, FailureKind::Generation, e)),
        };

        let block = render_block(
            phase.index,
            &phase.title,
            &self.policy.assistant_name,
            Utc::now().date_naive(),
            &generated.text,
        );
        let description = compose_description(&task.description, &block);

        if let Err(e) = self.update_with_retry(&task.id, &description).await {
            if e.is_fatal() {
                return Err(e);
            }
            // State is not advanced, so the task stays due for the next run.
            return Ok(failed(task, FailureKind::Tracker, e));
        }

        let record = EnrichmentRecord {
            task_id: task.id.clone(),
            matched_phase_index: phase.index,
            content_fingerprint: fingerprint,
            generated_text: generated.text.clone(),
            applied_at: Utc::now(),
        };
        self.store.put_record(&record).await?;

        Ok(TaskOutcome::Applied {
            update: AppliedUpdate {
                task_id: task.id.clone(),
                phase_index: phase.index,
                applied_text: generated.text,
            },
            tokens_in: generated.tokens_in,
            tokens_out: generated.tokens_out,
        })
    }

    /// One retry after the configured backoff.
    async fn update_with_retry(&self, task_id: &str, description: &str) -> Result<()> {
        match self.tracker.update_description(task_id, description).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(task_id, error = %e, "tracker update failed, retrying once");
                tokio::time::sleep(self.policy.retry_backoff).await;
                self.tracker.update_description(task_id, description).await
            }
        }
    }
}

fn failed(task: &ExternalTask, kind: FailureKind, error: PlaybookError) -> TaskOutcome {
    TaskOutcome::Failed(TaskFailure {
        task_id: task.id.clone(),
        kind,
        message: error.to_string(),
    })
}

/// Delete records for tasks that no longer exist in the tracker.
/// Returns the removed task ids.
pub async fn prune_records(
    storage: &Storage,
    existing_task_ids: &HashSet<String>,
) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for record in storage.list_records().await? {
        if existing_task_ids.contains(&record.task_id) {
            continue;
        }
        if storage.delete_record(&record.task_id).await? {
            removed.push(record.task_id);
        }
    }
    if !removed.is_empty() {
        info!(count = removed.len(), "pruned records of deleted tasks");
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
