// Run Executor - owns the step-by-step state machine for sequence runs.
//
// Single-writer deployment assumption: the re-entrancy guard below is an
// in-process set, not a cross-process lock. Running two instances of this
// service against the same database can double-execute a run; a hardened
// deployment would replace the guard with a claim on the run row
// (SELECT ... FOR UPDATE SKIP LOCKED).

use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{decode_steps, MessageDispatcher, RunStatus, Sequence, SequenceRun, SequenceStep};
use crate::error::AppError;

/// What the executor does with one decoded step.
#[derive(Debug, PartialEq)]
enum StepAction<'a> {
    Sleep { seconds: u64 },
    Send(&'a SequenceStep),
    SkipUnrecognized,
}

fn step_action(step: &Option<SequenceStep>) -> StepAction<'_> {
    match step {
        Some(SequenceStep::Delay { seconds }) => StepAction::Sleep { seconds: *seconds },
        Some(step @ SequenceStep::Message { .. }) => StepAction::Send(step),
        None => StepAction::SkipUnrecognized,
    }
}

pub struct SequenceWorker {
    db_pool: PgPool,
    dispatcher: MessageDispatcher,
    processing: Mutex<HashSet<Uuid>>,
    shutting_down: AtomicBool,
}

impl SequenceWorker {
    pub fn new(db_pool: PgPool, dispatcher: MessageDispatcher) -> Self {
        Self {
            db_pool,
            dispatcher,
            processing: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Recovery scan: re-enqueue every run left in a non-terminal state.
    /// This is the sole crash-recovery mechanism; there is no separate queue.
    pub async fn start(self: &Arc<Self>) -> Result<(), AppError> {
        let run_ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM sequence_runs WHERE status IN ('pending', 'processing')",
        )
        .fetch_all(&self.db_pool)
        .await?;

        info!("Resuming {} in-flight sequence runs", run_ids.len());

        for (run_id,) in run_ids {
            self.enqueue(run_id);
        }

        Ok(())
    }

    /// Idempotent within one process: a run already being processed here is
    /// not re-entered. Execution happens on a spawned task; enqueue never
    /// waits for it.
    pub fn enqueue(self: &Arc<Self>, run_id: Uuid) {
        if !self.try_claim(run_id) {
            debug!(
                "Run {} not claimed (already in flight or worker stopping), ignoring enqueue",
                run_id
            );
            return;
        }

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = worker.execute(run_id).await {
                error!("Run {} execution error: {}", run_id, e);
            }
            worker.release(run_id);
        });
    }

    /// Stop claiming new runs, then wait until every in-flight execution has
    /// released its claim.
    pub async fn stop(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("Worker stopping, draining in-flight runs");

        loop {
            let in_flight = self
                .processing
                .lock()
                .expect("processing set poisoned")
                .len();
            if in_flight == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("Worker stopped");
    }

    fn try_claim(&self, run_id: Uuid) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        self.processing.lock().expect("processing set poisoned").insert(run_id)
    }

    fn release(&self, run_id: Uuid) {
        self.processing.lock().expect("processing set poisoned").remove(&run_id);
    }

    async fn execute(&self, run_id: Uuid) -> Result<(), AppError> {
        let run: Option<SequenceRun> =
            sqlx::query_as("SELECT * FROM sequence_runs WHERE id = $1")
                .bind(run_id)
                .fetch_optional(&self.db_pool)
                .await?;

        let Some(run) = run else {
            warn!("Run {} not found, nothing to execute", run_id);
            return Ok(());
        };

        if run.status.is_terminal() {
            debug!("Run {} already {:?}, no-op", run_id, run.status);
            return Ok(());
        }

        if run.status == RunStatus::Pending {
            sqlx::query(
                "UPDATE sequence_runs
                 SET status = 'processing', started_at = COALESCE(started_at, NOW())
                 WHERE id = $1",
            )
            .bind(run_id)
            .execute(&self.db_pool)
            .await?;
        }

        // Steps are read live from the sequence at execution time; only the
        // index is snapshotted on the run. Editing an active sequence's steps
        // changes the meaning of in-flight runs.
        let sequence: Option<Sequence> = sqlx::query_as("SELECT * FROM sequences WHERE id = $1")
            .bind(run.sequence_id)
            .fetch_optional(&self.db_pool)
            .await?;

        let Some(sequence) = sequence else {
            self.fail_run(run_id, "sequence not found").await?;
            return Ok(());
        };

        let steps = decode_steps(&sequence.steps);
        let start = run.current_step_index.max(0) as usize;

        for index in start..steps.len() {
            match step_action(&steps[index]) {
                StepAction::Sleep { seconds } => {
                    // Checkpoint before sleeping: the delay counts as consumed,
                    // so a crash mid-sleep resumes at the next step rather than
                    // re-sleeping.
                    self.advance_checkpoint(run_id, index + 1).await?;
                    tokio::time::sleep(Duration::from_secs(seconds)).await;
                }
                StepAction::Send(step) => {
                    if let Err(e) = self.dispatcher.dispatch(&run, &sequence, step).await {
                        // Checkpoint stays at the failed step so a manual
                        // re-enqueue retries exactly this step.
                        error!("Run {} failed at step {}: {}", run_id, index, e);
                        self.fail_run(run_id, &e.to_string()).await?;
                        refresh_sequence_stats(&self.db_pool, sequence.id).await?;
                        return Ok(());
                    }
                    self.advance_checkpoint(run_id, index + 1).await?;
                }
                StepAction::SkipUnrecognized => {
                    warn!(
                        "Run {}: unrecognized step at index {}, skipping",
                        run_id, index
                    );
                    self.advance_checkpoint(run_id, index + 1).await?;
                }
            }
        }

        sqlx::query(
            "UPDATE sequence_runs
             SET status = 'completed', completed_at = NOW(), failure_reason = NULL
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(run_id)
        .execute(&self.db_pool)
        .await?;

        info!("Run {} completed ({} steps)", run_id, steps.len());
        refresh_sequence_stats(&self.db_pool, sequence.id).await?;

        Ok(())
    }

    /// The checkpoint is monotonically non-decreasing and persisted
    /// synchronously before the next step executes.
    async fn advance_checkpoint(&self, run_id: Uuid, next_index: usize) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE sequence_runs
             SET current_step_index = GREATEST(current_step_index, $2)
             WHERE id = $1",
        )
        .bind(run_id)
        .bind(next_index as i32)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn fail_run(&self, run_id: Uuid, reason: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE sequence_runs
             SET status = 'failed', failure_reason = $2, completed_at = NOW()
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(run_id)
        .bind(reason)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }
}

/// Recompute the sequence's cached analytics snapshot from all of its runs.
///
/// Concurrent refreshes race, but each write is a full recomputation, so
/// last-write-wins converges regardless of ordering.
pub async fn refresh_sequence_stats(pool: &PgPool, sequence_id: Uuid) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE sequences s
        SET stats = (
            SELECT jsonb_build_object(
                'total_runs', COUNT(*),
                'completed_runs', COUNT(*) FILTER (WHERE status = 'completed'),
                'failed_runs', COUNT(*) FILTER (WHERE status = 'failed'),
                'emails_sent', COALESCE(SUM(emails_sent), 0),
                'sms_sent', COALESCE(SUM(sms_sent), 0),
                'emails_opened', COALESCE(SUM(emails_opened), 0),
                'emails_clicked', COALESCE(SUM(emails_clicked), 0)
            )
            FROM sequence_runs r
            WHERE r.sequence_id = s.id
        ),
        stats_refreshed_at = NOW()
        WHERE s.id = $1
        "#,
    )
    .bind(sequence_id)
    .execute(pool)
    .await?;

    Ok(())
}
