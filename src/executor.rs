//! Stage execution: the only code that moves a stage through its lifecycle.
//!
//! A stage runs at most once per pipeline run and is never retried here;
//! retry happens at the job level, which restarts the whole pipeline.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::db::DbHandle;
use crate::errors::{StageError, TaskError};
use crate::models::{StageName, StageStatus, Task, TaskStatus};
use crate::notify::{NotificationBridge, TaskEvent};

/// Outcome of a successful stage body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    /// The task was cancelled while the body ran. The completed transition
    /// was discarded: a failed status is sticky.
    CancelledMidRun,
}

pub struct StageExecutor {
    db: DbHandle,
    bridge: Arc<NotificationBridge>,
}

impl StageExecutor {
    pub fn new(db: DbHandle, bridge: Arc<NotificationBridge>) -> Self {
        Self { db, bridge }
    }

    /// Run one stage: mark it in-progress and persist, await the body, then
    /// persist the outcome. A body error marks the stage failed and
    /// propagates as `TaskError::Stage` so the driver aborts the run.
    pub async fn run_stage<F>(
        &self,
        task: &mut Task,
        stage: StageName,
        body: F,
    ) -> Result<StageOutcome, TaskError>
    where
        F: Future<Output = Result<Value, StageError>>,
    {
        let task_id = task.id;
        {
            let record = task
                .find_stage_mut(stage)
                .ok_or(TaskError::StageNotFound { task_id, stage })?;
            record.status = StageStatus::InProgress;
            record.started_at = Some(Utc::now());
        }
        self.persist(task).await?;
        self.bridge
            .notify(task_id, &TaskEvent::StageStarted { task_id, stage });

        match body.await {
            Ok(output) => {
                // The cancel endpoint may have flipped the persisted status
                // while the body ran. Failed is sticky; a stale completed
                // transition must not overwrite it.
                let persisted = self
                    .db
                    .call(move |db| db.load_task(task_id))
                    .await?
                    .ok_or(TaskError::TaskNotFound { id: task_id })?;
                if persisted.status == TaskStatus::Failed {
                    task.status = TaskStatus::Failed;
                    // Roll the stage back to pending so the stored record
                    // never shows a finished task with a stage stuck at
                    // in-progress.
                    if let Some(record) = task.find_stage_mut(stage) {
                        record.reset();
                    }
                    self.persist(task).await?;
                    tracing::info!(%task_id, %stage, "Discarding stage result for cancelled task");
                    return Ok(StageOutcome::CancelledMidRun);
                }

                let record = task
                    .find_stage_mut(stage)
                    .ok_or(TaskError::StageNotFound { task_id, stage })?;
                record.status = StageStatus::Completed;
                record.completed_at = Some(Utc::now());
                record.output = Some(output);
                task.recompute_progress();
                self.persist(task).await?;
                self.bridge.notify(
                    task_id,
                    &TaskEvent::StageCompleted {
                        task_id,
                        stage,
                        progress: task.progress,
                    },
                );
                Ok(StageOutcome::Completed)
            }
            Err(source) => {
                let message = source.to_string();
                let record = task
                    .find_stage_mut(stage)
                    .ok_or(TaskError::StageNotFound { task_id, stage })?;
                record.status = StageStatus::Failed;
                record.error = Some(message.clone());
                self.persist(task).await?;
                self.bridge.notify(
                    task_id,
                    &TaskEvent::StageFailed {
                        task_id,
                        stage,
                        error: message,
                    },
                );
                Err(TaskError::Stage { stage, source })
            }
        }
    }

    async fn persist(&self, task: &Task) -> Result<(), TaskError> {
        let snapshot = task.clone();
        self.db.call(move |db| db.save_task(&snapshot)).await?;
        Ok(())
    }
}
