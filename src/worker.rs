//! Queue consumers: each worker claims one job at a time and runs the
//! pipeline for it.
//!
//! The pool also runs a reaper that releases jobs whose worker died, so a
//! crash mid-run turns into redelivery instead of a lost task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::db::DbHandle;
use crate::errors::TaskError;
use crate::models::{LogLevel, TaskStatus};
use crate::notify::{NotificationBridge, TaskEvent};
use crate::pipeline::PipelineDriver;
use crate::queue::{Job, JobDisposition, JobQueue};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

pub struct WorkerPool {
    db: DbHandle,
    queue: JobQueue,
    driver: Arc<PipelineDriver>,
    bridge: Arc<NotificationBridge>,
    workers: usize,
    poll_interval: Duration,
    visibility_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        db: DbHandle,
        queue: JobQueue,
        driver: Arc<PipelineDriver>,
        bridge: Arc<NotificationBridge>,
        workers: usize,
    ) -> Self {
        Self {
            db,
            queue,
            driver,
            bridge,
            workers,
            poll_interval: DEFAULT_POLL_INTERVAL,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Spawn the consumer loops and the stale-job reaper. Tasks run until
    /// the process exits.
    pub fn spawn(self: Arc<Self>) {
        for worker_id in 0..self.workers {
            let pool = self.clone();
            tokio::spawn(async move {
                tracing::info!(worker_id, "Worker started");
                loop {
                    match pool.process_one().await {
                        Ok(true) => {}
                        Ok(false) => tokio::time::sleep(pool.poll_interval).await,
                        Err(e) => {
                            tracing::error!(worker_id, error = %e, "Worker iteration failed");
                            tokio::time::sleep(pool.poll_interval).await;
                        }
                    }
                }
            });
        }

        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(pool.visibility_timeout).await;
                match pool.queue.release_stale(pool.visibility_timeout).await {
                    Ok(0) => {}
                    Ok(n) => tracing::warn!(released = n, "Released stale jobs"),
                    Err(e) => tracing::error!(error = %e, "Stale job sweep failed"),
                }
            }
        });
    }

    /// Claim and process a single job. Returns `Ok(true)` if a job was
    /// handled, `Ok(false)` if the queue was empty. Split out from the loop
    /// so tests can drive the pool deterministically.
    pub async fn process_one(&self) -> Result<bool> {
        let job = match self.queue.claim_next().await? {
            Some(job) => job,
            None => return Ok(false),
        };
        let task_id = job.task_id;

        let task = self.db.call(move |db| db.load_task(task_id)).await?;
        let task = match task {
            Some(task) => task,
            None => {
                // A job without a task cannot ever succeed; no retry.
                tracing::error!(%task_id, job_id = job.id, "Job references missing task, dropping");
                self.queue.ack(&job).await?;
                return Ok(true);
            }
        };

        // Redelivery of an already-finished task (crash after the terminal
        // write, or a cancel that raced the queue) is a no-op.
        if task.status.is_terminal() {
            tracing::info!(%task_id, status = %task.status, "Task already terminal, acking job");
            self.queue.ack(&job).await?;
            return Ok(true);
        }

        match self.driver.run(task_id).await {
            Ok(()) => {
                self.queue.ack(&job).await?;
            }
            Err(e) => {
                self.handle_infrastructure_failure(&job, &e).await?;
            }
        }
        Ok(true)
    }

    /// Catch-all for errors the driver could not absorb: mark the task
    /// failed so users see a terminal status, then hand the job back to the
    /// queue's retry policy.
    async fn handle_infrastructure_failure(&self, job: &Job, error: &TaskError) -> Result<()> {
        let task_id = job.task_id;
        let message = error.to_string();
        tracing::error!(%task_id, job_id = job.id, error = %message, "Pipeline run errored");

        let mark = {
            let message = message.clone();
            self.db
                .call(move |db| {
                    let mut task = match db.load_task(task_id)? {
                        Some(task) => task,
                        None => return Ok(None),
                    };
                    task.status = TaskStatus::Failed;
                    let entry = task.push_log(
                        LogLevel::Error,
                        format!("Task failed: {}", message),
                        None,
                    );
                    db.save_task(&task)?;
                    db.append_log(task_id, &entry)?;
                    Ok(Some(entry))
                })
                .await?
        };
        if let Some(entry) = mark {
            self.bridge
                .notify(task_id, &TaskEvent::LogAppended { task_id, entry });
            self.bridge.notify(
                task_id,
                &TaskEvent::TaskFailed {
                    task_id,
                    error: message,
                },
            );
        }

        match self.queue.fail(job).await? {
            JobDisposition::Requeued { delay } => {
                tracing::warn!(
                    %task_id,
                    job_id = job.id,
                    attempt = job.attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Job requeued with backoff"
                );
            }
            JobDisposition::Dropped => {
                tracing::error!(%task_id, job_id = job.id, "Job attempts exhausted, dropped");
            }
        }
        Ok(())
    }

    /// Run one stale-job sweep immediately. The server calls this at boot so
    /// jobs orphaned by a previous crash are not stuck for a full window.
    pub async fn sweep_stale_now(&self) -> Result<usize> {
        self.queue.release_stale(self.visibility_timeout).await
    }
}
