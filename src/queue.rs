//! Durable job queue over the `jobs` table.
//!
//! Delivery is at-least-once: a claimed job that is never acked comes back
//! after the visibility timeout, so a crashed worker's job is redelivered
//! rather than lost. Consumers must tolerate a second delivery for a task
//! that already reached a terminal status.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use crate::db::DbHandle;

/// Options applied when enqueuing a pipeline run.
///
/// Priority: higher value dequeues first; jobs with equal priority are FIFO.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub priority: i64,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 1,
            max_attempts: 3,
            base_delay: Duration::from_millis(5000),
        }
    }
}

/// A claimed job handed to a worker.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub task_id: Uuid,
    pub priority: i64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

/// What happened to a job after `fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    /// Re-queued, due again after the given backoff delay.
    Requeued { delay: Duration },
    /// Attempts exhausted; the job is gone.
    Dropped,
}

/// Exponential backoff: `base * 2^attempt`, where `attempt` counts completed
/// deliveries (0 for the first retry).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

#[derive(Clone)]
pub struct JobQueue {
    db: DbHandle,
}

impl JobQueue {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Enqueue a pipeline run for a task, due immediately.
    pub async fn enqueue(&self, task_id: Uuid, opts: EnqueueOptions) -> Result<i64> {
        let base_delay_ms = opts.base_delay.as_millis() as u64;
        self.db
            .call(move |db| {
                db.insert_job(task_id, opts.priority, opts.max_attempts, base_delay_ms, Utc::now())
            })
            .await
    }

    /// Claim the next due job, if any. At most one job per task id is ever
    /// in flight.
    pub async fn claim_next(&self) -> Result<Option<Job>> {
        let row = self.db.call(|db| db.claim_next_job(Utc::now())).await?;
        Ok(row.map(|r| Job {
            id: r.id,
            task_id: r.task_id,
            priority: r.priority,
            attempt: r.attempt,
            max_attempts: r.max_attempts,
            base_delay: Duration::from_millis(r.base_delay_ms),
        }))
    }

    /// Acknowledge a job as done. The job is removed regardless of the
    /// pipeline outcome; retries of failed tasks go through a fresh enqueue.
    pub async fn ack(&self, job: &Job) -> Result<()> {
        let id = job.id;
        self.db.call(move |db| db.delete_job(id)).await
    }

    /// Record a processing failure. The job is re-queued with exponential
    /// backoff until its attempts are exhausted, then dropped.
    pub async fn fail(&self, job: &Job) -> Result<JobDisposition> {
        let next_attempt = job.attempt + 1;
        let id = job.id;
        if next_attempt >= job.max_attempts {
            self.db.call(move |db| db.delete_job(id)).await?;
            return Ok(JobDisposition::Dropped);
        }
        let delay = backoff_delay(job.base_delay, job.attempt);
        let available_at = Utc::now()
            + chrono::Duration::milliseconds(delay.as_millis() as i64);
        self.db
            .call(move |db| db.retry_job(id, available_at))
            .await?;
        Ok(JobDisposition::Requeued { delay })
    }

    /// Release jobs that have been in flight longer than `visibility`.
    pub async fn release_stale(&self, visibility: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(visibility.as_millis() as i64);
        self.db.call(move |db| db.release_stale_jobs(cutoff)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TaskStore;

    fn queue() -> JobQueue {
        JobQueue::new(DbHandle::new(
            TaskStore::new_in_memory().expect("in-memory db"),
        ))
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base = Duration::from_millis(5000);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(5000));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(10000));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(20000));
    }

    #[test]
    fn test_default_options_match_queue_policy() {
        let opts = EnqueueOptions::default();
        assert_eq!(opts.priority, 1);
        assert_eq!(opts.max_attempts, 3);
        assert_eq!(opts.base_delay, Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_enqueue_claim_ack() -> Result<()> {
        let q = queue();
        let task_id = Uuid::new_v4();
        q.enqueue(task_id, EnqueueOptions::default()).await?;

        let job = q.claim_next().await?.expect("job due");
        assert_eq!(job.task_id, task_id);
        assert_eq!(job.attempt, 0);

        q.ack(&job).await?;
        assert!(q.claim_next().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_higher_priority_dequeues_first() -> Result<()> {
        let q = queue();
        let normal = Uuid::new_v4();
        let urgent = Uuid::new_v4();
        q.enqueue(normal, EnqueueOptions::default()).await?;
        q.enqueue(
            urgent,
            EnqueueOptions {
                priority: 10,
                ..EnqueueOptions::default()
            },
        )
        .await?;

        let first = q.claim_next().await?.expect("job due");
        assert_eq!(first.task_id, urgent);
        Ok(())
    }

    #[tokio::test]
    async fn test_fail_requeues_until_attempts_exhausted() -> Result<()> {
        let q = queue();
        q.enqueue(
            Uuid::new_v4(),
            EnqueueOptions {
                max_attempts: 2,
                base_delay: Duration::from_millis(0),
                ..EnqueueOptions::default()
            },
        )
        .await?;

        let job = q.claim_next().await?.expect("job due");
        let disposition = q.fail(&job).await?;
        assert_eq!(
            disposition,
            JobDisposition::Requeued {
                delay: Duration::from_millis(0)
            }
        );

        let job = q.claim_next().await?.expect("redelivered");
        assert_eq!(job.attempt, 1);
        let disposition = q.fail(&job).await?;
        assert_eq!(disposition, JobDisposition::Dropped);
        assert!(q.claim_next().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_release_stale_redelivers_claimed_job() -> Result<()> {
        let q = queue();
        let task_id = Uuid::new_v4();
        q.enqueue(task_id, EnqueueOptions::default()).await?;
        let job = q.claim_next().await?.expect("job due");

        // A generous visibility window keeps the job invisible.
        assert_eq!(q.release_stale(Duration::from_secs(300)).await?, 0);
        assert!(q.claim_next().await?.is_none());

        // A zero window treats the in-flight claim as stale.
        assert_eq!(q.release_stale(Duration::from_secs(0)).await?, 1);
        let redelivered = q.claim_next().await?.expect("released job");
        assert_eq!(redelivered.id, job.id);
        assert_eq!(redelivered.task_id, task_id);
        Ok(())
    }
}
