//! Pipeline driver: runs a task's stages in order and owns the task-level
//! status for the duration of a run.
//!
//! The stage list is data (`StageName::SEQUENCE`), consumed by one loop. A
//! stage failure aborts the run and marks the task failed; later stages stay
//! pending. Stage bodies delegate to the injected [`Providers`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::db::DbHandle;
use crate::errors::{StageError, TaskError};
use crate::executor::{StageExecutor, StageOutcome};
use crate::models::{LogLevel, StageName, Task, TaskStatus};
use crate::notify::{NotificationBridge, TaskEvent};
use crate::providers::{CodeChange, Providers, RepoAnalysis, Review};

/// Task status shown while a given stage runs.
pub fn stage_task_status(stage: StageName) -> TaskStatus {
    match stage {
        StageName::Planning => TaskStatus::Analyzing,
        StageName::Analysis => TaskStatus::Analyzing,
        StageName::Implementation => TaskStatus::Coding,
        StageName::Review => TaskStatus::Reviewing,
        StageName::PrCreation => TaskStatus::CreatingPr,
        StageName::Deployment => TaskStatus::Deploying,
    }
}

fn stage_banner(stage: StageName) -> &'static str {
    match stage {
        StageName::Planning => "Planning execution strategy",
        StageName::Analysis => "Analyzing repository structure",
        StageName::Implementation => "Generating code changes",
        StageName::Review => "Reviewing generated changes",
        StageName::PrCreation => "Creating pull request",
        StageName::Deployment => "Triggering deployment",
    }
}

/// Pull a typed value out of an earlier stage's recorded output. Stage
/// bodies use this, so a missing prerequisite surfaces as a stage failure.
fn prior_output<T: DeserializeOwned>(task: &Task, stage: StageName) -> Result<T, StageError> {
    let output = task
        .find_stage(stage)
        .and_then(|s| s.output.clone())
        .ok_or_else(|| StageError::new(format!("Missing output from {} stage", stage)))?;
    serde_json::from_value(output)
        .map_err(|e| StageError::new(format!("Corrupt output from {} stage: {}", stage, e)))
}

fn prior_field<T: DeserializeOwned>(
    task: &Task,
    stage: StageName,
    field: &str,
) -> Result<T, StageError> {
    let output = task
        .find_stage(stage)
        .and_then(|s| s.output.clone())
        .ok_or_else(|| StageError::new(format!("Missing output from {} stage", stage)))?;
    let value = output
        .get(field)
        .cloned()
        .ok_or_else(|| StageError::new(format!("Missing '{}' in {} stage output", field, stage)))?;
    serde_json::from_value(value)
        .map_err(|e| StageError::new(format!("Corrupt output from {} stage: {}", stage, e)))
}

pub struct PipelineDriver {
    db: DbHandle,
    bridge: Arc<NotificationBridge>,
    executor: StageExecutor,
    providers: Providers,
}

impl PipelineDriver {
    pub fn new(db: DbHandle, bridge: Arc<NotificationBridge>, providers: Providers) -> Self {
        let executor = StageExecutor::new(db.clone(), bridge.clone());
        Self {
            db,
            bridge,
            executor,
            providers,
        }
    }

    /// Run the full pipeline for a task. A stage failure is absorbed here:
    /// the task ends up failed and `Ok(())` is returned, since the run
    /// itself concluded. Only infrastructure errors propagate.
    pub async fn run(&self, task_id: uuid::Uuid) -> Result<(), TaskError> {
        let mut task = self
            .db
            .call(move |db| db.load_task(task_id))
            .await?
            .ok_or(TaskError::TaskNotFound { id: task_id })?;

        tracing::info!(%task_id, title = %task.title, "Starting pipeline run");

        for stage in StageName::SEQUENCE {
            // A cancel can land between stages; failed is sticky, so check
            // the persisted status before advancing.
            let persisted = self
                .db
                .call(move |db| db.load_task(task_id))
                .await?
                .ok_or(TaskError::TaskNotFound { id: task_id })?;
            if persisted.status == TaskStatus::Failed {
                tracing::info!(%task_id, "Pipeline halted: task cancelled before {}", stage);
                return Ok(());
            }

            task.status = stage_task_status(stage);
            self.persist(&task).await?;
            self.bridge.notify(
                task_id,
                &TaskEvent::StatusChanged {
                    task_id,
                    status: task.status,
                },
            );
            self.log(&mut task, LogLevel::Info, stage_banner(stage), None)
                .await?;

            match self.run_one(&mut task, stage).await {
                Ok(StageOutcome::Completed) => {}
                Ok(StageOutcome::CancelledMidRun) => {
                    tracing::info!(%task_id, %stage, "Pipeline halted: task cancelled");
                    return Ok(());
                }
                Err(TaskError::Stage { stage, source }) => {
                    tracing::warn!(%task_id, %stage, error = %source, "Pipeline run failed");
                    task.status = TaskStatus::Failed;
                    self.log(
                        &mut task,
                        LogLevel::Error,
                        format!("Task failed: {}", source),
                        Some(json!({"stage": stage})),
                    )
                    .await?;
                    self.persist(&task).await?;
                    self.bridge.notify(
                        task_id,
                        &TaskEvent::TaskFailed {
                            task_id,
                            error: source.to_string(),
                        },
                    );
                    return Ok(());
                }
                Err(other) => return Err(other),
            }
        }

        task.status = TaskStatus::Completed;
        task.recompute_progress();
        self.log(&mut task, LogLevel::Success, "Task completed successfully", None)
            .await?;
        self.persist(&task).await?;
        self.bridge
            .notify(task_id, &TaskEvent::TaskCompleted { task_id });
        tracing::info!(%task_id, "Pipeline run completed");
        Ok(())
    }

    async fn run_one(&self, task: &mut Task, stage: StageName) -> Result<StageOutcome, TaskError> {
        // Bodies run over an owned snapshot: the executor holds the mutable
        // borrow while the future is pending.
        let snapshot = task.clone();
        let outcome = match stage {
            StageName::Planning => {
                let planner = self.providers.planner.clone();
                self.executor
                    .run_stage(task, stage, async move {
                        let plan = planner.plan(&snapshot).await?;
                        to_output(&plan)
                    })
                    .await?
            }
            StageName::Analysis => {
                let analyzer = self.providers.analyzer.clone();
                self.executor
                    .run_stage(task, stage, async move {
                        let analysis = analyzer
                            .analyze(&snapshot.repository, &snapshot.description)
                            .await?;
                        to_output(&analysis)
                    })
                    .await?
            }
            StageName::Implementation => {
                let generator = self.providers.generator.clone();
                self.executor
                    .run_stage(task, stage, async move {
                        let analysis: RepoAnalysis =
                            prior_output(&snapshot, StageName::Analysis)?;
                        let changes = generator.generate(&analysis, &snapshot).await?;
                        let files_changed = changes.len();
                        Ok(json!({
                            "changes": changes,
                            "files_changed": files_changed,
                        }))
                    })
                    .await?
            }
            StageName::Review => {
                let reviewer = self.providers.reviewer.clone();
                let planner = self.providers.planner.clone();
                let outcome = self
                    .executor
                    .run_stage(task, stage, async move {
                        let mut changes: Vec<CodeChange> =
                            prior_field(&snapshot, StageName::Implementation, "changes")?;
                        let review =
                            reviewer.review(&snapshot.repository, &changes).await?;
                        // One refinement pass when the review does not pass;
                        // the refined changes become this stage's output.
                        let refined = !review.passed;
                        if refined {
                            changes = planner.refine(&changes, &review).await?;
                        }
                        Ok(json!({
                            "review": review,
                            "changes": changes,
                            "refined": refined,
                        }))
                    })
                    .await?;
                if outcome == StageOutcome::Completed {
                    let refined = task
                        .find_stage(stage)
                        .and_then(|s| s.output.as_ref())
                        .and_then(|o| o.get("refined"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if refined {
                        self.log(
                            task,
                            LogLevel::Warning,
                            "Review found issues; changes refined",
                            None,
                        )
                        .await?;
                    }
                }
                outcome
            }
            StageName::PrCreation => {
                let git_host = self.providers.git_host.clone();
                self.executor
                    .run_stage(task, stage, async move {
                        let review: Review =
                            prior_field(&snapshot, StageName::Review, "review")?;
                        let changes: Vec<CodeChange> =
                            prior_field(&snapshot, StageName::Review, "changes")?;
                        let pr = git_host
                            .open_pull_request(&snapshot, &changes, &review)
                            .await?;
                        to_output(&pr)
                    })
                    .await?
            }
            StageName::Deployment => {
                let deployer = self.providers.deployer.clone();
                self.executor
                    .run_stage(task, stage, async move {
                        let changes: Vec<CodeChange> =
                            prior_field(&snapshot, StageName::Review, "changes")?;
                        let deployment =
                            deployer.trigger_deployment(&snapshot, &changes).await?;
                        to_output(&deployment)
                    })
                    .await?
            }
        };
        Ok(outcome)
    }

    /// Append a log entry to the task, persist it, and notify subscribers.
    async fn log(
        &self,
        task: &mut Task,
        level: LogLevel,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), TaskError> {
        let entry = task.push_log(level, message, data);
        let task_id = task.id;
        let stored = entry.clone();
        self.db
            .call(move |db| db.append_log(task_id, &stored))
            .await?;
        self.bridge
            .notify(task_id, &TaskEvent::LogAppended { task_id, entry });
        Ok(())
    }

    async fn persist(&self, task: &Task) -> Result<(), TaskError> {
        let snapshot = task.clone();
        self.db.call(move |db| db.save_task(&snapshot)).await?;
        Ok(())
    }
}

fn to_output<T: serde::Serialize>(value: &T) -> Result<Value, StageError> {
    serde_json::to_value(value)
        .map_err(|e| StageError::new(format!("Failed to encode stage output: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TaskStore;
    use crate::models::{Repository, StageStatus, TaskType};
    use crate::providers::{CodeGenerator, ReviewIssue, ReviewService};
    use async_trait::async_trait;

    fn handle() -> DbHandle {
        DbHandle::new(TaskStore::new_in_memory().expect("in-memory db"))
    }

    async fn seed_task(db: &DbHandle) -> Task {
        let task = Task::new(
            "Optimize API response times",
            "The /search api endpoint is slow",
            TaskType::OptimizeApi,
            Repository {
                url: "https://github.com/acme/widgets".into(),
                owner: "acme".into(),
                name: "widgets".into(),
                branch: None,
            },
            "user-1",
        );
        let snapshot = task.clone();
        db.call(move |db| db.save_task(&snapshot)).await.unwrap();
        task
    }

    #[test]
    fn test_stage_status_mapping() {
        assert_eq!(stage_task_status(StageName::Planning), TaskStatus::Analyzing);
        assert_eq!(stage_task_status(StageName::Analysis), TaskStatus::Analyzing);
        assert_eq!(stage_task_status(StageName::Implementation), TaskStatus::Coding);
        assert_eq!(stage_task_status(StageName::Review), TaskStatus::Reviewing);
        assert_eq!(stage_task_status(StageName::PrCreation), TaskStatus::CreatingPr);
        assert_eq!(stage_task_status(StageName::Deployment), TaskStatus::Deploying);
    }

    #[tokio::test]
    async fn test_full_run_completes_task() {
        let db = handle();
        let task = seed_task(&db).await;
        let driver = PipelineDriver::new(
            db.clone(),
            Arc::new(NotificationBridge::new()),
            Providers::simulated(),
        );

        driver.run(task.id).await.unwrap();

        let done = db
            .call(move |db| db.load_task(task.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Completed));
        assert!(done
            .logs
            .iter()
            .any(|l| l.level == LogLevel::Success && l.message.contains("completed")));
        // Every stage recorded an output.
        assert!(done.stages.iter().all(|s| s.output.is_some()));
    }

    #[tokio::test]
    async fn test_run_for_missing_task_is_not_found() {
        let db = handle();
        let driver = PipelineDriver::new(
            db,
            Arc::new(NotificationBridge::new()),
            Providers::simulated(),
        );
        let err = driver.run(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, TaskError::TaskNotFound { .. }));
    }

    struct FailingGenerator;

    #[async_trait]
    impl CodeGenerator for FailingGenerator {
        async fn generate(
            &self,
            _analysis: &RepoAnalysis,
            _task: &Task,
        ) -> Result<Vec<CodeChange>, StageError> {
            Err(StageError::new("generation failed"))
        }
    }

    #[tokio::test]
    async fn test_stage_failure_aborts_run_and_marks_task_failed() {
        let db = handle();
        let task = seed_task(&db).await;
        let mut providers = Providers::simulated();
        providers.generator = Arc::new(FailingGenerator);
        let driver =
            PipelineDriver::new(db.clone(), Arc::new(NotificationBridge::new()), providers);

        // Stage errors are absorbed: the run concluded, the task failed.
        driver.run(task.id).await.unwrap();

        let failed = db
            .call(move |db| db.load_task(task.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        // Two stages done out of six.
        assert_eq!(failed.progress, 33);
        assert_eq!(
            failed.find_stage(StageName::Implementation).unwrap().status,
            StageStatus::Failed
        );
        assert_eq!(
            failed
                .find_stage(StageName::Implementation)
                .unwrap()
                .error
                .as_deref(),
            Some("generation failed")
        );
        // Later stages were never touched.
        for later in [StageName::Review, StageName::PrCreation, StageName::Deployment] {
            assert_eq!(failed.find_stage(later).unwrap().status, StageStatus::Pending);
        }
        assert!(failed
            .logs
            .iter()
            .any(|l| l.level == LogLevel::Error && l.message.contains("generation failed")));
    }

    struct HarshReviewer;

    #[async_trait]
    impl ReviewService for HarshReviewer {
        async fn review(
            &self,
            _repository: &Repository,
            changes: &[CodeChange],
        ) -> Result<Review, StageError> {
            Ok(Review {
                score: 40,
                passed: false,
                issues: changes
                    .iter()
                    .map(|c| ReviewIssue {
                        file: c.path.clone(),
                        line: 1,
                        severity: "major".into(),
                        message: "Unhandled error path".into(),
                        suggestion: "Handle the error".into(),
                    })
                    .collect(),
                suggestions: vec![],
                summary: "Needs work".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_failed_review_triggers_single_refinement_pass() {
        let db = handle();
        let task = seed_task(&db).await;
        let mut providers = Providers::simulated();
        providers.reviewer = Arc::new(HarshReviewer);
        let driver =
            PipelineDriver::new(db.clone(), Arc::new(NotificationBridge::new()), providers);

        driver.run(task.id).await.unwrap();

        let done = db
            .call(move |db| db.load_task(task.id))
            .await
            .unwrap()
            .unwrap();
        // A failed review is not a stage failure; the run continues with the
        // refined changes.
        assert_eq!(done.status, TaskStatus::Completed);
        let review_output = done
            .find_stage(StageName::Review)
            .unwrap()
            .output
            .clone()
            .unwrap();
        assert_eq!(review_output["refined"], true);
        assert_eq!(review_output["review"]["passed"], false);
        let changes: Vec<CodeChange> =
            serde_json::from_value(review_output["changes"].clone()).unwrap();
        assert!(changes.iter().all(|c| c.description.contains("revised after review")));
        assert!(done
            .logs
            .iter()
            .any(|l| l.level == LogLevel::Warning && l.message.contains("refined")));
    }

    #[tokio::test]
    async fn test_run_publishes_lifecycle_events() {
        let db = handle();
        let task = seed_task(&db).await;
        let bridge = Arc::new(NotificationBridge::new());
        let mut rx = bridge.subscribe(task.id);
        let driver = PipelineDriver::new(db, bridge.clone(), Providers::simulated());

        driver.run(task.id).await.unwrap();

        let mut saw_completed = false;
        let mut stage_started = 0;
        while let Ok(payload) = rx.try_recv() {
            if payload.contains("task_completed") {
                saw_completed = true;
            }
            if payload.contains("stage_started") {
                stage_started += 1;
            }
        }
        assert!(saw_completed);
        assert_eq!(stage_started, 6);
    }
}
