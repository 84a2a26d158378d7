//! Shared domain types: tasks, stages, logs, and their status enums.
//!
//! The `Task` record is the single source of truth for pipeline state. Its
//! mutation helpers enforce the lifecycle invariants (terminal statuses are
//! sticky except via explicit retry, progress is derived from completed
//! stages); persistence lives in [`crate::db`].

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::TaskError;

/// Total number of stages in every pipeline. The stage set is fixed for the
/// life of a task.
pub const STAGE_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    OptimizeApi,
    FixBug,
    DeployFrontend,
    AddFeature,
    Refactor,
    Custom,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptimizeApi => "optimize-api",
            Self::FixBug => "fix-bug",
            Self::DeployFrontend => "deploy-frontend",
            Self::AddFeature => "add-feature",
            Self::Refactor => "refactor",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "optimize-api" => Ok(Self::OptimizeApi),
            "fix-bug" => Ok(Self::FixBug),
            "deploy-frontend" => Ok(Self::DeployFrontend),
            "add-feature" => Ok(Self::AddFeature),
            "refactor" => Ok(Self::Refactor),
            "custom" => Ok(Self::Custom),
            _ => Err(format!("Invalid task type: {}", s)),
        }
    }
}

/// Task-level status, derived from the most recently transitioned stage.
/// Only the pipeline driver writes it, except for cancel/retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    Analyzing,
    Coding,
    Reviewing,
    Refining,
    CreatingPr,
    Deploying,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Coding => "coding",
            Self::Reviewing => "reviewing",
            Self::Refining => "refining",
            Self::CreatingPr => "creating-pr",
            Self::Deploying => "deploying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses admit no further pipeline progress without an
    /// explicit user action (retry).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "analyzing" => Ok(Self::Analyzing),
            "coding" => Ok(Self::Coding),
            "reviewing" => Ok(Self::Reviewing),
            "refining" => Ok(Self::Refining),
            "creating-pr" => Ok(Self::CreatingPr),
            "deploying" => Ok(Self::Deploying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Identity of a pipeline stage. The set and order are closed; see
/// [`StageName::SEQUENCE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageName {
    Planning,
    Analysis,
    Implementation,
    Review,
    PrCreation,
    Deployment,
}

impl StageName {
    /// The fixed execution order of the pipeline. Stage descriptors are data
    /// consumed by the driver loop, not control flow.
    pub const SEQUENCE: [StageName; STAGE_COUNT] = [
        Self::Planning,
        Self::Analysis,
        Self::Implementation,
        Self::Review,
        Self::PrCreation,
        Self::Deployment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Analysis => "analysis",
            Self::Implementation => "implementation",
            Self::Review => "review",
            Self::PrCreation => "pr-creation",
            Self::Deployment => "deployment",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "analysis" => Ok(Self::Analysis),
            "implementation" => Ok(Self::Implementation),
            "review" => Ok(Self::Review),
            "pr-creation" => Ok(Self::PrCreation),
            "deployment" => Ok(Self::Deployment),
            _ => Err(format!("Invalid stage name: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid stage status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Success => "success",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "success" => Ok(Self::Success),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

/// Repository descriptor, opaque to the pipeline core; passed through to
/// stage bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub url: String,
    pub owner: String,
    pub name: String,
    pub branch: Option<String>,
}

/// One entry of the append-only task log. A missing message deserializes to
/// the empty string rather than rejecting the entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default)]
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            data,
        }
    }
}

/// One named unit of pipeline work. Created with the task, mutated only by
/// the stage executor (reset aside).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: StageName,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Stage {
    fn pending(name: StageName) -> Self {
        Self {
            name,
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
        }
    }

    /// Revert to the pending baseline, clearing timestamps, output and error.
    pub fn reset(&mut self) {
        *self = Self::pending(self.name);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub owner: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub repository: Repository,
    pub status: TaskStatus,
    /// 0–100, recomputed at stage boundaries only.
    pub progress: u8,
    pub stages: Vec<Stage>,
    pub logs: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with all six stages pending, status `pending`,
    /// progress 0.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        task_type: TaskType,
        repository: Repository,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            title: title.into(),
            description: description.into(),
            task_type,
            repository,
            status: TaskStatus::Pending,
            progress: 0,
            stages: StageName::SEQUENCE.iter().map(|&n| Stage::pending(n)).collect(),
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn find_stage(&self, name: StageName) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn find_stage_mut(&mut self, name: StageName) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.name == name)
    }

    /// Append a log entry in memory and return a copy for persistence.
    pub fn push_log(
        &mut self,
        level: LogLevel,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> LogEntry {
        let entry = LogEntry::new(level, message, data);
        self.logs.push(entry.clone());
        entry
    }

    pub fn completed_stage_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .count()
    }

    /// Recompute `progress` as round(100 * completed / total). Called at
    /// stage boundaries, never mid-stage.
    pub fn recompute_progress(&mut self) {
        let completed = self.completed_stage_count();
        self.progress =
            ((completed as f64 / self.stages.len() as f64) * 100.0).round() as u8;
    }

    /// Cancel the task: terminal statuses are rejected, otherwise the task
    /// is marked failed with a warning log. Does not interrupt an in-flight
    /// stage body; the executor detects the status flip at the next
    /// transition.
    pub fn cancel(&mut self) -> Result<(), TaskError> {
        if self.status.is_terminal() {
            return Err(TaskError::InvalidState {
                action: "cancel",
                status: self.status,
            });
        }
        self.status = TaskStatus::Failed;
        self.push_log(LogLevel::Warning, "Task cancelled by user", None);
        Ok(())
    }

    /// Reset for a fresh pipeline run: only valid from `failed`. Reverts
    /// every stage to the pending baseline and zeroes progress.
    pub fn reset_for_retry(&mut self) -> Result<(), TaskError> {
        if self.status != TaskStatus::Failed {
            return Err(TaskError::InvalidState {
                action: "retry",
                status: self.status,
            });
        }
        self.status = TaskStatus::Pending;
        self.progress = 0;
        for stage in &mut self.stages {
            stage.reset();
        }
        Ok(())
    }
}
