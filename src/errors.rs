//! Typed error hierarchy for the task pipeline.
//!
//! `StageError` is the expected failure mode of a stage body — it is caught
//! by the stage executor, recorded on the stage, and converted into a failed
//! task by the pipeline driver; it never crosses the driver boundary.
//! Everything else surfaces as a `TaskError` variant.

use thiserror::Error;
use uuid::Uuid;

use crate::models::{StageName, TaskStatus};

/// Failure reported by a stage body (an external collaborator).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StageError {
    pub message: String,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors from the task lifecycle and pipeline subsystem.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Invalid task input: {0}")]
    Validation(String),

    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Stage {stage} not found on task {task_id}")]
    StageNotFound { task_id: Uuid, stage: StageName },

    #[error("Cannot {action} task in status '{status}'")]
    InvalidState {
        action: &'static str,
        status: TaskStatus,
    },

    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: StageName,
        #[source]
        source: StageError,
    },

    /// Queue/persistence/notification failures, unexpected by design.
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl TaskError {
    /// True for errors the worker must hand back to the queue's retry policy
    /// rather than treat as a terminal pipeline outcome.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }
}
