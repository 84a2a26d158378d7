//! Collaborator seams for the six pipeline stages.
//!
//! Each stage body calls exactly one of these traits. The driver receives a
//! `Providers` bundle at construction, so simulation is an injected
//! implementation rather than a fallback inside the pipeline. The simulated
//! implementations ship as the default and produce deterministic, plausible
//! output shapes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::StageError;
use crate::models::{Repository, StageName, Task};

// ── Stage output shapes ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub stage: StageName,
    pub action: String,
    pub tool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoAnalysis {
    pub files_analyzed: usize,
    pub identified_files: Vec<String>,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChange {
    pub path: String,
    pub change_type: String,
    pub content: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub file: String,
    pub line: u32,
    pub severity: String,
    pub message: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub score: u32,
    pub issues: Vec<ReviewIssue>,
    pub suggestions: Vec<String>,
    pub summary: String,
    pub passed: bool,
}

/// A review passes at this score or above.
pub const REVIEW_PASS_THRESHOLD: u32 = 70;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub url: String,
    pub number: u64,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub workflow_id: String,
    pub execution_id: String,
    pub status: String,
    pub url: String,
}

// ── Traits ────────────────────────────────────────────────────────────

#[async_trait]
pub trait PlannerService: Send + Sync {
    /// Produce an execution plan for the task.
    async fn plan(&self, task: &Task) -> Result<ExecutionPlan, StageError>;

    /// Revise generated changes to address review findings.
    async fn refine(
        &self,
        changes: &[CodeChange],
        review: &Review,
    ) -> Result<Vec<CodeChange>, StageError>;
}

#[async_trait]
pub trait RepoAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        repository: &Repository,
        description: &str,
    ) -> Result<RepoAnalysis, StageError>;
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(
        &self,
        analysis: &RepoAnalysis,
        task: &Task,
    ) -> Result<Vec<CodeChange>, StageError>;
}

#[async_trait]
pub trait ReviewService: Send + Sync {
    async fn review(
        &self,
        repository: &Repository,
        changes: &[CodeChange],
    ) -> Result<Review, StageError>;
}

#[async_trait]
pub trait GitHost: Send + Sync {
    async fn open_pull_request(
        &self,
        task: &Task,
        changes: &[CodeChange],
        review: &Review,
    ) -> Result<PullRequest, StageError>;
}

#[async_trait]
pub trait DeployService: Send + Sync {
    async fn trigger_deployment(
        &self,
        task: &Task,
        changes: &[CodeChange],
    ) -> Result<Deployment, StageError>;
}

/// The full set of collaborators the pipeline driver needs.
#[derive(Clone)]
pub struct Providers {
    pub planner: Arc<dyn PlannerService>,
    pub analyzer: Arc<dyn RepoAnalyzer>,
    pub generator: Arc<dyn CodeGenerator>,
    pub reviewer: Arc<dyn ReviewService>,
    pub git_host: Arc<dyn GitHost>,
    pub deployer: Arc<dyn DeployService>,
}

impl Providers {
    /// Fully simulated provider set. Deterministic apart from PR numbering.
    pub fn simulated() -> Self {
        Self {
            planner: Arc::new(SimulatedPlanner),
            analyzer: Arc::new(SimulatedAnalyzer),
            generator: Arc::new(SimulatedGenerator),
            reviewer: Arc::new(SimulatedReviewer),
            git_host: Arc::new(SimulatedGitHost::new()),
            deployer: Arc::new(SimulatedDeployer),
        }
    }
}

// ── Simulated implementations ─────────────────────────────────────────

pub struct SimulatedPlanner;

#[async_trait]
impl PlannerService for SimulatedPlanner {
    async fn plan(&self, task: &Task) -> Result<ExecutionPlan, StageError> {
        let steps = vec![
            PlanStep {
                stage: StageName::Analysis,
                action: "Analyze repository structure and locate relevant code".into(),
                tool: "analyzer".into(),
            },
            PlanStep {
                stage: StageName::Implementation,
                action: format!("Generate code changes for: {}", task.title),
                tool: "generator".into(),
            },
            PlanStep {
                stage: StageName::Review,
                action: "Review generated changes for quality and correctness".into(),
                tool: "reviewer".into(),
            },
            PlanStep {
                stage: StageName::Deployment,
                action: "Open a pull request and trigger the deployment workflow".into(),
                tool: "ci".into(),
            },
        ];
        Ok(ExecutionPlan {
            steps,
            reasoning: format!(
                "Task '{}' is a {} request; the standard four-step strategy applies.",
                task.title, task.task_type
            ),
        })
    }

    async fn refine(
        &self,
        changes: &[CodeChange],
        review: &Review,
    ) -> Result<Vec<CodeChange>, StageError> {
        let mut refined = changes.to_vec();
        for change in &mut refined {
            change.description =
                format!("{} (revised after review, score {})", change.description, review.score);
        }
        Ok(refined)
    }
}

pub struct SimulatedAnalyzer;

#[async_trait]
impl RepoAnalyzer for SimulatedAnalyzer {
    async fn analyze(
        &self,
        repository: &Repository,
        description: &str,
    ) -> Result<RepoAnalysis, StageError> {
        let lower = description.to_lowercase();
        let identified_files: Vec<String> = if lower.contains("api") || lower.contains("endpoint") {
            vec![
                "src/routes/index.js".into(),
                "src/controllers/apiController.js".into(),
                "src/middleware/cache.js".into(),
            ]
        } else if lower.contains("frontend") || lower.contains("ui") {
            vec![
                "src/components/App.tsx".into(),
                "src/components/Dashboard.tsx".into(),
                "src/styles/main.css".into(),
            ]
        } else {
            vec!["src/index.js".into(), "src/lib/core.js".into()]
        };
        Ok(RepoAnalysis {
            files_analyzed: 42,
            identified_files: identified_files.clone(),
            reasoning: format!(
                "Scanned {}/{} and matched {} files against the task description.",
                repository.owner,
                repository.name,
                identified_files.len()
            ),
        })
    }
}

pub struct SimulatedGenerator;

#[async_trait]
impl CodeGenerator for SimulatedGenerator {
    async fn generate(
        &self,
        analysis: &RepoAnalysis,
        task: &Task,
    ) -> Result<Vec<CodeChange>, StageError> {
        let changes = analysis
            .identified_files
            .iter()
            .take(3)
            .map(|path| CodeChange {
                path: path.clone(),
                change_type: "modify".into(),
                content: format!("// updated for: {}\n", task.title),
                description: format!("Apply changes for '{}' in {}", task.title, path),
            })
            .collect();
        Ok(changes)
    }
}

pub struct SimulatedReviewer;

#[async_trait]
impl ReviewService for SimulatedReviewer {
    async fn review(
        &self,
        _repository: &Repository,
        changes: &[CodeChange],
    ) -> Result<Review, StageError> {
        // One minor finding per changed file beyond the first.
        let issues: Vec<ReviewIssue> = changes
            .iter()
            .skip(1)
            .map(|c| ReviewIssue {
                file: c.path.clone(),
                line: 1,
                severity: "minor".into(),
                message: "Consider adding a test for this change".into(),
                suggestion: "Add unit test coverage".into(),
            })
            .collect();
        let score = 100u32.saturating_sub(5 * issues.len() as u32).max(75);
        Ok(Review {
            score,
            passed: score >= REVIEW_PASS_THRESHOLD,
            suggestions: vec!["Keep functions small".into()],
            summary: format!(
                "Reviewed {} changed files, {} findings, score {}",
                changes.len(),
                issues.len(),
                score
            ),
            issues,
        })
    }
}

pub struct SimulatedGitHost {
    next_pr: AtomicU64,
}

impl SimulatedGitHost {
    pub fn new() -> Self {
        Self {
            next_pr: AtomicU64::new(1),
        }
    }
}

impl Default for SimulatedGitHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitHost for SimulatedGitHost {
    async fn open_pull_request(
        &self,
        task: &Task,
        _changes: &[CodeChange],
        _review: &Review,
    ) -> Result<PullRequest, StageError> {
        let number = self.next_pr.fetch_add(1, Ordering::Relaxed);
        Ok(PullRequest {
            url: format!(
                "https://github.com/{}/{}/pull/{}",
                task.repository.owner, task.repository.name, number
            ),
            number,
            state: "open".into(),
        })
    }
}

pub struct SimulatedDeployer;

#[async_trait]
impl DeployService for SimulatedDeployer {
    async fn trigger_deployment(
        &self,
        task: &Task,
        _changes: &[CodeChange],
    ) -> Result<Deployment, StageError> {
        Ok(Deployment {
            workflow_id: "ci-cd-pipeline".into(),
            execution_id: format!("exec-{}", task.id),
            status: "success".into(),
            url: format!(
                "https://{}-preview.example.dev",
                task.repository.name
            ),
        })
    }
}
