//! Session data model — requests, phases, progress, and final snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::team::{CollaborationMode, TaskSpec};

/// Coarse status of a collaboration session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, not yet driving any phase.
    #[default]
    Initializing,
    /// Somewhere between planning and aggregating.
    Running,
    /// Every task reached a terminal state and results were collated.
    Completed,
    /// Setup failed or `stop_on_first_failure` fired.
    Failed,
    /// Explicit cancel or deadline expiry; partial results preserved.
    Cancelled,
}

impl SessionStatus {
    /// Terminal statuses are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

/// Working phase of a running session.
///
/// `reviewing` only occurs for hierarchical and debate modes; sequential and
/// parallel sessions go straight from executing to aggregating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Request validation, task registration, capability checks.
    Planning,
    /// Mode-specific dispatch.
    Executing,
    /// Leader synthesize / reviewer judge.
    Reviewing,
    /// Result collation and terminal status decision.
    Aggregating,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Planning => "planning",
            SessionPhase::Executing => "executing",
            SessionPhase::Reviewing => "reviewing",
            SessionPhase::Aggregating => "aggregating",
        }
    }
}

/// Final outcome of one task within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationResult {
    /// The task this result settles.
    pub task_id: Uuid,
    /// The member whose output this is.
    pub member_id: Uuid,
    /// Whether the execution succeeded.
    pub success: bool,
    /// Executor output (the winning candidate's under debate).
    #[serde(default)]
    pub output: String,
    /// Error description when the execution failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl CollaborationResult {
    pub fn success(task_id: Uuid, member_id: Uuid, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            task_id,
            member_id,
            success: true,
            output: output.into(),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(task_id: Uuid, member_id: Uuid, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            task_id,
            member_id,
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// Progress snapshot delivered after each task settles.
///
/// Snapshots are produced in completion order, which matches submission
/// order only under sequential mode.
#[derive(Debug, Clone, Serialize)]
pub struct CollaborationProgress {
    pub session_id: Uuid,
    /// Phase the session was in when the snapshot was taken.
    pub phase: SessionPhase,
    pub completed_tasks: usize,
    pub total_tasks: usize,
    /// The task whose terminal transition triggered this snapshot.
    pub current_task: Option<Uuid>,
    /// Results settled so far, in completion order.
    pub results: Vec<CollaborationResult>,
}

/// Callback invoked synchronously with each progress snapshot.
pub type ProgressCallback = Arc<dyn Fn(CollaborationProgress) + Send + Sync>;

/// Tuning knobs for a single collaboration request.
#[derive(Clone, Default)]
pub struct CollaborateOptions {
    /// Overall session deadline; elapsing it cancels the session.
    pub timeout: Option<Duration>,
    /// Cancel remaining tasks and fail the session on the first failure.
    pub stop_on_first_failure: bool,
    /// Candidate count for debate mode; defaults to the eligible member count.
    pub debate_candidates: Option<usize>,
    /// Optional progress callback.
    pub progress: Option<ProgressCallback>,
}

impl fmt::Debug for CollaborateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollaborateOptions")
            .field("timeout", &self.timeout)
            .field("stop_on_first_failure", &self.stop_on_first_failure)
            .field("debate_candidates", &self.debate_candidates)
            .field("progress", &self.progress.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// A request to run a set of tasks through a team.
///
/// Exactly one of `team_id` (existing team) or `template` (ephemeral team)
/// must be supplied.
#[derive(Debug, Clone)]
pub struct CollaborateRequest {
    /// Existing team to run against.
    pub team_id: Option<Uuid>,
    /// Template name for an ephemeral team, dissolved when the session ends.
    pub template: Option<String>,
    /// Tasks to register and dispatch.
    pub tasks: Vec<TaskSpec>,
    /// Dispatch mode; `None` takes the team's default.
    pub mode: Option<CollaborationMode>,
    /// Request-scoped tuning.
    pub options: CollaborateOptions,
}

impl CollaborateRequest {
    /// Target an existing team.
    pub fn for_team(team_id: Uuid) -> Self {
        Self {
            team_id: Some(team_id),
            template: None,
            tasks: Vec::new(),
            mode: None,
            options: CollaborateOptions::default(),
        }
    }

    /// Target an ephemeral team built from a template.
    pub fn for_template(template: impl Into<String>) -> Self {
        Self {
            team_id: None,
            template: Some(template.into()),
            tasks: Vec::new(),
            mode: None,
            options: CollaborateOptions::default(),
        }
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_tasks<I>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = TaskSpec>,
    {
        self.tasks.extend(tasks);
        self
    }

    pub fn with_mode(mut self, mode: CollaborationMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn stop_on_first_failure(mut self) -> Self {
        self.options.stop_on_first_failure = true;
        self
    }

    pub fn with_debate_candidates(mut self, candidates: usize) -> Self {
        self.options.debate_candidates = Some(candidates);
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.options.progress = Some(callback);
        self
    }

    /// Reject requests that name neither or both team sources.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match (self.team_id.is_some(), self.template.is_some()) {
            (false, false) => Err(ValidationError::MissingTeamSource),
            (true, true) => Err(ValidationError::ConflictingTeamSource),
            _ => Ok(()),
        }
    }
}

/// Snapshot of a collaboration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationSession {
    /// Session identifier.
    pub id: Uuid,
    /// Team the session ran against.
    pub team_id: Uuid,
    /// Template the ephemeral team came from, if any.
    #[serde(default)]
    pub template: Option<String>,
    /// Dispatch mode in effect.
    pub mode: CollaborationMode,
    /// Coarse status.
    pub status: SessionStatus,
    /// Last phase reached.
    pub phase: SessionPhase,
    /// Tasks registered for this session, in submission order.
    pub task_ids: Vec<Uuid>,
    /// Results settled so far, in completion order.
    pub results: Vec<CollaborationResult>,
    /// Failure reason for `failed` sessions.
    #[serde(default)]
    pub error: Option<String>,
    /// When the session was created.
    pub started_at: DateTime<Utc>,
    /// Wall-clock deadline derived from the request timeout.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// When the session reached a terminal status.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl CollaborationSession {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Result settled for the given task, if any.
    pub fn result_for(&self, task_id: Uuid) -> Option<&CollaborationResult> {
        self.results.iter().find(|r| r.task_id == task_id)
    }

    /// Number of successful results.
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}
