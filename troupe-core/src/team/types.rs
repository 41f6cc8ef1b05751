//! Team data model — members, tasks, messages, and per-team configuration.
//!
//! Teams group agent members with roles and capability tags; tasks move
//! through a terminal-state machine driven by the manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Priority of a team task. Higher discriminant wins.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Role of a member within a team.
///
/// A capability tag used by the dispatch strategies (hierarchical picks the
/// leader, debate picks a reviewer as judge), not a behavior hierarchy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Leader,
    #[default]
    Worker,
    Reviewer,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Leader => "leader",
            MemberRole::Worker => "worker",
            MemberRole::Reviewer => "reviewer",
        }
    }
}

/// Availability of a team member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    #[default]
    Idle,
    Busy,
    Offline,
}

/// Input description of a member, before the manager assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSpec {
    /// Display name, unique within the team.
    pub name: String,
    /// Role within the team.
    #[serde(default)]
    pub role: MemberRole,
    /// Capability tags this member can serve.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl MemberSpec {
    pub fn new(name: impl Into<String>, role: MemberRole) -> Self {
        Self {
            name: name.into(),
            role,
            capabilities: Vec::new(),
        }
    }

    /// Add a single capability tag.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Add several capability tags.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(capabilities.into_iter().map(Into::into));
        self
    }
}

/// A member of a team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    /// Unique identifier for this member.
    pub id: Uuid,
    /// Display name, unique within the team.
    pub name: String,
    /// Role within the team.
    pub role: MemberRole,
    /// Capability tags this member can serve.
    pub capabilities: Vec<String>,
    /// Current availability.
    pub status: MemberStatus,
    /// Number of tasks currently assigned to this member.
    pub load: usize,
}

impl TeamMember {
    pub fn from_spec(spec: MemberSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: spec.name,
            role: spec.role,
            capabilities: spec.capabilities,
            status: MemberStatus::Idle,
            load: 0,
        }
    }

    /// Whether this member's capabilities cover every required tag.
    pub fn can_handle(&self, required: &[String]) -> bool {
        required.iter().all(|cap| self.capabilities.contains(cap))
    }

    /// Whether the scheduler may hand this member a task right now.
    pub fn is_assignable(&self) -> bool {
        self.status == MemberStatus::Idle
    }
}

/// Status of a team task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the task state machine permits `self -> next`.
    ///
    /// `assigned -> pending` covers forced member removal, which hands the
    /// task back to the scheduler.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(next, TaskStatus::Assigned | TaskStatus::Cancelled),
            TaskStatus::Assigned => matches!(
                next,
                TaskStatus::Running | TaskStatus::Pending | TaskStatus::Cancelled
            ),
            TaskStatus::Running => matches!(
                next,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
            ),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Whether the execution succeeded.
    pub success: bool,
    /// Executor output (empty on failure).
    #[serde(default)]
    pub output: String,
    /// Error description when the execution failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock duration of the execution in milliseconds.
    pub duration_ms: u64,
}

impl TaskResult {
    pub fn success(output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// Input description of a task, before the manager registers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Short title.
    pub title: String,
    /// Longer description handed to the executor.
    #[serde(default)]
    pub description: String,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Capability tags a member must cover to take this task.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

impl TaskSpec {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            priority: TaskPriority::Normal,
            required_capabilities: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Require a capability tag.
    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }
}

/// A task tracked on a team's board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamTask {
    /// Task identifier.
    pub id: Uuid,
    /// Short title.
    pub title: String,
    /// Longer description handed to the executor.
    pub description: String,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Capability tags a member must cover to take this task.
    pub required_capabilities: Vec<String>,
    /// Current state-machine position.
    pub status: TaskStatus,
    /// Member this task is assigned to, if any.
    #[serde(default)]
    pub assigned_to: Option<Uuid>,
    /// Final result, set on the terminal transition.
    #[serde(default)]
    pub result: Option<TaskResult>,
    /// Number of executor retries consumed.
    pub retry_count: u32,
    /// When the task was registered.
    pub created_at: DateTime<Utc>,
    /// When the task last changed.
    pub updated_at: DateTime<Utc>,
}

impl TeamTask {
    pub fn from_spec(spec: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: spec.title,
            description: spec.description,
            priority: spec.priority,
            required_capabilities: spec.required_capabilities,
            status: TaskStatus::Pending,
            assigned_to: None,
            result: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Refresh the update timestamp after a mutation.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// An append-only message on a team's log.
///
/// No recipient means broadcast; hierarchical and debate sessions use the log
/// to share intermediate artifacts between members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMessage {
    /// Message identifier.
    pub id: Uuid,
    /// Sending member.
    pub sender: Uuid,
    /// Receiving member; `None` broadcasts to the whole team.
    #[serde(default)]
    pub recipient: Option<Uuid>,
    /// Free-form type tag (e.g. "decomposition", "candidate").
    pub kind: String,
    /// Message body.
    pub payload: String,
    /// When the message was posted.
    pub timestamp: DateTime<Utc>,
}

impl TeamMessage {
    pub fn new(sender: Uuid, kind: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            recipient: None,
            kind: kind.into(),
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }

    /// Address the message to a single member instead of broadcasting.
    pub fn with_recipient(mut self, recipient: Uuid) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }
}

/// Retry behavior for failed executor invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: u32,
    /// Base backoff in milliseconds, doubled per attempt.
    pub backoff_ms: u64,
    /// Add a random fraction of the base to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 500,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (1-based): base * 2^(attempt - 1),
    /// plus up to one extra base of jitter when enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let mut millis = self.backoff_ms.saturating_mul(1u64 << exp);
        if self.jitter {
            millis += rand::random::<u64>() % self.backoff_ms.max(1);
        }
        Duration::from_millis(millis)
    }
}

/// Per-team execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Cap on tasks simultaneously assigned or running.
    pub max_concurrency: usize,
    /// Per-invocation executor timeout in seconds.
    pub task_timeout_secs: u64,
    /// Retry behavior for failed invocations.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            task_timeout_secs: 300,
            retry: RetryPolicy::default(),
        }
    }
}

impl TeamConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// Dispatch strategy for a collaboration session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationMode {
    /// One task at a time, in priority-then-FIFO order.
    #[default]
    Sequential,
    /// Fan-out up to the concurrency bound, replenishing as slots free up.
    Parallel,
    /// Leader decomposes, workers execute, leader synthesizes.
    Hierarchical,
    /// Redundant candidates per task, judged by a reviewer.
    Debate,
}

/// Input description of a team, before the manager assigns ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamSpec {
    /// Team name.
    pub name: String,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// Members to create with the team.
    #[serde(default)]
    pub members: Vec<MemberSpec>,
    /// Default collaboration mode.
    #[serde(default)]
    pub mode: CollaborationMode,
    /// Execution limits; `None` takes the configured defaults.
    #[serde(default)]
    pub config: Option<TeamConfig>,
}

impl TeamSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            members: Vec::new(),
            mode: CollaborationMode::Sequential,
            config: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_member(mut self, member: MemberSpec) -> Self {
        self.members.push(member);
        self
    }

    pub fn with_mode(mut self, mode: CollaborationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_config(mut self, config: TeamConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// A team of agent members that collaborate on tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    /// Team identifier.
    pub id: Uuid,
    /// Team name.
    pub name: String,
    /// Human description.
    pub description: String,
    /// Members, in creation order.
    pub members: Vec<TeamMember>,
    /// Default collaboration mode.
    pub mode: CollaborationMode,
    /// Execution limits.
    pub config: TeamConfig,
    /// When the team was created.
    pub created_at: DateTime<Utc>,
}

impl Team {
    /// Look up a member by id.
    pub fn member(&self, id: Uuid) -> Option<&TeamMember> {
        self.members.iter().find(|m| m.id == id)
    }

    /// First member carrying the given role, in creation order.
    pub fn member_with_role(&self, role: MemberRole) -> Option<&TeamMember> {
        self.members.iter().find(|m| m.role == role)
    }

    /// All members carrying the given role.
    pub fn members_with_role(&self, role: MemberRole) -> Vec<&TeamMember> {
        self.members.iter().filter(|m| m.role == role).collect()
    }

    /// Whether any non-offline member covers the required capabilities.
    pub fn can_satisfy(&self, required: &[String]) -> bool {
        self.members
            .iter()
            .any(|m| m.status != MemberStatus::Offline && m.can_handle(required))
    }
}

/// Load snapshot for one member inside a [`TeamStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberLoad {
    pub member_id: Uuid,
    pub name: String,
    pub status: MemberStatus,
    pub load: usize,
}

/// Aggregate, read-only view of a team's tasks and member loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamStatus {
    pub team_id: Uuid,
    pub name: String,
    pub total_tasks: usize,
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub member_loads: Vec<MemberLoad>,
}

/// Session-scoped context handed to every executor invocation.
///
/// Facts carry intermediate artifacts (decomposition plans, debate
/// candidates); messages snapshot the team log at invocation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedContext {
    /// Keyed facts shared across the session.
    #[serde(default)]
    pub facts: HashMap<String, String>,
    /// Team message log snapshot.
    #[serde(default)]
    pub messages: Vec<TeamMessage>,
}

impl SharedContext {
    /// Record a keyed fact, replacing any previous value.
    pub fn add_fact(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.facts.insert(key.into(), value.into());
    }

    pub fn fact(&self, key: &str) -> Option<&str> {
        self.facts.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_priority_default_is_normal() {
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }

    #[test]
    fn test_member_can_handle_subset() {
        let member = TeamMember::from_spec(
            MemberSpec::new("dev", MemberRole::Worker)
                .with_capabilities(["coding", "testing", "debugging"]),
        );
        assert!(member.can_handle(&["coding".into()]));
        assert!(member.can_handle(&["coding".into(), "testing".into()]));
        assert!(member.can_handle(&[]));
        assert!(!member.can_handle(&["deployment".into()]));
    }

    #[test]
    fn test_member_starts_idle_with_zero_load() {
        let member = TeamMember::from_spec(MemberSpec::new("fresh", MemberRole::Worker));
        assert_eq!(member.status, MemberStatus::Idle);
        assert_eq!(member.load, 0);
        assert!(member.is_assignable());
    }

    #[test]
    fn test_task_state_machine_permits_documented_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Assigned.can_transition_to(Running));
        assert!(Assigned.can_transition_to(Pending));
        assert!(Assigned.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
    }

    #[test]
    fn test_task_state_machine_rejects_illegal_edges() {
        use TaskStatus::*;
        assert!(!Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Assigned));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Assigned, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_task_from_spec() {
        let task = TeamTask::from_spec(
            TaskSpec::new("Review PR#1")
                .with_priority(TaskPriority::High)
                .requires("code-review"),
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::High);
        assert!(task.assigned_to.is_none());
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn test_message_broadcast_by_default() {
        let sender = Uuid::new_v4();
        let msg = TeamMessage::new(sender, "status", "all clear");
        assert!(msg.is_broadcast());

        let recipient = Uuid::new_v4();
        let msg = msg.with_recipient(recipient);
        assert!(!msg.is_broadcast());
        assert_eq!(msg.recipient, Some(recipient));
    }

    #[test]
    fn test_retry_delay_grows_exponentially() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_ms: 100,
            jitter: false,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_jitter_bounded_by_base() {
        let policy = RetryPolicy {
            max_retries: 1,
            backoff_ms: 100,
            jitter: true,
        };
        for _ in 0..20 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(100));
            assert!(d < Duration::from_millis(200));
        }
    }

    #[test]
    fn test_team_role_lookup() {
        let team = Team {
            id: Uuid::new_v4(),
            name: "qa".into(),
            description: String::new(),
            members: vec![
                TeamMember::from_spec(
                    MemberSpec::new("judge", MemberRole::Reviewer).with_capability("code-review"),
                ),
                TeamMember::from_spec(
                    MemberSpec::new("runner", MemberRole::Worker).with_capability("testing"),
                ),
            ],
            mode: CollaborationMode::Sequential,
            config: TeamConfig::default(),
            created_at: Utc::now(),
        };

        assert_eq!(
            team.member_with_role(MemberRole::Reviewer).map(|m| m.name.as_str()),
            Some("judge")
        );
        assert!(team.member_with_role(MemberRole::Leader).is_none());
        assert!(team.can_satisfy(&["testing".into()]));
        assert!(!team.can_satisfy(&["deployment".into()]));
    }

    #[test]
    fn test_shared_context_facts() {
        let mut ctx = SharedContext::default();
        ctx.add_fact("plan", "three sub-tasks");
        assert_eq!(ctx.fact("plan"), Some("three sub-tasks"));
        assert_eq!(ctx.fact("missing"), None);
    }

    #[test]
    fn test_team_serde_roundtrip() {
        let team = Team {
            id: Uuid::new_v4(),
            name: "serde-test".into(),
            description: "roundtrip".into(),
            members: vec![TeamMember::from_spec(
                MemberSpec::new("solo", MemberRole::Leader).with_capability("planning"),
            )],
            mode: CollaborationMode::Hierarchical,
            config: TeamConfig::default(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&team).unwrap();
        let restored: Team = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.name, "serde-test");
        assert_eq!(restored.members.len(), 1);
        assert_eq!(restored.mode, CollaborationMode::Hierarchical);
    }

    #[test]
    fn test_status_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&MemberStatus::Offline).unwrap(),
            "\"offline\""
        );
        assert_eq!(
            serde_json::to_string(&CollaborationMode::Hierarchical).unwrap(),
            "\"hierarchical\""
        );
    }
}
