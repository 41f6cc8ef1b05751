//! Integration tests for the collaboration core.
//!
//! These tests exercise teams, scheduling, and sessions end-to-end through
//! the public surface (`Troupe` facade and `CollaborationEngine`), using the
//! mock executor and a concurrency-counting executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use troupe_core::error::ExecutionError;
use troupe_core::executor::{AgentExecutor, ExecutionRequest, MockAgentExecutor};
use troupe_core::team::RetryPolicy;
use troupe_core::{
    CollaborateRequest, CollaborationMode, MemberRole, MemberSpec, SessionStatus, TaskPriority,
    TaskSpec, TaskStatus, TeamConfig, TeamSpec, Troupe, TroupeConfig,
};

/// Helper executor that records the peak number of concurrent invocations.
struct CountingExecutor {
    current: AtomicUsize,
    peak: AtomicUsize,
    hold: Duration,
}

impl CountingExecutor {
    fn new(hold: Duration) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            hold,
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentExecutor for CountingExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<String, ExecutionError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("done: {}", request.task.title))
    }

    fn name(&self) -> &str {
        "counting-executor"
    }
}

/// Helper to build a facade around the given executor.
fn troupe_with(executor: Arc<dyn AgentExecutor>) -> Troupe {
    Troupe::new(TroupeConfig::default(), executor).0
}

// --- Integration Tests ---

#[tokio::test]
async fn test_qa_team_end_to_end_sequential() {
    let mock = Arc::new(MockAgentExecutor::new());
    let troupe = troupe_with(mock.clone());

    let team = troupe.create_team("QA", None).await.unwrap();
    troupe
        .add_member(
            team.id,
            MemberSpec::new("reviewer", MemberRole::Reviewer).with_capability("code-review"),
        )
        .await
        .unwrap();
    troupe
        .add_member(
            team.id,
            MemberSpec::new("tester", MemberRole::Worker).with_capability("testing"),
        )
        .await
        .unwrap();

    let session = troupe
        .collaborate(
            CollaborateRequest::for_team(team.id)
                .with_task(
                    TaskSpec::new("Review PR#1")
                        .with_priority(TaskPriority::High)
                        .requires("code-review"),
                )
                .with_task(TaskSpec::new("Run tests").requires("testing"))
                .with_mode(CollaborationMode::Sequential),
        )
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.results.len(), 2);
    // Completion order equals submission order under sequential mode.
    assert_eq!(session.results[0].task_id, session.task_ids[0]);
    assert_eq!(session.results[1].task_id, session.task_ids[1]);
    assert!(session.results.iter().all(|r| r.success));

    let titles: Vec<String> = mock.invocations().into_iter().map(|(_, t)| t).collect();
    assert_eq!(titles, ["Review PR#1", "Run tests"]);

    // Both members are idle again with zero load.
    let status = troupe.status(team.id).await.unwrap();
    assert!(status.member_loads.iter().all(|m| m.load == 0));
    assert_eq!(status.completed, 2);
}

#[tokio::test]
async fn test_parallel_mode_respects_concurrency_bound() {
    let counting = Arc::new(CountingExecutor::new(Duration::from_millis(30)));
    let troupe = troupe_with(counting.clone());

    let team = troupe
        .manager()
        .create_team(
            TeamSpec::new("capped")
                .with_member(MemberSpec::new("w1", MemberRole::Worker))
                .with_member(MemberSpec::new("w2", MemberRole::Worker))
                .with_member(MemberSpec::new("w3", MemberRole::Worker))
                .with_config(TeamConfig {
                    max_concurrency: 2,
                    ..TeamConfig::default()
                }),
        )
        .await
        .unwrap();

    let tasks: Vec<TaskSpec> = (1..=5).map(|i| TaskSpec::new(format!("job-{i}"))).collect();
    let session = troupe
        .collaborate(
            CollaborateRequest::for_team(team.id)
                .with_tasks(tasks)
                .with_mode(CollaborationMode::Parallel),
        )
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.results.len(), 5);
    assert!(
        counting.peak() <= 2,
        "observed {} concurrent invocations",
        counting.peak()
    );
}

#[tokio::test]
async fn test_debate_without_reviewer_yields_one_result_per_task() {
    let troupe = troupe_with(Arc::new(MockAgentExecutor::new()));

    let team = troupe.create_team("panel", None).await.unwrap();
    for name in ["w1", "w2", "w3"] {
        troupe
            .add_member(
                team.id,
                MemberSpec::new(name, MemberRole::Worker).with_capability("analysis"),
            )
            .await
            .unwrap();
    }

    let session = troupe
        .collaborate(
            CollaborateRequest::for_team(team.id)
                .with_task(TaskSpec::new("alpha").requires("analysis"))
                .with_task(TaskSpec::new("beta").requires("analysis"))
                .with_mode(CollaborationMode::Debate)
                .with_debate_candidates(3),
        )
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.results.len(), 2);
    for task_id in &session.task_ids {
        let matching = session
            .results
            .iter()
            .filter(|r| r.task_id == *task_id)
            .count();
        assert_eq!(matching, 1);
    }
}

#[tokio::test]
async fn test_session_timeout_yields_cancelled_with_no_results() {
    let slow = Arc::new(MockAgentExecutor::new().with_delay(Duration::from_millis(500)));
    let troupe = troupe_with(slow);

    let team = troupe.create_team("slowpokes", None).await.unwrap();
    troupe
        .add_member(team.id, MemberSpec::new("w", MemberRole::Worker))
        .await
        .unwrap();

    let session = troupe
        .collaborate(
            CollaborateRequest::for_team(team.id)
                .with_task(TaskSpec::new("never finishes"))
                .with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Cancelled);
    assert!(session.results.is_empty());
    let deadline = session.deadline.expect("timeout recorded as a deadline");
    assert_eq!((deadline - session.started_at).num_milliseconds(), 100);

    let task = troupe
        .manager()
        .task(team.id, session.task_ids[0])
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_dissolve_with_pending_tasks_emits_single_event() {
    let (troupe, mut stream) = Troupe::new(
        TroupeConfig::default(),
        Arc::new(MockAgentExecutor::new()),
    );

    let team = troupe.create_team("doomed", None).await.unwrap();
    for i in 1..=3 {
        troupe
            .create_task(team.id, TaskSpec::new(format!("pending-{i}")))
            .await
            .unwrap();
    }

    troupe.dissolve(team.id).await.unwrap();
    assert!(troupe.list_teams().await.is_empty());
    assert!(troupe.dissolve(team.id).await.is_err());

    let kinds: Vec<&'static str> = stream.drain().iter().map(|e| e.kind()).collect();
    let dissolved = kinds.iter().filter(|k| **k == "team_dissolved").count();
    assert_eq!(dissolved, 1);
    // Dissolution cancels silently; no per-task cancellation events.
    assert!(!kinds.contains(&"task_cancelled"));
}

#[tokio::test]
async fn test_retry_policy_recovers_after_two_failures() {
    let mock = Arc::new(MockAgentExecutor::new());
    mock.queue_failure("first");
    mock.queue_failure("second");
    mock.queue_output("third time lucky");

    let mut config = TroupeConfig::default();
    config.teams.retry = RetryPolicy {
        max_retries: 2,
        backoff_ms: 1,
        jitter: false,
    };
    let (troupe, _stream) = Troupe::new(config, mock);

    let team = troupe.create_team("flaky-squad", None).await.unwrap();
    troupe
        .add_member(team.id, MemberSpec::new("w", MemberRole::Worker))
        .await
        .unwrap();

    let session = troupe
        .collaborate(CollaborateRequest::for_team(team.id).with_task(TaskSpec::new("wobbly")))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.results[0].output, "third time lucky");

    let task = troupe
        .manager()
        .task(team.id, session.task_ids[0])
        .await
        .unwrap();
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_forced_removal_requeues_the_task() {
    let troupe = troupe_with(Arc::new(MockAgentExecutor::new()));

    let team = troupe.create_team("short-staffed", None).await.unwrap();
    let member = troupe
        .add_member(team.id, MemberSpec::new("leaver", MemberRole::Worker))
        .await
        .unwrap();
    let task = troupe
        .create_task(team.id, TaskSpec::new("orphaned"))
        .await
        .unwrap();
    troupe.assign(team.id, task.id, member.id).await.unwrap();

    // Without force the removal is rejected while the task is in flight.
    assert!(troupe
        .remove_member(team.id, member.id, false)
        .await
        .is_err());

    troupe.remove_member(team.id, member.id, true).await.unwrap();
    let task = troupe.manager().task(team.id, task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.assigned_to.is_none());

    let status = troupe.status(team.id).await.unwrap();
    assert!(status.member_loads.is_empty());
}

#[tokio::test]
async fn test_hierarchical_template_through_facade() {
    let mock = Arc::new(MockAgentExecutor::new());
    mock.queue_output(
        r#"[{"title":"gather papers","required_capabilities":["research"]},
            {"title":"extract findings","required_capabilities":["research"]}]"#,
    );
    let troupe = troupe_with(mock.clone());

    let session = troupe
        .collaborate(
            CollaborateRequest::for_template("research").with_task(TaskSpec::new("survey field")),
        )
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.mode, CollaborationMode::Hierarchical);
    // Original task plus two sub-tasks, each with exactly one result.
    assert_eq!(session.task_ids.len(), 3);
    assert_eq!(session.results.len(), 3);
    let synthesis = session.result_for(session.task_ids[0]).unwrap();
    assert!(synthesis.success);

    // The template team was ephemeral.
    assert!(troupe.list_teams().await.is_empty());
}
