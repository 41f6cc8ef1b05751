//! Collaboration engine — sessions, phases, and the dispatch strategies.
//!
//! `collaborate` drives one session from planning through aggregation:
//! assignment and state transitions go through the team manager, the actual
//! work goes through an injected [`AgentExecutor`], and every settled task
//! feeds the progress callback and the event bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{self, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{Future, StreamExt};
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CapabilityError, ExecutionError, Result, TroupeError, ValidationError};
use crate::events::{EventBus, TeamEvent};
use crate::executor::{AgentExecutor, ExecutionRequest};
use crate::session::types::{
    CollaborateOptions, CollaborateRequest, CollaborationProgress, CollaborationResult,
    CollaborationSession, SessionPhase, SessionStatus,
};
use crate::team::{
    resolve_template, CollaborationMode, MemberRole, MemberStatus, SharedContext, TaskResult,
    TaskSpec, TaskStatus, Team, TeamConfig, TeamManager, TeamMember, TeamMessage, TeamTask,
};

/// How long a cancelled session waits for outstanding invocations to settle.
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_millis(1_000);

/// Cap on sub-tasks accepted from a single decomposition.
const MAX_SUBTASKS: usize = 16;

/// How often an idle pool re-polls the board while every usable member is
/// held elsewhere (another session, a manual assignment, or the team's
/// concurrency bound).
const CONTENTION_POLL: Duration = Duration::from_millis(25);

/// One contestant's outcome in a debate round.
#[derive(Debug, Clone)]
pub struct DebateCandidate {
    pub member_id: Uuid,
    pub member_name: String,
    /// The candidate answer; `None` when the invocation failed.
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Picks the winning candidate index when no reviewer is available.
///
/// Returning `None` means no candidate is usable and the task fails; an
/// out-of-range index is treated the same way.
pub type DebateComparator = Arc<dyn Fn(&[DebateCandidate]) -> Option<usize> + Send + Sync>;

/// Default comparator: the longest successful output wins, first on ties.
pub fn longest_output(candidates: &[DebateCandidate]) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if let Some(output) = &candidate.output {
            let len = output.len();
            if best.is_none_or(|(_, best_len)| len > best_len) {
                best = Some((index, len));
            }
        }
    }
    best.map(|(index, _)| index)
}

/// Parse a decomposition answer as a JSON array of task specs.
///
/// Tolerates prose around the array by retrying on the outermost bracket
/// pair; anything else is `None` and the caller degrades to a single
/// sub-task.
fn parse_decomposition(output: &str) -> Option<Vec<TaskSpec>> {
    let trimmed = output.trim();
    if let Ok(specs) = serde_json::from_str::<Vec<TaskSpec>>(trimmed) {
        return Some(specs).filter(|s| !s.is_empty());
    }
    let start = trimmed.find('[')?;
    let end = trimmed.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Vec<TaskSpec>>(&trimmed[start..=end])
        .ok()
        .filter(|s| !s.is_empty())
}

/// Outcome of one executor invocation, ready for bookkeeping.
struct Settled {
    task_id: Uuid,
    member_id: Uuid,
    title: String,
    member_name: String,
    outcome: std::result::Result<String, ExecutionError>,
    duration_ms: u64,
}

/// How a dispatch pool ended.
enum PoolOutcome {
    /// Every pool task reached a terminal state.
    Completed,
    /// The session token fired or the deadline elapsed.
    Cancelled,
    /// `stop_on_first_failure` engaged.
    Halted(String),
    /// Pending tasks remain that no roster member can satisfy anymore.
    Stalled(usize),
}

/// Terminal disposition of a driven session.
enum Disposition {
    Completed,
    Cancelled,
    Failed(String),
}

/// Everything a running session carries between phases.
struct DriveCtx {
    session_id: Uuid,
    team_id: Uuid,
    mode: CollaborationMode,
    config: TeamConfig,
    options: CollaborateOptions,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    facts: HashMap<String, String>,
    /// Tasks from the request, in submission order.
    task_ids: Vec<Uuid>,
}

struct SessionEntry {
    snapshot: CollaborationSession,
    cancel: CancellationToken,
}

/// Drives collaboration sessions over teams held by a [`TeamManager`].
///
/// Cloning shares the session store, the manager, and the executor.
#[derive(Clone)]
pub struct CollaborationEngine {
    manager: TeamManager,
    executor: Arc<dyn AgentExecutor>,
    events: EventBus,
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
    cancel_grace: Duration,
    debate_fallback: DebateComparator,
}

impl CollaborationEngine {
    pub fn new(manager: TeamManager, executor: Arc<dyn AgentExecutor>, events: EventBus) -> Self {
        Self {
            manager,
            executor,
            events,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            cancel_grace: DEFAULT_CANCEL_GRACE,
            debate_fallback: Arc::new(longest_output),
        }
    }

    /// Override the grace period granted to outstanding invocations on
    /// cancellation.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Replace the comparator used when a debate has no reviewer.
    pub fn with_debate_fallback(mut self, comparator: DebateComparator) -> Self {
        self.debate_fallback = comparator;
        self
    }

    /// The manager this engine schedules through.
    pub fn manager(&self) -> &TeamManager {
        &self.manager
    }

    /// Run a collaboration request to a terminal state.
    ///
    /// Setup problems (bad request shape, unknown template, unsatisfiable
    /// capabilities, missing leader) return `Err` with the session snapshot
    /// left in `failed`. Once dispatch begins, the call always returns the
    /// final snapshot: timeouts and cancellations yield a `cancelled`
    /// session carrying whatever results had settled.
    pub async fn collaborate(&self, request: CollaborateRequest) -> Result<CollaborationSession> {
        request.validate()?;

        let (team, template) = if let Some(team_id) = request.team_id {
            (self.manager.team(team_id).await?, None)
        } else if let Some(name) = request.template.clone() {
            let spec = resolve_template(&name)?;
            (self.manager.create_team(spec).await?, Some(name))
        } else {
            return Err(ValidationError::MissingTeamSource.into());
        };
        let ephemeral = template.is_some();

        let mode = request.mode.unwrap_or(team.mode);
        let session_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let started_at = Utc::now();
        let snapshot = CollaborationSession {
            id: session_id,
            team_id: team.id,
            template,
            mode,
            status: SessionStatus::Initializing,
            phase: SessionPhase::Planning,
            task_ids: Vec::new(),
            results: Vec::new(),
            error: None,
            started_at,
            deadline: request
                .options
                .timeout
                .and_then(|t| chrono::Duration::from_std(t).ok())
                .map(|t| started_at + t),
            ended_at: None,
        };
        self.sessions.write().await.insert(
            session_id,
            SessionEntry {
                snapshot,
                cancel: cancel.clone(),
            },
        );
        info!(session_id = %session_id, team = %team.name, mode = ?mode, "session started");
        self.events.emit(TeamEvent::SessionStarted {
            session_id,
            team_id: team.id,
            mode,
        });

        let mut ctx = DriveCtx {
            session_id,
            team_id: team.id,
            mode,
            config: team.config.clone(),
            options: request.options.clone(),
            deadline: request.options.timeout.map(|t| Instant::now() + t),
            cancel,
            facts: HashMap::new(),
            task_ids: Vec::new(),
        };

        self.enter_phase(&ctx, SessionPhase::Planning).await;
        if let Err(err) = self.plan(&mut ctx, &team, &request.tasks).await {
            return Err(self.fail_setup(&ctx, ephemeral, err).await);
        }

        let disposition = match self.drive(&mut ctx, &team).await {
            Ok(disposition) => disposition,
            Err(err) => Disposition::Failed(err.to_string()),
        };
        self.finalize(&ctx, ephemeral, disposition).await
    }

    /// Request cooperative cancellation of a running session.
    ///
    /// Returns the current snapshot immediately; the driving `collaborate`
    /// call finalizes the cancelled state after the grace period. Cancelling
    /// a terminal session is a no-op.
    pub async fn cancel_session(&self, session_id: Uuid) -> Result<CollaborationSession> {
        let entry = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&session_id)
                .map(|e| (e.snapshot.clone(), e.cancel.clone()))
        };
        let Some((snapshot, cancel)) = entry else {
            return Err(ValidationError::SessionNotFound { id: session_id }.into());
        };
        if !snapshot.is_terminal() {
            info!(session_id = %session_id, "cancelling session");
            cancel.cancel();
        }
        Ok(snapshot)
    }

    /// Snapshot of a session.
    pub async fn session(&self, session_id: Uuid) -> Result<CollaborationSession> {
        self.snapshot(session_id)
            .await
            .ok_or_else(|| ValidationError::SessionNotFound { id: session_id }.into())
    }

    /// Snapshot of every session, running and terminal.
    pub async fn list_sessions(&self) -> Vec<CollaborationSession> {
        self.sessions
            .read()
            .await
            .values()
            .map(|e| e.snapshot.clone())
            .collect()
    }

    // Planning: register tasks and prove the session can make progress.

    async fn plan(&self, ctx: &mut DriveCtx, team: &Team, specs: &[TaskSpec]) -> Result<()> {
        let mut tasks = Vec::with_capacity(specs.len());
        for spec in specs {
            let task = self.manager.create_task(ctx.team_id, spec.clone()).await?;
            ctx.task_ids.push(task.id);
            tasks.push(task);
        }
        let task_ids = ctx.task_ids.clone();
        self.update_session(ctx.session_id, |s| {
            s.status = SessionStatus::Running;
            s.task_ids = task_ids;
        })
        .await;

        // Every task must be satisfiable by some non-offline member,
        // ignoring instantaneous busyness.
        for task in &tasks {
            if !team.can_satisfy(&task.required_capabilities) {
                return Err(CapabilityError::Unsatisfiable {
                    title: task.title.clone(),
                    required: task.required_capabilities.clone(),
                }
                .into());
            }
        }

        if ctx.mode == CollaborationMode::Hierarchical
            && team.member_with_role(MemberRole::Leader).is_none()
        {
            return Err(CapabilityError::MissingRole {
                role: "leader".into(),
            }
            .into());
        }
        Ok(())
    }

    async fn fail_setup(&self, ctx: &DriveCtx, ephemeral: bool, err: TroupeError) -> TroupeError {
        warn!(session_id = %ctx.session_id, error = %err, "session setup failed");
        self.cancel_remaining(ctx).await;
        let reason = err.to_string();
        self.update_session(ctx.session_id, |s| {
            s.status = SessionStatus::Failed;
            s.error = Some(reason);
            s.ended_at = Some(Utc::now());
        })
        .await;
        self.events.emit(TeamEvent::SessionEnded {
            session_id: ctx.session_id,
            status: SessionStatus::Failed,
        });
        if ephemeral {
            if let Err(dissolve_err) = self.manager.dissolve_team(ctx.team_id).await {
                warn!(
                    session_id = %ctx.session_id,
                    error = %dissolve_err,
                    "could not dissolve ephemeral team"
                );
            }
        }
        err
    }

    // Mode dispatch.

    async fn drive(&self, ctx: &mut DriveCtx, team: &Team) -> Result<Disposition> {
        match ctx.mode {
            CollaborationMode::Sequential => {
                self.enter_phase(ctx, SessionPhase::Executing).await;
                let pool = ctx.task_ids.clone();
                let outcome = self.run_pool(ctx, &pool, 1).await?;
                Ok(Self::disposition_of(outcome))
            }
            CollaborationMode::Parallel => {
                self.enter_phase(ctx, SessionPhase::Executing).await;
                let pool = ctx.task_ids.clone();
                let outcome = self.run_pool(ctx, &pool, usize::MAX).await?;
                Ok(Self::disposition_of(outcome))
            }
            CollaborationMode::Hierarchical => self.drive_hierarchical(ctx, team).await,
            CollaborationMode::Debate => self.drive_debate(ctx).await,
        }
    }

    fn disposition_of(outcome: PoolOutcome) -> Disposition {
        match outcome {
            PoolOutcome::Completed => Disposition::Completed,
            PoolOutcome::Cancelled => Disposition::Cancelled,
            PoolOutcome::Halted(reason) => Disposition::Failed(reason),
            PoolOutcome::Stalled(pending) => {
                Disposition::Failed(CapabilityError::Stalled { pending }.to_string())
            }
        }
    }

    /// Fan tasks out up to `cap` concurrent invocations, replenishing a slot
    /// whenever one settles. `cap` of 1 degenerates to strict sequential
    /// order; larger caps are still bounded by the team's `max_concurrency`
    /// through the scheduler. When nothing is assignable and nothing is in
    /// flight the pool waits for the roster to free up; it fails only once a
    /// pending task has no capable member left.
    async fn run_pool(&self, ctx: &DriveCtx, pool: &[Uuid], cap: usize) -> Result<PoolOutcome> {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, Settled>> = FuturesUnordered::new();
        let mut halt: Option<String> = None;

        loop {
            if ctx.cancel.is_cancelled() {
                self.drain_with_grace(ctx, &mut in_flight).await;
                return Ok(PoolOutcome::Cancelled);
            }

            if halt.is_none() {
                while in_flight.len() < cap {
                    match self
                        .manager
                        .assign_task_within(ctx.team_id, Some(pool))
                        .await?
                    {
                        Some((task, member)) => {
                            self.manager
                                .update_task_status(ctx.team_id, task.id, TaskStatus::Running, None)
                                .await?;
                            let shared = self.shared_context(ctx).await;
                            in_flight.push(self.invocation(ctx, task, member, shared));
                        }
                        None => break,
                    }
                }
            }

            if in_flight.is_empty() {
                if let Some(reason) = halt.take() {
                    self.cancel_tasks(ctx, pool).await;
                    return Ok(PoolOutcome::Halted(reason));
                }
                let unfinished = self.unfinished_in(ctx, pool).await?;
                if unfinished == 0 {
                    return Ok(PoolOutcome::Completed);
                }
                // Nothing assignable right now. Busy members and an
                // exhausted concurrency bound are contention; the board
                // will move again. Only a pending task no roster member
                // can satisfy is fatal.
                if self.unsatisfiable_pending(ctx, pool).await? {
                    return Ok(PoolOutcome::Stalled(unfinished));
                }
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {}
                    _ = deadline_wait(ctx.deadline) => ctx.cancel.cancel(),
                    _ = tokio::time::sleep(CONTENTION_POLL) => {}
                }
                continue;
            }

            let settled = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                _ = deadline_wait(ctx.deadline) => {
                    ctx.cancel.cancel();
                    None
                }
                settled = in_flight.next() => settled,
            };

            match settled {
                Some(settled) => {
                    let failed = matches!(
                        settled.outcome,
                        Err(ExecutionError::Failed { .. }) | Err(ExecutionError::Timeout { .. })
                    );
                    let title = settled.title.clone();
                    self.settle_board_task(ctx, settled).await;
                    if failed && ctx.options.stop_on_first_failure && halt.is_none() {
                        halt = Some(format!("task '{title}' failed and the request stops on first failure"));
                    }
                }
                None => {
                    self.drain_with_grace(ctx, &mut in_flight).await;
                    return Ok(PoolOutcome::Cancelled);
                }
            }
        }
    }

    /// Leader decomposes, workers execute, leader synthesizes.
    async fn drive_hierarchical(&self, ctx: &mut DriveCtx, team: &Team) -> Result<Disposition> {
        let Some(leader) = team.member_with_role(MemberRole::Leader).cloned() else {
            return Ok(Disposition::Failed(
                CapabilityError::MissingRole {
                    role: "leader".into(),
                }
                .to_string(),
            ));
        };

        // Still in the planning phase: decompose each requested task. The
        // original tasks stay `pending` on the board until synthesis so they
        // never occupy concurrency slots the sub-tasks need.
        let mut plans: Vec<(TeamTask, Vec<Uuid>)> = Vec::new();
        for task_id in ctx.task_ids.clone() {
            let task = self.manager.task(ctx.team_id, task_id).await?;
            let decompose = decompose_task(&task);
            let shared = self.shared_context(ctx).await;
            let settled = match until_cancelled(
                ctx.deadline,
                &ctx.cancel,
                self.cancel_grace,
                self.invocation(ctx, decompose, leader.clone(), shared),
            )
            .await
            {
                Some(settled) => settled,
                None => return Ok(Disposition::Cancelled),
            };

            match settled.outcome {
                Ok(plan) => {
                    let specs = parse_decomposition(&plan).unwrap_or_else(|| {
                        debug!(
                            session_id = %ctx.session_id,
                            task = %task.title,
                            "decomposition not parseable, degrading to one sub-task"
                        );
                        vec![TaskSpec::new(format!("{} (plan)", task.title))
                            .with_description(plan.clone())]
                    });

                    let mut sub_ids = Vec::new();
                    for spec in specs.into_iter().take(MAX_SUBTASKS) {
                        let sub = self.manager.create_task(ctx.team_id, spec).await?;
                        sub_ids.push(sub.id);
                    }
                    let appended = sub_ids.clone();
                    self.update_session(ctx.session_id, |s| s.task_ids.extend(appended))
                        .await;

                    ctx.facts.insert(format!("plan:{}", task.id), plan.clone());
                    let message = TeamMessage::new(leader.id, "decomposition", plan);
                    if let Err(err) = self.manager.post_message(ctx.team_id, message).await {
                        debug!(session_id = %ctx.session_id, error = %err, "could not post plan");
                    }
                    plans.push((task, sub_ids));
                }
                Err(ExecutionError::Cancelled { .. }) => return Ok(Disposition::Cancelled),
                Err(err) => {
                    // A failed decomposition settles only this task.
                    self.settle_out_of_band(
                        ctx,
                        task.id,
                        leader.id,
                        Err(err.to_string()),
                        settled.duration_ms,
                    )
                    .await;
                    if ctx.options.stop_on_first_failure {
                        return Ok(Disposition::Failed(format!(
                            "task '{}' failed and the request stops on first failure",
                            task.title
                        )));
                    }
                }
            }
        }

        self.enter_phase(ctx, SessionPhase::Executing).await;
        let sub_pool: Vec<Uuid> = plans.iter().flat_map(|(_, subs)| subs.clone()).collect();
        let outcome = self.run_pool(ctx, &sub_pool, usize::MAX).await?;
        match outcome {
            PoolOutcome::Completed => {}
            other => return Ok(Self::disposition_of(other)),
        }

        self.enter_phase(ctx, SessionPhase::Reviewing).await;
        for (task, sub_ids) in plans {
            if ctx.cancel.is_cancelled() {
                return Ok(Disposition::Cancelled);
            }
            let collected = self
                .snapshot(ctx.session_id)
                .await
                .map(|s| {
                    s.results
                        .iter()
                        .filter(|r| sub_ids.contains(&r.task_id))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            let synthesize = synthesize_task(&task, &collected);
            let shared = self.shared_context(ctx).await;
            let settled = match until_cancelled(
                ctx.deadline,
                &ctx.cancel,
                self.cancel_grace,
                self.invocation(ctx, synthesize, leader.clone(), shared),
            )
            .await
            {
                Some(settled) => settled,
                None => return Ok(Disposition::Cancelled),
            };

            match settled.outcome {
                Ok(output) => {
                    self.settle_out_of_band(
                        ctx,
                        task.id,
                        leader.id,
                        Ok(output),
                        settled.duration_ms,
                    )
                    .await;
                }
                Err(ExecutionError::Cancelled { .. }) => return Ok(Disposition::Cancelled),
                Err(err) => {
                    self.settle_out_of_band(
                        ctx,
                        task.id,
                        leader.id,
                        Err(err.to_string()),
                        settled.duration_ms,
                    )
                    .await;
                }
            }
        }
        Ok(Disposition::Completed)
    }

    /// Independent candidates per task, then a judge or the fallback
    /// comparator.
    async fn drive_debate(&self, ctx: &mut DriveCtx) -> Result<Disposition> {
        self.enter_phase(ctx, SessionPhase::Executing).await;

        let mut contests: Vec<(TeamTask, Vec<DebateCandidate>)> = Vec::new();
        for task_id in ctx.task_ids.clone() {
            if ctx.cancel.is_cancelled() {
                return Ok(Disposition::Cancelled);
            }
            let task = self.manager.task(ctx.team_id, task_id).await?;

            // Fresh snapshot: availability may have changed since planning.
            let team = self.manager.team(ctx.team_id).await?;
            let mut pool: Vec<TeamMember> = team
                .members
                .iter()
                .filter(|m| {
                    m.status != MemberStatus::Offline
                        && m.role != MemberRole::Leader
                        && m.can_handle(&task.required_capabilities)
                })
                .cloned()
                .collect();
            if pool.is_empty() {
                pool = team
                    .members
                    .iter()
                    .filter(|m| {
                        m.status != MemberStatus::Offline
                            && m.can_handle(&task.required_capabilities)
                    })
                    .cloned()
                    .collect();
            }
            if pool.is_empty() {
                return Ok(Disposition::Failed(
                    CapabilityError::Unsatisfiable {
                        title: task.title.clone(),
                        required: task.required_capabilities.clone(),
                    }
                    .to_string(),
                ));
            }
            let wanted = ctx.options.debate_candidates.unwrap_or(pool.len());
            let candidates_n = wanted.clamp(1, pool.len());

            let shared = self.shared_context(ctx).await;
            let mut invocations = Vec::with_capacity(candidates_n);
            for member in pool.into_iter().take(candidates_n) {
                invocations.push(self.invocation(ctx, task.clone(), member, shared.clone()));
            }
            let settled = match until_cancelled(
                ctx.deadline,
                &ctx.cancel,
                self.cancel_grace,
                future::join_all(invocations),
            )
            .await
            {
                Some(settled) => settled,
                None => return Ok(Disposition::Cancelled),
            };

            let mut candidates = Vec::with_capacity(settled.len());
            for s in settled {
                match s.outcome {
                    Ok(output) => {
                        let message = TeamMessage::new(s.member_id, "candidate", output.clone());
                        if let Err(err) = self.manager.post_message(ctx.team_id, message).await {
                            debug!(session_id = %ctx.session_id, error = %err, "could not post candidate");
                        }
                        candidates.push(DebateCandidate {
                            member_id: s.member_id,
                            member_name: s.member_name,
                            output: Some(output),
                            error: None,
                            duration_ms: s.duration_ms,
                        });
                    }
                    Err(ExecutionError::Cancelled { .. }) => return Ok(Disposition::Cancelled),
                    Err(err) => candidates.push(DebateCandidate {
                        member_id: s.member_id,
                        member_name: s.member_name,
                        output: None,
                        error: Some(err.to_string()),
                        duration_ms: s.duration_ms,
                    }),
                }
            }
            contests.push((task, candidates));
        }

        self.enter_phase(ctx, SessionPhase::Reviewing).await;
        for (task, candidates) in contests {
            if ctx.cancel.is_cancelled() {
                return Ok(Disposition::Cancelled);
            }
            let team = self.manager.team(ctx.team_id).await?;
            let reviewer = team
                .members
                .iter()
                .find(|m| m.role == MemberRole::Reviewer && m.status != MemberStatus::Offline)
                .cloned();

            let (member_id, verdict, duration_ms) = match reviewer {
                Some(reviewer) => {
                    let settled = match until_cancelled(
                        ctx.deadline,
                        &ctx.cancel,
                        self.cancel_grace,
                        self.invocation(
                            ctx,
                            judge_task(&task, &candidates),
                            reviewer.clone(),
                            self.shared_context(ctx).await,
                        ),
                    )
                    .await
                    {
                        Some(settled) => settled,
                        None => return Ok(Disposition::Cancelled),
                    };
                    match settled.outcome {
                        Ok(output) => (reviewer.id, Some(output), settled.duration_ms),
                        Err(ExecutionError::Cancelled { .. }) => {
                            return Ok(Disposition::Cancelled)
                        }
                        Err(err) => {
                            debug!(
                                session_id = %ctx.session_id,
                                error = %err,
                                "judge failed, falling back to comparator"
                            );
                            Self::pick_fallback(&self.debate_fallback, &candidates)
                        }
                    }
                }
                None => Self::pick_fallback(&self.debate_fallback, &candidates),
            };

            let outcome = match verdict {
                Some(output) => Ok(output),
                None => Err("all debate candidates failed".to_string()),
            };
            let failed = outcome.is_err();
            self.settle_out_of_band(ctx, task.id, member_id, outcome, duration_ms)
                .await;
            if failed && ctx.options.stop_on_first_failure {
                return Ok(Disposition::Failed(format!(
                    "task '{}' failed and the request stops on first failure",
                    task.title
                )));
            }
        }
        Ok(Disposition::Completed)
    }

    fn pick_fallback(
        comparator: &DebateComparator,
        candidates: &[DebateCandidate],
    ) -> (Uuid, Option<String>, u64) {
        let winner = comparator(candidates).and_then(|index| {
            let picked = candidates.get(index);
            if picked.is_none() {
                warn!(index, "comparator returned an out-of-range index");
            }
            picked
        });
        match winner {
            Some(winner) => (winner.member_id, winner.output.clone(), winner.duration_ms),
            // No usable winner; attribute the failure to the first contestant.
            None => (
                candidates.first().map(|c| c.member_id).unwrap_or_default(),
                None,
                candidates.iter().map(|c| c.duration_ms).max().unwrap_or(0),
            ),
        }
    }

    // Aggregation and teardown.

    async fn finalize(
        &self,
        ctx: &DriveCtx,
        ephemeral: bool,
        disposition: Disposition,
    ) -> Result<CollaborationSession> {
        let (status, error) = match disposition {
            Disposition::Completed => {
                self.enter_phase(ctx, SessionPhase::Aggregating).await;
                if let Ok(team_status) = self.manager.team_status(ctx.team_id).await {
                    let residual: usize = team_status.member_loads.iter().map(|m| m.load).sum();
                    if residual > 0 {
                        debug!(
                            session_id = %ctx.session_id,
                            residual,
                            "members still loaded after session"
                        );
                    }
                }
                (SessionStatus::Completed, None)
            }
            Disposition::Cancelled => {
                self.cancel_remaining(ctx).await;
                (SessionStatus::Cancelled, None)
            }
            Disposition::Failed(reason) => {
                self.cancel_remaining(ctx).await;
                (SessionStatus::Failed, Some(reason))
            }
        };

        let error_for_update = error.clone();
        self.update_session(ctx.session_id, |s| {
            s.status = status;
            s.error = error_for_update;
            s.ended_at = Some(Utc::now());
        })
        .await;
        info!(session_id = %ctx.session_id, status = status.as_str(), "session ended");
        self.events.emit(TeamEvent::SessionEnded {
            session_id: ctx.session_id,
            status,
        });

        if ephemeral {
            if let Err(err) = self.manager.dissolve_team(ctx.team_id).await {
                warn!(
                    session_id = %ctx.session_id,
                    error = %err,
                    "could not dissolve ephemeral team"
                );
            }
        }

        self.session(ctx.session_id).await
    }

    // Invocation plumbing.

    /// One executor invocation with per-call timeout and in-place retries.
    ///
    /// Retries only apply to board tasks (the retry counter lives there);
    /// cancellation is never retried.
    fn invocation(
        &self,
        ctx: &DriveCtx,
        task: TeamTask,
        member: TeamMember,
        shared: SharedContext,
    ) -> BoxFuture<'static, Settled> {
        let executor = Arc::clone(&self.executor);
        let manager = self.manager.clone();
        let team_id = ctx.team_id;
        let session = ctx.cancel.clone();
        let task_timeout = ctx.config.task_timeout();
        let retry = ctx.config.retry.clone();

        Box::pin(async move {
            let started = std::time::Instant::now();
            let mut attempt: u32 = 0;
            let outcome = loop {
                let child = session.child_token();
                let request = ExecutionRequest::new(
                    task.clone(),
                    member.clone(),
                    shared.clone(),
                    child,
                );
                let result = match timeout(task_timeout, executor.execute(request)).await {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(ExecutionError::Timeout {
                        task: task.title.clone(),
                        timeout_secs: task_timeout.as_secs(),
                    }),
                };

                match result {
                    Ok(output) => break Ok(output),
                    Err(err @ ExecutionError::Cancelled { .. }) => break Err(err),
                    Err(err) => {
                        if attempt >= retry.max_retries || session.is_cancelled() {
                            break Err(err);
                        }
                        attempt += 1;
                        if manager.note_retry(team_id, task.id).await.is_err() {
                            break Err(err);
                        }
                        warn!(task = %task.title, attempt, "invocation failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(retry.delay(attempt)) => {}
                            _ = session.cancelled() => {
                                break Err(ExecutionError::Cancelled {
                                    task: task.title.clone(),
                                });
                            }
                        }
                    }
                }
            };

            Settled {
                task_id: task.id,
                member_id: member.id,
                title: task.title.clone(),
                member_name: member.name.clone(),
                outcome,
                duration_ms: started.elapsed().as_millis() as u64,
            }
        })
    }

    /// Book a settled pool invocation: board transition, result, callback.
    ///
    /// Cancelled invocations update the board but record no result; a
    /// cancelled session reports only the work that actually finished.
    async fn settle_board_task(&self, ctx: &DriveCtx, settled: Settled) {
        let (status, result) = match &settled.outcome {
            Ok(output) => (
                TaskStatus::Completed,
                Some(TaskResult::success(output.clone(), settled.duration_ms)),
            ),
            Err(ExecutionError::Cancelled { .. }) => (TaskStatus::Cancelled, None),
            Err(err) => (
                TaskStatus::Failed,
                Some(TaskResult::failure(err.to_string(), settled.duration_ms)),
            ),
        };
        if let Err(err) = self
            .manager
            .update_task_status(ctx.team_id, settled.task_id, status, result)
            .await
        {
            warn!(
                session_id = %ctx.session_id,
                task = %settled.title,
                error = %err,
                "could not record task outcome"
            );
        }

        match settled.outcome {
            Ok(output) => {
                self.record_result(
                    ctx,
                    CollaborationResult::success(
                        settled.task_id,
                        settled.member_id,
                        output,
                        settled.duration_ms,
                    ),
                )
                .await;
            }
            Err(ExecutionError::Cancelled { .. }) => {}
            Err(err) => {
                self.record_result(
                    ctx,
                    CollaborationResult::failure(
                        settled.task_id,
                        settled.member_id,
                        err.to_string(),
                        settled.duration_ms,
                    ),
                )
                .await;
            }
        }
    }

    /// Settle a task that is already `running` on the board.
    async fn settle_running(
        &self,
        ctx: &DriveCtx,
        task_id: Uuid,
        member_id: Uuid,
        output: std::result::Result<String, String>,
        duration_ms: u64,
    ) {
        let update = match &output {
            Ok(text) => {
                self.manager
                    .update_task_status(
                        ctx.team_id,
                        task_id,
                        TaskStatus::Completed,
                        Some(TaskResult::success(text.clone(), duration_ms)),
                    )
                    .await
            }
            Err(message) => {
                self.manager
                    .update_task_status(
                        ctx.team_id,
                        task_id,
                        TaskStatus::Failed,
                        Some(TaskResult::failure(message.clone(), duration_ms)),
                    )
                    .await
            }
        };
        if let Err(err) = update {
            warn!(
                session_id = %ctx.session_id,
                task_id = %task_id,
                error = %err,
                "could not record task outcome"
            );
        }
        let result = match output {
            Ok(text) => CollaborationResult::success(task_id, member_id, text, duration_ms),
            Err(message) => CollaborationResult::failure(task_id, member_id, message, duration_ms),
        };
        self.record_result(ctx, result).await;
    }

    /// Drive a still-`pending` board task through assignment to its terminal
    /// state on behalf of work that happened out of band.
    async fn settle_out_of_band(
        &self,
        ctx: &DriveCtx,
        task_id: Uuid,
        member_id: Uuid,
        output: std::result::Result<String, String>,
        duration_ms: u64,
    ) {
        if let Err(err) = self
            .manager
            .assign_task_to(ctx.team_id, task_id, member_id)
            .await
        {
            warn!(
                session_id = %ctx.session_id,
                task_id = %task_id,
                error = %err,
                "could not stage task for its recorded outcome"
            );
        } else if let Err(err) = self
            .manager
            .update_task_status(ctx.team_id, task_id, TaskStatus::Running, None)
            .await
        {
            warn!(
                session_id = %ctx.session_id,
                task_id = %task_id,
                error = %err,
                "could not stage task for its recorded outcome"
            );
        }
        self.settle_running(ctx, task_id, member_id, output, duration_ms)
            .await;
    }

    /// Append a result to the session and fire the progress callback.
    async fn record_result(&self, ctx: &DriveCtx, result: CollaborationResult) {
        let progress = {
            let mut sessions = self.sessions.write().await;
            sessions.get_mut(&ctx.session_id).map(|entry| {
                entry.snapshot.results.push(result.clone());
                CollaborationProgress {
                    session_id: ctx.session_id,
                    phase: entry.snapshot.phase,
                    completed_tasks: entry.snapshot.results.len(),
                    total_tasks: entry.snapshot.task_ids.len(),
                    current_task: Some(result.task_id),
                    results: entry.snapshot.results.clone(),
                }
            })
        };
        // Callback runs synchronously, outside the session lock.
        if let (Some(progress), Some(callback)) = (progress, ctx.options.progress.as_ref()) {
            callback(progress);
        }
    }

    async fn drain_with_grace(
        &self,
        ctx: &DriveCtx,
        in_flight: &mut FuturesUnordered<BoxFuture<'static, Settled>>,
    ) {
        if in_flight.is_empty() {
            return;
        }
        let drain = async {
            while let Some(settled) = in_flight.next().await {
                self.settle_board_task(ctx, settled).await;
            }
        };
        if timeout(self.cancel_grace, drain).await.is_err() {
            warn!(
                session_id = %ctx.session_id,
                "cancellation grace elapsed with invocations outstanding"
            );
        }
    }

    /// Cancel whatever the session registered that has not finished.
    async fn cancel_remaining(&self, ctx: &DriveCtx) {
        let task_ids = self
            .snapshot(ctx.session_id)
            .await
            .map(|s| s.task_ids)
            .unwrap_or_default();
        self.cancel_tasks(ctx, &task_ids).await;
    }

    async fn cancel_tasks(&self, ctx: &DriveCtx, task_ids: &[Uuid]) {
        for task_id in task_ids {
            match self.manager.task(ctx.team_id, *task_id).await {
                Ok(task) if !task.is_terminal() => {
                    if let Err(err) = self
                        .manager
                        .update_task_status(ctx.team_id, *task_id, TaskStatus::Cancelled, None)
                        .await
                    {
                        debug!(
                            session_id = %ctx.session_id,
                            task_id = %task_id,
                            error = %err,
                            "could not cancel task"
                        );
                    }
                }
                _ => {}
            }
        }
    }

    async fn unfinished_in(&self, ctx: &DriveCtx, pool: &[Uuid]) -> Result<usize> {
        let tasks = self.manager.tasks(ctx.team_id).await?;
        Ok(tasks
            .iter()
            .filter(|t| pool.contains(&t.id) && !t.is_terminal())
            .count())
    }

    /// True when a pending pool task can no longer be satisfied by any
    /// non-offline member. Busy members still count as satisfiable.
    async fn unsatisfiable_pending(&self, ctx: &DriveCtx, pool: &[Uuid]) -> Result<bool> {
        let team = self.manager.team(ctx.team_id).await?;
        let tasks = self.manager.tasks(ctx.team_id).await?;
        Ok(tasks.iter().any(|t| {
            pool.contains(&t.id)
                && t.status == TaskStatus::Pending
                && !team.can_satisfy(&t.required_capabilities)
        }))
    }

    async fn shared_context(&self, ctx: &DriveCtx) -> SharedContext {
        let messages = self
            .manager
            .messages(ctx.team_id, None)
            .await
            .unwrap_or_default();
        SharedContext {
            facts: ctx.facts.clone(),
            messages,
        }
    }

    async fn enter_phase(&self, ctx: &DriveCtx, phase: SessionPhase) {
        debug!(session_id = %ctx.session_id, phase = phase.as_str(), "phase change");
        self.update_session(ctx.session_id, |s| {
            s.phase = phase;
            if !s.status.is_terminal() {
                s.status = SessionStatus::Running;
            }
        })
        .await;
        self.events.emit(TeamEvent::SessionPhaseChanged {
            session_id: ctx.session_id,
            phase,
        });
    }

    async fn update_session(&self, session_id: Uuid, f: impl FnOnce(&mut CollaborationSession)) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(&session_id) {
            f(&mut entry.snapshot);
        }
    }

    async fn snapshot(&self, session_id: Uuid) -> Option<CollaborationSession> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .map(|e| e.snapshot.clone())
    }
}

/// Sleep until the deadline, or forever without one.
async fn deadline_wait(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Await a future against the session token and deadline.
///
/// On either signal the future is granted the grace period to settle;
/// `None` means it did not.
async fn until_cancelled<F, T>(
    deadline: Option<Instant>,
    cancel: &CancellationToken,
    grace: Duration,
    fut: F,
) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::pin!(fut);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => timeout(grace, fut).await.ok(),
        _ = deadline_wait(deadline) => {
            cancel.cancel();
            timeout(grace, fut).await.ok()
        }
        value = &mut fut => Some(value),
    }
}

fn decompose_task(task: &TeamTask) -> TeamTask {
    let mut description = format!(
        "Break '{}' into independent sub-tasks. Reply with a JSON array of \
         objects, each carrying \"title\" and optionally \"description\" and \
         \"required_capabilities\".",
        task.title
    );
    if !task.description.is_empty() {
        description.push_str("\n\n");
        description.push_str(&task.description);
    }
    TeamTask::from_spec(
        TaskSpec::new(format!("Decompose: {}", task.title)).with_description(description),
    )
}

fn synthesize_task(task: &TeamTask, sub_results: &[CollaborationResult]) -> TeamTask {
    let mut description = format!(
        "Combine the sub-task results below into one answer for '{}'.\n",
        task.title
    );
    for result in sub_results {
        match &result.error {
            None => {
                description.push_str(&format!("- {}\n", result.output));
            }
            Some(error) => {
                description.push_str(&format!("- (failed: {error})\n"));
            }
        }
    }
    TeamTask::from_spec(
        TaskSpec::new(format!("Synthesize: {}", task.title)).with_description(description),
    )
}

fn judge_task(task: &TeamTask, candidates: &[DebateCandidate]) -> TeamTask {
    let mut description = format!(
        "Pick the best candidate answer for '{}' and reply with it.\n",
        task.title
    );
    for (index, candidate) in candidates.iter().enumerate() {
        match &candidate.output {
            Some(output) => {
                description.push_str(&format!(
                    "{}. [{}] {}\n",
                    index + 1,
                    candidate.member_name,
                    output
                ));
            }
            None => {
                description.push_str(&format!(
                    "{}. [{}] (failed)\n",
                    index + 1,
                    candidate.member_name
                ));
            }
        }
    }
    TeamTask::from_spec(
        TaskSpec::new(format!("Judge: {}", task.title)).with_description(description),
    )
}
