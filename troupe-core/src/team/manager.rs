//! Team manager — lifecycle, capability-based scheduling, and task state.
//!
//! All business rules over the registry arena live here: member lifecycle,
//! the priority-then-FIFO scheduler, the per-task state machine with
//! exactly-once load accounting, and team dissolution.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::events::{EventBus, TeamEvent};
use crate::team::registry::{TeamRecord, TeamRegistry};
use crate::team::types::{
    MemberLoad, MemberSpec, MemberStatus, TaskPriority, TaskResult, TaskSpec, TaskStatus, Team,
    TeamConfig, TeamMember, TeamMessage, TeamSpec, TeamStatus, TeamTask,
};

/// Owns the registry and enforces every team-level rule.
///
/// Explicitly constructed and injected wherever it is needed; cloning shares
/// the same underlying registry.
#[derive(Clone)]
pub struct TeamManager {
    registry: Arc<TeamRegistry>,
    defaults: TeamConfig,
    events: EventBus,
}

impl TeamManager {
    pub fn new(events: EventBus) -> Self {
        Self::with_defaults(TeamConfig::default(), events)
    }

    /// Use the given config for teams that do not specify their own.
    pub fn with_defaults(defaults: TeamConfig, events: EventBus) -> Self {
        Self {
            registry: Arc::new(TeamRegistry::new()),
            defaults,
            events,
        }
    }

    /// Create a team with fresh ids for the team and every member.
    ///
    /// Member names must be unique within the team; members start idle with
    /// zero load.
    pub async fn create_team(&self, spec: TeamSpec) -> Result<Team> {
        let mut seen = HashSet::new();
        for member in &spec.members {
            if !seen.insert(member.name.as_str()) {
                return Err(ValidationError::DuplicateMemberName {
                    name: member.name.clone(),
                }
                .into());
            }
        }

        let team = Team {
            id: Uuid::new_v4(),
            name: spec.name,
            description: spec.description,
            members: spec.members.into_iter().map(TeamMember::from_spec).collect(),
            mode: spec.mode,
            config: spec.config.unwrap_or_else(|| self.defaults.clone()),
            created_at: chrono::Utc::now(),
        };

        self.registry.insert(TeamRecord::new(team.clone())).await;
        info!(team = %team.name, members = team.members.len(), "created team");
        self.events.emit(TeamEvent::TeamCreated { team: team.clone() });
        Ok(team)
    }

    /// Add a member to an existing team.
    pub async fn add_member(&self, team_id: Uuid, spec: MemberSpec) -> Result<TeamMember> {
        let member = self
            .registry
            .update(team_id, |rec| {
                if rec.dissolved {
                    return Err(ValidationError::TeamNotFound { id: team_id });
                }
                if rec.team.members.iter().any(|m| m.name == spec.name) {
                    return Err(ValidationError::DuplicateMemberName {
                        name: spec.name.clone(),
                    });
                }
                let member = TeamMember::from_spec(spec);
                rec.team.members.push(member.clone());
                Ok(member)
            })
            .await??;

        debug!(team_id = %team_id, member = %member.name, "added member");
        self.events.emit(TeamEvent::MemberAdded {
            team_id,
            member: member.clone(),
        });
        Ok(member)
    }

    /// Remove a member.
    ///
    /// A member with tasks in flight is rejected unless `force` is set, in
    /// which case its in-flight tasks are unassigned back to `pending` and
    /// re-enter the scheduler.
    pub async fn remove_member(
        &self,
        team_id: Uuid,
        member_id: Uuid,
        force: bool,
    ) -> Result<TeamMember> {
        let (member, unassigned) = self
            .registry
            .update(team_id, |rec| {
                let index = rec
                    .team
                    .members
                    .iter()
                    .position(|m| m.id == member_id)
                    .ok_or(ValidationError::MemberNotFound { id: member_id })?;

                let load = rec.team.members[index].load;
                if load > 0 && !force {
                    return Err(ValidationError::MemberLoaded {
                        name: rec.team.members[index].name.clone(),
                        load,
                    });
                }

                let mut unassigned = 0usize;
                if load > 0 {
                    for task in rec.tasks.values_mut() {
                        if task.assigned_to == Some(member_id) && !task.is_terminal() {
                            task.status = TaskStatus::Pending;
                            task.assigned_to = None;
                            task.touch();
                            unassigned += 1;
                        }
                    }
                }
                Ok((rec.team.members.remove(index), unassigned))
            })
            .await??;

        if unassigned > 0 {
            warn!(
                team_id = %team_id,
                member = %member.name,
                unassigned,
                "force-removed member, tasks returned to pending"
            );
        }
        self.events.emit(TeamEvent::MemberRemoved {
            team_id,
            member_id: member.id,
            name: member.name.clone(),
        });
        Ok(member)
    }

    /// Take a member offline or bring it back.
    ///
    /// Offline members are invisible to the scheduler; a returning member is
    /// busy if it still carries load, idle otherwise.
    pub async fn set_member_availability(
        &self,
        team_id: Uuid,
        member_id: Uuid,
        available: bool,
    ) -> Result<TeamMember> {
        let member = self
            .registry
            .update(team_id, |rec| {
                let member = rec
                    .team
                    .members
                    .iter_mut()
                    .find(|m| m.id == member_id)
                    .ok_or(ValidationError::MemberNotFound { id: member_id })?;
                member.status = if !available {
                    MemberStatus::Offline
                } else if member.load > 0 {
                    MemberStatus::Busy
                } else {
                    MemberStatus::Idle
                };
                Ok::<_, ValidationError>(member.clone())
            })
            .await??;

        debug!(team_id = %team_id, member = %member.name, status = ?member.status, "availability changed");
        Ok(member)
    }

    /// Register a task in `pending` state.
    pub async fn create_task(&self, team_id: Uuid, spec: TaskSpec) -> Result<TeamTask> {
        let task = self
            .registry
            .update(team_id, |rec| {
                if rec.dissolved {
                    return Err(ValidationError::TeamNotFound { id: team_id });
                }
                let task = TeamTask::from_spec(spec);
                rec.push_task(task.clone());
                Ok(task)
            })
            .await??;

        debug!(team_id = %team_id, task = %task.title, priority = ?task.priority, "created task");
        self.events.emit(TeamEvent::TaskCreated {
            team_id,
            task: task.clone(),
        });
        Ok(task)
    }

    /// The scheduling step: pair the best pending task with an idle member.
    ///
    /// Pending tasks are walked by priority (critical first) and FIFO within
    /// a tier; the first task whose required capabilities are a subset of an
    /// idle member's capabilities wins. Returns `None` when nothing can be
    /// paired or the team is at its concurrency bound; both are normal.
    pub async fn assign_task(&self, team_id: Uuid) -> Result<Option<(TeamTask, TeamMember)>> {
        self.assign_task_within(team_id, None).await
    }

    /// Same scheduling step, restricted to a pool of task ids.
    ///
    /// Sessions use this so two sessions over one team never steal each
    /// other's pending tasks; they still contend for members and the
    /// concurrency bound.
    pub async fn assign_task_within(
        &self,
        team_id: Uuid,
        pool: Option<&[Uuid]>,
    ) -> Result<Option<(TeamTask, TeamMember)>> {
        let assigned = self
            .registry
            .update(team_id, |rec| {
                if rec.dissolved {
                    return None;
                }
                if rec.in_flight() >= rec.team.config.max_concurrency {
                    return None;
                }

                let mut candidates: Vec<(Uuid, TaskPriority)> = rec
                    .task_order
                    .iter()
                    .filter_map(|id| rec.tasks.get(id))
                    .filter(|t| t.status == TaskStatus::Pending)
                    .filter(|t| pool.is_none_or(|pool| pool.contains(&t.id)))
                    .map(|t| (t.id, t.priority))
                    .collect();
                // Stable sort keeps FIFO order within a priority tier.
                candidates.sort_by_key(|(_, priority)| Reverse(*priority));

                for (task_id, _) in candidates {
                    let Some(task) = rec.tasks.get(&task_id) else {
                        continue;
                    };
                    let required = task.required_capabilities.clone();
                    let member_id = rec
                        .team
                        .members
                        .iter()
                        .find(|m| m.is_assignable() && m.can_handle(&required))
                        .map(|m| m.id);
                    if let Some(member_id) = member_id {
                        return Self::apply_assignment(rec, task_id, member_id);
                    }
                }
                None
            })
            .await?;

        if let Some((task, member)) = &assigned {
            debug!(
                team_id = %team_id,
                task = %task.title,
                member = %member.name,
                "assigned task"
            );
            self.events.emit(TeamEvent::TaskAssigned {
                team_id,
                task_id: task.id,
                member_id: member.id,
            });
        }
        Ok(assigned)
    }

    /// Manual override of the scheduler.
    ///
    /// The concurrency bound and offline status are still enforced; a
    /// capability mismatch is allowed but logged.
    pub async fn assign_task_to(
        &self,
        team_id: Uuid,
        task_id: Uuid,
        member_id: Uuid,
    ) -> Result<(TeamTask, TeamMember)> {
        let (task, member) = self
            .registry
            .update(team_id, |rec| {
                if rec.dissolved {
                    return Err(ValidationError::TeamNotFound { id: team_id });
                }
                let task = rec
                    .tasks
                    .get(&task_id)
                    .ok_or(ValidationError::TaskNotFound { id: task_id })?;
                if task.status != TaskStatus::Pending {
                    return Err(ValidationError::InvalidTransition {
                        from: task.status.as_str().into(),
                        to: TaskStatus::Assigned.as_str().into(),
                    });
                }
                let required = task.required_capabilities.clone();
                let member = rec
                    .team
                    .members
                    .iter()
                    .find(|m| m.id == member_id)
                    .ok_or(ValidationError::MemberNotFound { id: member_id })?;
                if member.status == MemberStatus::Offline {
                    return Err(ValidationError::MemberOffline {
                        name: member.name.clone(),
                    });
                }
                let limit = rec.team.config.max_concurrency;
                if rec.in_flight() >= limit {
                    return Err(ValidationError::ConcurrencyLimit { limit });
                }
                if !member.can_handle(&required) {
                    warn!(
                        team_id = %team_id,
                        task_id = %task_id,
                        member = %member.name,
                        "manual assignment overrides capability mismatch"
                    );
                }
                Self::apply_assignment(rec, task_id, member_id)
                    .ok_or(ValidationError::TaskNotFound { id: task_id })
            })
            .await??;

        debug!(team_id = %team_id, task = %task.title, member = %member.name, "manually assigned task");
        self.events.emit(TeamEvent::TaskAssigned {
            team_id,
            task_id: task.id,
            member_id: member.id,
        });
        Ok((task, member))
    }

    /// Record a pairing both callers have already validated.
    fn apply_assignment(
        rec: &mut TeamRecord,
        task_id: Uuid,
        member_id: Uuid,
    ) -> Option<(TeamTask, TeamMember)> {
        let task = rec.tasks.get_mut(&task_id)?;
        task.status = TaskStatus::Assigned;
        task.assigned_to = Some(member_id);
        task.touch();
        let task = task.clone();

        let member = rec.team.members.iter_mut().find(|m| m.id == member_id)?;
        member.load += 1;
        member.status = MemberStatus::Busy;
        Some((task, member.clone()))
    }

    /// Drive the task state machine.
    ///
    /// Legal targets are `running` and the terminal states; assignment and
    /// unassignment go through their own operations. A terminal transition
    /// releases the owning member's load exactly once. Calling this on an
    /// already-terminal task is an idempotent no-op returning the stored
    /// record, which is what makes a cancel racing a late completion safe.
    pub async fn update_task_status(
        &self,
        team_id: Uuid,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<TaskResult>,
    ) -> Result<TeamTask> {
        let (task, event) = self
            .registry
            .update(team_id, |rec| {
                let task = rec
                    .tasks
                    .get_mut(&task_id)
                    .ok_or(ValidationError::TaskNotFound { id: task_id })?;

                if task.is_terminal() {
                    return Ok((task.clone(), None));
                }
                if !matches!(
                    status,
                    TaskStatus::Running
                        | TaskStatus::Completed
                        | TaskStatus::Failed
                        | TaskStatus::Cancelled
                ) || !task.status.can_transition_to(status)
                {
                    return Err(ValidationError::InvalidTransition {
                        from: task.status.as_str().into(),
                        to: status.as_str().into(),
                    });
                }

                task.status = status;
                if let Some(result) = result {
                    task.result = Some(result);
                }
                task.touch();
                let owner = task.assigned_to;
                let task = task.clone();

                if status.is_terminal() {
                    if let Some(member_id) = owner {
                        // Member may be gone after a forced removal.
                        if let Some(member) =
                            rec.team.members.iter_mut().find(|m| m.id == member_id)
                        {
                            member.load = member.load.saturating_sub(1);
                            if member.load == 0 && member.status != MemberStatus::Offline {
                                member.status = MemberStatus::Idle;
                            }
                        }
                    }
                }

                let event = match status {
                    TaskStatus::Running => Some(TeamEvent::TaskStarted { team_id, task_id }),
                    TaskStatus::Completed => Some(TeamEvent::TaskCompleted {
                        team_id,
                        task: task.clone(),
                    }),
                    TaskStatus::Failed => Some(TeamEvent::TaskFailed {
                        team_id,
                        task: task.clone(),
                    }),
                    TaskStatus::Cancelled => Some(TeamEvent::TaskCancelled { team_id, task_id }),
                    _ => None,
                };
                Ok((task, event))
            })
            .await??;

        if let Some(event) = event {
            debug!(team_id = %team_id, task = %task.title, status = task.status.as_str(), "task transition");
            self.events.emit(event);
        }
        Ok(task)
    }

    /// Count an executor retry against the task.
    pub async fn note_retry(&self, team_id: Uuid, task_id: Uuid) -> Result<u32> {
        self.registry
            .update(team_id, |rec| {
                let task = rec
                    .tasks
                    .get_mut(&task_id)
                    .ok_or(ValidationError::TaskNotFound { id: task_id })?;
                if !task.is_terminal() {
                    task.retry_count += 1;
                    task.touch();
                }
                Ok::<_, ValidationError>(task.retry_count)
            })
            .await?
            .map_err(Into::into)
    }

    /// Append a message to the team log.
    pub async fn post_message(&self, team_id: Uuid, message: TeamMessage) -> Result<TeamMessage> {
        let message = self
            .registry
            .update(team_id, |rec| {
                if !rec.team.members.iter().any(|m| m.id == message.sender) {
                    return Err(ValidationError::MemberNotFound { id: message.sender });
                }
                if let Some(recipient) = message.recipient {
                    if !rec.team.members.iter().any(|m| m.id == recipient) {
                        return Err(ValidationError::MemberNotFound { id: recipient });
                    }
                }
                rec.messages.push(message.clone());
                Ok(message)
            })
            .await??;

        self.events.emit(TeamEvent::MessagePosted {
            team_id,
            message: message.clone(),
        });
        Ok(message)
    }

    /// Messages visible to a member: broadcasts plus anything addressed to
    /// it. With no member given, the whole log.
    pub async fn messages(
        &self,
        team_id: Uuid,
        recipient: Option<Uuid>,
    ) -> Result<Vec<TeamMessage>> {
        self.registry
            .read(team_id, |rec| match recipient {
                None => rec.messages.clone(),
                Some(member_id) => rec
                    .messages
                    .iter()
                    .filter(|m| m.is_broadcast() || m.recipient == Some(member_id))
                    .cloned()
                    .collect(),
            })
            .await
    }

    /// Cancel every non-terminal task, emit one `team_dissolved` event, and
    /// remove the team.
    ///
    /// Safe against concurrent assignment: the dissolved flag is set under
    /// the record lock before any cancellation, so the scheduler can never
    /// produce a new pairing afterwards, and already-terminal tasks are left
    /// untouched.
    pub async fn dissolve_team(&self, team_id: Uuid) -> Result<Team> {
        let (team, cancelled) = self
            .registry
            .update(team_id, |rec| {
                if rec.dissolved {
                    return Err(ValidationError::TeamNotFound { id: team_id });
                }
                rec.dissolved = true;

                let mut cancelled = 0usize;
                for task in rec.tasks.values_mut() {
                    if !task.is_terminal() {
                        if let Some(member_id) = task.assigned_to {
                            if let Some(member) =
                                rec.team.members.iter_mut().find(|m| m.id == member_id)
                            {
                                member.load = member.load.saturating_sub(1);
                                if member.load == 0 && member.status != MemberStatus::Offline {
                                    member.status = MemberStatus::Idle;
                                }
                            }
                        }
                        task.status = TaskStatus::Cancelled;
                        task.touch();
                        cancelled += 1;
                    }
                }
                Ok((rec.team.clone(), cancelled))
            })
            .await??;

        self.registry.remove(team_id).await;
        info!(team = %team.name, cancelled, "dissolved team");
        self.events.emit(TeamEvent::TeamDissolved { team: team.clone() });
        Ok(team)
    }

    /// Aggregate task counts and member loads. Read-only.
    pub async fn team_status(&self, team_id: Uuid) -> Result<TeamStatus> {
        self.registry
            .read(team_id, |rec| {
                let mut status = TeamStatus {
                    team_id,
                    name: rec.team.name.clone(),
                    total_tasks: rec.tasks.len(),
                    pending: 0,
                    assigned: 0,
                    running: 0,
                    completed: 0,
                    failed: 0,
                    cancelled: 0,
                    member_loads: rec
                        .team
                        .members
                        .iter()
                        .map(|m| MemberLoad {
                            member_id: m.id,
                            name: m.name.clone(),
                            status: m.status,
                            load: m.load,
                        })
                        .collect(),
                };
                for task in rec.tasks.values() {
                    match task.status {
                        TaskStatus::Pending => status.pending += 1,
                        TaskStatus::Assigned => status.assigned += 1,
                        TaskStatus::Running => status.running += 1,
                        TaskStatus::Completed => status.completed += 1,
                        TaskStatus::Failed => status.failed += 1,
                        TaskStatus::Cancelled => status.cancelled += 1,
                    }
                }
                status
            })
            .await
    }

    /// Snapshot of a team.
    pub async fn team(&self, team_id: Uuid) -> Result<Team> {
        self.registry.read(team_id, |rec| rec.team.clone()).await
    }

    /// Snapshot of every team.
    pub async fn list_teams(&self) -> Vec<Team> {
        self.registry.teams().await
    }

    /// Snapshot of the team's tasks, in registration order.
    pub async fn tasks(&self, team_id: Uuid) -> Result<Vec<TeamTask>> {
        self.registry
            .read(team_id, |rec| {
                rec.tasks_in_order().into_iter().cloned().collect()
            })
            .await
    }

    /// Snapshot of a task.
    pub async fn task(&self, team_id: Uuid, task_id: Uuid) -> Result<TeamTask> {
        self.registry
            .read(team_id, |rec| {
                rec.tasks
                    .get(&task_id)
                    .cloned()
                    .ok_or(ValidationError::TaskNotFound { id: task_id })
            })
            .await?
            .map_err(Into::into)
    }
}
