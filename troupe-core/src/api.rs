//! High-level control surface wiring config, manager, engine, and events.
//!
//! [`Troupe`] is the embeddable entry point: construct it with a
//! [`TroupeConfig`] and an executor, keep the returned [`EventStream`] if you
//! want to observe lifecycle events, and drive everything else through its
//! methods. Hosts that need the full manager or engine API can reach them
//! through the accessors.

use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::{load_config, TroupeConfig};
use crate::error::{ConfigError, Result};
use crate::events::{EventBus, EventStream};
use crate::executor::AgentExecutor;
use crate::session::{CollaborateRequest, CollaborationEngine, CollaborationSession};
use crate::team::{
    resolve_template, MemberSpec, TaskSpec, Team, TeamManager, TeamMember, TeamMessage, TeamSpec,
    TeamStatus, TeamTask,
};

/// Facade over the orchestration core.
///
/// Cheap to clone; clones share the same teams, sessions, and event bus.
#[derive(Clone)]
pub struct Troupe {
    config: TroupeConfig,
    manager: TeamManager,
    engine: CollaborationEngine,
}

impl Troupe {
    /// Build from an explicit config. Returns the facade and the consumer
    /// side of its event channel.
    pub fn new(config: TroupeConfig, executor: Arc<dyn AgentExecutor>) -> (Self, EventStream) {
        let (events, stream) = EventBus::bounded(config.engine.event_buffer);
        let manager = TeamManager::with_defaults(config.teams.clone(), events.clone());
        let engine = CollaborationEngine::new(manager.clone(), executor, events)
            .with_cancel_grace(config.engine.cancel_grace());
        (
            Self {
                config,
                manager,
                engine,
            },
            stream,
        )
    }

    /// Load layered configuration for the given workspace and build.
    pub fn from_workspace(
        workspace: Option<&Path>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Result<(Self, EventStream)> {
        let config = load_config(workspace, None).map_err(ConfigError::from)?;
        Ok(Self::new(config, executor))
    }

    pub fn config(&self) -> &TroupeConfig {
        &self.config
    }

    pub fn manager(&self) -> &TeamManager {
        &self.manager
    }

    pub fn engine(&self) -> &CollaborationEngine {
        &self.engine
    }

    // Team lifecycle.

    /// Create a team, either empty or from a named template.
    ///
    /// With a template the caller's name replaces the template's; the
    /// composition comes from the template table.
    pub async fn create_team(&self, name: &str, template: Option<&str>) -> Result<Team> {
        let spec = match template {
            Some(template) => {
                let mut spec = resolve_template(template)?;
                spec.name = name.to_string();
                spec
            }
            None => TeamSpec::new(name),
        };
        self.manager.create_team(spec).await
    }

    pub async fn dissolve(&self, team_id: Uuid) -> Result<Team> {
        self.manager.dissolve_team(team_id).await
    }

    pub async fn team(&self, team_id: Uuid) -> Result<Team> {
        self.manager.team(team_id).await
    }

    pub async fn list_teams(&self) -> Vec<Team> {
        self.manager.list_teams().await
    }

    pub async fn status(&self, team_id: Uuid) -> Result<TeamStatus> {
        self.manager.team_status(team_id).await
    }

    // Membership.

    pub async fn add_member(&self, team_id: Uuid, spec: MemberSpec) -> Result<TeamMember> {
        self.manager.add_member(team_id, spec).await
    }

    pub async fn remove_member(
        &self,
        team_id: Uuid,
        member_id: Uuid,
        force: bool,
    ) -> Result<TeamMember> {
        self.manager.remove_member(team_id, member_id, force).await
    }

    // Tasks.

    pub async fn create_task(&self, team_id: Uuid, spec: TaskSpec) -> Result<TeamTask> {
        self.manager.create_task(team_id, spec).await
    }

    /// Manually assign a pending task, overriding capability matching but
    /// not the concurrency bound or member availability.
    pub async fn assign(
        &self,
        team_id: Uuid,
        task_id: Uuid,
        member_id: Uuid,
    ) -> Result<(TeamTask, TeamMember)> {
        self.manager.assign_task_to(team_id, task_id, member_id).await
    }

    // Messages.

    pub async fn post_message(&self, team_id: Uuid, message: TeamMessage) -> Result<TeamMessage> {
        self.manager.post_message(team_id, message).await
    }

    pub async fn messages(
        &self,
        team_id: Uuid,
        recipient: Option<Uuid>,
    ) -> Result<Vec<TeamMessage>> {
        self.manager.messages(team_id, recipient).await
    }

    // Sessions.

    /// Run a collaboration request, applying the configured default session
    /// timeout when the request does not set one.
    pub async fn collaborate(&self, mut request: CollaborateRequest) -> Result<CollaborationSession> {
        if request.options.timeout.is_none() {
            request.options.timeout = self.config.engine.default_session_timeout();
        }
        self.engine.collaborate(request).await
    }

    pub async fn session(&self, session_id: Uuid) -> Result<CollaborationSession> {
        self.engine.session(session_id).await
    }

    pub async fn cancel_session(&self, session_id: Uuid) -> Result<CollaborationSession> {
        self.engine.cancel_session(session_id).await
    }

    pub async fn list_sessions(&self) -> Vec<CollaborationSession> {
        self.engine.list_sessions().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockAgentExecutor;
    use crate::session::SessionStatus;
    use crate::team::{MemberRole, TaskStatus};

    fn troupe() -> (Troupe, EventStream) {
        Troupe::new(TroupeConfig::default(), Arc::new(MockAgentExecutor::new()))
    }

    #[tokio::test]
    async fn test_create_team_from_template_keeps_caller_name() {
        let (troupe, _stream) = troupe();
        let team = troupe
            .create_team("research-alpha", Some("research"))
            .await
            .unwrap();
        assert_eq!(team.name, "research-alpha");
        assert_eq!(team.members.len(), 3);
        assert!(team.member_with_role(MemberRole::Leader).is_some());
    }

    #[tokio::test]
    async fn test_manual_flow_create_assign_status() {
        let (troupe, _stream) = troupe();
        let team = troupe.create_team("ops", None).await.unwrap();
        let member = troupe
            .add_member(team.id, MemberSpec::new("worker", MemberRole::Worker))
            .await
            .unwrap();
        let task = troupe
            .create_task(team.id, TaskSpec::new("rotate logs"))
            .await
            .unwrap();

        let (assigned, _) = troupe.assign(team.id, task.id, member.id).await.unwrap();
        assert_eq!(assigned.status, TaskStatus::Assigned);

        let status = troupe.status(team.id).await.unwrap();
        assert_eq!(status.assigned, 1);
        assert_eq!(status.member_loads[0].load, 1);
    }

    #[tokio::test]
    async fn test_collaborate_and_events_through_facade() {
        let (troupe, mut stream) = troupe();
        let team = troupe.create_team("crew", None).await.unwrap();
        troupe
            .add_member(team.id, MemberSpec::new("solo", MemberRole::Worker))
            .await
            .unwrap();

        let session = troupe
            .collaborate(CollaborateRequest::for_team(team.id).with_task(TaskSpec::new("ping")))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.results.len(), 1);

        let kinds: Vec<&'static str> = stream.drain().iter().map(|e| e.kind()).collect();
        assert!(kinds.contains(&"team_created"));
        assert!(kinds.contains(&"session_started"));
        assert!(kinds.contains(&"task_completed"));
        assert!(kinds.contains(&"session_ended"));
    }

    #[tokio::test]
    async fn test_from_workspace_uses_layered_config() {
        let dir = tempfile::tempdir().unwrap();
        let troupe_dir = dir.path().join(".troupe");
        std::fs::create_dir_all(&troupe_dir).unwrap();
        std::fs::write(
            troupe_dir.join("config.toml"),
            "[teams]\nmax_concurrency = 2\ntask_timeout_secs = 30\n\n[teams.retry]\nmax_retries = 0\nbackoff_ms = 500\njitter = false\n",
        )
        .unwrap();

        let (troupe, _stream) = Troupe::from_workspace(
            Some(dir.path()),
            Arc::new(MockAgentExecutor::new()),
        )
        .unwrap();
        assert_eq!(troupe.config().teams.max_concurrency, 2);

        let team = troupe.create_team("configured", None).await.unwrap();
        assert_eq!(team.config.max_concurrency, 2);
    }
}
