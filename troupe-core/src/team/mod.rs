//! Team management — data model, registry, scheduling, and templates.
//!
//! Provides the building blocks for orchestrating teams of agent members:
//! the registry arena, the manager with its capability-based scheduler and
//! task state machine, and the fixed template table.

pub mod manager;
pub mod registry;
pub mod templates;
pub mod types;

pub use manager::TeamManager;
pub use registry::{TeamRecord, TeamRegistry};
pub use templates::{resolve_template, TEMPLATE_NAMES};
pub use types::{
    CollaborationMode, MemberLoad, MemberRole, MemberSpec, MemberStatus, RetryPolicy,
    SharedContext, TaskPriority, TaskResult, TaskSpec, TaskStatus, Team, TeamConfig, TeamMember,
    TeamMessage, TeamSpec, TeamStatus, TeamTask,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    #[tokio::test]
    async fn test_template_to_running_task_flow() {
        // resolve_template → TeamManager → scheduler → state machine
        let manager = TeamManager::new(EventBus::disabled());
        let spec = resolve_template("qa").unwrap();
        let team = manager.create_team(spec).await.unwrap();
        assert_eq!(team.mode, CollaborationMode::Sequential);

        manager
            .create_task(team.id, TaskSpec::new("Verify release").requires("testing"))
            .await
            .unwrap();

        let (task, member) = manager.assign_task(team.id).await.unwrap().unwrap();
        assert_eq!(member.name, "tester");
        manager
            .update_task_status(team.id, task.id, TaskStatus::Running, None)
            .await
            .unwrap();
        manager
            .update_task_status(
                team.id,
                task.id,
                TaskStatus::Completed,
                Some(TaskResult::success("verified", 5)),
            )
            .await
            .unwrap();

        let status = manager.team_status(team.id).await.unwrap();
        assert_eq!(status.completed, 1);
        assert_eq!(status.member_loads.iter().map(|m| m.load).sum::<usize>(), 0);
    }
}
