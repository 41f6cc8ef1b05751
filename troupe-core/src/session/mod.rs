//! Collaboration sessions: request/result types and the driving engine.

pub mod engine;
pub mod types;

pub use engine::{CollaborationEngine, DebateCandidate, DebateComparator, longest_output};
pub use types::{
    CollaborateOptions, CollaborateRequest, CollaborationProgress, CollaborationResult,
    CollaborationSession, ProgressCallback, SessionPhase, SessionStatus,
};

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::events::EventBus;
    use crate::executor::MockAgentExecutor;
    use crate::team::{MemberRole, MemberSpec, TaskSpec, TeamManager, TeamSpec};

    use super::*;

    /// Progress snapshots arrive in completion order with growing counts.
    #[tokio::test]
    async fn test_progress_callbacks_track_completion_order() {
        let manager = TeamManager::new(EventBus::disabled());
        let engine = CollaborationEngine::new(
            manager.clone(),
            Arc::new(MockAgentExecutor::new()),
            EventBus::disabled(),
        );
        let team = manager
            .create_team(
                TeamSpec::new("tracked").with_member(MemberSpec::new("solo", MemberRole::Worker)),
            )
            .await
            .unwrap();

        let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let session = engine
            .collaborate(
                CollaborateRequest::for_team(team.id)
                    .with_task(TaskSpec::new("one"))
                    .with_task(TaskSpec::new("two"))
                    .on_progress(Arc::new(move |progress: CollaborationProgress| {
                        sink.lock()
                            .unwrap()
                            .push((progress.completed_tasks, progress.total_tasks));
                    })),
            )
            .await
            .unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![(1, 2), (2, 2)]);
    }
}
