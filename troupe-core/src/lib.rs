//! # Troupe Core
//!
//! Core library for the Troupe multi-agent orchestration platform.
//! Provides the team manager, capability-based task scheduling,
//! collaboration sessions with pluggable dispatch strategies, layered
//! configuration, and the lifecycle event stream.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod session;
pub mod team;

// Re-export commonly used types at the crate root.
pub use api::Troupe;
pub use config::{config_exists, load_config, save_config, TroupeConfig};
pub use error::{Result, TroupeError};
pub use events::{EventBus, EventStream, TeamEvent};
pub use executor::{AgentExecutor, ExecutionRequest, MockAgentExecutor};
pub use session::{
    CollaborateOptions, CollaborateRequest, CollaborationEngine, CollaborationProgress,
    CollaborationResult, CollaborationSession, DebateCandidate, DebateComparator, ProgressCallback,
    SessionPhase, SessionStatus,
};
pub use team::{
    resolve_template, CollaborationMode, MemberRole, MemberSpec, MemberStatus, SharedContext,
    TaskPriority, TaskResult, TaskSpec, TaskStatus, Team, TeamConfig, TeamManager, TeamMember,
    TeamMessage, TeamSpec, TeamStatus, TeamTask, TEMPLATE_NAMES,
};
