//! Error types for the Troupe orchestration core.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering validation, capability matching, task execution, and configuration
//! domains.

use uuid::Uuid;

/// Top-level error type for the Troupe core library.
#[derive(Debug, thiserror::Error)]
pub enum TroupeError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from malformed requests and registry lookups.
///
/// Raised synchronously by the manager and at session-setup time by the
/// engine; never wrapped together with task execution failures.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Team not found: {id}")]
    TeamNotFound { id: Uuid },

    #[error("Task not found: {id}")]
    TaskNotFound { id: Uuid },

    #[error("Member not found: {id}")]
    MemberNotFound { id: Uuid },

    #[error("Session not found: {id}")]
    SessionNotFound { id: Uuid },

    #[error("Duplicate member name in team: {name}")]
    DuplicateMemberName { name: String },

    #[error("Member '{name}' has {load} task(s) in flight; use force to remove")]
    MemberLoaded { name: String, load: usize },

    #[error("Member '{name}' is offline")]
    MemberOffline { name: String },

    #[error("Invalid task transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Team is at its concurrency limit ({limit})")]
    ConcurrencyLimit { limit: usize },

    #[error("Unknown team template: {name}")]
    UnknownTemplate { name: String },

    #[error("Request must name a team or a template")]
    MissingTeamSource,

    #[error("Request names both a team and a template")]
    ConflictingTeamSource,
}

/// Errors from capability-based matching.
///
/// Raised when a session can never make progress: at setup time when no
/// member covers a task's required capabilities, or mid-session when every
/// capable member has gone away.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("No member can satisfy task '{title}' (requires {required:?})")]
    Unsatisfiable { title: String, required: Vec<String> },

    #[error("No member with role '{role}' available")]
    MissingRole { role: String },

    #[error("No assignable member for {pending} pending task(s)")]
    Stalled { pending: usize },
}

/// Errors from a single `AgentExecutor` invocation.
///
/// Always task-scoped: the engine converts these into the task's result and
/// never lets them end the session.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Task '{task}' execution failed: {message}")]
    Failed { task: String, message: String },

    #[error("Task '{task}' timed out after {timeout_secs}s")]
    Timeout { task: String, timeout_secs: u64 },

    #[error("Task '{task}' was cancelled")]
    Cancelled { task: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration extraction failed: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// A type alias for results using the top-level `TroupeError`.
pub type Result<T> = std::result::Result<T, TroupeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_validation() {
        let err = TroupeError::Validation(ValidationError::DuplicateMemberName {
            name: "scout".into(),
        });
        assert_eq!(
            err.to_string(),
            "Validation error: Duplicate member name in team: scout"
        );
    }

    #[test]
    fn test_error_display_capability() {
        let err = TroupeError::Capability(CapabilityError::Unsatisfiable {
            title: "Review PR#1".into(),
            required: vec!["code-review".into()],
        });
        assert_eq!(
            err.to_string(),
            "Capability error: No member can satisfy task 'Review PR#1' (requires [\"code-review\"])"
        );
    }

    #[test]
    fn test_error_display_execution() {
        let err = TroupeError::Execution(ExecutionError::Timeout {
            task: "Run tests".into(),
            timeout_secs: 30,
        });
        assert_eq!(
            err.to_string(),
            "Execution error: Task 'Run tests' timed out after 30s"
        );
    }

    #[test]
    fn test_error_display_transition() {
        let err = ValidationError::InvalidTransition {
            from: "completed".into(),
            to: "running".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid task transition: completed -> running"
        );
    }

    #[test]
    fn test_error_display_member_loaded() {
        let err = ValidationError::MemberLoaded {
            name: "builder".into(),
            load: 2,
        };
        assert_eq!(
            err.to_string(),
            "Member 'builder' has 2 task(s) in flight; use force to remove"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TroupeError = io_err.into();
        assert!(matches!(err, TroupeError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: TroupeError = serde_err.into();
        assert!(matches!(err, TroupeError::Serialization(_)));
    }

    #[test]
    fn test_capability_error_variants() {
        let err = CapabilityError::MissingRole {
            role: "leader".into(),
        };
        assert_eq!(err.to_string(), "No member with role 'leader' available");

        let err = CapabilityError::Stalled { pending: 3 };
        assert_eq!(
            err.to_string(),
            "No assignable member for 3 pending task(s)"
        );
    }

    #[test]
    fn test_validation_error_request_sources() {
        assert_eq!(
            ValidationError::MissingTeamSource.to_string(),
            "Request must name a team or a template"
        );
        assert_eq!(
            ValidationError::ConflictingTeamSource.to_string(),
            "Request names both a team and a template"
        );
    }
}
