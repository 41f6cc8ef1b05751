//! Executor module — the external agent capability boundary.
//!
//! Defines the `AgentExecutor` trait through which the engine hands work to
//! whatever actually runs an agent (model invocation, prompt construction),
//! and provides a scriptable mock implementation for tests and benches.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;
use crate::team::{SharedContext, TeamMember, TeamTask};

/// One unit of work handed to an executor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// The task to perform.
    pub task: TeamTask,
    /// The member performing it.
    pub member: TeamMember,
    /// Session-scoped shared context snapshot.
    pub shared_context: SharedContext,
    /// Cooperative cancellation signal; implementations must honor it.
    pub cancellation: CancellationToken,
}

impl ExecutionRequest {
    pub fn new(
        task: TeamTask,
        member: TeamMember,
        shared_context: SharedContext,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            task,
            member,
            shared_context,
            cancellation,
        }
    }
}

/// Trait for the external capability that performs tasks.
///
/// Implementations are free to fail; the engine converts every error into
/// that task's result and keeps the session alive. The only hard obligation
/// is honoring the cancellation token without corrupting shared state.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Execute the task and return its output.
    async fn execute(&self, request: ExecutionRequest) -> Result<String, ExecutionError>;

    /// Name of this executor, for logging.
    fn name(&self) -> &str;
}

/// A mock executor for testing and development.
///
/// Outcomes are scripted front-to-back; with an empty queue it echoes the
/// member and task so distinct assignments stay distinguishable.
pub struct MockAgentExecutor {
    name: String,
    outcomes: std::sync::Mutex<Vec<Result<String, String>>>,
    delay: Option<Duration>,
    invocations: std::sync::Mutex<Vec<(String, String)>>,
}

impl MockAgentExecutor {
    pub fn new() -> Self {
        Self {
            name: "mock-executor".to_string(),
            outcomes: std::sync::Mutex::new(Vec::new()),
            delay: None,
            invocations: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create a mock that always returns the given output.
    ///
    /// Queues multiple copies so it can serve several calls.
    pub fn with_output(text: &str) -> Self {
        let executor = Self::new();
        for _ in 0..20 {
            executor.queue_output(text);
        }
        executor
    }

    /// Sleep this long inside every call (cancellation-aware).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a successful outcome for the next call.
    pub fn queue_output(&self, text: &str) {
        self.outcomes.lock().unwrap().push(Ok(text.to_string()));
    }

    /// Queue a failed outcome for the next call.
    pub fn queue_failure(&self, message: &str) {
        self.outcomes.lock().unwrap().push(Err(message.to_string()));
    }

    /// `(member name, task title)` pairs in invocation order.
    pub fn invocations(&self) -> Vec<(String, String)> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

impl Default for MockAgentExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentExecutor for MockAgentExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<String, ExecutionError> {
        self.invocations
            .lock()
            .unwrap()
            .push((request.member.name.clone(), request.task.title.clone()));

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = request.cancellation.cancelled() => {
                    return Err(ExecutionError::Cancelled {
                        task: request.task.title,
                    });
                }
            }
        }

        let outcome = {
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                None
            } else {
                Some(outcomes.remove(0))
            }
        };

        match outcome {
            None => Ok(format!(
                "{} handled '{}'",
                request.member.name, request.task.title
            )),
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(ExecutionError::Failed {
                task: request.task.title,
                message,
            }),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
