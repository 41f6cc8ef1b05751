//! Team events — typed notifications and the bounded event bus.
//!
//! The manager and the engine emit `TeamEvent`s over a bounded channel so a
//! slow consumer (an SSE broadcaster, a log tailer) can never block
//! scheduling. Emission is fire-and-forget: a full buffer drops the event.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use crate::session::{SessionPhase, SessionStatus};
use crate::team::{CollaborationMode, Team, TeamMember, TeamMessage, TeamTask};

/// A typed notification carrying a snapshot of the affected entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TeamEvent {
    /// A team was created.
    TeamCreated { team: Team },
    /// A member joined an existing team.
    MemberAdded { team_id: Uuid, member: TeamMember },
    /// A member left a team.
    MemberRemoved {
        team_id: Uuid,
        member_id: Uuid,
        name: String,
    },
    /// A task was registered on a team's board.
    TaskCreated { team_id: Uuid, task: TeamTask },
    /// The scheduler (or a manual override) paired a task with a member.
    TaskAssigned {
        team_id: Uuid,
        task_id: Uuid,
        member_id: Uuid,
    },
    /// A task moved to `running`.
    TaskStarted { team_id: Uuid, task_id: Uuid },
    /// A task ended in `completed`.
    TaskCompleted { team_id: Uuid, task: TeamTask },
    /// A task ended in `failed`.
    TaskFailed { team_id: Uuid, task: TeamTask },
    /// A task ended in `cancelled`.
    TaskCancelled { team_id: Uuid, task_id: Uuid },
    /// A message was appended to the team log.
    MessagePosted { team_id: Uuid, message: TeamMessage },
    /// A collaboration session started running.
    SessionStarted {
        session_id: Uuid,
        team_id: Uuid,
        mode: CollaborationMode,
    },
    /// A session advanced to a new phase.
    SessionPhaseChanged {
        session_id: Uuid,
        phase: SessionPhase,
    },
    /// A session reached a terminal status.
    SessionEnded {
        session_id: Uuid,
        status: SessionStatus,
    },
    /// A team was dissolved and removed.
    TeamDissolved { team: Team },
}

impl TeamEvent {
    /// Stable tag, matching the serialized `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            TeamEvent::TeamCreated { .. } => "team_created",
            TeamEvent::MemberAdded { .. } => "member_added",
            TeamEvent::MemberRemoved { .. } => "member_removed",
            TeamEvent::TaskCreated { .. } => "task_created",
            TeamEvent::TaskAssigned { .. } => "task_assigned",
            TeamEvent::TaskStarted { .. } => "task_started",
            TeamEvent::TaskCompleted { .. } => "task_completed",
            TeamEvent::TaskFailed { .. } => "task_failed",
            TeamEvent::TaskCancelled { .. } => "task_cancelled",
            TeamEvent::MessagePosted { .. } => "message_posted",
            TeamEvent::SessionStarted { .. } => "session_started",
            TeamEvent::SessionPhaseChanged { .. } => "session_phase_changed",
            TeamEvent::SessionEnded { .. } => "session_ended",
            TeamEvent::TeamDissolved { .. } => "team_dissolved",
        }
    }
}

/// Producer side of the bounded event channel. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: Option<mpsc::Sender<TeamEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity and its consumer stream.
    pub fn bounded(capacity: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            EventStream { rx },
        )
    }

    /// A bus with no consumer; every emission is silently discarded.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event without waiting. A full buffer drops the event with a
    /// warning; a disconnected consumer is tolerated silently.
    pub fn emit(&self, event: TeamEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event = event.kind(), "event buffer full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Number of events dropped because the buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer side of the event channel.
pub struct EventStream {
    rx: mpsc::Receiver<TeamEvent>,
}

impl EventStream {
    /// Wait for the next event; `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<TeamEvent> {
        self.rx.recv().await
    }

    /// Pull an event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<TeamEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<TeamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    /// Adapt into a `Stream` for SSE-style consumers.
    pub fn into_stream(self) -> ReceiverStream<TeamEvent> {
        ReceiverStream::new(self.rx)
    }
}
