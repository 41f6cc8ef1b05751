//! Registry store — the canonical in-memory arena of team records.
//!
//! Pure storage, no business logic. Reads hand out cloned snapshots;
//! mutations run as closures under a per-record write lock, so every record
//! has a single writer at a time and a read-compute-replace sequence behaves
//! atomically for that record. Guards are never held across an await.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::team::types::{Team, TeamMessage, TeamTask};

/// One team's canonical state: the team plus its task board and message log.
#[derive(Debug, Clone)]
pub struct TeamRecord {
    /// The team and its members.
    pub team: Team,
    /// Tasks by id.
    pub tasks: HashMap<Uuid, TeamTask>,
    /// Task registration order, for FIFO walks within a priority tier.
    pub task_order: Vec<Uuid>,
    /// Append-only message log.
    pub messages: Vec<TeamMessage>,
    /// Set when dissolution begins; no assignment may happen after this.
    pub dissolved: bool,
}

impl TeamRecord {
    pub fn new(team: Team) -> Self {
        Self {
            team,
            tasks: HashMap::new(),
            task_order: Vec::new(),
            messages: Vec::new(),
            dissolved: false,
        }
    }

    /// Register a task, preserving arrival order.
    pub fn push_task(&mut self, task: TeamTask) {
        self.task_order.push(task.id);
        self.tasks.insert(task.id, task);
    }

    /// Tasks in registration order.
    pub fn tasks_in_order(&self) -> Vec<&TeamTask> {
        self.task_order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    /// Number of tasks currently holding a concurrency slot.
    pub fn in_flight(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| {
                matches!(
                    t.status,
                    crate::team::TaskStatus::Assigned | crate::team::TaskStatus::Running
                )
            })
            .count()
    }
}

/// Arena of team records addressed by id.
#[derive(Default)]
pub struct TeamRegistry {
    records: RwLock<HashMap<Uuid, Arc<RwLock<TeamRecord>>>>,
}

impl TeamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh record.
    pub async fn insert(&self, record: TeamRecord) {
        let id = record.team.id;
        self.records
            .write()
            .await
            .insert(id, Arc::new(RwLock::new(record)));
    }

    async fn record(&self, team_id: Uuid) -> Result<Arc<RwLock<TeamRecord>>> {
        self.records
            .read()
            .await
            .get(&team_id)
            .cloned()
            .ok_or_else(|| ValidationError::TeamNotFound { id: team_id }.into())
    }

    /// Run a read-only closure against a record.
    pub async fn read<R>(&self, team_id: Uuid, f: impl FnOnce(&TeamRecord) -> R) -> Result<R> {
        let record = self.record(team_id).await?;
        let guard = record.read().await;
        Ok(f(&guard))
    }

    /// Run a mutating closure against a record under its write lock.
    ///
    /// The closure is synchronous: nothing can interleave with it for this
    /// record, which is what makes load accounting exact.
    pub async fn update<R>(
        &self,
        team_id: Uuid,
        f: impl FnOnce(&mut TeamRecord) -> R,
    ) -> Result<R> {
        let record = self.record(team_id).await?;
        let mut guard = record.write().await;
        Ok(f(&mut guard))
    }

    /// Drop a record from the arena. Concurrent holders of the record finish
    /// their operation against the detached copy.
    pub async fn remove(&self, team_id: Uuid) -> bool {
        self.records.write().await.remove(&team_id).is_some()
    }

    pub async fn contains(&self, team_id: Uuid) -> bool {
        self.records.read().await.contains_key(&team_id)
    }

    /// Snapshot of every stored team.
    pub async fn teams(&self) -> Vec<Team> {
        let records: Vec<_> = self.records.read().await.values().cloned().collect();
        let mut teams = Vec::with_capacity(records.len());
        for record in records {
            teams.push(record.read().await.team.clone());
        }
        teams
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}
