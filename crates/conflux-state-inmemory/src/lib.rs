//! In-memory entity store for the Conflux process engine
//!
//! This crate provides an implementation of the `EntityStore` port defined
//! in conflux-core. Every table lives behind one `tokio::sync::RwLock`, so a
//! flush batch and a job acquisition are each applied under a single write
//! guard. It is primarily useful for development, testing and single-process
//! deployments where persistence is not required.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use conflux_core::domain::entity::{Entity, EntityKind};
use conflux_core::domain::job::{JobEntity, JobLock, JobState};
use conflux_core::store::{AcquireJobsRequest, DbOperation, EntityStore, Query};
use conflux_core::{CoreError, ExecutionId, ProcessDefinitionId};


struct Row {
    entity: Entity,
    seq: u64,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<EntityKind, HashMap<String, Row>>,
    next_seq: u64,
}

type RowKey = (EntityKind, String);

impl Tables {
    fn table(&self, kind: EntityKind) -> Option<&HashMap<String, Row>> {
        self.rows.get(&kind.family())
    }

    fn revision(&self, key: &RowKey) -> Option<u32> {
        self.table(key.0)
            .and_then(|table| table.get(&key.1))
            .map(|row| row.entity.revision())
    }

    /// Check a batch against the current rows without touching them
    fn validate(&self, operations: &[DbOperation]) -> Result<(), CoreError> {
        let mut staged: HashMap<RowKey, Option<u32>> = HashMap::new();
        for operation in operations {
            let (key, expected) = match operation {
                DbOperation::Insert(entity) => {
                    ((entity.kind().family(), entity.id().to_string()), None)
                }
                DbOperation::Update {
                    entity,
                    expected_revision,
                } => (
                    (entity.kind().family(), entity.id().to_string()),
                    Some(*expected_revision),
                ),
                DbOperation::Delete {
                    kind,
                    id,
                    expected_revision,
                } => ((kind.family(), id.clone()), Some(*expected_revision)),
            };
            let current = match staged.get(&key) {
                Some(revision) => *revision,
                None => self.revision(&key),
            };
            let next = match operation {
                DbOperation::Insert(entity) => {
                    if current.is_some() {
                        return Err(CoreError::StateStoreError(format!(
                            "{} {} already exists",
                            key.0, key.1
                        )));
                    }
                    Some(entity.revision())
                }
                DbOperation::Update { entity, .. } => {
                    if current != expected {
                        return Err(conflict(&key));
                    }
                    Some(entity.revision())
                }
                DbOperation::Delete { .. } => {
                    if current != expected {
                        return Err(conflict(&key));
                    }
                    None
                }
            };
            staged.insert(key, next);
        }
        Ok(())
    }

    fn apply(&mut self, operation: DbOperation) {
        match operation {
            DbOperation::Insert(entity) => {
                self.next_seq += 1;
                let seq = self.next_seq;
                self.rows
                    .entry(entity.kind().family())
                    .or_default()
                    .insert(entity.id().to_string(), Row { entity, seq });
            }
            DbOperation::Update { entity, .. } => {
                let table = self.rows.entry(entity.kind().family()).or_default();
                if let Some(row) = table.get_mut(entity.id()) {
                    row.entity = entity;
                }
            }
            DbOperation::Delete { kind, id, .. } => {
                if let Some(table) = self.rows.get_mut(&kind.family()) {
                    table.remove(&id);
                }
            }
        }
    }

    fn jobs_mut(&mut self) -> impl Iterator<Item = (&mut JobEntity, u64)> {
        self.rows
            .get_mut(&EntityKind::Job)
            .into_iter()
            .flat_map(|table| table.values_mut())
            .filter_map(|row| {
                let seq = row.seq;
                match &mut row.entity {
                    Entity::Job(job) => Some((job, seq)),
                    _ => None,
                }
            })
    }
}

fn conflict(key: &RowKey) -> CoreError {
    CoreError::OptimisticLockingFailure {
        entity: key.0.to_string(),
        id: key.1.clone(),
    }
}

/// `EntityStore` keeping every table in memory
#[derive(Clone, Default)]
pub struct InMemoryEntityStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryEntityStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in a partition; [`EntityKind::Job`] counts only executable jobs
    pub async fn count(&self, kind: EntityKind) -> usize {
        let tables = self.tables.read().await;
        tables
            .table(kind)
            .map(|table| {
                table
                    .values()
                    .filter(|row| row.entity.kind() == kind)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop every row
    pub async fn clear(&self) {
        let mut tables = self.tables.write().await;
        tables.rows.clear();
    }
}

impl std::fmt::Debug for InMemoryEntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEntityStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn flush(&self, operations: Vec<DbOperation>) -> Result<(), CoreError> {
        let mut tables = self.tables.write().await;
        if let Err(e) = tables.validate(&operations) {
            warn!(error = %e, operations = operations.len(), "Rejected flush batch");
            return Err(e);
        }
        debug!(operations = operations.len(), "Applying flush batch");
        for operation in operations {
            tables.apply(operation);
        }
        Ok(())
    }

    async fn find_by_id(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>, CoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .table(kind)
            .and_then(|table| table.get(id))
            .filter(|row| kind == kind.family() || row.entity.kind() == kind)
            .map(|row| row.entity.clone()))
    }

    async fn select_list(&self, query: Query) -> Result<Vec<Entity>, CoreError> {
        let tables = self.tables.read().await;
        let Some(table) = tables.table(query.kind()) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<&Row> = table
            .values()
            .filter(|row| query.matches(&row.entity))
            .collect();
        rows.sort_by_key(|row| row.seq);
        Ok(rows.into_iter().map(|row| row.entity.clone()).collect())
    }

    async fn acquire_jobs(&self, request: AcquireJobsRequest) -> Result<Vec<JobEntity>, CoreError> {
        let now = request.now;
        let mut tables = self.tables.write().await;

        let mut busy: HashSet<ExecutionId> = tables
            .jobs_mut()
            .filter(|(job, _)| job.exclusive && job.is_locked(now))
            .filter_map(|(job, _)| job.process_instance_id.clone())
            .collect();

        let mut candidates: Vec<(&mut JobEntity, u64)> = tables
            .jobs_mut()
            .filter(|(job, _)| job.is_acquirable(now))
            .filter(|(job, _)| match &request.tenant_id {
                Some(tenant) => job.tenant_id.as_ref() == Some(tenant),
                None => true,
            })
            .collect();
        candidates.sort_by_key(|(job, seq)| (job.due_date.unwrap_or(DateTime::<Utc>::MIN_UTC), *seq));

        let mut acquired = Vec::new();
        for (job, _) in candidates {
            if acquired.len() >= request.max_jobs {
                break;
            }
            if job.exclusive {
                if let Some(instance) = &job.process_instance_id {
                    if !busy.insert(instance.clone()) {
                        continue;
                    }
                }
            }
            // All jobs share one table here, so the timer-to-executable move is
            // an in-place update under the write guard rather than a delete and
            // insert through a command context.
            if job.state == JobState::Timer {
                job.state = JobState::Executable;
            }
            job.lock = Some(JobLock {
                owner: request.lock_owner.clone(),
                expiration_time: request.lock_expiration_time,
            });
            job.revision += 1;
            acquired.push(job.clone());
        }
        Ok(acquired)
    }

    async fn update_jobs_tenant(
        &self,
        process_definition_id: &ProcessDefinitionId,
        tenant_id: Option<String>,
    ) -> Result<usize, CoreError> {
        let mut tables = self.tables.write().await;
        let mut changed = 0;
        for (job, _) in tables.jobs_mut() {
            if job.process_definition_id.as_ref() == Some(process_definition_id) {
                job.tenant_id = tenant_id.clone();
                job.revision += 1;
                changed += 1;
            }
        }
        Ok(changed)
    }
}
