//! Unit of work
//!
//! A [`CommandContext`] lives for exactly one API call or job execution. It
//! caches every entity it loads or writes, keeps the operation agenda and the
//! events to publish, and hands all writes to the store as one batch in
//! [`CommandContext::commit`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::entity::{Entity, EntityKind, PersistentEntity};
use crate::domain::events::EngineEvent;
use crate::engine::agenda::{Agenda, Operation};
use crate::store::{DbOperation, EntityStore, Query};
use crate::types::Clock;
use crate::CoreError;

type CacheKey = (EntityKind, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    /// Created in this unit of work
    Inserted,
    /// Created and removed again in this unit of work
    InsertedThenDeleted,
    /// Read from the store
    Loaded {
        kind: EntityKind,
        revision: u32,
        dirty: bool,
    },
    /// Read from the store and removed
    Deleted { kind: EntityKind, revision: u32 },
}

#[derive(Debug, Clone)]
struct CachedEntity {
    entity: Entity,
    state: CacheState,
}

impl CachedEntity {
    fn is_live(&self) -> bool {
        matches!(self.state, CacheState::Inserted | CacheState::Loaded { .. })
    }
}

/// One unit of work
pub struct CommandContext {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    cache: HashMap<CacheKey, CachedEntity>,
    order: Vec<CacheKey>,
    agenda: Agenda,
    events: Vec<EngineEvent>,
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("cached", &self.cache.len())
            .field("agenda", &self.agenda.len())
            .field("events", &self.events.len())
            .finish()
    }
}

fn key_of(entity: &Entity) -> CacheKey {
    (entity.kind().family(), entity.id().to_string())
}

impl CommandContext {
    /// Open a unit of work on `store`
    pub fn new(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            cache: HashMap::new(),
            order: Vec::new(),
            agenda: Agenda::default(),
            events: Vec::new(),
        }
    }

    /// Current time
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    fn remember(&mut self, key: CacheKey, cached: CachedEntity) {
        if self.cache.insert(key.clone(), cached).is_none() {
            self.order.push(key);
        }
    }

    /// Load an entity, from the cache first and then from the store
    pub async fn get<T: PersistentEntity>(&mut self, id: &str) -> Result<Option<T>, CoreError> {
        let key = (T::KIND, id.to_string());
        if let Some(cached) = self.cache.get(&key) {
            if !cached.is_live() {
                return Ok(None);
            }
            return Ok(T::from_entity_ref(&cached.entity).cloned());
        }

        let Some(entity) = self.store.find_by_id(T::KIND, id).await? else {
            return Ok(None);
        };
        let typed = T::from_entity_ref(&entity).cloned();
        let state = CacheState::Loaded {
            kind: entity.kind(),
            revision: entity.revision(),
            dirty: false,
        };
        self.remember(key, CachedEntity { entity, state });
        Ok(typed)
    }

    /// Load an entity or fail with the error built by `not_found`
    pub async fn get_required<T: PersistentEntity>(
        &mut self,
        id: &str,
        not_found: impl FnOnce(String) -> CoreError + Send,
    ) -> Result<T, CoreError> {
        match self.get::<T>(id).await? {
            Some(entity) => Ok(entity),
            None => Err(not_found(id.to_string())),
        }
    }

    /// Register a new entity
    pub fn insert<T: PersistentEntity>(&mut self, entity: T) {
        let entity = entity.into_entity();
        let key = key_of(&entity);
        let state = match self.cache.get(&key).map(|c| c.state) {
            Some(CacheState::Deleted { kind, revision })
            | Some(CacheState::Loaded { kind, revision, .. }) => CacheState::Loaded {
                kind,
                revision,
                dirty: true,
            },
            _ => CacheState::Inserted,
        };
        self.remember(key, CachedEntity { entity, state });
    }

    /// Replace a cached entity with a modified copy. A job whose state changed
    /// is written as a delete of the old partition plus an insert of the new one.
    pub fn update<T: PersistentEntity>(&mut self, entity: T) {
        let entity = entity.into_entity();
        let key = key_of(&entity);
        let state = match self.cache.get(&key).map(|c| c.state) {
            Some(CacheState::Inserted) | Some(CacheState::InsertedThenDeleted) => {
                CacheState::Inserted
            }
            Some(CacheState::Loaded { kind, revision, .. })
            | Some(CacheState::Deleted { kind, revision }) => CacheState::Loaded {
                kind,
                revision,
                dirty: true,
            },
            None => CacheState::Loaded {
                kind: entity.kind(),
                revision: entity.revision(),
                dirty: true,
            },
        };
        self.remember(key, CachedEntity { entity, state });
    }

    /// Remove an entity
    pub fn delete<T: PersistentEntity>(&mut self, entity: T) {
        let entity = entity.into_entity();
        let key = key_of(&entity);
        let state = match self.cache.get(&key).map(|c| c.state) {
            Some(CacheState::Inserted) | Some(CacheState::InsertedThenDeleted) => {
                CacheState::InsertedThenDeleted
            }
            Some(CacheState::Loaded { kind, revision, .. })
            | Some(CacheState::Deleted { kind, revision }) => {
                CacheState::Deleted { kind, revision }
            }
            None => CacheState::Deleted {
                kind: entity.kind(),
                revision: entity.revision(),
            },
        };
        self.remember(key, CachedEntity { entity, state });
    }

    /// Whether the entity was created in this unit of work
    pub fn is_inserted(&self, kind: EntityKind, id: &str) -> bool {
        matches!(
            self.cache.get(&(kind.family(), id.to_string())).map(|c| c.state),
            Some(CacheState::Inserted)
        )
    }

    /// First live cached entity of type `T` satisfying `predicate`
    pub fn find_in_cache<T: PersistentEntity>(
        &self,
        predicate: impl Fn(&T) -> bool,
    ) -> Option<T> {
        self.order
            .iter()
            .filter(|key| key.0 == T::KIND)
            .filter_map(|key| self.cache.get(key))
            .filter(|cached| cached.is_live())
            .filter_map(|cached| T::from_entity_ref(&cached.entity))
            .find(|entity| predicate(entity))
            .cloned()
    }

    /// Every live cached entity of type `T` satisfying `predicate`
    pub fn find_all_in_cache<T: PersistentEntity>(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.order
            .iter()
            .filter(|key| key.0 == T::KIND)
            .filter_map(|key| self.cache.get(key))
            .filter(|cached| cached.is_live())
            .filter_map(|cached| T::from_entity_ref(&cached.entity))
            .filter(|entity| predicate(entity))
            .cloned()
            .collect()
    }

    /// Run `query` against the store and merge the result with this unit of
    /// work's own writes: cached copies win, deleted rows disappear and new
    /// matching rows are appended.
    pub async fn query<T: PersistentEntity>(&mut self, query: Query) -> Result<Vec<T>, CoreError> {
        debug_assert_eq!(query.kind(), T::KIND);
        let rows = self.store.select_list(query.clone()).await?;

        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let key = key_of(&row);
            if !seen.insert(key.clone()) {
                continue;
            }
            match self.cache.get(&key) {
                Some(cached) => {
                    if cached.is_live() && query.matches(&cached.entity) {
                        if let Some(typed) = T::from_entity_ref(&cached.entity) {
                            result.push(typed.clone());
                        }
                    }
                }
                None => {
                    if let Some(typed) = T::from_entity_ref(&row) {
                        result.push(typed.clone());
                    }
                    let state = CacheState::Loaded {
                        kind: row.kind(),
                        revision: row.revision(),
                        dirty: false,
                    };
                    self.remember(key, CachedEntity { entity: row, state });
                }
            }
        }

        for key in &self.order {
            if key.0 != T::KIND || seen.contains(key) {
                continue;
            }
            if let Some(cached) = self.cache.get(key) {
                if cached.is_live() && query.matches(&cached.entity) {
                    if let Some(typed) = T::from_entity_ref(&cached.entity) {
                        result.push(typed.clone());
                    }
                }
            }
        }

        Ok(result)
    }

    /// First result of [`CommandContext::query`]
    pub async fn query_one<T: PersistentEntity>(
        &mut self,
        query: Query,
    ) -> Result<Option<T>, CoreError> {
        Ok(self.query::<T>(query).await?.into_iter().next())
    }

    /// Queue an engine operation
    pub fn push_operation(&mut self, operation: Operation) {
        self.agenda.push(operation);
    }

    /// Queue operations so that they run in the given order, before anything queued earlier
    pub fn push_operations_in_order(&mut self, operations: Vec<Operation>) {
        self.agenda.push_all_in_order(operations);
    }

    /// Take the next engine operation
    pub fn next_operation(&mut self) -> Option<Operation> {
        self.agenda.pop()
    }

    /// Record an event to publish after commit
    pub fn record_event(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    /// Events recorded so far
    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    /// The write batch this unit of work would flush, in first-touch order
    pub fn pending_operations(&self) -> Vec<DbOperation> {
        let mut operations = Vec::new();
        for key in &self.order {
            let Some(cached) = self.cache.get(key) else {
                continue;
            };
            match cached.state {
                CacheState::Inserted => {
                    let mut entity = cached.entity.clone();
                    entity.set_revision(1);
                    operations.push(DbOperation::Insert(entity));
                }
                CacheState::InsertedThenDeleted => {}
                CacheState::Loaded { dirty: false, .. } => {}
                CacheState::Loaded {
                    kind,
                    revision,
                    dirty: true,
                } => {
                    let mut entity = cached.entity.clone();
                    entity.set_revision(revision + 1);
                    if entity.kind() == kind {
                        operations.push(DbOperation::Update {
                            entity,
                            expected_revision: revision,
                        });
                    } else {
                        operations.push(DbOperation::Delete {
                            kind,
                            id: key.1.clone(),
                            expected_revision: revision,
                        });
                        operations.push(DbOperation::Insert(entity));
                    }
                }
                CacheState::Deleted { kind, revision } => {
                    operations.push(DbOperation::Delete {
                        kind,
                        id: key.1.clone(),
                        expected_revision: revision,
                    });
                }
            }
        }
        operations
    }

    /// Flush every write as one batch and hand back the recorded events
    pub async fn commit(self) -> Result<Vec<EngineEvent>, CoreError> {
        let operations = self.pending_operations();
        if !operations.is_empty() {
            tracing::debug!(operations = operations.len(), "Flushing unit of work");
            self.store.flush(operations).await?;
        }
        Ok(self.events)
    }
}
