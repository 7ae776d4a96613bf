//! In-memory implementation of FollowupStore for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::store::*;
use crate::definition::WorkflowDefinition;
use crate::instance::{ExecutionLogEntry, FollowupInstance, InstanceKey};

#[derive(Default)]
struct MemoryState {
    workflows: RwLock<HashMap<Uuid, WorkflowDefinition>>,
    instances: RwLock<HashMap<Uuid, FollowupInstance>>,
    log: RwLock<Vec<ExecutionLogEntry>>,
    row_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    open_steps: AtomicUsize,
}

impl MemoryState {
    /// Exclusive write lock for one instance row
    async fn lock_row(&self, instance_id: Uuid) -> OwnedMutexGuard<()> {
        let row = self
            .row_locks
            .lock()
            .entry(instance_id)
            .or_default()
            .clone();
        row.lock_owned().await
    }
}

/// In-memory implementation of FollowupStore
///
/// Provides the same semantics as the PostgreSQL implementation. A step
/// unit's instance write stays invisible until commit and holds a per-row
/// lock until the unit ends, so a second writer waits and then runs its
/// compare-and-set against the committed version.
///
/// # Example
///
/// ```
/// use steward_followup::InMemoryFollowupStore;
///
/// let store = InMemoryFollowupStore::new();
/// assert_eq!(store.instance_count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryFollowupStore {
    state: Arc<MemoryState>,
}

impl InMemoryFollowupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_count(&self) -> usize {
        self.state.instances.read().len()
    }

    pub fn log_count(&self) -> usize {
        self.state.log.read().len()
    }

    /// Step units begun and not yet committed or dropped
    pub fn open_step_units(&self) -> usize {
        self.state.open_steps.load(Ordering::SeqCst)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.state.workflows.write().clear();
        self.state.instances.write().clear();
        self.state.log.write().clear();
        self.state.row_locks.lock().clear();
    }
}

fn check_version(
    instance: &FollowupInstance,
    current_version: i64,
    expected_version: i64,
) -> Result<FollowupInstance, StoreError> {
    if current_version != expected_version {
        return Err(StoreError::ConcurrencyConflict {
            expected: expected_version,
            actual: current_version,
        });
    }

    let mut updated = instance.clone();
    updated.version = expected_version + 1;
    Ok(updated)
}

fn stored_version(state: &MemoryState, instance_id: Uuid) -> Result<i64, StoreError> {
    state
        .instances
        .read()
        .get(&instance_id)
        .map(|i| i.version)
        .ok_or(StoreError::InstanceNotFound(instance_id))
}

#[async_trait]
impl FollowupStore for InMemoryFollowupStore {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        workflow.validate()?;
        self.state
            .workflows
            .write()
            .insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.state.workflows.read().get(&workflow_id).cloned())
    }

    async fn set_workflow_active(
        &self,
        workflow_id: Uuid,
        active: bool,
    ) -> Result<(), StoreError> {
        let mut workflows = self.state.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        workflow.active = active;
        Ok(())
    }

    async fn set_step_active(&self, step_id: Uuid, active: bool) -> Result<(), StoreError> {
        let mut workflows = self.state.workflows.write();
        let step = workflows
            .values_mut()
            .flat_map(|w| w.steps.iter_mut())
            .find(|s| s.id == step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;
        step.active = active;
        Ok(())
    }

    async fn get_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<FollowupInstance>, StoreError> {
        Ok(self.state.instances.read().get(&instance_id).cloned())
    }

    async fn find_instance(
        &self,
        key: InstanceKey,
    ) -> Result<Option<FollowupInstance>, StoreError> {
        Ok(self
            .state
            .instances
            .read()
            .values()
            .find(|i| i.key() == key)
            .cloned())
    }

    async fn list_instances(
        &self,
        tenant_id: Uuid,
        filter: &InstanceFilter,
        pagination: Pagination,
    ) -> Result<Vec<FollowupInstance>, StoreError> {
        let mut instances: Vec<FollowupInstance> = self
            .state
            .instances
            .read()
            .values()
            .filter(|i| i.tenant_id == tenant_id && filter.matches(i))
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.id);

        Ok(instances
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn upsert_instance(
        &self,
        instance: FollowupInstance,
        log: Option<ExecutionLogEntry>,
    ) -> Result<Upserted, StoreError> {
        let key = instance.key();
        let existing_id = self
            .state
            .instances
            .read()
            .values()
            .find(|i| i.key() == key)
            .map(|i| i.id);
        let _row = match existing_id {
            Some(id) => Some(self.state.lock_row(id).await),
            None => None,
        };

        let mut instances = self.state.instances.write();
        let upserted = match instances.values_mut().find(|i| i.key() == key) {
            Some(existing) => {
                existing.state = instance.state;
                existing.started_at = instance.started_at;
                existing.last_step_run_at = instance.last_step_run_at;
                existing.version += 1;
                Upserted {
                    instance: existing.clone(),
                    created: false,
                }
            }
            None => {
                instances.insert(instance.id, instance.clone());
                Upserted {
                    instance,
                    created: true,
                }
            }
        };

        if let Some(mut entry) = log {
            entry.instance_id = upserted.instance.id;
            self.state.log.write().push(entry);
        }

        Ok(upserted)
    }

    async fn update_instance(
        &self,
        instance: &FollowupInstance,
        expected_version: i64,
    ) -> Result<FollowupInstance, StoreError> {
        let _row = self.state.lock_row(instance.id).await;
        let current = stored_version(&self.state, instance.id)?;
        let updated = check_version(instance, current, expected_version)?;
        self.state
            .instances
            .write()
            .insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn due_instances(
        &self,
        tenant_id: Option<Uuid>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut due: Vec<(Option<DateTime<Utc>>, Uuid)> = self
            .state
            .instances
            .read()
            .values()
            .filter(|i| tenant_id.map_or(true, |t| i.tenant_id == t))
            .filter(|i| i.state.is_due(now))
            .map(|i| (i.state.next_run_at(), i.id))
            .collect();

        // None sorts before Some
        due.sort();

        Ok(due
            .into_iter()
            .take(limit as usize)
            .map(|(_, id)| id)
            .collect())
    }

    async fn begin_step(&self) -> Result<Box<dyn StepTransaction>, StoreError> {
        self.state.open_steps.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryStepTransaction {
            state: self.state.clone(),
            rows: HashMap::new(),
            pending_instances: HashMap::new(),
            pending_log: Vec::new(),
        }))
    }

    async fn execution_log(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        Ok(self
            .state
            .log
            .read()
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect())
    }
}

/// Step unit over the in-memory store
///
/// Writes are buffered until commit. Each touched instance stays row-locked
/// until the unit commits or is dropped; dropping discards the buffers.
struct MemoryStepTransaction {
    state: Arc<MemoryState>,
    rows: HashMap<Uuid, OwnedMutexGuard<()>>,
    pending_instances: HashMap<Uuid, FollowupInstance>,
    pending_log: Vec<ExecutionLogEntry>,
}

#[async_trait]
impl StepTransaction for MemoryStepTransaction {
    async fn update_instance(
        &mut self,
        instance: &FollowupInstance,
        expected_version: i64,
    ) -> Result<FollowupInstance, StoreError> {
        if !self.rows.contains_key(&instance.id) {
            let row = self.state.lock_row(instance.id).await;
            self.rows.insert(instance.id, row);
        }

        let current = match self.pending_instances.get(&instance.id) {
            Some(pending) => pending.version,
            None => stored_version(&self.state, instance.id)?,
        };
        let updated = check_version(instance, current, expected_version)?;
        self.pending_instances.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn append_log(&mut self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
        self.pending_log.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        {
            let mut instances = this.state.instances.write();
            for (id, instance) in this.pending_instances.drain() {
                instances.insert(id, instance);
            }
        }
        let entries = std::mem::take(&mut this.pending_log);
        this.state.log.write().extend(entries);
        Ok(())
    }
}

impl Drop for MemoryStepTransaction {
    fn drop(&mut self) {
        // Row guards are released after this, once the fields drop
        self.state.open_steps.fetch_sub(1, Ordering::SeqCst);
    }
}
