use crate::store::{InstanceLease, InstanceState, RuntimeStore};
use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slot = Arc<Mutex<Option<InstanceState>>>;

#[derive(Default)]
struct Inner {
    slots: RwLock<HashMap<ProcessInstanceId, Slot>>,
    /// execution id → process instance id, committed executions only.
    executions: RwLock<HashMap<ExecutionId, ProcessInstanceId>>,
    sequence: AtomicU64,
}

/// In-memory RuntimeStore for testing and embedding.
///
/// One async mutex per instance; the map locks are only held for lookups.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, process_instance_id: &str) -> Result<Option<Slot>> {
        let slots = self.inner.slots.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(slots.get(process_instance_id).cloned())
    }
}

#[async_trait]
impl RuntimeStore for MemoryStore {
    async fn lock_instance(&self, process_instance_id: &str) -> Result<Option<Box<dyn InstanceLease>>> {
        let Some(slot) = self.slot(process_instance_id)? else {
            return Ok(None);
        };
        let guard = slot.lock_owned().await;
        if guard.is_none() {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLease {
            process_instance_id: process_instance_id.to_string(),
            guard,
            inner: self.inner.clone(),
        })))
    }

    async fn create_instance(&self, process_instance_id: &str) -> Result<Box<dyn InstanceLease>> {
        let slot: Slot = Arc::new(Mutex::new(None));
        let guard = slot
            .clone()
            .try_lock_owned()
            .map_err(|e| anyhow!("Lock: {}", e))?;
        {
            let mut slots = self.inner.slots.write().map_err(|e| anyhow!("Lock: {}", e))?;
            if slots.contains_key(process_instance_id) {
                return Err(anyhow!("Process instance {} already exists", process_instance_id));
            }
            slots.insert(process_instance_id.to_string(), slot);
        }
        Ok(Box::new(MemoryLease {
            process_instance_id: process_instance_id.to_string(),
            guard,
            inner: self.inner.clone(),
        }))
    }

    async fn locate_execution(&self, execution_id: &str) -> Result<Option<ProcessInstanceId>> {
        let index = self.inner.executions.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(index.get(execution_id).cloned())
    }

    async fn instance_ids(&self) -> Result<Vec<ProcessInstanceId>> {
        let slots = self.inner.slots.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut ids: Vec<_> = slots.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

// ── MemoryLease ──

struct MemoryLease {
    process_instance_id: ProcessInstanceId,
    guard: OwnedMutexGuard<Option<InstanceState>>,
    inner: Arc<Inner>,
}

impl InstanceLease for MemoryLease {
    fn process_instance_id(&self) -> &str {
        &self.process_instance_id
    }

    fn current(&self) -> Option<&InstanceState> {
        (*self.guard).as_ref()
    }

    fn next_sequence(&self) -> Sequence {
        self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn write(&mut self, state: Option<InstanceState>) -> Result<()> {
        {
            let mut index = self.inner.executions.write().map_err(|e| anyhow!("Lock: {}", e))?;
            if let Some(old) = (*self.guard).as_ref() {
                for id in old.tree.ids() {
                    index.remove(id);
                }
            }
            if let Some(new) = state.as_ref() {
                for id in new.tree.ids() {
                    index.insert(id.clone(), self.process_instance_id.clone());
                }
            }
        }
        if state.is_none() {
            let mut slots = self.inner.slots.write().map_err(|e| anyhow!("Lock: {}", e))?;
            slots.remove(&self.process_instance_id);
        }
        *self.guard = state;
        Ok(())
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        // A reserved slot that never received state is rolled back.
        if self.guard.is_none() {
            if let Ok(mut slots) = self.inner.slots.write() {
                slots.remove(&self.process_instance_id);
            }
        }
    }
}
