use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::scheduler::ContinuationJob;
use crate::subscriptions::SubscriptionRegistry;
use crate::tree::ExecutionTree;
use crate::types::*;
use crate::value::CodecRegistry;
use crate::variables::VariableStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Everything the runtime keeps for one process instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InstanceState {
    pub process_instance_id: ProcessInstanceId,
    pub definition: DefinitionRef,
    pub name: Option<String>,
    pub callback_id: Option<String>,
    pub callback_type: Option<String>,
    pub suspended: bool,
    /// Async start accepted, first activity not yet run.
    pub pending_start: bool,
    pub tree: ExecutionTree,
    pub variables: VariableStore,
    pub subscriptions: SubscriptionRegistry,
}

impl InstanceState {
    pub fn new(process_instance_id: impl Into<String>) -> Self {
        Self {
            process_instance_id: process_instance_id.into(),
            ..Default::default()
        }
    }

    /// Snapshot for callers. `None` until the root execution exists.
    pub fn view(&self) -> Option<ProcessInstance> {
        let root = self.tree.root()?;
        Some(ProcessInstance {
            id: self.process_instance_id.clone(),
            definition_id: self.definition.id.clone(),
            definition_key: self.definition.key.clone(),
            definition_version: self.definition.version,
            definition_name: self.definition.name.clone(),
            business_key: root.business_key.clone(),
            name: self.name.clone(),
            tenant_id: root.tenant_id.clone(),
            start_time: root.start_time,
            start_user_id: root.start_user_id.clone(),
            callback_id: self.callback_id.clone(),
            callback_type: self.callback_type.clone(),
            is_suspended: self.suspended,
            is_ended: root.is_ended,
            is_pending: self.pending_start,
        })
    }
}

/// Per-instance state storage with pessimistic locking on the root id.
///
/// Every read or write of an instance goes through a lease. Leases on
/// different instances never contend; leases on the same instance are
/// handed out one at a time.
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    /// Wait for the instance lock. `None` when the instance does not exist,
    /// including when it was deleted while this caller was waiting.
    async fn lock_instance(&self, process_instance_id: &str) -> Result<Option<Box<dyn InstanceLease>>>;

    /// Reserve and lock a slot for an instance that does not exist yet.
    /// The slot disappears again if the lease is dropped without a write.
    async fn create_instance(&self, process_instance_id: &str) -> Result<Box<dyn InstanceLease>>;

    /// Which committed instance owns an execution id.
    async fn locate_execution(&self, execution_id: &str) -> Result<Option<ProcessInstanceId>>;

    async fn instance_ids(&self) -> Result<Vec<ProcessInstanceId>>;
}

/// A held instance lock.
pub trait InstanceLease: Send + Sync {
    fn process_instance_id(&self) -> &str;

    /// Last committed state, if any.
    fn current(&self) -> Option<&InstanceState>;

    /// Store-wide monotonic counter used for creation order.
    fn next_sequence(&self) -> Sequence;

    /// Publish a new state, or remove the instance with `None`.
    fn write(&mut self, state: Option<InstanceState>) -> Result<()>;
}

// ── UnitOfWork ──

/// Ambient values a unit of work carries into every core operation.
#[derive(Clone, Debug)]
pub struct UnitContext {
    pub actor: Option<String>,
    pub config: Arc<EngineConfig>,
    pub codecs: Arc<CodecRegistry>,
}

impl Default for UnitContext {
    fn default() -> Self {
        Self {
            actor: None,
            config: Arc::new(EngineConfig::default()),
            codecs: Arc::new(CodecRegistry::new()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceFate {
    Live,
    Completed,
    Deleted,
}

/// Transaction over one process instance.
///
/// Holds the instance lock and a private working copy. Nothing is visible
/// to other callers until [`UnitOfWork::commit`]; dropping the unit
/// discards every change.
pub struct UnitOfWork {
    lease: Box<dyn InstanceLease>,
    state: InstanceState,
    fate: InstanceFate,
    events: Vec<HistoryEvent>,
    jobs: Vec<ContinuationJob>,
    ctx: UnitContext,
}

/// What a commit hands back for publication.
#[derive(Debug)]
pub struct Committed {
    pub process_instance_id: ProcessInstanceId,
    pub fate: InstanceFate,
    pub events: Vec<HistoryEvent>,
    pub jobs: Vec<ContinuationJob>,
}

impl UnitOfWork {
    /// Open over an existing instance. `None` if the lease holds no state.
    pub fn begin(lease: Box<dyn InstanceLease>, ctx: UnitContext) -> Option<Self> {
        let state = lease.current()?.clone();
        Some(Self {
            lease,
            state,
            fate: InstanceFate::Live,
            events: Vec::new(),
            jobs: Vec::new(),
            ctx,
        })
    }

    /// Open over a freshly reserved instance slot.
    pub fn begin_new(lease: Box<dyn InstanceLease>, ctx: UnitContext) -> Self {
        let state = InstanceState::new(lease.process_instance_id());
        Self {
            lease,
            state,
            fate: InstanceFate::Live,
            events: Vec::new(),
            jobs: Vec::new(),
            ctx,
        }
    }

    pub fn process_instance_id(&self) -> &str {
        &self.state.process_instance_id
    }

    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }

    pub fn emit(&mut self, event: HistoryEvent) {
        self.events.push(event);
    }

    /// History buffered so far, published on commit.
    pub fn pending_events(&self) -> &[HistoryEvent] {
        &self.events
    }

    /// Queue a continuation for hand-off after commit.
    pub fn schedule(&mut self, job: ContinuationJob) {
        self.jobs.push(job);
    }

    pub fn next_sequence(&self) -> Sequence {
        self.lease.next_sequence()
    }

    pub fn actor(&self) -> Option<&str> {
        self.ctx.actor.as_deref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.ctx.codecs
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn fate(&self) -> InstanceFate {
        self.fate
    }

    pub fn mark_completed(&mut self) {
        self.fate = InstanceFate::Completed;
    }

    pub fn mark_deleted(&mut self) {
        self.fate = InstanceFate::Deleted;
    }

    /// Mutations are refused while the instance is suspended.
    pub fn ensure_not_suspended(&self, what: &str) -> EngineResult<()> {
        if self.state.suspended {
            return Err(EngineError::invalid_state(format!(
                "process instance {} is suspended, cannot {}",
                self.state.process_instance_id, what
            )));
        }
        Ok(())
    }

    pub fn commit(self) -> EngineResult<Committed> {
        let UnitOfWork {
            mut lease,
            state,
            fate,
            events,
            jobs,
            ..
        } = self;
        let process_instance_id = state.process_instance_id.clone();
        match fate {
            InstanceFate::Live => lease.write(Some(state))?,
            InstanceFate::Completed | InstanceFate::Deleted => lease.write(None)?,
        }
        Ok(Committed {
            process_instance_id,
            fate,
            events,
            jobs,
        })
    }
}
