//! Process instance orchestrator: the façade that opens a unit of work per
//! request, drives the tree, variables and subscriptions, and publishes
//! history and jobs once the unit commits.

use crate::config::EngineConfig;
use crate::correlation::CorrelationDispatcher;
use crate::definition::{DefinitionResolver, ProcessDefinition};
use crate::error::{require_id, EngineError, EngineResult, ObjectKind};
use crate::events::{HistoryEvent, HistoryRecorder, NoopHistory};
use crate::executor::FlowExecutor;
use crate::scheduler::{ContinuationJob, JobKind, JobScheduler, MemoryJobQueue};
use crate::store::{InstanceFate, RuntimeStore, UnitContext, UnitOfWork};
use crate::subscriptions::{EventSubscription, EventType};
use crate::tree::{self, RootSpec};
use crate::types::*;
use crate::value::{CodecRegistry, FromVariable, VariableValue};
use crate::variables;
use std::collections::BTreeMap;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// EngineServices
// ---------------------------------------------------------------------------

/// Collaborators shared by the façade and the correlation dispatcher.
pub(crate) struct EngineServices {
    pub store: Arc<dyn RuntimeStore>,
    pub definitions: Arc<dyn DefinitionResolver>,
    pub history: Arc<dyn HistoryRecorder>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub config: Arc<EngineConfig>,
    pub codecs: Arc<CodecRegistry>,
}

impl EngineServices {
    fn context(&self, actor: Option<&str>) -> UnitContext {
        UnitContext {
            actor: actor.map(str::to_string),
            config: self.config.clone(),
            codecs: self.codecs.clone(),
        }
    }

    /// Lock an instance. `None` when it does not exist.
    pub async fn try_open_instance(
        &self,
        process_instance_id: &str,
        actor: Option<&str>,
    ) -> EngineResult<Option<UnitOfWork>> {
        let lease = self.store.lock_instance(process_instance_id).await?;
        Ok(lease.and_then(|lease| UnitOfWork::begin(lease, self.context(actor))))
    }

    pub async fn open_instance(&self, process_instance_id: &str, actor: Option<&str>) -> EngineResult<UnitOfWork> {
        require_id(process_instance_id, "processInstanceId")?;
        self.try_open_instance(process_instance_id, actor)
            .await?
            .ok_or_else(|| EngineError::instance_not_found(process_instance_id))
    }

    /// Lock the instance that owns `execution_id` for a read. Ended
    /// executions count as missing.
    pub async fn open_execution(&self, execution_id: &str, actor: Option<&str>) -> EngineResult<UnitOfWork> {
        require_id(execution_id, "executionId")?;
        let Some(process_instance_id) = self.store.locate_execution(execution_id).await? else {
            return Err(EngineError::execution_not_found(execution_id));
        };
        match self.try_open_instance(&process_instance_id, actor).await? {
            Some(uow) if uow.state().tree.get(execution_id).is_some_and(|e| !e.is_ended) => Ok(uow),
            _ => Err(EngineError::execution_not_found(execution_id)),
        }
    }

    /// Lock the instance that owns `execution_id` for a change to that
    /// execution. An ended execution still in the tree is an invalid state,
    /// not a missing one.
    pub async fn open_execution_for_update(
        &self,
        execution_id: &str,
        actor: Option<&str>,
    ) -> EngineResult<UnitOfWork> {
        require_id(execution_id, "executionId")?;
        let Some(process_instance_id) = self.store.locate_execution(execution_id).await? else {
            return Err(EngineError::execution_not_found(execution_id));
        };
        let Some(uow) = self.try_open_instance(&process_instance_id, actor).await? else {
            return Err(EngineError::execution_not_found(execution_id));
        };
        match uow.state().tree.get(execution_id) {
            None => Err(EngineError::execution_not_found(execution_id)),
            Some(execution) if execution.is_ended => Err(EngineError::invalid_state(format!(
                "execution {} has ended",
                execution_id
            ))),
            Some(_) => Ok(uow),
        }
    }

    pub async fn definition_for(&self, uow: &UnitOfWork) -> EngineResult<Arc<ProcessDefinition>> {
        let id = &uow.state().definition.id;
        self.definitions.find_by_id(id).await?.ok_or_else(|| {
            EngineError::not_found(
                ObjectKind::ProcessDefinition,
                format!("No process definition found for id = '{}'", id),
            )
        })
    }

    /// Commit, then publish history and hand queued jobs to the scheduler.
    ///
    /// The state is already written when jobs are scheduled, so a refused job
    /// is logged and does not fail the call. The instance keeps waiting until
    /// the job is handed to [`RuntimeService::execute_job`] again.
    pub async fn commit(&self, uow: UnitOfWork) -> EngineResult<InstanceFate> {
        let committed = uow.commit()?;
        if self.config.history_enabled && !committed.events.is_empty() {
            self.history
                .record(&committed.process_instance_id, committed.events);
        }
        for job in committed.jobs {
            let job_id = job.job_id.clone();
            if let Err(e) = self.scheduler.schedule(job).await {
                tracing::error!(
                    job_id = %job_id,
                    process_instance_id = %committed.process_instance_id,
                    error = %e,
                    "continuation job not scheduled"
                );
            }
        }
        Ok(committed.fate)
    }
}

// ---------------------------------------------------------------------------
// RuntimeService
// ---------------------------------------------------------------------------

/// Entry point for callers. Cheap to clone; clones share collaborators.
#[derive(Clone)]
pub struct RuntimeService {
    services: Arc<EngineServices>,
    actor: Option<String>,
}

pub struct RuntimeServiceBuilder {
    store: Arc<dyn RuntimeStore>,
    definitions: Arc<dyn DefinitionResolver>,
    history: Arc<dyn HistoryRecorder>,
    scheduler: Arc<dyn JobScheduler>,
    config: EngineConfig,
    codecs: CodecRegistry,
}

impl RuntimeServiceBuilder {
    pub fn history(mut self, history: Arc<dyn HistoryRecorder>) -> Self {
        self.history = history;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn JobScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn build(self) -> RuntimeService {
        RuntimeService {
            services: Arc::new(EngineServices {
                store: self.store,
                definitions: self.definitions,
                history: self.history,
                scheduler: self.scheduler,
                config: Arc::new(self.config),
                codecs: Arc::new(self.codecs),
            }),
            actor: None,
        }
    }
}

impl RuntimeService {
    /// History defaults to a no-op recorder and jobs to an unattended
    /// in-memory queue; override both through the builder.
    pub fn builder(store: Arc<dyn RuntimeStore>, definitions: Arc<dyn DefinitionResolver>) -> RuntimeServiceBuilder {
        RuntimeServiceBuilder {
            store,
            definitions,
            history: Arc::new(NoopHistory),
            scheduler: Arc::new(MemoryJobQueue::new()),
            config: EngineConfig::default(),
            codecs: CodecRegistry::new(),
        }
    }

    /// Handle that stamps `actor` as start user and on variable history.
    pub fn as_actor(&self, actor: impl Into<String>) -> Self {
        Self {
            services: self.services.clone(),
            actor: Some(actor.into()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn correlation(&self) -> CorrelationDispatcher {
        CorrelationDispatcher::new(self.services.clone(), self.actor.clone())
    }

    fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    // ── Start ──

    pub async fn start_process(&self, request: StartProcess) -> EngineResult<ProcessInstance> {
        self.start_internal(request, false).await
    }

    /// Phase one of an async start: the root is created with its variables
    /// and left pending; a continuation job runs the first activity.
    pub async fn start_process_async(&self, request: StartProcess) -> EngineResult<ProcessInstance> {
        self.start_internal(request, true).await
    }

    async fn resolve_definition(&self, request: &StartProcess) -> EngineResult<(Arc<ProcessDefinition>, bool)> {
        let resolver = &self.services.definitions;

        if let Some(id) = request.definition_id.as_deref() {
            require_id(id, "processDefinitionId")?;
            let definition = resolver.find_by_id(id).await?.ok_or_else(|| {
                EngineError::not_found(
                    ObjectKind::ProcessDefinition,
                    format!("No process definition found for id = '{}'", id),
                )
            })?;
            return Ok((definition, false));
        }

        let Some(key) = request.definition_key.as_deref() else {
            return Err(EngineError::invalid_argument(
                "No processDefinitionId, processDefinitionKey provided",
            ));
        };
        require_id(key, "processDefinitionKey")?;
        let tenant = request.tenant_id.as_deref().filter(|t| !t.is_empty());

        if let Some(definition) = resolver.find_latest_by_key(key, tenant).await? {
            return Ok((definition, false));
        }
        match tenant {
            Some(_) if request.fallback_to_default_tenant => {
                match resolver.find_latest_by_key(key, None).await? {
                    Some(definition) => Ok((definition, true)),
                    None => Err(EngineError::not_found(
                        ObjectKind::ProcessDefinition,
                        format!(
                            "No process definition found for key '{}'. Fallback to default tenant was also applied.",
                            key
                        ),
                    )),
                }
            }
            Some(tenant) => Err(EngineError::not_found(
                ObjectKind::ProcessDefinition,
                format!(
                    "No process definition found for key '{}' and tenantId '{}'",
                    key, tenant
                ),
            )),
            None => Err(EngineError::not_found(
                ObjectKind::ProcessDefinition,
                format!("No process definition found for key '{}'", key),
            )),
        }
    }

    async fn start_internal(&self, request: StartProcess, is_async: bool) -> EngineResult<ProcessInstance> {
        let (definition, fallback_applied) = self.resolve_definition(&request).await?;
        let tenant_id = match (&request.override_tenant_id, fallback_applied) {
            (Some(tenant), _) => Some(tenant.clone()),
            (None, true) => request.tenant_id.clone(),
            (None, false) => definition.tenant_id.clone(),
        };

        let process_instance_id = new_id();
        let lease = self.services.store.create_instance(&process_instance_id).await?;
        let mut uow = UnitOfWork::begin_new(lease, self.services.context(self.actor()));

        let root = tree::create_root(
            &mut uow,
            RootSpec {
                definition: definition.reference(),
                business_key: request.business_key.clone(),
                tenant_id: tenant_id.clone(),
                start_user_id: self.actor.clone(),
            },
        )?;
        {
            let state = uow.state_mut();
            state.name = request.name.clone();
            state.callback_id = request.callback_id.clone();
            state.callback_type = request.callback_type.clone();
        }
        uow.emit(HistoryEvent::InstanceStarted {
            definition_id: definition.id.clone(),
            business_key: request.business_key.clone(),
            start_user_id: self.actor.clone(),
            tenant_id,
            is_async,
        });
        variables::set_all_local(&mut uow, &root.id, request.variables)?;

        if is_async {
            uow.state_mut().pending_start = true;
            uow.schedule(ContinuationJob::async_start(&root.id));
        } else {
            FlowExecutor::new(&definition).start(&mut uow, &root.id)?;
        }

        let view = uow
            .state()
            .view()
            .ok_or_else(|| EngineError::invariant("started instance has no root"))?;
        self.services.commit(uow).await?;
        tracing::info!(
            process_instance_id = %view.id,
            definition_id = %view.definition_id,
            business_key = ?view.business_key,
            is_async,
            ended = view.is_ended,
            "process instance started"
        );
        Ok(view)
    }

    /// Phase two of an async start, or any other continuation job.
    pub async fn execute_job(&self, job: &ContinuationJob) -> EngineResult<()> {
        match job.kind {
            JobKind::AsyncStart => {
                let mut uow = self
                    .services
                    .open_instance(&job.process_instance_id, self.actor())
                    .await?;
                if !uow.state().pending_start {
                    return Err(EngineError::invalid_state(format!(
                        "process instance {} is not waiting for its start job",
                        job.process_instance_id
                    )));
                }
                uow.ensure_not_suspended("execute job")?;
                uow.state_mut().pending_start = false;
                let definition = self.services.definition_for(&uow).await?;
                FlowExecutor::new(&definition).start(&mut uow, &job.execution_id)?;
                self.services.commit(uow).await?;
                tracing::debug!(job_id = %job.job_id, process_instance_id = %job.process_instance_id, "async start executed");
                Ok(())
            }
        }
    }

    // ── Lifecycle ──

    /// End the instance and its whole tree. A missing reason falls back to
    /// the configured default.
    pub async fn delete_process_instance(&self, process_instance_id: &str, reason: Option<&str>) -> EngineResult<()> {
        let mut uow = self.services.open_instance(process_instance_id, self.actor()).await?;
        let reason = reason.unwrap_or(&self.services.config.default_delete_reason).to_string();
        tree::delete(&mut uow, &reason)?;
        self.services.commit(uow).await?;
        tracing::info!(process_instance_id, %reason, "process instance deleted");
        Ok(())
    }

    pub async fn suspend_process_instance(&self, process_instance_id: &str) -> EngineResult<()> {
        let mut uow = self.services.open_instance(process_instance_id, self.actor()).await?;
        tree::suspend(&mut uow)?;
        self.services.commit(uow).await?;
        tracing::info!(process_instance_id, "process instance suspended");
        Ok(())
    }

    pub async fn activate_process_instance(&self, process_instance_id: &str) -> EngineResult<()> {
        let mut uow = self.services.open_instance(process_instance_id, self.actor()).await?;
        tree::activate(&mut uow)?;
        self.services.commit(uow).await?;
        tracing::info!(process_instance_id, "process instance activated");
        Ok(())
    }

    pub async fn set_process_instance_name(&self, process_instance_id: &str, name: Option<&str>) -> EngineResult<()> {
        let mut uow = self.services.open_instance(process_instance_id, self.actor()).await?;
        uow.ensure_not_suspended("set name")?;
        uow.state_mut().name = name.map(str::to_string);
        uow.emit(HistoryEvent::InstanceRenamed {
            name: name.map(str::to_string),
        });
        self.services.commit(uow).await?;
        Ok(())
    }

    /// Resume an execution waiting at a wait state. `variables` are written
    /// with the non-local rule before the execution moves on.
    pub async fn trigger(
        &self,
        execution_id: &str,
        variables: Option<BTreeMap<String, VariableValue>>,
    ) -> EngineResult<()> {
        let mut uow = self.services.open_execution_for_update(execution_id, self.actor()).await?;
        uow.ensure_not_suspended("trigger execution")?;
        if let Some(variables) = variables {
            variables::set_all(&mut uow, execution_id, variables)?;
        }
        let definition = self.services.definition_for(&uow).await?;
        FlowExecutor::new(&definition).trigger(&mut uow, execution_id)?;
        self.services.commit(uow).await?;
        Ok(())
    }

    // ── Events ──

    /// Broadcast when `target` is `None`; otherwise deliver to that
    /// execution only. Returns the number of subscriptions triggered.
    pub async fn signal_event_received(&self, signal_name: &str, target: Option<&str>) -> EngineResult<usize> {
        self.correlation()
            .dispatch_signal(signal_name, target, BTreeMap::new())
            .await
    }

    pub async fn signal_event_received_with_variables(
        &self,
        signal_name: &str,
        target: Option<&str>,
        variables: BTreeMap<String, VariableValue>,
    ) -> EngineResult<usize> {
        self.correlation()
            .dispatch_signal(signal_name, target, variables)
            .await
    }

    pub async fn message_event_received(&self, message_name: &str, execution_id: &str) -> EngineResult<()> {
        self.correlation()
            .dispatch_message(message_name, execution_id, BTreeMap::new())
            .await
    }

    pub async fn message_event_received_with_variables(
        &self,
        message_name: &str,
        execution_id: &str,
        variables: BTreeMap<String, VariableValue>,
    ) -> EngineResult<()> {
        self.correlation()
            .dispatch_message(message_name, execution_id, variables)
            .await
    }

    // ── Queries ──

    pub async fn process_instance(&self, process_instance_id: &str) -> EngineResult<Option<ProcessInstance>> {
        require_id(process_instance_id, "processInstanceId")?;
        Ok(self
            .services
            .try_open_instance(process_instance_id, None)
            .await?
            .and_then(|uow| uow.state().view()))
    }

    /// Every running instance, oldest first.
    pub async fn process_instances(&self) -> EngineResult<Vec<ProcessInstance>> {
        let mut out = Vec::new();
        for id in self.services.store.instance_ids().await? {
            if let Some(view) = self
                .services
                .try_open_instance(&id, None)
                .await?
                .and_then(|uow| uow.state().view())
            {
                out.push(view);
            }
        }
        out.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    pub async fn execution(&self, execution_id: &str) -> EngineResult<Option<Execution>> {
        match self.services.open_execution(execution_id, None).await {
            Ok(uow) => Ok(uow.state().tree.get(execution_id).cloned()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Executions of an instance that have not ended, in creation order.
    pub async fn executions(&self, process_instance_id: &str) -> EngineResult<Vec<Execution>> {
        let uow = self.services.open_instance(process_instance_id, None).await?;
        Ok(uow
            .state()
            .tree
            .in_creation_order()
            .into_iter()
            .filter(|e| !e.is_ended)
            .cloned()
            .collect())
    }

    pub async fn executions_at_activity(
        &self,
        process_instance_id: &str,
        activity_id: &str,
    ) -> EngineResult<Vec<Execution>> {
        Ok(self
            .executions(process_instance_id)
            .await?
            .into_iter()
            .filter(|e| e.activity_id.as_deref() == Some(activity_id))
            .collect())
    }

    pub async fn active_activity_ids(&self, execution_id: &str) -> EngineResult<Vec<ActivityId>> {
        let uow = self.services.open_execution(execution_id, None).await?;
        tree::active_activity_ids(&uow, execution_id)
    }

    /// Engine-wide subscriptions of a type, optionally narrowed to one name.
    pub async fn event_subscriptions(
        &self,
        event_type: EventType,
        event_name: Option<&str>,
    ) -> EngineResult<Vec<EventSubscription>> {
        self.correlation()
            .subscriptions(|s| s.event_type == event_type && event_name.map_or(true, |n| s.event_name == n))
            .await
    }

    pub async fn subscriptions_for_execution(&self, execution_id: &str) -> EngineResult<Vec<EventSubscription>> {
        let uow = self.services.open_execution(execution_id, None).await?;
        Ok(crate::subscriptions::find_by_execution(&uow, execution_id))
    }

    // ── Variables: reads ──

    pub async fn get_variable(&self, execution_id: &str, name: &str) -> EngineResult<Option<VariableValue>> {
        let uow = self.services.open_execution(execution_id, None).await?;
        variables::get(&uow, execution_id, name)
    }

    pub async fn get_variable_local(&self, execution_id: &str, name: &str) -> EngineResult<Option<VariableValue>> {
        let uow = self.services.open_execution(execution_id, None).await?;
        variables::get_local(&uow, execution_id, name)
    }

    pub async fn get_variable_as<T: FromVariable>(&self, execution_id: &str, name: &str) -> EngineResult<Option<T>> {
        let uow = self.services.open_execution(execution_id, None).await?;
        variables::get_as(&uow, execution_id, name)
    }

    pub async fn get_variable_local_as<T: FromVariable>(
        &self,
        execution_id: &str,
        name: &str,
    ) -> EngineResult<Option<T>> {
        let uow = self.services.open_execution(execution_id, None).await?;
        variables::get_local_as(&uow, execution_id, name)
    }

    pub async fn get_variables(&self, execution_id: &str) -> EngineResult<BTreeMap<String, VariableValue>> {
        let uow = self.services.open_execution(execution_id, None).await?;
        variables::get_all(&uow, execution_id)
    }

    pub async fn get_variables_local(&self, execution_id: &str) -> EngineResult<BTreeMap<String, VariableValue>> {
        let uow = self.services.open_execution(execution_id, None).await?;
        variables::get_all_local(&uow, execution_id)
    }

    // ── Variables: writes ──

    async fn mutate_variables<F>(&self, execution_id: &str, op: F) -> EngineResult<()>
    where
        F: FnOnce(&mut UnitOfWork) -> EngineResult<()>,
    {
        let mut uow = self.services.open_execution_for_update(execution_id, self.actor()).await?;
        uow.ensure_not_suspended("modify variables")?;
        op(&mut uow)?;
        self.services.commit(uow).await?;
        Ok(())
    }

    pub async fn set_variable(&self, execution_id: &str, name: &str, value: impl Into<VariableValue>) -> EngineResult<()> {
        let value = value.into();
        self.mutate_variables(execution_id, |uow| variables::set(uow, execution_id, name, value))
            .await
    }

    pub async fn set_variable_local(
        &self,
        execution_id: &str,
        name: &str,
        value: impl Into<VariableValue>,
    ) -> EngineResult<()> {
        let value = value.into();
        self.mutate_variables(execution_id, |uow| variables::set_local(uow, execution_id, name, value))
            .await
    }

    pub async fn set_variables(&self, execution_id: &str, values: BTreeMap<String, VariableValue>) -> EngineResult<()> {
        self.mutate_variables(execution_id, |uow| variables::set_all(uow, execution_id, values))
            .await
    }

    pub async fn set_variables_local(
        &self,
        execution_id: &str,
        values: BTreeMap<String, VariableValue>,
    ) -> EngineResult<()> {
        self.mutate_variables(execution_id, |uow| variables::set_all_local(uow, execution_id, values))
            .await
    }

    pub async fn remove_variable(&self, execution_id: &str, name: &str) -> EngineResult<()> {
        self.mutate_variables(execution_id, |uow| variables::remove(uow, execution_id, name).map(|_| ()))
            .await
    }

    pub async fn remove_variable_local(&self, execution_id: &str, name: &str) -> EngineResult<()> {
        self.mutate_variables(execution_id, |uow| {
            variables::remove_local(uow, execution_id, name).map(|_| ())
        })
        .await
    }

    pub async fn remove_variables<S: AsRef<str> + Sync>(&self, execution_id: &str, names: &[S]) -> EngineResult<()> {
        self.mutate_variables(execution_id, |uow| variables::remove_all(uow, execution_id, names))
            .await
    }

    pub async fn remove_variables_local<S: AsRef<str> + Sync>(
        &self,
        execution_id: &str,
        names: &[S],
    ) -> EngineResult<()> {
        self.mutate_variables(execution_id, |uow| variables::remove_all_local(uow, execution_id, names))
            .await
    }
}
