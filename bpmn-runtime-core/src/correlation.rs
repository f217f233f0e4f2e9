//! Correlation dispatcher: routes signals and messages to the executions
//! subscribed to them.
//!
//! A targeted delivery locks the owning instance once. A broadcast takes a
//! snapshot of matching subscriptions across the engine, then fires each
//! one in its own unit of work, so one instance's failure never rolls back
//! another's progress.

use crate::config::BroadcastPolicy;
use crate::error::{require_id, EngineError, EngineResult};
use crate::executor::FlowExecutor;
use crate::runtime::EngineServices;
use crate::subscriptions::{self, EventSubscription, EventType};
use crate::value::VariableValue;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct CorrelationDispatcher {
    services: Arc<EngineServices>,
    actor: Option<String>,
}

/// Result of firing one subscription out of a broadcast snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Delivery {
    Fired,
    /// Instance gone, subscription already consumed, or instance suspended.
    Skipped,
}

impl CorrelationDispatcher {
    pub(crate) fn new(services: Arc<EngineServices>, actor: Option<String>) -> Self {
        Self { services, actor }
    }

    /// Deliver a signal. With a target only that execution is considered;
    /// otherwise every subscription to `signal_name` fires. Returns how many
    /// subscriptions fired.
    pub async fn dispatch_signal(
        &self,
        signal_name: &str,
        target: Option<&str>,
        variables: BTreeMap<String, VariableValue>,
    ) -> EngineResult<usize> {
        require_id(signal_name, "signalName")?;
        match target {
            Some(execution_id) => {
                self.dispatch_targeted(EventType::Signal, signal_name, execution_id, variables)
                    .await?;
                Ok(1)
            }
            None => self.broadcast(EventType::Signal, signal_name, variables).await,
        }
    }

    /// Messages are always delivered to one execution.
    pub async fn dispatch_message(
        &self,
        message_name: &str,
        execution_id: &str,
        variables: BTreeMap<String, VariableValue>,
    ) -> EngineResult<()> {
        require_id(message_name, "messageName")?;
        self.dispatch_targeted(EventType::Message, message_name, execution_id, variables)
            .await
    }

    /// Engine-wide snapshot of subscriptions accepted by `filter`, ordered by
    /// creation.
    pub async fn subscriptions<F>(&self, filter: F) -> EngineResult<Vec<EventSubscription>>
    where
        F: Fn(&EventSubscription) -> bool,
    {
        let mut out = Vec::new();
        for id in self.services.store.instance_ids().await? {
            let Some(uow) = self.services.try_open_instance(&id, None).await? else {
                continue;
            };
            out.extend(
                uow.state()
                    .subscriptions
                    .all()
                    .into_iter()
                    .filter(|&s| filter(s))
                    .cloned(),
            );
        }
        out.sort_by_key(|s| s.sequence);
        Ok(out)
    }

    async fn dispatch_targeted(
        &self,
        event_type: EventType,
        event_name: &str,
        execution_id: &str,
        variables: BTreeMap<String, VariableValue>,
    ) -> EngineResult<()> {
        let mut uow = self
            .services
            .open_execution(execution_id, self.actor.as_deref())
            .await?;
        uow.ensure_not_suspended(&format!("deliver {} '{}'", event_type, event_name))?;

        let Some(subscription) = subscriptions::find_by_execution(&uow, execution_id)
            .into_iter()
            .find(|s| s.event_type == event_type && s.event_name == event_name)
        else {
            return Err(EngineError::CorrelationFailure(format!(
                "Execution '{}' has not subscribed to a {} event with name '{}'",
                execution_id, event_type, event_name
            )));
        };

        let definition = self.services.definition_for(&uow).await?;
        FlowExecutor::new(&definition).fire_subscription(&mut uow, &subscription.id, variables)?;
        self.services.commit(uow).await?;
        tracing::debug!(
            %event_type,
            event_name,
            execution_id,
            subscription_id = %subscription.id,
            "event delivered"
        );
        Ok(())
    }

    async fn broadcast(
        &self,
        event_type: EventType,
        event_name: &str,
        variables: BTreeMap<String, VariableValue>,
    ) -> EngineResult<usize> {
        let matches = self
            .subscriptions(|s| s.event_type == event_type && s.event_name == event_name)
            .await?;
        if matches.is_empty() {
            tracing::debug!(%event_type, event_name, "no subscriptions for broadcast");
            return Ok(0);
        }

        let policy = self.services.config.broadcast_failure_policy;
        let mut fired = 0;
        let mut failures = 0;
        let mut first_error = None;

        for subscription in &matches {
            match self.fire_one(subscription, variables.clone()).await {
                Ok(Delivery::Fired) => fired += 1,
                Ok(Delivery::Skipped) => {}
                Err(e) => {
                    tracing::warn!(
                        %event_type,
                        event_name,
                        subscription_id = %subscription.id,
                        process_instance_id = %subscription.process_instance_id,
                        error = %e,
                        "broadcast delivery failed"
                    );
                    if policy == BroadcastPolicy::FailFast {
                        return Err(e);
                    }
                    failures += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(
            %event_type,
            event_name,
            matched = matches.len(),
            fired,
            failures,
            "broadcast finished"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(fired),
        }
    }

    async fn fire_one(
        &self,
        subscription: &EventSubscription,
        variables: BTreeMap<String, VariableValue>,
    ) -> EngineResult<Delivery> {
        let Some(mut uow) = self
            .services
            .try_open_instance(&subscription.process_instance_id, self.actor.as_deref())
            .await?
        else {
            return Ok(Delivery::Skipped);
        };
        if uow.state().suspended {
            tracing::debug!(
                process_instance_id = %subscription.process_instance_id,
                subscription_id = %subscription.id,
                "skipping suspended instance"
            );
            return Ok(Delivery::Skipped);
        }
        if uow.state().subscriptions.get(&subscription.id).is_none() {
            return Ok(Delivery::Skipped);
        }

        let definition = self.services.definition_for(&uow).await?;
        let fired = FlowExecutor::new(&definition).fire_subscription(&mut uow, &subscription.id, variables)?;
        if fired.is_none() {
            return Ok(Delivery::Skipped);
        }
        self.services.commit(uow).await?;
        Ok(Delivery::Fired)
    }
}
