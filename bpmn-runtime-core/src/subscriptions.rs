//! Event subscription registry, partitioned per process instance.

use crate::error::{EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::store::UnitOfWork;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Signal,
    Message,
    Compensate,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Signal => "signal",
            EventType::Message => "message",
            EventType::Compensate => "compensate",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: SubscriptionId,
    pub sequence: Sequence,
    pub event_type: EventType,
    pub event_name: String,
    /// Execution resumed when the subscription fires.
    pub execution_id: ExecutionId,
    /// Scope the subscription was created under; ending it removes the subscription.
    pub scope_execution_id: ExecutionId,
    pub process_instance_id: ProcessInstanceId,
    /// Catch activity the execution moves to when this subscription wins.
    pub activity_id: Option<ActivityId>,
    pub configuration: Option<String>,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Inputs for [`subscribe`].
#[derive(Clone, Debug)]
pub struct SubscriptionSpec {
    pub event_type: EventType,
    pub event_name: String,
    pub execution_id: ExecutionId,
    pub scope_execution_id: ExecutionId,
    pub activity_id: Option<ActivityId>,
    pub configuration: Option<String>,
}

impl SubscriptionSpec {
    pub fn new(event_type: EventType, event_name: &str, execution_id: &str, scope_execution_id: &str) -> Self {
        Self {
            event_type,
            event_name: event_name.to_string(),
            execution_id: execution_id.to_string(),
            scope_execution_id: scope_execution_id.to_string(),
            activity_id: None,
            configuration: None,
        }
    }

    pub fn activity(mut self, activity_id: &str) -> Self {
        self.activity_id = Some(activity_id.to_string());
        self
    }

    pub fn configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration = Some(configuration.into());
        self
    }
}

/// Subscriptions of one process instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRegistry {
    by_id: BTreeMap<SubscriptionId, EventSubscription>,
}

impl SubscriptionRegistry {
    pub fn get(&self, id: &str) -> Option<&EventSubscription> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// All subscriptions in creation order.
    pub fn all(&self) -> Vec<&EventSubscription> {
        let mut all: Vec<_> = self.by_id.values().collect();
        all.sort_by_key(|s| s.sequence);
        all
    }

    pub fn by_correlation(&self, event_type: EventType, event_name: &str) -> Vec<&EventSubscription> {
        self.all()
            .into_iter()
            .filter(|s| s.event_type == event_type && s.event_name == event_name)
            .collect()
    }

    pub fn by_execution(&self, execution_id: &str) -> Vec<&EventSubscription> {
        self.all()
            .into_iter()
            .filter(|s| s.execution_id == execution_id)
            .collect()
    }
}

/// Register a subscription for a waiting execution.
pub fn subscribe(uow: &mut UnitOfWork, spec: SubscriptionSpec) -> EngineResult<EventSubscription> {
    if spec.event_name.is_empty() {
        return Err(EngineError::invalid_argument("event name is null"));
    }
    let tree = &uow.state().tree;
    let execution = tree
        .get(&spec.execution_id)
        .ok_or_else(|| EngineError::execution_not_found(&spec.execution_id))?;
    if execution.is_ended {
        return Err(EngineError::invalid_state(format!(
            "execution {} has ended and cannot subscribe to {} '{}'",
            spec.execution_id, spec.event_type, spec.event_name
        )));
    }
    if !tree.get(&spec.scope_execution_id).is_some_and(|s| s.is_scope) {
        return Err(EngineError::invariant(format!(
            "subscription scope {} is not a scope execution",
            spec.scope_execution_id
        )));
    }

    let subscription = EventSubscription {
        id: new_id(),
        sequence: uow.next_sequence(),
        event_type: spec.event_type,
        event_name: spec.event_name,
        execution_id: spec.execution_id,
        scope_execution_id: spec.scope_execution_id,
        process_instance_id: execution.process_instance_id.clone(),
        activity_id: spec.activity_id,
        configuration: spec.configuration,
        tenant_id: execution.tenant_id.clone(),
        created_at: uow.now(),
    };
    uow.state_mut()
        .subscriptions
        .by_id
        .insert(subscription.id.clone(), subscription.clone());
    tracing::debug!(
        subscription_id = %subscription.id,
        event_type = %subscription.event_type,
        event_name = %subscription.event_name,
        execution_id = %subscription.execution_id,
        "subscription created"
    );
    uow.emit(HistoryEvent::SubscriptionCreated {
        subscription_id: subscription.id.clone(),
        event_type: subscription.event_type,
        event_name: subscription.event_name.clone(),
        execution_id: subscription.execution_id.clone(),
    });
    Ok(subscription)
}

/// Matches within this unit's instance. Callers pick; nothing is consumed.
pub fn find_by_correlation(uow: &UnitOfWork, event_type: EventType, event_name: &str) -> Vec<EventSubscription> {
    uow.state()
        .subscriptions
        .by_correlation(event_type, event_name)
        .into_iter()
        .cloned()
        .collect()
}

pub fn find_by_execution(uow: &UnitOfWork, execution_id: &str) -> Vec<EventSubscription> {
    uow.state()
        .subscriptions
        .by_execution(execution_id)
        .into_iter()
        .cloned()
        .collect()
}

/// Remove a subscription. Removing an unknown or already-removed id is a
/// no-op and returns `None`.
pub fn remove(uow: &mut UnitOfWork, subscription_id: &str) -> Option<EventSubscription> {
    let removed = uow.state_mut().subscriptions.by_id.remove(subscription_id)?;
    uow.emit(HistoryEvent::SubscriptionRemoved {
        subscription_id: removed.id.clone(),
        event_type: removed.event_type,
        event_name: removed.event_name.clone(),
    });
    Some(removed)
}

/// Remove everything owned by an execution, either as the resumed execution
/// or as the scope it was created under.
pub(crate) fn remove_for_execution(uow: &mut UnitOfWork, execution_id: &str) -> Vec<EventSubscription> {
    let ids: Vec<SubscriptionId> = uow
        .state()
        .subscriptions
        .all()
        .into_iter()
        .filter(|s| s.execution_id == execution_id || s.scope_execution_id == execution_id)
        .map(|s| s.id.clone())
        .collect();
    ids.iter().filter_map(|id| remove(uow, id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RuntimeStore, UnitContext};
    use crate::store_memory::MemoryStore;
    use crate::tree::{self, RootSpec};

    async fn make_unit(store: &MemoryStore) -> UnitOfWork {
        let lease = store.create_instance(&new_id()).await.unwrap();
        let mut uow = UnitOfWork::begin_new(lease, UnitContext::default());
        tree::create_root(
            &mut uow,
            RootSpec {
                definition: DefinitionRef {
                    id: "subs:1:x".into(),
                    key: "subs".into(),
                    version: 1,
                    ..Default::default()
                },
                tenant_id: Some("t1".into()),
                ..Default::default()
            },
        )
        .unwrap();
        uow
    }

    #[tokio::test]
    async fn test_find_by_correlation_in_creation_order() {
        let store = MemoryStore::new();
        let mut uow = make_unit(&store).await;
        let root = uow.process_instance_id().to_string();
        let branches = tree::fork(&mut uow, &root, 3, None).unwrap();

        for b in &branches {
            subscribe(&mut uow, SubscriptionSpec::new(EventType::Signal, "alert", &b.id, &b.id)).unwrap();
        }
        subscribe(
            &mut uow,
            SubscriptionSpec::new(EventType::Message, "alert", &branches[0].id, &branches[0].id),
        )
        .unwrap();

        let signals = find_by_correlation(&uow, EventType::Signal, "alert");
        assert_eq!(
            signals.iter().map(|s| s.execution_id.clone()).collect::<Vec<_>>(),
            branches.iter().map(|b| b.id.clone()).collect::<Vec<_>>()
        );
        assert!(signals.iter().all(|s| s.tenant_id.as_deref() == Some("t1")));
        assert_eq!(find_by_execution(&uow, &branches[0].id).len(), 2);
        assert_eq!(find_by_correlation(&uow, EventType::Signal, "other").len(), 0);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let store = MemoryStore::new();
        let mut uow = make_unit(&store).await;
        let root = uow.process_instance_id().to_string();
        let sub = subscribe(
            &mut uow,
            SubscriptionSpec::new(EventType::Message, "order", &root, &root).activity("catch"),
        )
        .unwrap();
        assert_eq!(sub.activity_id.as_deref(), Some("catch"));

        assert!(remove(&mut uow, &sub.id).is_some());
        assert!(remove(&mut uow, &sub.id).is_none());
        assert!(remove(&mut uow, "never-existed").is_none());
        assert!(uow.state().subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_rejects_ended_execution() {
        let store = MemoryStore::new();
        let mut uow = make_unit(&store).await;
        let root = uow.process_instance_id().to_string();
        let child = tree::create_child_scope(&mut uow, &root, false).unwrap();
        tree::end(&mut uow, &child.id, None).unwrap();

        let err = subscribe(
            &mut uow,
            SubscriptionSpec::new(EventType::Signal, "s", &child.id, &root),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_ending_scope_removes_child_subscriptions() {
        let store = MemoryStore::new();
        let mut uow = make_unit(&store).await;
        let root = uow.process_instance_id().to_string();
        let sub_scope = tree::create_child_scope(&mut uow, &root, false).unwrap();
        subscribe(
            &mut uow,
            SubscriptionSpec::new(EventType::Compensate, "undo", &root, &sub_scope.id),
        )
        .unwrap();

        tree::end(&mut uow, &sub_scope.id, None).unwrap();
        assert!(uow.state().subscriptions.is_empty());
    }
}
