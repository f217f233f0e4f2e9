use crate::subscriptions::EventType;
use crate::types::*;
use crate::value::VariableValue;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableUpdateKind {
    Created,
    Updated,
    Deleted,
}

/// One create/update/delete of a variable. Deletes carry `new_value: None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableUpdate {
    pub execution_id: ExecutionId,
    pub name: String,
    pub kind: VariableUpdateKind,
    pub old_value: Option<VariableValue>,
    pub new_value: Option<VariableValue>,
    pub timestamp: DateTime<Utc>,
    pub actor: Option<String>,
}

/// History events emitted by the core, published after commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HistoryEvent {
    InstanceStarted {
        definition_id: String,
        business_key: Option<String>,
        start_user_id: Option<String>,
        tenant_id: Option<String>,
        is_async: bool,
    },
    ExecutionCreated {
        execution_id: ExecutionId,
        parent_id: Option<ExecutionId>,
        is_concurrent: bool,
        is_scope: bool,
    },
    ActivityEntered {
        execution_id: ExecutionId,
        activity_id: ActivityId,
    },
    Forked {
        execution_id: ExecutionId,
        children: Vec<ExecutionId>,
        join_activity: Option<ActivityId>,
    },
    JoinArrived {
        parent_id: ExecutionId,
        execution_id: ExecutionId,
        arrived: usize,
        expected: usize,
    },
    JoinReleased {
        parent_id: ExecutionId,
        join_activity: Option<ActivityId>,
    },
    ExecutionEnded {
        execution_id: ExecutionId,
        activity_id: Option<ActivityId>,
        reason: Option<String>,
    },
    SubscriptionCreated {
        subscription_id: SubscriptionId,
        event_type: EventType,
        event_name: String,
        execution_id: ExecutionId,
    },
    SubscriptionRemoved {
        subscription_id: SubscriptionId,
        event_type: EventType,
        event_name: String,
    },
    RaceWon {
        execution_id: ExecutionId,
        activity_id: ActivityId,
        cancelled: Vec<SubscriptionId>,
    },
    VariableUpdated(VariableUpdate),
    InstanceSuspended,
    InstanceActivated,
    InstanceRenamed {
        name: Option<String>,
    },
    InstanceCompleted,
    InstanceDeleted {
        reason: String,
    },
}

/// A history event as stored by a recorder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub seq: u64,
    pub process_instance_id: ProcessInstanceId,
    pub recorded_at: DateTime<Utc>,
    pub event: HistoryEvent,
}

/// Receives committed history. Fire-and-forget: recording never fails the
/// operation that produced the events.
pub trait HistoryRecorder: Send + Sync {
    fn record(&self, process_instance_id: &str, events: Vec<HistoryEvent>);
}

/// Recorder that drops everything.
pub struct NoopHistory;

impl HistoryRecorder for NoopHistory {
    fn record(&self, _process_instance_id: &str, _events: Vec<HistoryEvent>) {}
}

// ── MemoryHistory ──

/// In-memory history log for tests and embedding.
#[derive(Default)]
pub struct MemoryHistory {
    inner: RwLock<Vec<HistoryRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events for one instance with `seq >= from_seq`, in recording order.
    pub fn read_events(&self, process_instance_id: &str, from_seq: u64) -> Result<Vec<HistoryRecord>> {
        let log = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(log
            .iter()
            .filter(|r| r.process_instance_id == process_instance_id && r.seq >= from_seq)
            .cloned()
            .collect())
    }

    /// Variable history for one name across all scopes of an instance.
    pub fn variable_updates(&self, process_instance_id: &str, name: &str) -> Result<Vec<VariableUpdate>> {
        Ok(self
            .read_events(process_instance_id, 0)?
            .into_iter()
            .filter_map(|r| match r.event {
                HistoryEvent::VariableUpdated(u) if u.name == name => Some(u),
                _ => None,
            })
            .collect())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|log| log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistoryRecorder for MemoryHistory {
    fn record(&self, process_instance_id: &str, events: Vec<HistoryEvent>) {
        let Ok(mut log) = self.inner.write() else {
            tracing::warn!(process_instance_id, "history log poisoned, events dropped");
            return;
        };
        let now = Utc::now();
        for event in events {
            let seq = log.len() as u64;
            log.push(HistoryRecord {
                seq,
                process_instance_id: process_instance_id.to_string(),
                recorded_at: now,
                event,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(name: &str, kind: VariableUpdateKind) -> HistoryEvent {
        HistoryEvent::VariableUpdated(VariableUpdate {
            execution_id: "e1".into(),
            name: name.into(),
            kind,
            old_value: None,
            new_value: None,
            timestamp: Utc::now(),
            actor: None,
        })
    }

    #[test]
    fn test_memory_history_filters_by_instance_and_seq() {
        let history = MemoryHistory::new();
        history.record("p1", vec![HistoryEvent::InstanceCompleted]);
        history.record("p2", vec![HistoryEvent::InstanceSuspended]);
        history.record(
            "p1",
            vec![
                update("a", VariableUpdateKind::Created),
                update("b", VariableUpdateKind::Created),
                update("a", VariableUpdateKind::Deleted),
            ],
        );

        assert_eq!(history.len(), 5);
        let p1 = history.read_events("p1", 0).unwrap();
        assert_eq!(p1.len(), 4);
        assert!(p1.windows(2).all(|w| w[0].seq < w[1].seq));

        let tail = history.read_events("p1", 3).unwrap();
        assert_eq!(tail.len(), 2);

        let a = history.variable_updates("p1", "a").unwrap();
        assert_eq!(
            a.iter().map(|u| u.kind).collect::<Vec<_>>(),
            vec![VariableUpdateKind::Created, VariableUpdateKind::Deleted]
        );
    }
}
