//! Execution tree: an arena of executions keyed by id with explicit parent
//! links, plus the join barriers of active parallel forks.

use crate::error::{EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::store::UnitOfWork;
use crate::subscriptions;
use crate::types::*;
use crate::variables;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ─── Arena ────────────────────────────────────────────────────

/// Children registered against one fork and the ones that have ended.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinBarrier {
    pub join_activity: Option<ActivityId>,
    pub members: BTreeSet<ExecutionId>,
    pub arrived: BTreeSet<ExecutionId>,
    /// At least one member ended by arriving at the join gateway.
    pub joined_at_gateway: bool,
}

impl JoinBarrier {
    pub fn is_satisfied(&self) -> bool {
        !self.members.is_empty() && self.members.is_subset(&self.arrived)
    }
}

/// Ended executions stay in the arena until the instance itself ends.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionTree {
    executions: BTreeMap<ExecutionId, Execution>,
    /// Keyed by the forking (parent) execution.
    barriers: BTreeMap<ExecutionId, JoinBarrier>,
    root_id: Option<ExecutionId>,
}

impl ExecutionTree {
    pub fn get(&self, id: &str) -> Option<&Execution> {
        self.executions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Execution> {
        self.executions.get_mut(id)
    }

    pub fn root(&self) -> Option<&Execution> {
        self.root_id.as_deref().and_then(|id| self.executions.get(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &ExecutionId> {
        self.executions.keys()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    /// All executions in creation order.
    pub fn in_creation_order(&self) -> Vec<&Execution> {
        let mut all: Vec<_> = self.executions.values().collect();
        all.sort_by_key(|e| e.sequence);
        all
    }

    /// Direct children in creation order, ended ones included.
    pub fn children(&self, id: &str) -> Vec<&Execution> {
        let mut children: Vec<_> = self
            .executions
            .values()
            .filter(|e| e.parent_id.as_deref() == Some(id))
            .collect();
        children.sort_by_key(|e| e.sequence);
        children
    }

    pub fn live_children(&self, id: &str) -> Vec<&Execution> {
        self.children(id).into_iter().filter(|e| !e.is_ended).collect()
    }

    pub fn barrier(&self, parent_id: &str) -> Option<&JoinBarrier> {
        self.barriers.get(parent_id)
    }

    /// The execution itself if it is a scope, else its closest scope ancestor.
    pub fn nearest_scope(&self, id: &str) -> Option<&Execution> {
        let mut current = self.executions.get(id)?;
        loop {
            if current.is_scope {
                return Some(current);
            }
            current = self.executions.get(current.parent_id.as_deref()?)?;
        }
    }

    /// Scope executions from the nearest one up to the root.
    pub fn scope_chain(&self, id: &str) -> Vec<ExecutionId> {
        let mut chain = Vec::new();
        let mut next = self.nearest_scope(id);
        while let Some(scope) = next {
            chain.push(scope.id.clone());
            next = scope
                .parent_id
                .as_deref()
                .and_then(|parent| self.nearest_scope(parent));
        }
        chain
    }

    /// Closest non-concurrent execution at or above `id`: the process
    /// instance or sub-process a branch belongs to.
    pub fn enclosing_scope(&self, id: &str) -> Option<&Execution> {
        let mut current = self.executions.get(id)?;
        while current.is_concurrent {
            current = self.executions.get(current.parent_id.as_deref()?)?;
        }
        Some(current)
    }

    /// Ids of `id` and every descendant.
    pub fn subtree(&self, id: &str) -> Vec<ExecutionId> {
        let mut out = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(next) = stack.pop() {
            for child in self.children(&next) {
                stack.push(child.id.clone());
            }
            out.push(next);
        }
        out
    }
}

// ─── Operations ───────────────────────────────────────────────

/// Attributes of a new process instance root.
#[derive(Clone, Debug, Default)]
pub struct RootSpec {
    pub definition: DefinitionRef,
    pub business_key: Option<String>,
    pub tenant_id: Option<String>,
    pub start_user_id: Option<String>,
}

/// What ending an execution did to its parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndOutcome {
    /// The execution had already ended. Nothing changed.
    AlreadyEnded,
    Ended,
    /// Concurrent branch ended; siblings still outstanding.
    JoinPending {
        parent_id: ExecutionId,
        arrived: usize,
        expected: usize,
    },
    /// Last concurrent branch ended; the parent is active again.
    JoinReleased {
        parent_id: ExecutionId,
        join_activity: Option<ActivityId>,
        joined_at_gateway: bool,
    },
}

fn lookup<'a>(uow: &'a UnitOfWork, id: &str) -> EngineResult<&'a Execution> {
    uow.state()
        .tree
        .get(id)
        .ok_or_else(|| EngineError::execution_not_found(id))
}

fn lookup_mut<'a>(uow: &'a mut UnitOfWork, id: &str) -> EngineResult<&'a mut Execution> {
    uow.state_mut()
        .tree
        .get_mut(id)
        .ok_or_else(|| EngineError::execution_not_found(id))
}

/// Create the root execution of the unit's process instance. The root's id
/// is the process instance id.
pub fn create_root(uow: &mut UnitOfWork, spec: RootSpec) -> EngineResult<Execution> {
    if spec.definition.id.trim().is_empty() {
        return Err(EngineError::invalid_argument("processDefinitionId is null"));
    }
    if uow.state().tree.root_id.is_some() {
        return Err(EngineError::invariant(format!(
            "process instance {} already has a root execution",
            uow.process_instance_id()
        )));
    }

    let id = uow.process_instance_id().to_string();
    let root = Execution {
        id: id.clone(),
        parent_id: None,
        process_instance_id: id.clone(),
        activity_id: None,
        is_active: true,
        is_concurrent: false,
        is_scope: true,
        is_ended: false,
        end_reason: None,
        end_reason_override: None,
        business_key: spec.business_key,
        tenant_id: spec.tenant_id,
        start_time: uow.now(),
        start_user_id: spec.start_user_id,
        sequence: uow.next_sequence(),
    };

    let state = uow.state_mut();
    state.definition = spec.definition;
    state.tree.executions.insert(id.clone(), root.clone());
    state.tree.root_id = Some(id.clone());
    uow.emit(HistoryEvent::ExecutionCreated {
        execution_id: id,
        parent_id: None,
        is_concurrent: false,
        is_scope: true,
    });
    Ok(root)
}

/// Create a scope child under `parent_id`, positioned at the parent's
/// activity. The parent stops being active. Concurrent children are
/// registered on the parent's join barrier.
pub fn create_child_scope(
    uow: &mut UnitOfWork,
    parent_id: &str,
    is_concurrent: bool,
) -> EngineResult<Execution> {
    let parent = lookup(uow, parent_id)?;
    if parent.is_ended {
        return Err(EngineError::invalid_state(format!(
            "execution {} has ended and cannot receive children",
            parent_id
        )));
    }

    let child = Execution {
        id: new_id(),
        parent_id: Some(parent_id.to_string()),
        process_instance_id: parent.process_instance_id.clone(),
        activity_id: parent.activity_id.clone(),
        is_active: true,
        is_concurrent,
        is_scope: true,
        is_ended: false,
        end_reason: None,
        end_reason_override: None,
        business_key: None,
        tenant_id: parent.tenant_id.clone(),
        start_time: uow.now(),
        start_user_id: uow.actor().map(str::to_string),
        sequence: uow.next_sequence(),
    };

    let tree = &mut uow.state_mut().tree;
    if let Some(parent) = tree.executions.get_mut(parent_id) {
        parent.is_active = false;
    }
    if is_concurrent {
        tree.barriers
            .entry(parent_id.to_string())
            .or_default()
            .members
            .insert(child.id.clone());
    }
    tree.executions.insert(child.id.clone(), child.clone());

    uow.emit(HistoryEvent::ExecutionCreated {
        execution_id: child.id.clone(),
        parent_id: child.parent_id.clone(),
        is_concurrent,
        is_scope: true,
    });
    Ok(child)
}

/// Split `parent_id` into `branches` concurrent children sharing one barrier.
pub fn fork(
    uow: &mut UnitOfWork,
    parent_id: &str,
    branches: usize,
    join_activity: Option<ActivityId>,
) -> EngineResult<Vec<Execution>> {
    if branches == 0 {
        return Err(EngineError::invariant(format!(
            "fork of {} with no branches",
            parent_id
        )));
    }
    if uow.state().tree.barriers.contains_key(parent_id) {
        return Err(EngineError::invariant(format!(
            "execution {} already has an outstanding join",
            parent_id
        )));
    }

    let mut children = Vec::with_capacity(branches);
    for _ in 0..branches {
        children.push(create_child_scope(uow, parent_id, true)?);
    }
    if let Some(barrier) = uow.state_mut().tree.barriers.get_mut(parent_id) {
        barrier.join_activity = join_activity.clone();
    }
    uow.emit(HistoryEvent::Forked {
        execution_id: parent_id.to_string(),
        children: children.iter().map(|c| c.id.clone()).collect(),
        join_activity,
    });
    Ok(children)
}

/// Move an execution onto an activity and mark it active.
pub fn enter_activity(uow: &mut UnitOfWork, id: &str, activity_id: &str) -> EngineResult<()> {
    let execution = lookup_mut(uow, id)?;
    if execution.is_ended {
        return Err(EngineError::invalid_state(format!("execution {} has ended", id)));
    }
    execution.activity_id = Some(activity_id.to_string());
    execution.is_active = true;
    uow.emit(HistoryEvent::ActivityEntered {
        execution_id: id.to_string(),
        activity_id: activity_id.to_string(),
    });
    Ok(())
}

pub fn set_active(uow: &mut UnitOfWork, id: &str, active: bool) -> EngineResult<()> {
    lookup_mut(uow, id)?.is_active = active;
    Ok(())
}

/// Reason a cascade should use for this execution instead of its parent's.
pub fn set_end_reason_override(
    uow: &mut UnitOfWork,
    id: &str,
    reason: Option<String>,
) -> EngineResult<()> {
    lookup_mut(uow, id)?.end_reason_override = reason;
    Ok(())
}

/// End a concurrent branch at a converging gateway.
pub fn arrive_at_join(uow: &mut UnitOfWork, id: &str, gateway_id: &str) -> EngineResult<EndOutcome> {
    let execution = lookup(uow, id)?;
    let parent_id = match (&execution.parent_id, execution.is_concurrent) {
        (Some(parent), true) => parent.clone(),
        _ => {
            return Err(EngineError::invariant(format!(
                "execution {} reached join {} but is not a concurrent branch",
                id, gateway_id
            )))
        }
    };
    if let Some(barrier) = uow.state_mut().tree.barriers.get_mut(&parent_id) {
        barrier.joined_at_gateway = true;
        match &barrier.join_activity {
            Some(expected) if expected != gateway_id => tracing::warn!(
                execution_id = %id,
                expected = %expected,
                actual = %gateway_id,
                "branch joined at a different gateway than its fork declared"
            ),
            Some(_) => {}
            None => barrier.join_activity = Some(gateway_id.to_string()),
        }
    }
    if let Some(execution) = uow.state_mut().tree.get_mut(id) {
        execution.activity_id = Some(gateway_id.to_string());
    }
    end(uow, id, None)
}

/// End an execution and everything below it.
///
/// Children are ended first with the same reason unless they carry an
/// override. Scope data (variables, subscriptions) goes with them. When the
/// execution is a concurrent branch its arrival is counted on the parent's
/// barrier; the last arrival releases the parent exactly once. Ending an
/// already-ended execution changes nothing.
pub fn end(uow: &mut UnitOfWork, id: &str, reason: Option<&str>) -> EngineResult<EndOutcome> {
    let execution = lookup(uow, id)?;
    if execution.is_ended {
        tracing::debug!(execution_id = %id, "end of already-ended execution ignored");
        return Ok(EndOutcome::AlreadyEnded);
    }
    let is_concurrent = execution.is_concurrent;
    let parent_id = execution.parent_id.clone();

    end_subtree(uow, id, reason)?;

    if !is_concurrent {
        return Ok(EndOutcome::Ended);
    }
    let Some(parent_id) = parent_id else {
        return Err(EngineError::invariant(format!(
            "concurrent execution {} has no parent",
            id
        )));
    };
    let Some(parent) = uow.state().tree.get(&parent_id) else {
        return Err(EngineError::invariant(format!(
            "parent {} of {} missing",
            parent_id, id
        )));
    };
    if parent.is_ended {
        return Ok(EndOutcome::Ended);
    }

    let tree = &mut uow.state_mut().tree;
    let Some(barrier) = tree.barriers.get_mut(&parent_id) else {
        return Err(EngineError::invariant(format!(
            "concurrent execution {} ended but {} has no join barrier",
            id, parent_id
        )));
    };
    if !barrier.members.contains(id) {
        return Err(EngineError::invariant(format!(
            "execution {} is not registered on the join of {}",
            id, parent_id
        )));
    }
    barrier.arrived.insert(id.to_string());
    let arrived = barrier.arrived.len();
    let expected = barrier.members.len();

    if !barrier.is_satisfied() {
        uow.emit(HistoryEvent::JoinArrived {
            parent_id: parent_id.clone(),
            execution_id: id.to_string(),
            arrived,
            expected,
        });
        return Ok(EndOutcome::JoinPending {
            parent_id,
            arrived,
            expected,
        });
    }

    let released = tree.barriers.remove(&parent_id).unwrap_or_default();
    if let Some(parent) = tree.executions.get_mut(&parent_id) {
        parent.is_active = true;
    }
    uow.emit(HistoryEvent::JoinArrived {
        parent_id: parent_id.clone(),
        execution_id: id.to_string(),
        arrived,
        expected,
    });
    uow.emit(HistoryEvent::JoinReleased {
        parent_id: parent_id.clone(),
        join_activity: released.join_activity.clone(),
    });
    tracing::debug!(parent_id = %parent_id, expected, "join released");
    Ok(EndOutcome::JoinReleased {
        parent_id,
        join_activity: released.join_activity,
        joined_at_gateway: released.joined_at_gateway,
    })
}

/// End every live child of `id`, leaving `id` itself running.
pub fn end_children(uow: &mut UnitOfWork, id: &str, reason: Option<&str>) -> EngineResult<()> {
    let children: Vec<(ExecutionId, Option<String>)> = uow
        .state()
        .tree
        .live_children(id)
        .into_iter()
        .map(|c| (c.id.clone(), c.end_reason_override.clone()))
        .collect();
    for (child_id, override_reason) in children.into_iter().rev() {
        end_subtree(uow, &child_id, override_reason.as_deref().or(reason))?;
    }
    uow.state_mut().tree.barriers.remove(id);
    Ok(())
}

fn end_subtree(uow: &mut UnitOfWork, id: &str, reason: Option<&str>) -> EngineResult<()> {
    end_children(uow, id, reason)?;

    subscriptions::remove_for_execution(uow, id);
    let execution = lookup(uow, id)?;
    if execution.is_scope {
        variables::release_scope(uow, id);
    }

    let execution = lookup_mut(uow, id)?;
    execution.is_active = false;
    execution.is_ended = true;
    execution.end_reason = reason.map(str::to_string);
    let activity_id = execution.activity_id.clone();
    uow.emit(HistoryEvent::ExecutionEnded {
        execution_id: id.to_string(),
        activity_id,
        reason: reason.map(str::to_string),
    });
    Ok(())
}

/// End the whole instance with `reason` and mark it for removal on commit.
pub fn delete(uow: &mut UnitOfWork, reason: &str) -> EngineResult<()> {
    let root_id = match uow.state().tree.root() {
        Some(root) => root.id.clone(),
        None => return Err(EngineError::instance_not_found(uow.process_instance_id())),
    };
    end(uow, &root_id, Some(reason))?;
    uow.emit(HistoryEvent::InstanceDeleted {
        reason: reason.to_string(),
    });
    uow.mark_deleted();
    Ok(())
}

/// Activity ids of the active leaves under `id`, in creation order.
pub fn active_activity_ids(uow: &UnitOfWork, id: &str) -> EngineResult<Vec<ActivityId>> {
    let tree = &uow.state().tree;
    if tree.get(id).is_none() {
        return Err(EngineError::execution_not_found(id));
    }
    let mut leaves: Vec<&Execution> = tree
        .subtree(id)
        .iter()
        .filter_map(|eid| tree.get(eid))
        .filter(|e| e.is_active && !e.is_ended && tree.live_children(&e.id).is_empty())
        .collect();
    leaves.sort_by_key(|e| e.sequence);
    Ok(leaves
        .into_iter()
        .filter_map(|e| e.activity_id.clone())
        .collect())
}

pub fn suspend(uow: &mut UnitOfWork) -> EngineResult<()> {
    if uow.state().suspended {
        return Err(EngineError::invalid_state(format!(
            "process instance {} is already suspended",
            uow.process_instance_id()
        )));
    }
    uow.state_mut().suspended = true;
    uow.emit(HistoryEvent::InstanceSuspended);
    Ok(())
}

pub fn activate(uow: &mut UnitOfWork) -> EngineResult<()> {
    if !uow.state().suspended {
        return Err(EngineError::invalid_state(format!(
            "process instance {} is already active",
            uow.process_instance_id()
        )));
    }
    uow.state_mut().suspended = false;
    uow.emit(HistoryEvent::InstanceActivated);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RuntimeStore, UnitContext};
    use crate::store_memory::MemoryStore;
    use crate::subscriptions::{EventType, SubscriptionSpec};
    use crate::value::VariableValue;

    async fn make_unit(store: &MemoryStore) -> UnitOfWork {
        let lease = store.create_instance(&new_id()).await.unwrap();
        let mut uow = UnitOfWork::begin_new(lease, UnitContext::default());
        create_root(
            &mut uow,
            RootSpec {
                definition: DefinitionRef {
                    id: "proc:1:x".into(),
                    key: "proc".into(),
                    version: 1,
                    ..Default::default()
                },
                tenant_id: Some("acme".into()),
                ..Default::default()
            },
        )
        .unwrap();
        uow
    }

    fn root_id(uow: &UnitOfWork) -> String {
        uow.process_instance_id().to_string()
    }

    #[tokio::test]
    async fn test_create_root_requires_definition() {
        let store = MemoryStore::new();
        let lease = store.create_instance("p").await.unwrap();
        let mut uow = UnitOfWork::begin_new(lease, UnitContext::default());
        let err = create_root(&mut uow, RootSpec::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_child_inherits_tenant_and_instance() {
        let store = MemoryStore::new();
        let mut uow = make_unit(&store).await;
        let root = root_id(&uow);
        let child = create_child_scope(&mut uow, &root, false).unwrap();
        assert_eq!(child.tenant_id.as_deref(), Some("acme"));
        assert_eq!(child.process_instance_id, root);
        assert!(!uow.state().tree.get(&root).unwrap().is_active);
    }

    /// K-1 branches leave the join open, the K-th releases it once, and a
    /// repeated end is a no-op.
    #[tokio::test]
    async fn test_join_releases_exactly_once() {
        let store = MemoryStore::new();
        let mut uow = make_unit(&store).await;
        let root = root_id(&uow);
        let branches = fork(&mut uow, &root, 3, Some("join".into())).unwrap();

        for (i, branch) in branches.iter().take(2).enumerate() {
            let outcome = end(&mut uow, &branch.id, None).unwrap();
            assert_eq!(
                outcome,
                EndOutcome::JoinPending {
                    parent_id: root.clone(),
                    arrived: i + 1,
                    expected: 3
                }
            );
        }
        assert!(!uow.state().tree.get(&root).unwrap().is_active);

        let outcome = end(&mut uow, &branches[2].id, None).unwrap();
        assert!(matches!(outcome, EndOutcome::JoinReleased { ref parent_id, .. } if *parent_id == root));
        assert!(uow.state().tree.get(&root).unwrap().is_active);

        assert_eq!(end(&mut uow, &branches[2].id, None).unwrap(), EndOutcome::AlreadyEnded);
        assert_eq!(end(&mut uow, &branches[0].id, None).unwrap(), EndOutcome::AlreadyEnded);
        assert!(uow.state().tree.barrier(&root).is_none());
    }

    #[tokio::test]
    async fn test_end_cascades_with_override_reason() {
        let store = MemoryStore::new();
        let mut uow = make_unit(&store).await;
        let root = root_id(&uow);
        let sub = create_child_scope(&mut uow, &root, false).unwrap();
        let branches = fork(&mut uow, &sub.id, 2, None).unwrap();
        set_end_reason_override(&mut uow, &branches[1].id, Some("boundary".into())).unwrap();

        assert_eq!(end(&mut uow, &root, Some("cancelled")).unwrap(), EndOutcome::Ended);

        let tree = &uow.state().tree;
        assert!(tree.ids().all(|id| tree.get(id).unwrap().is_ended));
        assert_eq!(tree.get(&sub.id).unwrap().end_reason.as_deref(), Some("cancelled"));
        assert_eq!(tree.get(&branches[0].id).unwrap().end_reason.as_deref(), Some("cancelled"));
        assert_eq!(tree.get(&branches[1].id).unwrap().end_reason.as_deref(), Some("boundary"));
        assert!(tree.barrier(&sub.id).is_none());
    }

    #[tokio::test]
    async fn test_end_releases_scope_data() {
        let store = MemoryStore::new();
        let mut uow = make_unit(&store).await;
        let root = root_id(&uow);
        let sub = create_child_scope(&mut uow, &root, false).unwrap();
        variables::set_local(&mut uow, &sub.id, "local", VariableValue::from(1)).unwrap();
        subscriptions::subscribe(
            &mut uow,
            SubscriptionSpec::new(EventType::Signal, "alert", &sub.id, &sub.id),
        )
        .unwrap();

        end(&mut uow, &sub.id, None).unwrap();

        assert!(uow.state().variables.scope(&sub.id).is_none());
        assert!(uow.state().subscriptions.is_empty());
        assert_eq!(variables::get(&uow, &root, "local").unwrap(), None);
    }

    #[tokio::test]
    async fn test_active_activity_ids_are_leaves_in_creation_order() {
        let store = MemoryStore::new();
        let mut uow = make_unit(&store).await;
        let root = root_id(&uow);
        enter_activity(&mut uow, &root, "fork").unwrap();
        let branches = fork(&mut uow, &root, 2, None).unwrap();
        enter_activity(&mut uow, &branches[0].id, "taskA").unwrap();
        enter_activity(&mut uow, &branches[1].id, "taskB").unwrap();

        assert_eq!(active_activity_ids(&uow, &root).unwrap(), vec!["taskA", "taskB"]);
        assert_eq!(active_activity_ids(&uow, &branches[1].id).unwrap(), vec!["taskB"]);

        end(&mut uow, &branches[0].id, None).unwrap();
        assert_eq!(active_activity_ids(&uow, &root).unwrap(), vec!["taskB"]);

        let err = active_activity_ids(&uow, "nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_suspend_twice_is_invalid_state() {
        let store = MemoryStore::new();
        let mut uow = make_unit(&store).await;
        suspend(&mut uow).unwrap();
        assert!(matches!(suspend(&mut uow), Err(EngineError::InvalidState(_))));
        activate(&mut uow).unwrap();
        assert!(matches!(activate(&mut uow), Err(EngineError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_delete_marks_instance_deleted() {
        let store = MemoryStore::new();
        let mut uow = make_unit(&store).await;
        let root = root_id(&uow);
        delete(&mut uow, "cleanup").unwrap();
        assert_eq!(uow.fate(), crate::store::InstanceFate::Deleted);
        assert_eq!(
            uow.state().tree.get(&root).unwrap().end_reason.as_deref(),
            Some("cleanup")
        );
    }
}
