//! Variable scope store: values live in scope executions and are looked up
//! along the chain of enclosing scopes.

use crate::error::{require_id, EngineError, EngineResult};
use crate::events::{HistoryEvent, VariableUpdate, VariableUpdateKind};
use crate::store::UnitOfWork;
use crate::types::*;
use crate::value::{typed, FromVariable, VariableValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: VariableValue,
    /// Owning scope execution.
    pub execution_id: ExecutionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableScope {
    variables: BTreeMap<String, Variable>,
    /// Names whose latest history record in this scope is a live value.
    history_live: BTreeSet<String>,
}

impl VariableScope {
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.variables.keys()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

/// Scopes keyed by owning execution id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableStore {
    scopes: BTreeMap<ExecutionId, VariableScope>,
}

impl VariableStore {
    pub fn scope(&self, execution_id: &str) -> Option<&VariableScope> {
        self.scopes.get(execution_id)
    }

    /// Total number of live variables across every scope.
    pub fn len(&self) -> usize {
        self.scopes.values().map(VariableScope::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn value_in(&self, scope_id: &str, name: &str) -> Option<&VariableValue> {
        self.scopes
            .get(scope_id)
            .and_then(|s| s.variables.get(name))
            .map(|v| &v.value)
    }
}

// ─── Lookup helpers ───────────────────────────────────────────

fn check_name(name: &str) -> EngineResult<()> {
    if name.is_empty() {
        return Err(EngineError::invalid_argument("variableName is null"));
    }
    Ok(())
}

/// Scope chain of an execution, nearest first. Never empty on success.
fn chain(uow: &UnitOfWork, execution_id: &str) -> EngineResult<Vec<ExecutionId>> {
    require_id(execution_id, "executionId")?;
    let tree = &uow.state().tree;
    if tree.get(execution_id).is_none() {
        return Err(EngineError::execution_not_found(execution_id));
    }
    let chain = tree.scope_chain(execution_id);
    if chain.is_empty() {
        return Err(EngineError::invariant(format!(
            "execution {} has no enclosing scope",
            execution_id
        )));
    }
    Ok(chain)
}

fn writable_chain(uow: &UnitOfWork, execution_id: &str) -> EngineResult<Vec<ExecutionId>> {
    let chain = chain(uow, execution_id)?;
    if uow
        .state()
        .tree
        .get(execution_id)
        .is_some_and(|e| e.is_ended)
    {
        return Err(EngineError::invalid_state(format!(
            "execution {} has ended",
            execution_id
        )));
    }
    Ok(chain)
}

fn owner_of(uow: &UnitOfWork, chain: &[ExecutionId], name: &str) -> Option<ExecutionId> {
    chain
        .iter()
        .find(|scope| uow.state().variables.value_in(scope, name).is_some())
        .cloned()
}

fn record(
    uow: &mut UnitOfWork,
    scope_id: &str,
    name: &str,
    kind: VariableUpdateKind,
    old_value: Option<VariableValue>,
    new_value: Option<VariableValue>,
) {
    let update = VariableUpdate {
        execution_id: scope_id.to_string(),
        name: name.to_string(),
        kind,
        old_value,
        new_value,
        timestamp: uow.now(),
        actor: uow.actor().map(str::to_string),
    };
    uow.emit(HistoryEvent::VariableUpdated(update));
}

fn write(uow: &mut UnitOfWork, scope_id: &str, name: &str, value: VariableValue) -> EngineResult<()> {
    let value = value.normalized(uow.config().long_string_threshold);
    uow.codecs().check(name, &value)?;

    let now = uow.now();
    let scope = uow
        .state_mut()
        .variables
        .scopes
        .entry(scope_id.to_string())
        .or_default();
    scope.history_live.insert(name.to_string());
    let old = match scope.variables.get_mut(name) {
        Some(existing) => {
            existing.updated_at = now;
            Some(std::mem::replace(&mut existing.value, value.clone()))
        }
        None => {
            scope.variables.insert(
                name.to_string(),
                Variable {
                    name: name.to_string(),
                    value: value.clone(),
                    execution_id: scope_id.to_string(),
                    created_at: now,
                    updated_at: now,
                },
            );
            None
        }
    };
    let kind = if old.is_some() {
        VariableUpdateKind::Updated
    } else {
        VariableUpdateKind::Created
    };
    record(uow, scope_id, name, kind, old, Some(value));
    Ok(())
}

/// Remove `name` from one scope. Emits a deletion record when the variable
/// existed, or when history still shows it live there. Returns whether a
/// runtime variable was removed.
fn delete(uow: &mut UnitOfWork, scope_id: &str, name: &str) -> bool {
    let Some(scope) = uow.state_mut().variables.scopes.get_mut(scope_id) else {
        return false;
    };
    let removed = scope.variables.remove(name);
    let was_live = scope.history_live.remove(name);
    if removed.is_some() || was_live {
        record(
            uow,
            scope_id,
            name,
            VariableUpdateKind::Deleted,
            removed.as_ref().map(|v| v.value.clone()),
            None,
        );
    }
    removed.is_some()
}

// ─── Reads ────────────────────────────────────────────────────

/// Value owned by the execution's own scope, no ancestor walk.
pub fn get_local(uow: &UnitOfWork, execution_id: &str, name: &str) -> EngineResult<Option<VariableValue>> {
    check_name(name)?;
    let chain = chain(uow, execution_id)?;
    Ok(uow.state().variables.value_in(&chain[0], name).cloned())
}

/// Nearest value along the scope chain. Absent everywhere is `Ok(None)`.
pub fn get(uow: &UnitOfWork, execution_id: &str, name: &str) -> EngineResult<Option<VariableValue>> {
    check_name(name)?;
    let chain = chain(uow, execution_id)?;
    Ok(chain
        .iter()
        .find_map(|scope| uow.state().variables.value_in(scope, name))
        .cloned())
}

pub fn get_as<T: FromVariable>(uow: &UnitOfWork, execution_id: &str, name: &str) -> EngineResult<Option<T>> {
    typed(name, get(uow, execution_id, name)?)
}

pub fn get_local_as<T: FromVariable>(
    uow: &UnitOfWork,
    execution_id: &str,
    name: &str,
) -> EngineResult<Option<T>> {
    typed(name, get_local(uow, execution_id, name)?)
}

/// Every visible variable; nearer scopes shadow farther ones.
pub fn get_all(uow: &UnitOfWork, execution_id: &str) -> EngineResult<BTreeMap<String, VariableValue>> {
    let chain = chain(uow, execution_id)?;
    let mut out = BTreeMap::new();
    for scope_id in chain.iter().rev() {
        if let Some(scope) = uow.state().variables.scope(scope_id) {
            for (name, var) in &scope.variables {
                out.insert(name.clone(), var.value.clone());
            }
        }
    }
    Ok(out)
}

pub fn get_all_local(
    uow: &UnitOfWork,
    execution_id: &str,
) -> EngineResult<BTreeMap<String, VariableValue>> {
    let chain = chain(uow, execution_id)?;
    Ok(uow
        .state()
        .variables
        .scope(&chain[0])
        .map(|scope| {
            scope
                .variables
                .iter()
                .map(|(name, var)| (name.clone(), var.value.clone()))
                .collect()
        })
        .unwrap_or_default())
}

// ─── Writes ───────────────────────────────────────────────────

/// Write into the execution's own scope, shadowing any ancestor copy.
pub fn set_local(
    uow: &mut UnitOfWork,
    execution_id: &str,
    name: &str,
    value: VariableValue,
) -> EngineResult<()> {
    check_name(name)?;
    let chain = writable_chain(uow, execution_id)?;
    write(uow, &chain[0], name, value)
}

/// Update the variable in whichever scope owns it, or create it in the
/// nearest scope when nothing is visible.
pub fn set(uow: &mut UnitOfWork, execution_id: &str, name: &str, value: VariableValue) -> EngineResult<()> {
    check_name(name)?;
    let chain = writable_chain(uow, execution_id)?;
    let target = owner_of(uow, &chain, name).unwrap_or_else(|| chain[0].clone());
    write(uow, &target, name, value)
}

pub fn set_all(
    uow: &mut UnitOfWork,
    execution_id: &str,
    values: impl IntoIterator<Item = (String, VariableValue)>,
) -> EngineResult<()> {
    for (name, value) in values {
        set(uow, execution_id, &name, value)?;
    }
    Ok(())
}

pub fn set_all_local(
    uow: &mut UnitOfWork,
    execution_id: &str,
    values: impl IntoIterator<Item = (String, VariableValue)>,
) -> EngineResult<()> {
    for (name, value) in values {
        set_local(uow, execution_id, &name, value)?;
    }
    Ok(())
}

pub fn remove_local(uow: &mut UnitOfWork, execution_id: &str, name: &str) -> EngineResult<bool> {
    check_name(name)?;
    let chain = writable_chain(uow, execution_id)?;
    Ok(delete(uow, &chain[0], name))
}

/// Remove the visible variable from the scope that owns it. Absent is not
/// an error.
pub fn remove(uow: &mut UnitOfWork, execution_id: &str, name: &str) -> EngineResult<bool> {
    check_name(name)?;
    let chain = writable_chain(uow, execution_id)?;
    let target = owner_of(uow, &chain, name).unwrap_or_else(|| chain[0].clone());
    Ok(delete(uow, &target, name))
}

pub fn remove_all<S: AsRef<str>>(uow: &mut UnitOfWork, execution_id: &str, names: &[S]) -> EngineResult<()> {
    for name in names {
        remove(uow, execution_id, name.as_ref())?;
    }
    Ok(())
}

pub fn remove_all_local<S: AsRef<str>>(
    uow: &mut UnitOfWork,
    execution_id: &str,
    names: &[S],
) -> EngineResult<()> {
    for name in names {
        remove_local(uow, execution_id, name.as_ref())?;
    }
    Ok(())
}

/// Drop a whole scope, recording a deletion for each variable it held.
pub(crate) fn release_scope(uow: &mut UnitOfWork, scope_id: &str) {
    let names: Vec<String> = match uow.state().variables.scope(scope_id) {
        Some(scope) => scope
            .variables
            .keys()
            .chain(scope.history_live.iter())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        None => return,
    };
    for name in names {
        delete(uow, scope_id, &name);
    }
    uow.state_mut().variables.scopes.remove(scope_id);
}
