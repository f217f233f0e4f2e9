use crate::value::VariableValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Identifier aliases ───────────────────────────────────────

/// Execution id. The root execution's id doubles as the process instance id.
pub type ExecutionId = String;

pub type ProcessInstanceId = String;

/// Activity id from the process definition.
pub type ActivityId = String;

pub type SubscriptionId = String;

/// Store-wide creation order.
pub type Sequence = u64;

pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

// ─── Execution ────────────────────────────────────────────────

/// One path of control inside a process instance tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub parent_id: Option<ExecutionId>,
    pub process_instance_id: ProcessInstanceId,
    pub activity_id: Option<ActivityId>,
    pub is_active: bool,
    /// One of several sibling branches created by a parallel fork.
    pub is_concurrent: bool,
    /// Owns a variable scope and may hold subscriptions.
    pub is_scope: bool,
    pub is_ended: bool,
    pub end_reason: Option<String>,
    /// Reason used instead of the parent's when a cascade ends this execution.
    pub end_reason_override: Option<String>,
    /// Set on the root only.
    pub business_key: Option<String>,
    pub tenant_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub start_user_id: Option<String>,
    pub sequence: Sequence,
}

impl Execution {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

// ─── Process definition reference ─────────────────────────────

/// The definition an instance was started from, by value, so the instance
/// can be resumed after the repository hands out newer versions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub id: String,
    pub key: String,
    pub version: u32,
    pub name: Option<String>,
    pub tenant_id: Option<String>,
}

// ─── Process instance view ────────────────────────────────────

/// Read-only snapshot of a process instance returned by the façade.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: ProcessInstanceId,
    pub definition_id: String,
    pub definition_key: String,
    pub definition_version: u32,
    pub definition_name: Option<String>,
    pub business_key: Option<String>,
    pub name: Option<String>,
    pub tenant_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub start_user_id: Option<String>,
    pub callback_id: Option<String>,
    pub callback_type: Option<String>,
    pub is_suspended: bool,
    pub is_ended: bool,
    /// Started asynchronously and still waiting for its continuation job.
    pub is_pending: bool,
}

// ─── Start request ────────────────────────────────────────────

/// Inputs for starting a process instance. Either `definition_id` or
/// `definition_key` must be set; the id wins when both are.
#[derive(Clone, Debug, Default)]
pub struct StartProcess {
    pub definition_id: Option<String>,
    pub definition_key: Option<String>,
    pub tenant_id: Option<String>,
    /// Tenant stamped on the instance regardless of the definition's.
    pub override_tenant_id: Option<String>,
    /// Retry a tenant-scoped key lookup against the default tenant.
    pub fallback_to_default_tenant: bool,
    pub business_key: Option<String>,
    pub name: Option<String>,
    pub callback_id: Option<String>,
    pub callback_type: Option<String>,
    pub variables: BTreeMap<String, VariableValue>,
}

impl StartProcess {
    pub fn by_key(key: impl Into<String>) -> Self {
        Self {
            definition_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            definition_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn override_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.override_tenant_id = Some(tenant_id.into());
        self
    }

    pub fn fallback_to_default_tenant(mut self) -> Self {
        self.fallback_to_default_tenant = true;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn callback(mut self, id: impl Into<String>, callback_type: impl Into<String>) -> Self {
        self.callback_id = Some(id.into());
        self.callback_type = Some(callback_type.into());
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<VariableValue>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}
