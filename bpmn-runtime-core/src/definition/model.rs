use crate::value::VariableValue;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

fn is_false(v: &bool) -> bool {
    !v
}

// ── Top-level model ──

/// Authoring form of a process: nodes and sequence flows, as deployed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessModel {
    /// Definition key. Versions are assigned per key on deployment.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<NodeDto>,
    pub edges: Vec<EdgeDto>,
}

// ── Edge ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDto {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<VariableCondition>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_default: bool,
}

impl EdgeDto {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            condition: None,
            is_default: false,
        }
    }
}

/// `variable op value`, evaluated against the flow-taking execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableCondition {
    pub variable: String,
    pub op: ConditionOp,
    pub value: ConditionValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
}

impl VariableCondition {
    /// A missing variable, or one whose type does not fit the operand,
    /// never satisfies the condition.
    pub fn evaluate(&self, value: Option<&VariableValue>) -> bool {
        use std::cmp::Ordering;

        let Some(value) = value else {
            return false;
        };
        let ordering = match (&self.value, value) {
            (ConditionValue::Bool(expected), VariableValue::Boolean(actual)) => {
                Some(actual.cmp(expected))
            }
            (ConditionValue::I64(expected), VariableValue::Integer(actual)) => {
                Some(i64::from(*actual).cmp(expected))
            }
            (ConditionValue::I64(expected), VariableValue::Long(actual)) => Some(actual.cmp(expected)),
            (ConditionValue::I64(expected), VariableValue::Double(actual)) => {
                actual.partial_cmp(&(*expected as f64))
            }
            (ConditionValue::F64(expected), VariableValue::Double(actual)) => {
                actual.partial_cmp(expected)
            }
            (ConditionValue::F64(expected), VariableValue::Integer(actual)) => {
                f64::from(*actual).partial_cmp(expected)
            }
            (ConditionValue::F64(expected), VariableValue::Long(actual)) => {
                (*actual as f64).partial_cmp(expected)
            }
            (ConditionValue::Str(expected), other) => {
                other.as_text().map(|actual| actual.cmp(expected.as_str()))
            }
            _ => None,
        };
        match (self.op, ordering) {
            (ConditionOp::Eq, Some(o)) => o == Ordering::Equal,
            (ConditionOp::Neq, Some(o)) => o != Ordering::Equal,
            (ConditionOp::Lt, Some(o)) => o == Ordering::Less,
            (ConditionOp::Gt, Some(o)) => o == Ordering::Greater,
            (_, None) => false,
        }
    }
}

// ── Node (tagged enum) ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayDirection {
    Diverging,
    Converging,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeDto {
    Start {
        id: String,
    },
    End {
        id: String,
        #[serde(default, skip_serializing_if = "is_false")]
        terminate: bool,
    },
    /// Waits for an explicit trigger.
    UserTask {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ReceiveTask {
        id: String,
    },
    ExclusiveGateway {
        id: String,
    },
    ParallelGateway {
        id: String,
        direction: GatewayDirection,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        join: Option<String>,
    },
    /// Waits on every catch event it flows into; the first one to fire wins.
    EventGateway {
        id: String,
    },
    SignalCatch {
        id: String,
        signal: String,
    },
    MessageCatch {
        id: String,
        message: String,
    },
    SubProcess {
        id: String,
        nodes: Vec<NodeDto>,
        edges: Vec<EdgeDto>,
    },
}

impl NodeDto {
    /// Returns the id regardless of variant.
    pub fn id(&self) -> &str {
        match self {
            NodeDto::Start { id } => id,
            NodeDto::End { id, .. } => id,
            NodeDto::UserTask { id, .. } => id,
            NodeDto::ReceiveTask { id } => id,
            NodeDto::ExclusiveGateway { id } => id,
            NodeDto::ParallelGateway { id, .. } => id,
            NodeDto::EventGateway { id } => id,
            NodeDto::SignalCatch { id, .. } => id,
            NodeDto::MessageCatch { id, .. } => id,
            NodeDto::SubProcess { id, .. } => id,
        }
    }

    pub fn is_catch_event(&self) -> bool {
        matches!(self, NodeDto::SignalCatch { .. } | NodeDto::MessageCatch { .. })
    }
}

fn sort_flow(nodes: &mut [NodeDto], edges: &mut [EdgeDto]) {
    nodes.sort_by(|a, b| a.id().cmp(b.id()));
    edges.sort_by(|a, b| a.from.cmp(&b.from).then_with(|| a.to.cmp(&b.to)));
    for node in nodes.iter_mut() {
        if let NodeDto::SubProcess { nodes, edges, .. } = node {
            sort_flow(nodes, edges);
        }
    }
}

impl ProcessModel {
    /// Deterministic JSON: nodes sorted by id, edges by (from, to), nested
    /// sub-processes included.
    pub fn deterministic_json(&self) -> String {
        let mut model = self.clone();
        sort_flow(&mut model.nodes, &mut model.edges);
        serde_json::to_string_pretty(&model).unwrap_or_default()
    }

    /// SHA-256 of [`ProcessModel::deterministic_json`].
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.deterministic_json().as_bytes());
        hasher.finalize().into()
    }
}
