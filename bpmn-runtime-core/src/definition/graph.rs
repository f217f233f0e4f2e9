//! Compiled, flattened runtime form of a process model.

use super::model::*;
use crate::error::{EngineError, EngineResult};
use crate::types::{ActivityId, DefinitionRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActivityKind {
    Start,
    End { terminate: bool },
    UserTask,
    ReceiveTask,
    ExclusiveGateway,
    ParallelGateway {
        direction: GatewayDirection,
        join: Option<ActivityId>,
    },
    EventGateway,
    SignalCatch { signal: String },
    MessageCatch { message: String },
    SubProcess,
}

impl ActivityKind {
    /// Activities an execution can be parked at between operations.
    pub fn is_wait_state(&self) -> bool {
        matches!(
            self,
            ActivityKind::UserTask
                | ActivityKind::ReceiveTask
                | ActivityKind::SignalCatch { .. }
                | ActivityKind::MessageCatch { .. }
                | ActivityKind::EventGateway
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub target: ActivityId,
    pub condition: Option<VariableCondition>,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub name: Option<String>,
    pub kind: ActivityKind,
    /// Enclosing sub-process, `None` at top level.
    pub container: Option<ActivityId>,
    /// Outgoing flows in declaration order.
    pub outgoing: Vec<SequenceFlow>,
    pub incoming: usize,
}

/// A deployed, immutable process definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    pub key: String,
    pub version: u32,
    pub name: Option<String>,
    pub tenant_id: Option<String>,
    pub content_hash: [u8; 32],
    pub deployed_at: DateTime<Utc>,
    pub model: ProcessModel,
    activities: BTreeMap<ActivityId, Activity>,
    /// Start activity per container (`None` = top level).
    starts: BTreeMap<Option<ActivityId>, ActivityId>,
}

impl ProcessDefinition {
    /// Flatten a model that already passed validation.
    pub fn compile(
        model: ProcessModel,
        id: String,
        version: u32,
        tenant_id: Option<String>,
    ) -> EngineResult<Self> {
        let mut activities = BTreeMap::new();
        let mut starts = BTreeMap::new();
        flatten(&model.nodes, &model.edges, None, &mut activities, &mut starts)?;
        if !starts.contains_key(&None) {
            return Err(EngineError::invalid_argument(format!(
                "process '{}' has no start event",
                model.key
            )));
        }
        Ok(Self {
            id,
            key: model.key.clone(),
            version,
            name: model.name.clone(),
            tenant_id,
            content_hash: model.content_hash(),
            deployed_at: Utc::now(),
            model,
            activities,
            starts,
        })
    }

    pub fn reference(&self) -> DefinitionRef {
        DefinitionRef {
            id: self.id.clone(),
            key: self.key.clone(),
            version: self.version,
            name: self.name.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }

    pub fn activity(&self, id: &str) -> EngineResult<&Activity> {
        self.activities.get(id).ok_or_else(|| {
            EngineError::invariant(format!(
                "activity '{}' not found in definition {}",
                id, self.id
            ))
        })
    }

    /// Start activity of the top level (`None`) or of a sub-process.
    pub fn start_of(&self, container: Option<&str>) -> EngineResult<&ActivityId> {
        self.starts
            .get(&container.map(str::to_string))
            .ok_or_else(|| {
                EngineError::invariant(format!(
                    "no start activity for container {:?} in {}",
                    container, self.id
                ))
            })
    }

    pub fn activities(&self) -> impl Iterator<Item = &Activity> {
        self.activities.values()
    }
}

fn flatten(
    nodes: &[NodeDto],
    edges: &[EdgeDto],
    container: Option<&str>,
    activities: &mut BTreeMap<ActivityId, Activity>,
    starts: &mut BTreeMap<Option<ActivityId>, ActivityId>,
) -> EngineResult<()> {
    for node in nodes {
        let (kind, name) = match node {
            NodeDto::Start { .. } => (ActivityKind::Start, None),
            NodeDto::End { terminate, .. } => (
                ActivityKind::End {
                    terminate: *terminate,
                },
                None,
            ),
            NodeDto::UserTask { name, .. } => (ActivityKind::UserTask, name.clone()),
            NodeDto::ReceiveTask { .. } => (ActivityKind::ReceiveTask, None),
            NodeDto::ExclusiveGateway { .. } => (ActivityKind::ExclusiveGateway, None),
            NodeDto::ParallelGateway {
                direction, join, ..
            } => (
                ActivityKind::ParallelGateway {
                    direction: *direction,
                    join: join.clone(),
                },
                None,
            ),
            NodeDto::EventGateway { .. } => (ActivityKind::EventGateway, None),
            NodeDto::SignalCatch { signal, .. } => (
                ActivityKind::SignalCatch {
                    signal: signal.clone(),
                },
                None,
            ),
            NodeDto::MessageCatch { message, .. } => (
                ActivityKind::MessageCatch {
                    message: message.clone(),
                },
                None,
            ),
            NodeDto::SubProcess {
                id,
                nodes: inner_nodes,
                edges: inner_edges,
            } => {
                flatten(inner_nodes, inner_edges, Some(id), activities, starts)?;
                (ActivityKind::SubProcess, None)
            }
        };
        if matches!(kind, ActivityKind::Start) {
            starts.insert(container.map(str::to_string), node.id().to_string());
        }
        let previous = activities.insert(
            node.id().to_string(),
            Activity {
                id: node.id().to_string(),
                name,
                kind,
                container: container.map(str::to_string),
                outgoing: Vec::new(),
                incoming: 0,
            },
        );
        if previous.is_some() {
            return Err(EngineError::invalid_argument(format!(
                "duplicate activity id '{}'",
                node.id()
            )));
        }
    }

    for edge in edges {
        let Some(source) = activities.get_mut(&edge.from) else {
            return Err(EngineError::invalid_argument(format!(
                "sequence flow from unknown activity '{}'",
                edge.from
            )));
        };
        source.outgoing.push(SequenceFlow {
            target: edge.to.clone(),
            condition: edge.condition.clone(),
            is_default: edge.is_default,
        });
        let Some(target) = activities.get_mut(&edge.to) else {
            return Err(EngineError::invalid_argument(format!(
                "sequence flow to unknown activity '{}'",
                edge.to
            )));
        };
        target.incoming += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_flattens_sub_processes() {
        let model = ProcessModel {
            key: "nested".into(),
            name: Some("Nested".into()),
            nodes: vec![
                NodeDto::Start { id: "start".into() },
                NodeDto::SubProcess {
                    id: "sub".into(),
                    nodes: vec![
                        NodeDto::Start {
                            id: "subStart".into(),
                        },
                        NodeDto::ReceiveTask {
                            id: "subWait".into(),
                        },
                        NodeDto::End {
                            id: "subEnd".into(),
                            terminate: false,
                        },
                    ],
                    edges: vec![
                        EdgeDto::new("subStart", "subWait"),
                        EdgeDto::new("subWait", "subEnd"),
                    ],
                },
                NodeDto::End {
                    id: "end".into(),
                    terminate: false,
                },
            ],
            edges: vec![EdgeDto::new("start", "sub"), EdgeDto::new("sub", "end")],
        };

        let def = ProcessDefinition::compile(model, "nested:1:x".into(), 1, None).unwrap();
        assert_eq!(def.start_of(None).unwrap(), "start");
        assert_eq!(def.start_of(Some("sub")).unwrap(), "subStart");
        assert_eq!(def.activity("subWait").unwrap().container.as_deref(), Some("sub"));
        assert_eq!(def.activity("sub").unwrap().outgoing[0].target, "end");
        assert_eq!(def.activity("end").unwrap().incoming, 1);
        assert_eq!(def.reference().name.as_deref(), Some("Nested"));
    }
}
