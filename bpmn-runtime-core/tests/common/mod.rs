//! Shared harness for the runtime integration tests: an engine wired to
//! in-memory collaborators plus a handful of small process models.

#![allow(dead_code)]

use bpmn_runtime_core::definition::{MemoryDefinitionRepository, ProcessDefinition};
use bpmn_runtime_core::events::MemoryHistory;
use bpmn_runtime_core::scheduler::MemoryJobQueue;
use bpmn_runtime_core::store_memory::MemoryStore;
use bpmn_runtime_core::{EngineConfig, RuntimeService};
use std::sync::Arc;

pub struct Harness {
    pub runtime: RuntimeService,
    pub repository: Arc<MemoryDefinitionRepository>,
    pub history: Arc<MemoryHistory>,
    pub jobs: Arc<MemoryJobQueue>,
}

pub fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

pub fn harness_with(config: EngineConfig) -> Harness {
    let repository = Arc::new(MemoryDefinitionRepository::new());
    let history = Arc::new(MemoryHistory::new());
    let jobs = Arc::new(MemoryJobQueue::new());
    let runtime = RuntimeService::builder(Arc::new(MemoryStore::new()), repository.clone())
        .history(history.clone())
        .scheduler(jobs.clone())
        .config(config)
        .build();
    Harness {
        runtime,
        repository,
        history,
        jobs,
    }
}

impl Harness {
    pub fn deploy(&self, yaml: &str) -> Arc<ProcessDefinition> {
        self.repository.deploy_yaml(yaml, None).unwrap()
    }

    pub fn deploy_for_tenant(&self, yaml: &str, tenant: &str) -> Arc<ProcessDefinition> {
        self.repository.deploy_yaml(yaml, Some(tenant)).unwrap()
    }

    /// Run every queued continuation job once.
    pub async fn run_jobs(&self) -> usize {
        let jobs = self.jobs.take_all().unwrap();
        for job in &jobs {
            self.runtime.execute_job(job).await.unwrap();
        }
        jobs.len()
    }
}

// =============================================================================
// Models
// =============================================================================

pub const ONE_TASK: &str = r#"
key: oneTaskProcess
name: One task
nodes:
  - kind: Start
    id: start
  - kind: UserTask
    id: theTask
  - kind: End
    id: end
edges:
  - from: start
    to: theTask
  - from: theTask
    to: end
"#;

pub const STRAIGHT_THROUGH: &str = r#"
key: straightThrough
nodes:
  - kind: Start
    id: start
  - kind: End
    id: end
edges:
  - from: start
    to: end
"#;

pub const SIGNAL_CATCH: &str = r#"
key: signalCatch
nodes:
  - kind: Start
    id: start
  - kind: SignalCatch
    id: waitAlert
    signal: alert
  - kind: UserTask
    id: afterAlert
  - kind: End
    id: end
edges:
  - from: start
    to: waitAlert
  - from: waitAlert
    to: afterAlert
  - from: afterAlert
    to: end
"#;

pub const MESSAGE_CATCH: &str = r#"
key: messageCatch
nodes:
  - kind: Start
    id: start
  - kind: MessageCatch
    id: waitPayment
    message: payment
  - kind: End
    id: end
edges:
  - from: start
    to: waitPayment
  - from: waitPayment
    to: end
"#;

pub const PARALLEL: &str = r#"
key: parallel
nodes:
  - kind: Start
    id: start
  - kind: ParallelGateway
    id: fork
    direction: Diverging
    join: join
  - kind: UserTask
    id: taskA
  - kind: UserTask
    id: taskB
  - kind: ParallelGateway
    id: join
    direction: Converging
  - kind: UserTask
    id: afterJoin
  - kind: End
    id: end
edges:
  - from: start
    to: fork
  - from: fork
    to: taskA
  - from: fork
    to: taskB
  - from: taskA
    to: join
  - from: taskB
    to: join
  - from: join
    to: afterJoin
  - from: afterJoin
    to: end
"#;

/// A branch of the outer fork forks again; all three leaves share one join.
pub const NESTED_FORK: &str = r#"
key: nestedFork
nodes:
  - kind: Start
    id: start
  - kind: ParallelGateway
    id: outer
    direction: Diverging
    join: join
  - kind: UserTask
    id: a
  - kind: ParallelGateway
    id: inner
    direction: Diverging
    join: join
  - kind: UserTask
    id: b
  - kind: UserTask
    id: c
  - kind: ParallelGateway
    id: join
    direction: Converging
  - kind: UserTask
    id: after
  - kind: End
    id: end
edges:
  - from: start
    to: outer
  - from: outer
    to: a
  - from: outer
    to: inner
  - from: inner
    to: b
  - from: inner
    to: c
  - from: a
    to: join
  - from: b
    to: join
  - from: c
    to: join
  - from: join
    to: after
  - from: after
    to: end
"#;

pub const EVENT_RACE: &str = r#"
key: eventRace
nodes:
  - kind: Start
    id: start
  - kind: EventGateway
    id: race
  - kind: SignalCatch
    id: onCancel
    signal: cancel
  - kind: MessageCatch
    id: onApproval
    message: approval
  - kind: UserTask
    id: cancelled
  - kind: UserTask
    id: approved
  - kind: End
    id: endCancelled
  - kind: End
    id: endApproved
edges:
  - from: start
    to: race
  - from: race
    to: onCancel
  - from: race
    to: onApproval
  - from: onCancel
    to: cancelled
  - from: onApproval
    to: approved
  - from: cancelled
    to: endCancelled
  - from: approved
    to: endApproved
"#;

pub const SUB_PROCESS: &str = r#"
key: subProcess
nodes:
  - kind: Start
    id: start
  - kind: SubProcess
    id: review
    nodes:
      - kind: Start
        id: reviewStart
      - kind: UserTask
        id: reviewTask
      - kind: End
        id: reviewEnd
    edges:
      - from: reviewStart
        to: reviewTask
      - from: reviewTask
        to: reviewEnd
  - kind: UserTask
    id: afterReview
  - kind: End
    id: end
edges:
  - from: start
    to: review
  - from: review
    to: afterReview
  - from: afterReview
    to: end
"#;

pub const ROUTING: &str = r#"
key: routing
nodes:
  - kind: Start
    id: start
  - kind: ExclusiveGateway
    id: route
  - kind: UserTask
    id: bigOrder
  - kind: UserTask
    id: smallOrder
  - kind: End
    id: end
edges:
  - from: start
    to: route
  - from: route
    to: bigOrder
    condition:
      variable: amount
      op: ">"
      value: 1000
  - from: route
    to: smallOrder
    is_default: true
  - from: bigOrder
    to: end
  - from: smallOrder
    to: end
"#;

pub const TERMINATE: &str = r#"
key: terminate
nodes:
  - kind: Start
    id: start
  - kind: ParallelGateway
    id: fork
    direction: Diverging
  - kind: UserTask
    id: slowTask
  - kind: End
    id: killAll
    terminate: true
edges:
  - from: start
    to: fork
  - from: fork
    to: slowTask
  - from: fork
    to: killAll
  - from: slowTask
    to: killAll
"#;
