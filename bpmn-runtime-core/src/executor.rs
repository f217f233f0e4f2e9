//! Drives executions through a compiled definition.
//!
//! A work queue of steps runs inside one unit of work until every touched
//! execution is parked, ended or waiting on a join.

use crate::definition::{Activity, ActivityKind, GatewayDirection, ProcessDefinition, SequenceFlow};
use crate::error::{EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::store::UnitOfWork;
use crate::subscriptions::{self, EventType, SubscriptionSpec};
use crate::tree::{self, EndOutcome};
use crate::types::*;
use crate::value::VariableValue;
use crate::variables;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Move onto an activity and run its behaviour.
    Enter {
        execution_id: ExecutionId,
        activity_id: ActivityId,
    },
    /// Take an outgoing flow of the current activity.
    Leave { execution_id: ExecutionId },
    /// No flow left to take on this execution's path.
    Complete { execution_id: ExecutionId },
}

impl Step {
    fn execution_id(&self) -> &str {
        match self {
            Step::Enter { execution_id, .. }
            | Step::Leave { execution_id }
            | Step::Complete { execution_id } => execution_id,
        }
    }
}

/// Result of processing one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Follow-up steps were queued.
    Continue,
    /// Execution parked on a wait state.
    Parked {
        execution_id: ExecutionId,
        activity_id: ActivityId,
    },
    /// Concurrent branch ended; its join is still open.
    JoinPending,
    /// Execution ended.
    Ended,
    /// Root ended; the instance is complete.
    InstanceCompleted,
    /// Step addressed an execution that ended earlier in this run.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: usize,
    pub parked: Vec<(ExecutionId, ActivityId)>,
    pub instance_completed: bool,
}

pub struct FlowExecutor<'d> {
    definition: &'d ProcessDefinition,
}

impl<'d> FlowExecutor<'d> {
    pub fn new(definition: &'d ProcessDefinition) -> Self {
        Self { definition }
    }

    /// Run the root from the top-level start event.
    pub fn start(&self, uow: &mut UnitOfWork, root_id: &str) -> EngineResult<RunSummary> {
        let start = self.definition.start_of(None)?.clone();
        self.run(
            uow,
            vec![Step::Enter {
                execution_id: root_id.to_string(),
                activity_id: start,
            }],
        )
    }

    /// Continue an execution past its current activity.
    pub fn resume(&self, uow: &mut UnitOfWork, execution_id: &str) -> EngineResult<RunSummary> {
        self.run(
            uow,
            vec![Step::Leave {
                execution_id: execution_id.to_string(),
            }],
        )
    }

    /// Resume an execution parked at a user task, receive task or catch
    /// event. Its subscriptions are removed in the same unit.
    pub fn trigger(&self, uow: &mut UnitOfWork, execution_id: &str) -> EngineResult<RunSummary> {
        let execution = uow
            .state()
            .tree
            .get(execution_id)
            .ok_or_else(|| EngineError::execution_not_found(execution_id))?;
        if execution.is_ended {
            return Err(EngineError::invalid_state(format!(
                "execution {} has ended",
                execution_id
            )));
        }
        let activity = match &execution.activity_id {
            Some(activity_id) => self.definition.activity(activity_id)?,
            None => {
                return Err(EngineError::invalid_state(format!(
                    "execution {} has not started yet",
                    execution_id
                )))
            }
        };
        if !execution.is_active
            || !activity.kind.is_wait_state()
            || !uow.state().tree.live_children(execution_id).is_empty()
        {
            return Err(EngineError::invalid_state(format!(
                "execution {} is not waiting at a wait state",
                execution_id
            )));
        }
        if activity.kind == ActivityKind::EventGateway {
            return Err(EngineError::invalid_state(format!(
                "execution {} waits at event gateway '{}' and resumes only through one of its events",
                execution_id, activity.id
            )));
        }

        for subscription in subscriptions::find_by_execution(uow, execution_id) {
            subscriptions::remove(uow, &subscription.id);
        }
        self.resume(uow, execution_id)
    }

    /// Fire one subscription: remove it, merge `variables` into the waiting
    /// execution's local scope and continue past the catch point. When the
    /// execution was racing at an event gateway, the losing subscriptions are
    /// removed too. `None` when the subscription is already gone.
    pub fn fire_subscription(
        &self,
        uow: &mut UnitOfWork,
        subscription_id: &str,
        variables: BTreeMap<String, VariableValue>,
    ) -> EngineResult<Option<RunSummary>> {
        let Some(subscription) = subscriptions::remove(uow, subscription_id) else {
            return Ok(None);
        };
        let execution_id = subscription.execution_id.clone();
        let current = match uow.state().tree.get(&execution_id) {
            Some(e) if !e.is_ended => e.activity_id.clone(),
            _ => {
                return Err(EngineError::invariant(format!(
                    "subscription {} points at missing or ended execution {}",
                    subscription.id, execution_id
                )))
            }
        };

        variables::set_all_local(uow, &execution_id, variables)?;

        let target = subscription.activity_id.clone().or(current.clone());
        if target != current {
            let cancelled: Vec<SubscriptionId> = subscriptions::find_by_execution(uow, &execution_id)
                .into_iter()
                .filter_map(|s| subscriptions::remove(uow, &s.id))
                .map(|s| s.id)
                .collect();
            let Some(winner) = target else {
                return Err(EngineError::invariant("race winner without activity"));
            };
            tracing::debug!(
                execution_id = %execution_id,
                winner = %winner,
                cancelled = cancelled.len(),
                "event race won"
            );
            uow.emit(HistoryEvent::RaceWon {
                execution_id: execution_id.clone(),
                activity_id: winner.clone(),
                cancelled,
            });
            tree::enter_activity(uow, &execution_id, &winner)?;
        }
        self.resume(uow, &execution_id).map(Some)
    }

    pub fn run(&self, uow: &mut UnitOfWork, initial: Vec<Step>) -> EngineResult<RunSummary> {
        let max_steps = uow.config().max_steps_per_operation;
        let mut queue: VecDeque<Step> = initial.into();
        let mut summary = RunSummary::default();

        while let Some(step) = queue.pop_front() {
            if summary.steps >= max_steps {
                return Err(EngineError::invalid_state(format!(
                    "process instance {} exceeded {} steps in one operation",
                    uow.process_instance_id(),
                    max_steps
                )));
            }
            summary.steps += 1;
            match self.tick(uow, step, &mut queue)? {
                TickOutcome::Parked {
                    execution_id,
                    activity_id,
                } => summary.parked.push((execution_id, activity_id)),
                TickOutcome::InstanceCompleted => summary.instance_completed = true,
                _ => {}
            }
        }
        Ok(summary)
    }

    fn tick(&self, uow: &mut UnitOfWork, step: Step, queue: &mut VecDeque<Step>) -> EngineResult<TickOutcome> {
        match uow.state().tree.get(step.execution_id()) {
            None => return Err(EngineError::execution_not_found(step.execution_id())),
            Some(e) if e.is_ended => {
                tracing::debug!(execution_id = %e.id, ?step, "step for ended execution skipped");
                return Ok(TickOutcome::Skipped);
            }
            Some(_) => {}
        }
        tracing::debug!(?step, "tick");

        match step {
            Step::Enter {
                execution_id,
                activity_id,
            } => self.enter(uow, execution_id, activity_id, queue),
            Step::Leave { execution_id } => self.leave(uow, execution_id, queue),
            Step::Complete { execution_id } => self.complete(uow, execution_id, queue),
        }
    }

    fn enter(
        &self,
        uow: &mut UnitOfWork,
        execution_id: ExecutionId,
        activity_id: ActivityId,
        queue: &mut VecDeque<Step>,
    ) -> EngineResult<TickOutcome> {
        let activity = self.definition.activity(&activity_id)?;
        tree::enter_activity(uow, &execution_id, &activity_id)?;

        match &activity.kind {
            ActivityKind::Start | ActivityKind::ExclusiveGateway => {
                queue.push_back(Step::Leave { execution_id });
                Ok(TickOutcome::Continue)
            }
            ActivityKind::End { terminate: false } => {
                queue.push_back(Step::Complete { execution_id });
                Ok(TickOutcome::Continue)
            }
            ActivityKind::End { terminate: true } => {
                let scope_id = match uow.state().tree.enclosing_scope(&execution_id) {
                    Some(scope) => scope.id.clone(),
                    None => return Err(EngineError::invariant("terminate without enclosing scope")),
                };
                let reason = format!("terminate end event ({})", activity_id);
                tree::end_children(uow, &scope_id, Some(&reason))?;
                queue.push_back(Step::Complete {
                    execution_id: scope_id,
                });
                Ok(TickOutcome::Continue)
            }
            ActivityKind::UserTask | ActivityKind::ReceiveTask => Ok(TickOutcome::Parked {
                execution_id,
                activity_id,
            }),
            ActivityKind::SignalCatch { signal } => {
                self.subscribe(uow, &execution_id, EventType::Signal, signal, &activity_id)?;
                Ok(TickOutcome::Parked {
                    execution_id,
                    activity_id,
                })
            }
            ActivityKind::MessageCatch { message } => {
                self.subscribe(uow, &execution_id, EventType::Message, message, &activity_id)?;
                Ok(TickOutcome::Parked {
                    execution_id,
                    activity_id,
                })
            }
            ActivityKind::EventGateway => {
                for flow in &activity.outgoing {
                    let target = self.definition.activity(&flow.target)?;
                    match &target.kind {
                        ActivityKind::SignalCatch { signal } => {
                            self.subscribe(uow, &execution_id, EventType::Signal, signal, &target.id)?
                        }
                        ActivityKind::MessageCatch { message } => {
                            self.subscribe(uow, &execution_id, EventType::Message, message, &target.id)?
                        }
                        _ => {
                            return Err(EngineError::invariant(format!(
                                "event gateway {} flows into non-catch activity {}",
                                activity_id, target.id
                            )))
                        }
                    }
                }
                Ok(TickOutcome::Parked {
                    execution_id,
                    activity_id,
                })
            }
            ActivityKind::ParallelGateway {
                direction: GatewayDirection::Converging,
                ..
            } => {
                let is_branch = uow
                    .state()
                    .tree
                    .get(&execution_id)
                    .is_some_and(|e| e.is_concurrent);
                if !is_branch {
                    queue.push_back(Step::Leave { execution_id });
                    return Ok(TickOutcome::Continue);
                }
                match tree::arrive_at_join(uow, &execution_id, &activity_id)? {
                    // The parent may itself be a branch of an outer fork.
                    EndOutcome::JoinReleased { parent_id, .. } => {
                        queue.push_back(Step::Enter {
                            execution_id: parent_id,
                            activity_id,
                        });
                        Ok(TickOutcome::Continue)
                    }
                    EndOutcome::JoinPending { .. } => Ok(TickOutcome::JoinPending),
                    EndOutcome::Ended | EndOutcome::AlreadyEnded => Ok(TickOutcome::Ended),
                }
            }
            ActivityKind::ParallelGateway {
                direction: GatewayDirection::Diverging,
                join,
            } => {
                if activity.outgoing.len() <= 1 {
                    queue.push_back(Step::Leave { execution_id });
                    return Ok(TickOutcome::Continue);
                }
                let branches = tree::fork(uow, &execution_id, activity.outgoing.len(), join.clone())?;
                for (branch, flow) in branches.into_iter().zip(&activity.outgoing) {
                    queue.push_back(Step::Enter {
                        execution_id: branch.id,
                        activity_id: flow.target.clone(),
                    });
                }
                Ok(TickOutcome::Continue)
            }
            ActivityKind::SubProcess => {
                let child = tree::create_child_scope(uow, &execution_id, false)?;
                let start = self.definition.start_of(Some(&activity_id))?.clone();
                queue.push_back(Step::Enter {
                    execution_id: child.id,
                    activity_id: start,
                });
                Ok(TickOutcome::Continue)
            }
        }
    }

    fn leave(
        &self,
        uow: &mut UnitOfWork,
        execution_id: ExecutionId,
        queue: &mut VecDeque<Step>,
    ) -> EngineResult<TickOutcome> {
        let activity_id = uow
            .state()
            .tree
            .get(&execution_id)
            .and_then(|e| e.activity_id.clone())
            .ok_or_else(|| {
                EngineError::invariant(format!("execution {} has no current activity", execution_id))
            })?;
        let activity = self.definition.activity(&activity_id)?;
        if activity.outgoing.is_empty() {
            queue.push_back(Step::Complete { execution_id });
            return Ok(TickOutcome::Continue);
        }
        let flow = self.select_flow(uow, &execution_id, activity)?;
        queue.push_back(Step::Enter {
            execution_id,
            activity_id: flow.target.clone(),
        });
        Ok(TickOutcome::Continue)
    }

    /// First flow whose condition holds, else the default flow.
    fn select_flow<'a>(
        &self,
        uow: &UnitOfWork,
        execution_id: &str,
        activity: &'a Activity,
    ) -> EngineResult<&'a SequenceFlow> {
        for flow in &activity.outgoing {
            if let Some(condition) = &flow.condition {
                let value = variables::get(uow, execution_id, &condition.variable)?;
                if condition.evaluate(value.as_ref()) {
                    return Ok(flow);
                }
            }
        }
        activity
            .outgoing
            .iter()
            .find(|f| f.is_default || f.condition.is_none())
            .ok_or_else(|| {
                EngineError::invalid_state(format!(
                    "No outgoing sequence flow of activity '{}' could be selected",
                    activity.id
                ))
            })
    }

    fn complete(
        &self,
        uow: &mut UnitOfWork,
        execution_id: ExecutionId,
        queue: &mut VecDeque<Step>,
    ) -> EngineResult<TickOutcome> {
        let Some(execution) = uow.state().tree.get(&execution_id).cloned() else {
            return Err(EngineError::execution_not_found(&execution_id));
        };

        if execution.is_concurrent {
            return match tree::end(uow, &execution_id, None)? {
                EndOutcome::JoinReleased {
                    parent_id,
                    join_activity: Some(join),
                    joined_at_gateway: true,
                } => {
                    queue.push_back(Step::Enter {
                        execution_id: parent_id,
                        activity_id: join,
                    });
                    Ok(TickOutcome::Continue)
                }
                EndOutcome::JoinReleased { parent_id, .. } => {
                    queue.push_back(Step::Complete {
                        execution_id: parent_id,
                    });
                    Ok(TickOutcome::Continue)
                }
                EndOutcome::JoinPending { .. } => Ok(TickOutcome::JoinPending),
                EndOutcome::Ended | EndOutcome::AlreadyEnded => Ok(TickOutcome::Ended),
            };
        }

        if let Some(parent_id) = execution.parent_id {
            tree::end(uow, &execution_id, None)?;
            tree::set_active(uow, &parent_id, true)?;
            queue.push_back(Step::Leave {
                execution_id: parent_id,
            });
            return Ok(TickOutcome::Continue);
        }

        tree::end(uow, &execution_id, None)?;
        uow.emit(HistoryEvent::InstanceCompleted);
        uow.mark_completed();
        tracing::info!(process_instance_id = %execution_id, "process instance completed");
        Ok(TickOutcome::InstanceCompleted)
    }

    fn subscribe(
        &self,
        uow: &mut UnitOfWork,
        execution_id: &str,
        event_type: EventType,
        event_name: &str,
        activity_id: &str,
    ) -> EngineResult<()> {
        let scope_id = uow
            .state()
            .tree
            .nearest_scope(execution_id)
            .map(|s| s.id.clone())
            .ok_or_else(|| EngineError::invariant(format!("execution {} has no scope", execution_id)))?;
        subscriptions::subscribe(
            uow,
            SubscriptionSpec::new(event_type, event_name, execution_id, &scope_id).activity(activity_id),
        )?;
        Ok(())
    }
}
