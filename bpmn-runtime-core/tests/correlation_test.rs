//! Correlation dispatcher integration tests
//!
//! Signal broadcast and targeted delivery, message delivery, event-gateway
//! races, suspension handling and the broadcast failure policies.

mod common;

use bpmn_runtime_core::events::HistoryEvent;
use bpmn_runtime_core::subscriptions::EventType;
use bpmn_runtime_core::{BroadcastPolicy, EngineConfig, EngineError, StartProcess, VariableValue};
use common::*;
use std::collections::BTreeMap;

/// Catches `alert`, then runs through two gateways before parking, so a low
/// step limit makes its delivery fail while `SIGNAL_CATCH` still succeeds.
const ALERT_CHAIN: &str = r#"
key: alertChain
nodes:
  - kind: Start
    id: start
  - kind: SignalCatch
    id: waitAlert
    signal: alert
  - kind: ExclusiveGateway
    id: step1
  - kind: ExclusiveGateway
    id: step2
  - kind: UserTask
    id: chained
  - kind: End
    id: end
edges:
  - from: start
    to: waitAlert
  - from: waitAlert
    to: step1
  - from: step1
    to: step2
  - from: step2
    to: chained
  - from: chained
    to: end
"#;

async fn start(h: &Harness, key: &str) -> String {
    h.runtime
        .start_process(StartProcess::by_key(key))
        .await
        .unwrap()
        .id
}

// =============================================================================
// Signals
// =============================================================================

#[tokio::test]
async fn broadcast_signal_reaches_every_subscriber() {
    let h = harness();
    h.deploy(SIGNAL_CATCH);
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(start(&h, "signalCatch").await);
    }
    assert_eq!(
        h.runtime
            .event_subscriptions(EventType::Signal, Some("alert"))
            .await
            .unwrap()
            .len(),
        3
    );

    let fired = h.runtime.signal_event_received("alert", None).await.unwrap();
    assert_eq!(fired, 3);
    for id in &ids {
        assert_eq!(
            h.runtime.active_activity_ids(id).await.unwrap(),
            vec!["afterAlert".to_string()]
        );
    }
    assert!(h
        .runtime
        .event_subscriptions(EventType::Signal, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn broadcast_without_subscribers_is_a_no_op() {
    let h = harness();
    h.deploy(SIGNAL_CATCH);
    start(&h, "signalCatch").await;

    assert_eq!(h.runtime.signal_event_received("nobody-listens", None).await.unwrap(), 0);
    let err = h.runtime.signal_event_received("", None).await.unwrap_err();
    assert_eq!(err.to_string(), "signalName is null");
}

#[tokio::test]
async fn broadcast_variables_land_on_the_waiting_execution() {
    let h = harness();
    h.deploy(SIGNAL_CATCH);
    let id = start(&h, "signalCatch").await;

    let mut vars = BTreeMap::new();
    vars.insert("level".to_string(), VariableValue::String("high".into()));
    h.runtime
        .signal_event_received_with_variables("alert", None, vars)
        .await
        .unwrap();

    assert_eq!(
        h.runtime.get_variable_local(&id, "level").await.unwrap(),
        Some(VariableValue::String("high".into()))
    );
}

#[tokio::test]
async fn targeted_signal_fires_only_the_target() {
    let h = harness();
    h.deploy(SIGNAL_CATCH);
    let first = start(&h, "signalCatch").await;
    let second = start(&h, "signalCatch").await;

    let fired = h
        .runtime
        .signal_event_received("alert", Some(first.as_str()))
        .await
        .unwrap();
    assert_eq!(fired, 1);
    assert_eq!(
        h.runtime.active_activity_ids(&first).await.unwrap(),
        vec!["afterAlert".to_string()]
    );
    assert_eq!(
        h.runtime.active_activity_ids(&second).await.unwrap(),
        vec!["waitAlert".to_string()]
    );
    assert_eq!(h.runtime.subscriptions_for_execution(&second).await.unwrap().len(), 1);
}

#[tokio::test]
async fn targeted_signal_without_matching_subscription_fails() {
    let h = harness();
    h.deploy(SIGNAL_CATCH);
    h.deploy(ONE_TASK);
    let waiting = start(&h, "signalCatch").await;
    let plain = start(&h, "oneTaskProcess").await;

    let err = h
        .runtime
        .signal_event_received("alert", Some(plain.as_str()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CorrelationFailure(_)));

    let err = h
        .runtime
        .signal_event_received("other", Some(waiting.as_str()))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!(
            "Execution '{}' has not subscribed to a signal event with name 'other'",
            waiting
        )
    );

    let err = h
        .runtime
        .signal_event_received("alert", Some("ghost"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

// =============================================================================
// Messages
// =============================================================================

#[tokio::test]
async fn message_delivery_to_execution() {
    let h = harness();
    h.deploy(MESSAGE_CATCH);
    let id = start(&h, "messageCatch").await;

    let subs = h.runtime.event_subscriptions(EventType::Message, Some("payment")).await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].execution_id, id);
    assert_eq!(subs[0].activity_id.as_deref(), Some("waitPayment"));

    let err = h.runtime.message_event_received("", &id).await.unwrap_err();
    assert_eq!(err.to_string(), "messageName is null");
    let err = h.runtime.message_event_received("refund", &id).await.unwrap_err();
    assert!(matches!(err, EngineError::CorrelationFailure(_)));

    h.runtime.message_event_received("payment", &id).await.unwrap();
    assert!(h.runtime.process_instance(&id).await.unwrap().is_none());

    let err = h.runtime.message_event_received("payment", &id).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn message_fires_only_the_named_execution() {
    let h = harness();
    h.deploy(MESSAGE_CATCH);
    let first = start(&h, "messageCatch").await;
    let middle = start(&h, "messageCatch").await;
    let last = start(&h, "messageCatch").await;
    assert_eq!(
        h.runtime.event_subscriptions(EventType::Message, Some("payment")).await.unwrap().len(),
        3
    );

    h.runtime.message_event_received("payment", &middle).await.unwrap();

    let remaining: Vec<String> = h
        .runtime
        .event_subscriptions(EventType::Message, Some("payment"))
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.execution_id)
        .collect();
    assert_eq!(remaining, vec![first.clone(), last.clone()]);
    assert!(h.runtime.process_instance(&middle).await.unwrap().is_none());
    for id in [&first, &last] {
        assert_eq!(
            h.runtime.active_activity_ids(id).await.unwrap(),
            vec!["waitPayment".to_string()]
        );
    }
}

// =============================================================================
// Event gateway race
// =============================================================================

#[tokio::test]
async fn first_event_wins_the_race() {
    let h = harness();
    h.deploy(EVENT_RACE);
    let id = start(&h, "eventRace").await;

    assert_eq!(h.runtime.subscriptions_for_execution(&id).await.unwrap().len(), 2);
    let err = h.runtime.trigger(&id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let mut vars = BTreeMap::new();
    vars.insert("approver".to_string(), VariableValue::String("gonzo".into()));
    h.runtime
        .message_event_received_with_variables("approval", &id, vars)
        .await
        .unwrap();

    assert_eq!(
        h.runtime.active_activity_ids(&id).await.unwrap(),
        vec!["approved".to_string()]
    );
    assert!(h.runtime.subscriptions_for_execution(&id).await.unwrap().is_empty());
    assert_eq!(h.runtime.signal_event_received("cancel", None).await.unwrap(), 0);

    let race = h
        .history
        .read_events(&id, 0)
        .unwrap()
        .into_iter()
        .find_map(|r| match r.event {
            HistoryEvent::RaceWon {
                activity_id,
                cancelled,
                ..
            } => Some((activity_id, cancelled.len())),
            _ => None,
        });
    assert_eq!(race, Some(("onApproval".to_string(), 1)));
}

// =============================================================================
// Suspension and failure policy
// =============================================================================

#[tokio::test]
async fn broadcast_skips_suspended_instances() {
    let h = harness();
    h.deploy(SIGNAL_CATCH);
    let running = start(&h, "signalCatch").await;
    let suspended = start(&h, "signalCatch").await;
    h.runtime.suspend_process_instance(&suspended).await.unwrap();

    assert_eq!(h.runtime.signal_event_received("alert", None).await.unwrap(), 1);
    assert_eq!(
        h.runtime.active_activity_ids(&running).await.unwrap(),
        vec!["afterAlert".to_string()]
    );
    assert_eq!(h.runtime.subscriptions_for_execution(&suspended).await.unwrap().len(), 1);

    let err = h
        .runtime
        .signal_event_received("alert", Some(suspended.as_str()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    h.runtime.activate_process_instance(&suspended).await.unwrap();
    assert_eq!(h.runtime.signal_event_received("alert", None).await.unwrap(), 1);
}

#[tokio::test]
async fn continue_policy_delivers_the_rest_and_reports_failure() {
    let h = harness_with(EngineConfig {
        max_steps_per_operation: 4,
        ..EngineConfig::default()
    });
    h.deploy(ALERT_CHAIN);
    h.deploy(SIGNAL_CATCH);
    let failing = start(&h, "alertChain").await;
    let ok_a = start(&h, "signalCatch").await;
    let ok_b = start(&h, "signalCatch").await;

    let err = h.runtime.signal_event_received("alert", None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    for id in [&ok_a, &ok_b] {
        assert_eq!(
            h.runtime.active_activity_ids(id).await.unwrap(),
            vec!["afterAlert".to_string()]
        );
    }
    assert_eq!(
        h.runtime.active_activity_ids(&failing).await.unwrap(),
        vec!["waitAlert".to_string()]
    );
    assert_eq!(h.runtime.subscriptions_for_execution(&failing).await.unwrap().len(), 1);
}

#[tokio::test]
async fn fail_fast_policy_stops_at_first_failure() {
    let h = harness_with(EngineConfig {
        max_steps_per_operation: 4,
        broadcast_failure_policy: BroadcastPolicy::FailFast,
        ..EngineConfig::default()
    });
    h.deploy(ALERT_CHAIN);
    h.deploy(SIGNAL_CATCH);
    start(&h, "alertChain").await;
    let untouched = start(&h, "signalCatch").await;

    let err = h
        .runtime
        .correlation()
        .dispatch_signal("alert", None, BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
    assert_eq!(
        h.runtime.active_activity_ids(&untouched).await.unwrap(),
        vec!["waitAlert".to_string()]
    );
}
