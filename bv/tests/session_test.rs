//! Integration tests for the session coordinator
//!
//! Each test spawns the real worker thread against the in-process simulated
//! broker and observes it only through the caller-facing handle and the
//! notification bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use brokerview::session::{
    CallerHandle, ConnectionState, DEFAULT_AGENT_FILTER, NotificationBus, QueryKind, SessionConfig, SessionCoordinator,
    SessionHandle, SessionNotification,
};
use brokerview::transport::sim::{BROKER_OBJECT_NAME, IssuedRequest, SimulatedBroker};
use brokerview::transport::{AgentInfo, CorrelationId, ObjectAddress, QueryEvent, QueryTarget, SessionEvent};
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    broker: SimulatedBroker,
    coordinator: SessionCoordinator,
    handle: SessionHandle,
    rx: broadcast::Receiver<SessionNotification>,
}

impl Harness {
    fn start() -> Self {
        Self::start_with(SessionConfig {
            poll_interval_ms: 50,
            command_wait_ms: 50,
            ..Default::default()
        })
    }

    /// Subscribe before the worker starts so nothing it emits is missed
    fn start_with(config: SessionConfig) -> Self {
        let broker = SimulatedBroker::new();
        let bus = NotificationBus::new(config.notification_capacity);
        let rx = bus.subscribe();
        let coordinator = SessionCoordinator::spawn_with_bus(config, Arc::new(broker.transport()), bus)
            .expect("Failed to spawn coordinator");
        let handle = coordinator.handle();
        Self {
            broker,
            coordinator,
            handle,
            rx,
        }
    }

    /// Connect and wait until the broker agent has been discovered
    async fn connect(&mut self) -> Vec<SessionNotification> {
        self.handle.request_connect("broker.test:5672", "", "");
        self.broker.announce_broker_agent();
        let seen = self.until(|n| matches!(n, SessionNotification::ConnectedChanged { connected: true })).await;
        assert!(self.handle.snapshot().is_ready());
        seen
    }

    /// Collect notifications up to and including the first one matching `done`
    async fn until<F>(&mut self, mut done: F) -> Vec<SessionNotification>
    where
        F: FnMut(&SessionNotification) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        let mut seen = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Ok(notification)) => {
                    let stop = done(&notification);
                    seen.push(notification);
                    if stop {
                        return seen;
                    }
                }
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) | Err(_) => {
                    let types: Vec<&str> = seen.iter().map(|n| n.notification_type()).collect();
                    panic!("Timed out waiting for notification; saw {types:?}");
                }
            }
        }
    }

    /// Everything already delivered, without waiting
    fn drain(&mut self) -> Vec<SessionNotification> {
        let mut seen = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(notification) => seen.push(notification),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return seen,
            }
        }
    }

    async fn next_request(&self) -> IssuedRequest {
        self.broker
            .next_request(WAIT)
            .await
            .expect("Coordinator did not issue a request")
    }

    fn shutdown(self) {
        self.coordinator.cancel_and_join().expect("Worker did not stop cleanly");
    }
}

fn statuses(notifications: &[SessionNotification]) -> Vec<String> {
    notifications
        .iter()
        .filter_map(|n| match n {
            SessionNotification::ConnectionStatus { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn transitions(notifications: &[SessionNotification]) -> Vec<(ConnectionState, ConnectionState)> {
    notifications
        .iter()
        .filter_map(|n| match n {
            SessionNotification::StateChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

fn resolved_for(notifications: &[SessionNotification], caller: &CallerHandle) -> Vec<QueryEvent> {
    notifications
        .iter()
        .filter_map(|n| match n {
            SessionNotification::QueryResolved { caller: c, event } if c.same_caller(caller) => Some(event.clone()),
            _ => None,
        })
        .collect()
}

/// Poll `check` until it holds or the wait runs out
async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    while started.elapsed() < WAIT {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// =============================================================================
// Connection lifecycle
// =============================================================================

#[tokio::test]
async fn test_connect_reports_status_then_connected() {
    let mut h = Harness::start();

    let seen = h.connect().await;

    assert_eq!(
        statuses(&seen),
        vec![
            "Closed".to_string(),
            "Connection opening...".to_string(),
            "Connection opened".to_string(),
            "Operational (URL: broker.test:5672)".to_string(),
        ]
    );
    assert!(matches!(
        seen.last(),
        Some(SessionNotification::ConnectedChanged { connected: true })
    ));
    assert_eq!(
        transitions(&seen),
        vec![
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Connected),
        ]
    );
    assert_eq!(h.broker.last_address().as_deref(), Some("broker.test:5672"));
    assert_eq!(h.broker.agent_filter().as_deref(), Some(DEFAULT_AGENT_FILTER));
    assert_eq!(h.handle.snapshot().broker_agent.as_deref(), Some(h.broker.agent_name()));

    h.shutdown();
}

#[tokio::test]
async fn test_worker_reports_closed_before_any_command() {
    let mut h = Harness::start();

    let first = h.until(|_| true).await;

    assert!(matches!(
        first.as_slice(),
        [SessionNotification::ConnectionStatus { text }] if text == "Closed"
    ));
    assert_eq!(h.handle.state(), ConnectionState::Disconnected);

    h.shutdown();
}

#[tokio::test]
async fn test_connect_localhost_shortcut() {
    let mut h = Harness::start();

    h.handle.request_connect_localhost();
    h.until(|n| matches!(n, SessionNotification::ConnectionStatus { text } if text.starts_with("Operational")))
        .await;

    assert_eq!(h.broker.last_address().as_deref(), Some("localhost"));
    assert_eq!(h.handle.snapshot().address.as_deref(), Some("localhost"));

    h.shutdown();
}

#[tokio::test]
async fn test_disconnect_reports_status_and_closes_handles() {
    let mut h = Harness::start();
    h.connect().await;

    h.handle.request_disconnect();
    let seen = h
        .until(|n| matches!(n, SessionNotification::ConnectedChanged { connected: false }))
        .await;

    assert_eq!(
        statuses(&seen),
        vec![
            "Session closing...".to_string(),
            "Connection closing...".to_string(),
            "Closed".to_string(),
        ]
    );
    assert_eq!(
        transitions(&seen),
        vec![
            (ConnectionState::Connected, ConnectionState::Disconnecting),
            (ConnectionState::Disconnecting, ConnectionState::Disconnected),
        ]
    );
    assert_eq!(h.handle.state(), ConnectionState::Disconnected);
    assert_eq!(h.broker.sessions_closed(), 1);
    assert_eq!(h.broker.connections_closed(), 1);

    h.shutdown();
}

#[tokio::test]
async fn test_commands_processed_fifo_without_skipping_states() {
    let mut h = Harness::start();

    // Connect while connected and disconnect while disconnected are ignored
    h.handle.request_connect("a", "", "");
    h.handle.request_connect("b", "", "");
    h.handle.request_disconnect();
    h.handle.request_disconnect();
    h.handle.request_connect("c", "", "");
    h.handle.request_disconnect();

    let mut disconnects = 0;
    let seen = h
        .until(|n| {
            if matches!(
                n,
                SessionNotification::StateChanged {
                    to: ConnectionState::Disconnected,
                    from: ConnectionState::Disconnecting
                }
            ) {
                disconnects += 1;
            }
            disconnects == 2
        })
        .await;

    let steps = transitions(&seen);
    assert_eq!(steps.len(), 8);
    for (from, to) in &steps {
        assert!(from.can_transition_to(*to), "skipped a state: {from} -> {to}");
    }
    for pair in steps.windows(2) {
        assert_eq!(pair[0].1, pair[1].0, "transitions must chain");
    }
    assert_eq!(h.broker.connect_attempts(), 2);
    assert_eq!(h.broker.last_address().as_deref(), Some("c"));
    assert!(eventually(|| h.handle.queued_commands() == 0).await);

    h.shutdown();
}

#[tokio::test]
async fn test_connect_failure_then_reconnect() {
    let mut h = Harness::start();
    h.broker.fail_next_connect("connection refused");

    h.handle.request_connect("broker.test", "", "");
    let seen = h
        .until(|n| {
            matches!(
                n,
                SessionNotification::StateChanged {
                    to: ConnectionState::Disconnected,
                    ..
                }
            )
        })
        .await;

    assert_eq!(
        statuses(&seen),
        vec![
            "Closed".to_string(),
            "Connection opening...".to_string(),
            "Session failed: connection refused".to_string(),
        ]
    );
    assert_eq!(h.handle.state(), ConnectionState::Disconnected);
    assert_eq!(h.handle.snapshot().metrics.connect_failures, 1);

    h.connect().await;
    assert_eq!(h.broker.connect_attempts(), 2);

    h.shutdown();
}

#[test]
fn test_cancel_and_join_while_disconnected() {
    let config = SessionConfig {
        command_wait_ms: 100,
        ..Default::default()
    };
    let broker = SimulatedBroker::new();
    let coordinator = SessionCoordinator::spawn(config, Arc::new(broker.transport())).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    coordinator.cancel_and_join().unwrap();

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(broker.connect_attempts(), 0);
    assert_eq!(broker.sessions_closed(), 0);
    assert_eq!(broker.connections_closed(), 0);
}

#[tokio::test]
async fn test_cancel_and_join_closes_open_session() {
    let mut h = Harness::start();
    h.connect().await;
    let broker = h.broker.clone();

    h.shutdown();

    assert_eq!(broker.sessions_closed(), 1);
    assert_eq!(broker.connections_closed(), 1);
}

// =============================================================================
// Queries
// =============================================================================

#[tokio::test]
async fn test_streaming_query_resolves_three_times() {
    let mut h = Harness::start();
    h.connect().await;
    h.broker.set_next_correlation_id(42);

    let caller_a = CallerHandle::new("caller-a");
    assert!(h.handle.submit_streaming_query("queue", caller_a.clone()));

    match h.next_request().await {
        IssuedRequest::Query {
            correlation_id,
            agent,
            target: QueryTarget::Class { package, class_name },
        } => {
            assert_eq!(correlation_id, CorrelationId(42));
            assert_eq!(agent.name, h.broker.agent_name());
            assert_eq!(package, "org.apache.qpid.broker");
            assert_eq!(class_name, "queue");
        }
        other => panic!("Expected class query, got {other:?}"),
    }

    h.broker.respond(QueryEvent::partial(42, vec![json!({"name": "q1"})]));
    h.broker.respond(QueryEvent::partial(42, vec![json!({"name": "q2"})]));
    h.broker.respond(QueryEvent::complete(42, vec![json!({"name": "q3"})]));

    let mut count = 0;
    let seen = h
        .until(|n| {
            if matches!(n, SessionNotification::QueryResolved { .. }) {
                count += 1;
            }
            count == 3
        })
        .await;

    let events = resolved_for(&seen, &caller_a);
    assert_eq!(events.len(), 3);
    assert_eq!(
        events.iter().map(|e| e.is_final).collect::<Vec<_>>(),
        vec![false, false, true]
    );
    assert!(events.iter().all(|e| e.correlation_id == CorrelationId(42) && e.has_payload()));
    assert!(!h.handle.is_pending(CorrelationId(42)));
    assert_eq!(h.handle.pending_count(), 0);

    h.shutdown();
}

#[tokio::test]
async fn test_query_issued_is_announced_before_responses() {
    let mut h = Harness::start();
    h.connect().await;
    h.broker.set_next_correlation_id(5);

    let caller = CallerHandle::new(String::from("details"));
    assert!(h
        .handle
        .submit_object_query(ObjectAddress::new(h.broker.agent_name(), "queue:orders"), caller.clone()));

    let seen = h.until(|n| matches!(n, SessionNotification::QueryIssued { .. })).await;
    match seen.last() {
        Some(SessionNotification::QueryIssued {
            caller: c,
            correlation_id,
            kind,
        }) => {
            assert!(c.same_caller(&caller));
            assert_eq!(*correlation_id, CorrelationId(5));
            assert_eq!(*kind, QueryKind::SingleObject);
        }
        other => panic!("Expected QueryIssued, got {other:?}"),
    }
    assert!(h.handle.is_pending(CorrelationId(5)));

    // A single-object query completes on its first response even if not flagged final
    h.broker.respond(QueryEvent::partial(5, vec![json!({"name": "orders"})]));
    let seen = h.until(|n| matches!(n, SessionNotification::QueryResolved { .. })).await;
    let events = resolved_for(&seen, &caller);
    assert_eq!(events.len(), 1);
    assert!(events[0].is_final);
    assert_eq!(caller.downcast_ref::<String>().map(String::as_str), Some("details"));
    assert!(!h.handle.is_pending(CorrelationId(5)));

    h.shutdown();
}

#[tokio::test]
async fn test_method_call_resolves_on_first_response() {
    let mut h = Harness::start();
    h.connect().await;

    let caller = CallerHandle::new("purge-button");
    let mut arguments = serde_json::Map::new();
    arguments.insert("request".to_string(), json!(0));
    let address = ObjectAddress::new(h.broker.agent_name(), "queue:scratch");
    assert!(h.handle.submit_method_call("purge", arguments.clone(), address.clone(), caller.clone()));

    let id = match h.next_request().await {
        IssuedRequest::Method {
            correlation_id, call, ..
        } => {
            assert_eq!(call.method, "purge");
            assert_eq!(call.arguments, arguments);
            assert_eq!(call.address, address);
            correlation_id
        }
        other => panic!("Expected method call, got {other:?}"),
    };

    h.broker.respond_method(QueryEvent::partial(id, vec![json!({"status": "OK"})]));
    let seen = h.until(|n| matches!(n, SessionNotification::QueryResolved { .. })).await;

    let events = resolved_for(&seen, &caller);
    assert_eq!(events.len(), 1);
    assert!(events[0].is_final);
    assert!(!h.handle.is_pending(id));

    h.shutdown();
}

#[tokio::test]
async fn test_broker_method_call_targets_discovered_broker_object() {
    let mut h = Harness::start();
    h.connect().await;
    assert!(eventually(|| h.handle.broker_object().is_some()).await);

    let broker_object = ObjectAddress::new(h.broker.agent_name(), BROKER_OBJECT_NAME);
    assert_eq!(h.handle.snapshot().broker_object, Some(broker_object.clone()));

    let caller = CallerHandle::new("queue-ids");
    let mut arguments = serde_json::Map::new();
    arguments.insert("queue".to_string(), json!("orders"));
    assert!(h.handle.submit_broker_method_call("queueGetIdList", arguments.clone(), caller.clone()));

    let id = match h.next_request().await {
        IssuedRequest::Method {
            correlation_id, call, ..
        } => {
            assert_eq!(call.method, "queueGetIdList");
            assert_eq!(call.arguments, arguments);
            assert_eq!(call.address, broker_object);
            correlation_id
        }
        other => panic!("Expected method call, got {other:?}"),
    };

    h.broker.respond_method(QueryEvent::complete(id, vec![json!({"ids": [1, 2, 3]})]));
    let seen = h.until(|n| matches!(n, SessionNotification::QueryResolved { .. })).await;
    assert_eq!(resolved_for(&seen, &caller).len(), 1);

    // The lookup itself is never reported as a caller's query
    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.metrics.queries_issued, 1);
    assert_eq!(snapshot.metrics.unmatched_responses, 0);

    h.shutdown();
}

#[tokio::test]
async fn test_submit_refused_when_not_ready() {
    let mut h = Harness::start();
    let caller = CallerHandle::new(());

    assert!(!h.handle.submit_streaming_query("queue", caller.clone()));

    // Session open but broker agent not yet discovered
    h.handle.request_connect("broker.test", "", "");
    h.until(|n| matches!(n, SessionNotification::ConnectionStatus { text } if text.starts_with("Operational")))
        .await;
    assert_eq!(h.handle.state(), ConnectionState::Connected);
    assert!(!h.handle.submit_streaming_query("queue", caller.clone()));

    assert!(h.broker.next_request(Duration::from_millis(100)).await.is_none());
    assert_eq!(h.handle.pending_count(), 0);

    h.shutdown();
}

#[tokio::test]
async fn test_rejected_query_reports_error() {
    let mut h = Harness::start();
    h.connect().await;
    h.broker.reject_next_request("no such class");

    assert!(h.handle.submit_streaming_query("widget", CallerHandle::new(())));
    let seen = h.until(|n| matches!(n, SessionNotification::Error { .. })).await;

    assert!(matches!(
        seen.last(),
        Some(SessionNotification::Error { message }) if message.contains("no such class")
    ));
    assert_eq!(h.handle.pending_count(), 0);
    assert_eq!(h.handle.state(), ConnectionState::Connected);

    h.shutdown();
}

#[tokio::test]
async fn test_cancelled_query_is_never_routed() {
    let mut h = Harness::start();
    h.connect().await;

    let caller = CallerHandle::new("cancel-me");
    assert!(h.handle.submit_streaming_query("queue", caller.clone()));
    let id = h.next_request().await.correlation_id();
    assert!(eventually(|| h.handle.is_pending(id)).await);

    assert!(h.handle.cancel_query(id));
    assert!(!h.handle.cancel_query(id));

    h.broker.respond(QueryEvent::complete(id, vec![json!({"name": "late"})]));
    assert!(eventually(|| h.handle.snapshot().metrics.unmatched_responses == 1).await);
    assert!(resolved_for(&h.drain(), &caller).is_empty());

    h.shutdown();
}

#[tokio::test]
async fn test_unmatched_response_is_dropped_silently() {
    let mut h = Harness::start();
    h.connect().await;

    h.broker.respond(QueryEvent::complete(9999, vec![json!({})]));
    assert!(eventually(|| h.handle.snapshot().metrics.unmatched_responses == 1).await);

    let seen = h.drain();
    assert!(!seen.iter().any(|n| matches!(n, SessionNotification::QueryResolved { .. })));
    assert!(!seen.iter().any(|n| matches!(n, SessionNotification::Error { .. })));
    assert_eq!(h.handle.state(), ConnectionState::Connected);

    h.shutdown();
}

// =============================================================================
// Disconnect sweep and drain rule
// =============================================================================

#[tokio::test]
async fn test_disconnect_before_response_sweeps_object_query() {
    let mut h = Harness::start();
    h.connect().await;

    let caller_b = CallerHandle::new("caller-b");
    assert!(h
        .handle
        .submit_object_query(ObjectAddress::new(h.broker.agent_name(), "queue:orders"), caller_b.clone()));
    h.handle.request_disconnect();

    let seen = h
        .until(|n| matches!(n, SessionNotification::ConnectedChanged { connected: false }))
        .await;

    assert!(resolved_for(&seen, &caller_b).is_empty());
    assert_eq!(h.handle.pending_count(), 0);
    assert_eq!(h.handle.state(), ConnectionState::Disconnected);

    h.shutdown();
}

#[tokio::test]
async fn test_disconnect_sweeps_every_outstanding_query() {
    let mut h = Harness::start();
    h.connect().await;

    for n in 0..3 {
        let address = ObjectAddress::new(h.broker.agent_name(), format!("queue:q{n}"));
        assert!(h.handle.submit_object_query(address, CallerHandle::new(n)));
        h.next_request().await;
    }
    assert!(eventually(|| h.handle.pending_count() == 3).await);

    h.handle.request_disconnect();
    h.until(|n| matches!(n, SessionNotification::ConnectedChanged { connected: false }))
        .await;

    assert_eq!(h.handle.pending_count(), 0);
    assert_eq!(h.handle.snapshot().metrics.pending_swept, 3);

    h.shutdown();
}

#[tokio::test]
async fn test_disconnect_waits_for_streaming_queries() {
    let mut h = Harness::start();
    h.connect().await;

    let caller = CallerHandle::new("exchanges");
    assert!(h.handle.submit_streaming_query("exchange", caller.clone()));
    let id = h.next_request().await.correlation_id();
    assert!(eventually(|| h.handle.is_pending(id)).await);

    h.handle.request_disconnect();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.handle.state(), ConnectionState::Connected);
    assert_eq!(h.handle.queued_commands(), 1);

    h.broker.respond(QueryEvent::partial(id, vec![json!({"name": "amq.direct"})]));
    h.broker.respond(QueryEvent::complete(id, vec![]));
    let seen = h
        .until(|n| matches!(n, SessionNotification::ConnectedChanged { connected: false }))
        .await;

    let final_at = seen
        .iter()
        .position(|n| matches!(n, SessionNotification::QueryResolved { event, .. } if event.is_final))
        .expect("final event routed");
    let closing_at = seen
        .iter()
        .position(|n| {
            matches!(
                n,
                SessionNotification::StateChanged {
                    to: ConnectionState::Disconnecting,
                    ..
                }
            )
        })
        .expect("disconnect started");
    assert!(final_at < closing_at);
    assert_eq!(resolved_for(&seen, &caller).len(), 2);

    h.shutdown();
}

#[tokio::test]
async fn test_transport_failure_is_implicit_disconnect() {
    let mut h = Harness::start();
    h.connect().await;

    let caller = CallerHandle::new("abandoned");
    assert!(h.handle.submit_streaming_query("queue", caller.clone()));
    let id = h.next_request().await.correlation_id();
    assert!(eventually(|| h.handle.is_pending(id)).await);

    h.broker.drop_connection("peer reset");
    let seen = h
        .until(|n| matches!(n, SessionNotification::ConnectedChanged { connected: false }))
        .await;

    assert_eq!(
        statuses(&seen),
        vec!["Connection lost: peer reset".to_string(), "Closed".to_string()]
    );
    assert_eq!(
        transitions(&seen),
        vec![
            (ConnectionState::Connected, ConnectionState::Disconnecting),
            (ConnectionState::Disconnecting, ConnectionState::Disconnected),
        ]
    );
    assert!(resolved_for(&seen, &caller).is_empty());
    assert_eq!(h.handle.pending_count(), 0);

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert_eq!(snapshot.metrics.connection_losses, 1);
    assert!(snapshot.broker_agent.is_none());

    // The coordinator keeps serving connect commands
    h.connect().await;

    h.shutdown();
}

// =============================================================================
// Events
// =============================================================================

#[tokio::test]
async fn test_exception_reports_error_without_disconnecting() {
    let mut h = Harness::start();
    h.connect().await;

    h.broker.raise_exception(None, "queue 'ghost' not found");
    let seen = h.until(|n| matches!(n, SessionNotification::Error { .. })).await;

    assert!(matches!(
        seen.last(),
        Some(SessionNotification::Error { message }) if message == "queue 'ghost' not found"
    ));
    assert_eq!(h.handle.state(), ConnectionState::Connected);
    assert!(h.handle.snapshot().is_ready());

    h.shutdown();
}

#[tokio::test]
async fn test_exception_for_pending_query_resolves_it() {
    let mut h = Harness::start();
    h.connect().await;

    let caller = CallerHandle::new("delete-button");
    let address = ObjectAddress::new(h.broker.agent_name(), "queue:locked");
    assert!(h.handle.submit_method_call("delete", serde_json::Map::new(), address, caller.clone()));
    let id = h.next_request().await.correlation_id();
    assert!(eventually(|| h.handle.is_pending(id)).await);

    h.broker.raise_exception(Some(id), "permission denied");
    let seen = h.until(|n| matches!(n, SessionNotification::QueryResolved { .. })).await;

    let events = resolved_for(&seen, &caller);
    assert_eq!(events.len(), 1);
    assert!(events[0].is_final);
    assert_eq!(events[0].error.as_deref(), Some("permission denied"));
    assert!(seen.iter().any(|n| matches!(n, SessionNotification::Error { .. })));
    assert!(!h.handle.is_pending(id));

    h.shutdown();
}

#[tokio::test]
async fn test_foreign_agents_are_ignored() {
    let mut h = Harness::start();
    h.handle.request_connect("broker.test", "", "");
    h.broker.push(SessionEvent::AgentAdded(AgentInfo::new("com.example:console:1")));
    h.until(|n| matches!(n, SessionNotification::ConnectionStatus { text } if text.starts_with("Operational")))
        .await;

    assert!(eventually(|| h.handle.snapshot().metrics.events_received == 1).await);
    assert!(!h.handle.snapshot().is_ready());
    assert!(!h.drain().iter().any(|n| matches!(n, SessionNotification::ConnectedChanged { .. })));

    h.shutdown();
}

#[tokio::test]
async fn test_broker_agent_removed_refuses_queries() {
    let mut h = Harness::start();
    h.connect().await;

    h.broker
        .push(SessionEvent::AgentRemoved(AgentInfo::new(h.broker.agent_name())));
    assert!(eventually(|| h.handle.snapshot().broker_agent.is_none()).await);

    assert_eq!(h.handle.state(), ConnectionState::Connected);
    assert!(!h.handle.submit_streaming_query("queue", CallerHandle::new(())));
    assert!(h.handle.broker_object().is_none());
    assert!(!h.handle.submit_broker_method_call("queueGetIdList", serde_json::Map::new(), CallerHandle::new(())));

    h.shutdown();
}

#[tokio::test]
async fn test_broker_agent_readded_flips_connected() {
    let mut h = Harness::start();
    h.connect().await;
    let agent = AgentInfo::new(h.broker.agent_name());
    let flipped = |n: &SessionNotification| matches!(n, SessionNotification::ConnectedChanged { .. });

    h.broker.push(SessionEvent::AgentRemoved(agent.clone()));
    let removed = h.until(flipped).await;
    assert!(matches!(
        removed.last(),
        Some(SessionNotification::ConnectedChanged { connected: false })
    ));
    assert!(h.handle.broker_object().is_none());

    h.broker.push(SessionEvent::AgentAdded(agent));
    let readded = h.until(flipped).await;
    assert!(matches!(
        readded.last(),
        Some(SessionNotification::ConnectedChanged { connected: true })
    ));
    assert!(eventually(|| h.handle.broker_object().is_some()).await);

    h.handle.request_disconnect();
    let closed = h.until(flipped).await;
    assert!(matches!(
        closed.last(),
        Some(SessionNotification::ConnectedChanged { connected: false })
    ));

    h.shutdown();
}

#[tokio::test]
async fn test_idle_ticks_and_pause() {
    let mut h = Harness::start();
    h.connect().await;

    let mut ticks = 0;
    h.until(|n| {
        if matches!(n, SessionNotification::IdleTick) {
            ticks += 1;
        }
        ticks == 3
    })
    .await;

    h.handle.pause_refreshes(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.drain();
    let suppressed_before = h.handle.snapshot().metrics.idle_ticks_suppressed;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!h.drain().iter().any(|n| matches!(n, SessionNotification::IdleTick)));
    assert!(h.handle.snapshot().metrics.idle_ticks_suppressed > suppressed_before);

    h.handle.pause_refreshes(false);
    h.until(|n| matches!(n, SessionNotification::IdleTick)).await;

    h.shutdown();
}

#[tokio::test]
async fn test_idle_tick_count_matches_elapsed_intervals() {
    let mut h = Harness::start_with(SessionConfig {
        poll_interval_ms: 100,
        command_wait_ms: 50,
        ..Default::default()
    });
    h.connect().await;
    assert!(eventually(|| h.handle.broker_object().is_some()).await);
    h.drain();

    // About ten quiet intervals
    tokio::time::sleep(Duration::from_millis(1050)).await;
    let ticks = h
        .drain()
        .iter()
        .filter(|n| matches!(n, SessionNotification::IdleTick))
        .count();

    assert!((9..=11).contains(&ticks), "expected 10 +/- 1 idle ticks, got {ticks}");

    h.shutdown();
}

#[tokio::test]
async fn test_wait_helpers_follow_snapshot() {
    let h = Harness::start();

    assert!(!h.handle.wait_until_ready(Duration::from_millis(100)).await);

    h.handle.request_connect("broker.test", "", "");
    h.broker.announce_broker_agent();
    assert!(h.handle.wait_until_ready(WAIT).await);

    h.handle.request_disconnect();
    assert!(h.handle.wait_for_state(ConnectionState::Disconnected, WAIT).await);

    h.shutdown();
}
