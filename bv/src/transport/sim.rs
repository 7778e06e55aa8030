//! In-process simulated broker
//!
//! [`SimulatedBroker`] is the controlling side: tests push events into it, inject
//! failures, and observe the requests the coordinator issued. [`SimulatedTransport`]
//! is the [`Transport`] handed to the coordinator. All sessions opened through the
//! transport read from the same event stream, so events pushed before a session
//! exists are delivered to the next one.
//!
//! Queries for the `broker` class are answered by the session itself with
//! [`SimulatedBroker::broker_row`] and are not recorded as issued requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{
    AgentInfo, BrokerConnection, BrokerSession, CorrelationId, MethodCall, OBJECT_NAME_PROPERTY, QueryEvent,
    QueryTarget, SessionEvent, Transport, TransportError,
};

/// Name the simulated broker reports for its own management agent
pub const DEFAULT_BROKER_AGENT: &str = "org.apache.qpid.broker:qpidd:sim";

/// Object name of the simulated broker's own `broker` object
pub const BROKER_OBJECT_NAME: &str = "org.apache.qpid.broker:broker:amqp-broker";

/// A request the coordinator issued against a simulated session
#[derive(Debug, Clone, PartialEq)]
pub enum IssuedRequest {
    Query {
        correlation_id: CorrelationId,
        agent: AgentInfo,
        target: QueryTarget,
    },
    Method {
        correlation_id: CorrelationId,
        agent: AgentInfo,
        call: MethodCall,
    },
}

impl IssuedRequest {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            IssuedRequest::Query { correlation_id, .. } | IssuedRequest::Method { correlation_id, .. } => {
                *correlation_id
            }
        }
    }
}

enum SimItem {
    Event(SessionEvent),
    Fail(String),
}

struct SimInner {
    agent_name: String,
    events_tx: mpsc::UnboundedSender<SimItem>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SimItem>>,
    requests_tx: mpsc::UnboundedSender<IssuedRequest>,
    requests_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<IssuedRequest>>,
    next_id: AtomicU64,
    connect_failure: Mutex<Option<String>>,
    request_failure: Mutex<Option<String>>,
    last_address: Mutex<Option<String>>,
    agent_filter: Mutex<Option<String>>,
    connect_attempts: AtomicUsize,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    connections_closed: AtomicUsize,
}

/// Controlling handle for the simulated broker
#[derive(Clone)]
pub struct SimulatedBroker {
    inner: Arc<SimInner>,
}

impl SimulatedBroker {
    /// Create a broker whose management agent uses [`DEFAULT_BROKER_AGENT`]
    pub fn new() -> Self {
        Self::with_agent_name(DEFAULT_BROKER_AGENT)
    }

    pub fn with_agent_name(agent_name: impl Into<String>) -> Self {
        let agent_name = agent_name.into();
        debug!(%agent_name, "SimulatedBroker::with_agent_name: called");
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SimInner {
                agent_name,
                events_tx,
                events_rx: tokio::sync::Mutex::new(events_rx),
                requests_tx,
                requests_rx: tokio::sync::Mutex::new(requests_rx),
                next_id: AtomicU64::new(1),
                connect_failure: Mutex::new(None),
                request_failure: Mutex::new(None),
                last_address: Mutex::new(None),
                agent_filter: Mutex::new(None),
                connect_attempts: AtomicUsize::new(0),
                sessions_opened: AtomicUsize::new(0),
                sessions_closed: AtomicUsize::new(0),
                connections_closed: AtomicUsize::new(0),
            }),
        }
    }

    /// Transport to hand to the coordinator
    pub fn transport(&self) -> SimulatedTransport {
        SimulatedTransport {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.inner.agent_name
    }

    /// The row describing the broker object itself
    pub fn broker_row(&self) -> Value {
        json!({
            OBJECT_NAME_PROPERTY: BROKER_OBJECT_NAME,
            "name": "amqp-broker",
            "port": 5672,
            "agent": self.inner.agent_name,
        })
    }

    /// Deliver an arbitrary event to the current (or next) session
    pub fn push(&self, event: SessionEvent) {
        debug!(kind = event.kind(), "SimulatedBroker::push: called");
        let _ = self.inner.events_tx.send(SimItem::Event(event));
    }

    /// Announce the broker's own management agent
    pub fn announce_broker_agent(&self) {
        self.push(SessionEvent::AgentAdded(AgentInfo::new(self.inner.agent_name.clone())));
    }

    /// Deliver a query response
    pub fn respond(&self, event: QueryEvent) {
        self.push(SessionEvent::QueryResponse(event));
    }

    /// Deliver a method response
    pub fn respond_method(&self, event: QueryEvent) {
        self.push(SessionEvent::MethodResponse(event));
    }

    /// Deliver an exception whose first row carries `error_text`
    pub fn raise_exception(&self, correlation_id: Option<CorrelationId>, error_text: &str) {
        self.push(SessionEvent::Exception {
            correlation_id,
            rows: vec![json!({ "error_text": error_text })],
        });
    }

    /// Make the session's next event poll fail as a lost connection
    pub fn drop_connection(&self, reason: &str) {
        debug!(%reason, "SimulatedBroker::drop_connection: called");
        let _ = self.inner.events_tx.send(SimItem::Fail(reason.to_string()));
    }

    /// Make the next connect attempt fail with `reason`
    pub fn fail_next_connect(&self, reason: &str) {
        *self.inner.connect_failure.lock() = Some(reason.to_string());
    }

    /// Make the next query or method call fail with `reason`
    pub fn reject_next_request(&self, reason: &str) {
        *self.inner.request_failure.lock() = Some(reason.to_string());
    }

    /// Correlation id assigned to the next accepted request
    pub fn set_next_correlation_id(&self, id: u64) {
        self.inner.next_id.store(id, Ordering::SeqCst);
    }

    /// Wait up to `timeout` for the next request the coordinator issued
    pub async fn next_request(&self, timeout: Duration) -> Option<IssuedRequest> {
        let mut rx = self.inner.requests_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.inner.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.inner.connections_closed.load(Ordering::SeqCst)
    }

    /// Address used by the most recent connect attempt
    pub fn last_address(&self) -> Option<String> {
        self.inner.last_address.lock().clone()
    }

    /// Agent filter applied by the most recent session
    pub fn agent_filter(&self) -> Option<String> {
        self.inner.agent_filter.lock().clone()
    }

    /// Answer every issued request from a canned catalog until the returned task is aborted
    ///
    /// Class queries are answered one row per non-final event followed by an empty
    /// final event; object queries and method calls get a single final event.
    pub fn serve_catalog(&self, catalog: HashMap<String, Vec<Value>>) -> JoinHandle<()> {
        debug!(classes = catalog.len(), "SimulatedBroker::serve_catalog: called");
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                let request = {
                    let mut rx = broker.inner.requests_rx.lock().await;
                    rx.recv().await
                };
                let Some(request) = request else {
                    break;
                };
                match request {
                    IssuedRequest::Query {
                        correlation_id,
                        target: QueryTarget::Class { class_name, .. },
                        ..
                    } => {
                        for row in catalog.get(&class_name).cloned().unwrap_or_default() {
                            broker.respond(QueryEvent::partial(correlation_id, vec![row]));
                        }
                        broker.respond(QueryEvent::complete(correlation_id, vec![]));
                    }
                    IssuedRequest::Query {
                        correlation_id,
                        target: QueryTarget::Object { address },
                        ..
                    } => {
                        let row = json!({ "name": address.name, "agent": address.agent_name });
                        broker.respond(QueryEvent::complete(correlation_id, vec![row]));
                    }
                    IssuedRequest::Method { correlation_id, call, .. } => {
                        let row = json!({ "method": call.method, "status": "OK" });
                        broker.respond_method(QueryEvent::complete(correlation_id, vec![row]));
                    }
                }
            }
        })
    }

    fn take_request_failure(&self) -> Option<String> {
        self.inner.request_failure.lock().take()
    }

    fn record(&self, request: IssuedRequest) {
        let _ = self.inner.requests_tx.send(request);
    }
}

impl Default for SimulatedBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Transport`] backed by a [`SimulatedBroker`]
pub struct SimulatedTransport {
    inner: Arc<SimInner>,
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn connect(&self, address: &str, options: &str) -> Result<Box<dyn BrokerConnection>, TransportError> {
        debug!(%address, %options, "SimulatedTransport::connect: called");
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        *self.inner.last_address.lock() = Some(address.to_string());

        if let Some(reason) = self.inner.connect_failure.lock().take() {
            debug!(%reason, "SimulatedTransport::connect: injected failure");
            return Err(TransportError::ConnectFailed(reason));
        }

        Ok(Box::new(SimConnection {
            broker: SimulatedBroker {
                inner: Arc::clone(&self.inner),
            },
            open: true,
        }))
    }
}

struct SimConnection {
    broker: SimulatedBroker,
    open: bool,
}

#[async_trait]
impl BrokerConnection for SimConnection {
    async fn open_session(&mut self, options: &str) -> Result<Box<dyn BrokerSession>, TransportError> {
        debug!(%options, "SimConnection::open_session: called");
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.broker.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimSession {
            broker: self.broker.clone(),
            open: true,
        }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!("SimConnection::close: called");
        if self.open {
            self.open = false;
            self.broker.inner.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct SimSession {
    broker: SimulatedBroker,
    open: bool,
}

impl SimSession {
    fn accept(&mut self) -> Result<CorrelationId, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        if let Some(reason) = self.broker.take_request_failure() {
            return Err(TransportError::Rejected(reason));
        }
        Ok(CorrelationId(self.broker.inner.next_id.fetch_add(1, Ordering::SeqCst)))
    }
}

#[async_trait]
impl BrokerSession for SimSession {
    fn set_agent_filter(&mut self, filter: &str) -> Result<(), TransportError> {
        *self.broker.inner.agent_filter.lock() = Some(filter.to_string());
        Ok(())
    }

    fn broker_agent_name(&self) -> Option<String> {
        Some(self.broker.inner.agent_name.clone())
    }

    async fn next_event(&mut self, timeout: Duration) -> Result<Option<SessionEvent>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let mut rx = self.broker.inner.events_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(TransportError::Closed),
            Ok(Some(SimItem::Event(event))) => Ok(Some(event)),
            Ok(Some(SimItem::Fail(reason))) => {
                self.open = false;
                Err(TransportError::ConnectionLost(reason))
            }
        }
    }

    async fn query(&mut self, agent: &AgentInfo, target: &QueryTarget) -> Result<CorrelationId, TransportError> {
        let correlation_id = self.accept()?;
        debug!(%correlation_id, agent = %agent.name, ?target, "SimSession::query: accepted");
        if let QueryTarget::Class { class_name, .. } = target
            && class_name == "broker"
        {
            let row = self.broker.broker_row();
            self.broker.respond(QueryEvent::complete(correlation_id, vec![row]));
            return Ok(correlation_id);
        }
        self.broker.record(IssuedRequest::Query {
            correlation_id,
            agent: agent.clone(),
            target: target.clone(),
        });
        Ok(correlation_id)
    }

    async fn call_method(&mut self, agent: &AgentInfo, call: &MethodCall) -> Result<CorrelationId, TransportError> {
        let correlation_id = self.accept()?;
        debug!(%correlation_id, agent = %agent.name, method = %call.method, "SimSession::call_method: accepted");
        self.broker.record(IssuedRequest::Method {
            correlation_id,
            agent: agent.clone(),
            call: call.clone(),
        });
        Ok(correlation_id)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!("SimSession::close: called");
        if self.open {
            self.open = false;
            self.broker.inner.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
