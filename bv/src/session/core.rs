//! Session coordinator worker loop
//!
//! The worker owns the broker connection and session outright. Callers reach it
//! only through [`Shared`] (command queue, pending table, flags) and the query
//! request channel; everything it learns goes back out on the notification bus
//! and the snapshot watch channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, info, warn};

use super::command::{Command, CommandQueue};
use super::config::SessionConfig;
use super::messages::QueryRequest;
use super::notify::NotificationBus;
use super::pending::PendingQueryTable;
use super::state::{ConnectionState, SessionMetrics, SessionSnapshot};
use crate::transport::{
    AgentInfo, BrokerConnection, BrokerSession, CorrelationId, ObjectAddress, QueryEvent, QueryTarget, SessionEvent,
    Transport, TransportError, exception_text,
};

/// Schema class of the broker's own management object
const BROKER_CLASS: &str = "broker";

/// State shared between the caller-facing handle and the worker
pub(crate) struct Shared {
    pub(crate) commands: CommandQueue,
    pub(crate) pending: PendingQueryTable,
    pub(crate) wake: Arc<Notify>,
    pub(crate) cancelled: AtomicBool,
    pub(crate) refreshes_paused: AtomicBool,
}

impl Shared {
    pub(crate) fn new() -> Self {
        let wake = Arc::new(Notify::new());
        Self {
            commands: CommandQueue::new(Arc::clone(&wake)),
            pending: PendingQueryTable::new(),
            wake,
            cancelled: AtomicBool::new(false),
            refreshes_paused: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Live connection and session; replaced wholesale on every connect
struct Link {
    connection: Box<dyn BrokerConnection>,
    session: Box<dyn BrokerSession>,
    broker_agent: Option<AgentInfo>,

    /// Outstanding lookup of the `broker` object
    broker_query: Option<CorrelationId>,

    /// Target for broker-level method calls
    broker_object: Option<ObjectAddress>,
}

/// The single worker that drives the broker session
pub(crate) struct Worker {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    requests: mpsc::UnboundedReceiver<QueryRequest>,
    bus: NotificationBus,
    snapshot: watch::Sender<SessionSnapshot>,
    state: ConnectionState,
    address: Option<String>,
    link: Option<Link>,
    metrics: SessionMetrics,

    /// Last value sent as `ConnectedChanged`
    connected_announced: bool,
}

impl Worker {
    pub(crate) fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        shared: Arc<Shared>,
        requests: mpsc::UnboundedReceiver<QueryRequest>,
        bus: NotificationBus,
        snapshot: watch::Sender<SessionSnapshot>,
    ) -> Self {
        Self {
            config,
            transport,
            shared,
            requests,
            bus,
            snapshot,
            state: ConnectionState::Disconnected,
            address: None,
            link: None,
            metrics: SessionMetrics::default(),
            connected_announced: false,
        }
    }

    /// Run until cancelled
    pub(crate) async fn run(mut self) {
        let poll_interval = self.config.poll_interval();
        let command_wait = self.config.command_wait();

        info!(?poll_interval, ?command_wait, "Session coordinator started");
        self.bus.status("Closed");
        self.publish();

        loop {
            if self.state == ConnectionState::Connected {
                self.poll_session(poll_interval).await;
                self.issue_queries().await;
            } else {
                self.wait_for_command(command_wait).await;
                self.discard_queries("not connected");
            }

            self.process_command().await;
            self.publish();

            if self.shared.is_cancelled() {
                self.shutdown().await;
                break;
            }
        }

        info!("Session coordinator stopped");
    }

    // === Event handling ===

    async fn poll_session(&mut self, poll_interval: Duration) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        let polled = tokio::select! {
            biased;
            polled = link.session.next_event(poll_interval) => polled,
            _ = self.shared.wake.notified() => {
                debug!("poll_session: woken for command or query");
                return;
            }
        };

        match polled {
            Ok(Some(event)) => {
                self.metrics.events_received += 1;
                self.dispatch(event).await;
            }
            Ok(None) => self.idle_tick(),
            Err(err) => self.connection_lost(err).await,
        }
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        debug!(kind = event.kind(), "dispatch: called");
        match event {
            SessionEvent::AgentAdded(agent) => self.agent_added(agent).await,
            SessionEvent::AgentRemoved(agent) => self.agent_removed(agent),
            SessionEvent::QueryResponse(event) | SessionEvent::MethodResponse(event) => self.route(event),
            SessionEvent::Exception { correlation_id, rows } => {
                let message = exception_text(&rows);
                if let Some(message) = &message {
                    warn!(%message, "Broker exception");
                    self.metrics.errors_reported += 1;
                    self.bus.error(message.clone());
                }
                if let Some(id) = correlation_id
                    && (self.shared.pending.contains(id) || self.is_broker_query(id))
                {
                    let text = message.unwrap_or_else(|| "broker exception".to_string());
                    self.route(QueryEvent::failed(id, text));
                }
            }
            SessionEvent::Other { kind } => debug!(%kind, "dispatch: ignoring event"),
        }
    }

    /// Adopt the broker's management agent and look up its `broker` object
    async fn agent_added(&mut self, agent: AgentInfo) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if link.session.broker_agent_name().as_deref() != Some(agent.name.as_str()) {
            debug!(agent = %agent.name, "agent_added: not the broker agent");
            return;
        }

        info!(agent = %agent.name, "Broker management agent discovered");
        let target = QueryTarget::Class {
            package: self.config.schema_package.clone(),
            class_name: BROKER_CLASS.to_string(),
        };
        let lookup = link.session.query(&agent, &target).await;
        link.broker_agent = Some(agent);
        match lookup {
            Ok(correlation_id) => {
                debug!(%correlation_id, "agent_added: broker object requested");
                link.broker_query = Some(correlation_id);
            }
            Err(err) if err.is_connection_lost() => {
                self.connection_lost(err).await;
                return;
            }
            Err(err) => warn!(error = %err, "Broker object lookup not issued"),
        }

        self.publish();
        self.announce_connected(true);
    }

    fn agent_removed(&mut self, agent: AgentInfo) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if link.broker_agent.as_ref().is_some_and(|known| known.name == agent.name) {
            warn!(agent = %agent.name, "Broker management agent removed");
            link.broker_agent = None;
            link.broker_query = None;
            link.broker_object = None;
            self.publish();
            self.announce_connected(false);
        }
    }

    fn is_broker_query(&self, correlation_id: CorrelationId) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.broker_query == Some(correlation_id))
    }

    fn route(&mut self, event: QueryEvent) {
        let correlation_id = event.correlation_id;
        if self.is_broker_query(correlation_id) {
            self.capture_broker_object(event);
            return;
        }

        let bus = &self.bus;
        let found = self
            .shared
            .pending
            .resolve(correlation_id, event, |caller, event| bus.query_resolved(caller, event));
        if found {
            self.metrics.responses_routed += 1;
        } else {
            debug!(%correlation_id, "route: dropping unmatched response");
            self.metrics.unmatched_responses += 1;
        }
    }

    fn capture_broker_object(&mut self, event: QueryEvent) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let Some(agent) = link.broker_agent.as_ref() else {
            return;
        };

        if let Some(error) = &event.error {
            warn!(%error, "Broker object lookup failed");
        }
        let found = event
            .rows
            .iter()
            .find_map(|row| ObjectAddress::from_row(agent.name.as_str(), row));
        if let Some(address) = found {
            info!(%address, "Broker object captured");
            link.broker_object = Some(address);
        }
        if event.is_final {
            link.broker_query = None;
            if link.broker_object.is_none() {
                warn!("Management agent reported no broker object");
            }
        }
        self.publish();
    }

    fn idle_tick(&mut self) {
        if self.shared.refreshes_paused.load(Ordering::SeqCst) {
            self.metrics.idle_ticks_suppressed += 1;
        } else {
            self.metrics.idle_ticks += 1;
            self.bus.idle_tick();
        }
    }

    // === Query submission ===

    async fn issue_queries(&mut self) {
        while self.state.accepts_queries() {
            let Ok(request) = self.requests.try_recv() else {
                break;
            };

            if !self.shared.commands.is_empty() {
                self.drop_request(&request, "command pending");
                continue;
            }
            let Some(link) = self.link.as_mut() else {
                self.drop_request(&request, "no session");
                continue;
            };
            let Some(agent) = link.broker_agent.clone() else {
                self.drop_request(&request, "broker agent unknown");
                continue;
            };

            let kind = request.kind();
            let result = match &request {
                QueryRequest::Query { target, .. } => link.session.query(&agent, target).await,
                QueryRequest::Method { call, .. } => link.session.call_method(&agent, call).await,
            };

            match result {
                Ok(correlation_id) => {
                    let caller = request.caller();
                    self.shared.pending.register(correlation_id, caller.clone(), kind);
                    self.metrics.queries_issued += 1;
                    debug!(%correlation_id, ?kind, "issue_queries: registered");
                    self.bus.query_issued(caller, correlation_id, kind);
                }
                Err(err) if err.is_connection_lost() => {
                    self.metrics.queries_dropped += 1;
                    self.connection_lost(err).await;
                }
                Err(err) => {
                    warn!(error = %err, ?kind, "Query rejected by transport");
                    self.metrics.queries_dropped += 1;
                    self.metrics.errors_reported += 1;
                    self.bus.error(format!("Query failed: {}", err.reason()));
                }
            }
        }
    }

    fn discard_queries(&mut self, reason: &str) {
        while let Ok(request) = self.requests.try_recv() {
            self.drop_request(&request, reason);
        }
    }

    fn drop_request(&mut self, request: &QueryRequest, reason: &str) {
        debug!(kind = ?request.kind(), %reason, "drop_request: called");
        self.metrics.queries_dropped += 1;
    }

    // === Commands ===

    async fn wait_for_command(&mut self, command_wait: Duration) {
        if !self.shared.commands.is_empty() || self.shared.is_cancelled() {
            return;
        }
        let _ = tokio::time::timeout(command_wait, self.shared.wake.notified()).await;
    }

    async fn process_command(&mut self) {
        let Some(next) = self.shared.commands.peek_front() else {
            return;
        };

        if !next.wants_connect()
            && self.state == ConnectionState::Connected
            && self.shared.pending.has_outstanding_streams()
        {
            debug!(
                pending = self.shared.pending.len(),
                "process_command: deferring disconnect until class queries drain"
            );
            return;
        }

        let Some(command) = self.shared.commands.try_dequeue_front() else {
            return;
        };

        match command {
            Command::Connect {
                address,
                connection_options,
                session_options,
            } => {
                if self.state == ConnectionState::Disconnected {
                    self.connect(address, &connection_options, &session_options).await;
                } else {
                    debug!(%address, state = %self.state, "process_command: ignoring connect");
                }
            }
            Command::Disconnect => {
                if self.state == ConnectionState::Connected {
                    self.disconnect().await;
                } else {
                    debug!(state = %self.state, "process_command: ignoring disconnect");
                }
            }
        }
    }

    async fn connect(&mut self, address: String, connection_options: &str, session_options: &str) {
        info!(%address, "Connecting to broker");
        self.address = Some(address.clone());
        self.transition(ConnectionState::Connecting);

        self.bus.status("Connection opening...");
        match self.open_link(&address, connection_options, session_options).await {
            Ok(link) => {
                self.link = Some(link);
                self.transition(ConnectionState::Connected);
                self.bus.status(format!("Operational (URL: {address})"));
                info!(%address, "Broker session operational");
            }
            Err(err) => {
                warn!(%address, error = %err, "Connect failed");
                self.metrics.connect_failures += 1;
                self.bus.status(format!("Session failed: {}", err.reason()));
                self.transition(ConnectionState::Disconnected);
            }
        }
    }

    async fn open_link(
        &self,
        address: &str,
        connection_options: &str,
        session_options: &str,
    ) -> Result<Link, TransportError> {
        let mut connection = self.transport.connect(address, connection_options).await?;
        self.bus.status("Connection opened");

        let mut session = match connection.open_session(session_options).await {
            Ok(session) => session,
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "open_link: close after failed session open");
                }
                return Err(err);
            }
        };

        if let Err(err) = session.set_agent_filter(&self.config.agent_filter) {
            debug!(error = %err, "open_link: agent filter not applied");
        }

        Ok(Link {
            connection,
            session,
            broker_agent: None,
            broker_query: None,
            broker_object: None,
        })
    }

    async fn disconnect(&mut self) {
        info!("Disconnecting from broker");
        self.transition(ConnectionState::Disconnecting);
        self.teardown(true).await;
    }

    async fn connection_lost(&mut self, err: TransportError) {
        warn!(error = %err, "Broker connection lost");
        self.metrics.connection_losses += 1;
        self.transition(ConnectionState::Disconnecting);
        self.bus.status(format!("Connection lost: {}", err.reason()));
        self.teardown(false).await;
    }

    /// Close the link, sweep pending queries, and land in `Disconnected`
    async fn teardown(&mut self, report_steps: bool) {
        if let Some(mut link) = self.link.take() {
            if report_steps {
                self.bus.status("Session closing...");
            }
            if let Err(err) = link.session.close().await {
                debug!(error = %err, "teardown: session close failed");
            }
            if report_steps {
                self.bus.status("Connection closing...");
            }
            if let Err(err) = link.connection.close().await {
                debug!(error = %err, "teardown: connection close failed");
            }
        }

        let swept = self.shared.pending.clear_all();
        if swept > 0 {
            info!(swept, "Dropped pending queries on disconnect");
            self.metrics.pending_swept += swept as u64;
        }

        self.bus.status("Closed");
        self.transition(ConnectionState::Disconnected);
        self.announce_connected(false);
    }

    async fn shutdown(&mut self) {
        if self.state == ConnectionState::Connected {
            info!("Closing broker session for shutdown");
            self.transition(ConnectionState::Disconnecting);
            self.teardown(true).await;
        }
        self.discard_queries("shutting down");
        self.publish();
    }

    // === State ===

    fn transition(&mut self, next: ConnectionState) {
        let from = self.state;
        if !from.can_transition_to(next) {
            warn!(%from, %next, "Unexpected connection state transition");
        }
        debug!(%from, %next, "transition: called");
        self.state = next;
        self.publish();
        self.bus.state_changed(from, next);
    }

    /// Emit `ConnectedChanged` only when the announced value flips
    fn announce_connected(&mut self, connected: bool) {
        if self.connected_announced != connected {
            self.connected_announced = connected;
            self.bus.connected(connected);
        }
    }

    fn publish(&self) {
        let snapshot = SessionSnapshot {
            state: self.state,
            broker_agent: self
                .link
                .as_ref()
                .and_then(|link| link.broker_agent.as_ref())
                .map(|agent| agent.name.clone()),
            broker_object: self.link.as_ref().and_then(|link| link.broker_object.clone()),
            address: self.address.clone(),
            metrics: self.metrics.clone(),
        };
        self.snapshot.send_replace(snapshot);
    }
}
