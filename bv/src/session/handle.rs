//! SessionCoordinator and SessionHandle - caller-facing API
//!
//! [`SessionCoordinator`] owns the dedicated worker thread. [`SessionHandle`] is
//! the cloneable, non-blocking interface callers use from any thread: every
//! method either enqueues work for the worker or reads shared state, and none
//! of them touch the broker connection.
//!
//! Notifications travel on a bounded broadcast channel. A subscriber that falls
//! more than `notification-capacity` notifications behind loses the oldest ones,
//! final `QueryResolved` events included, and its next `recv` reports
//! `RecvError::Lagged` with the number skipped. Callers that cannot afford the
//! loss should size the capacity accordingly or re-query after a lag.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use super::command::Command;
use super::config::SessionConfig;
use super::core::{Shared, Worker};
use super::error::SessionError;
use super::messages::QueryRequest;
use super::notify::{NotificationBus, SessionNotification};
use super::pending::{CallerHandle, QueryKind};
use super::state::{ConnectionState, SessionSnapshot};
use crate::transport::{CorrelationId, MethodCall, ObjectAddress, QueryTarget, Transport};

/// Name of the worker thread
pub const WORKER_THREAD_NAME: &str = "session-coordinator";

/// Session options used by [`SessionHandle::request_connect_localhost`]
pub const LOCALHOST_SESSION_OPTIONS: &str = "{strict-security:False}";

/// Owner of the worker thread
///
/// Dropping the coordinator cancels the worker and waits for it, the same as
/// [`SessionCoordinator::cancel_and_join`] minus the error report.
pub struct SessionCoordinator {
    handle: SessionHandle,
    thread: Option<JoinHandle<()>>,
}

impl SessionCoordinator {
    /// Start the worker thread with its own single-threaded tokio runtime
    pub fn spawn(config: SessionConfig, transport: Arc<dyn Transport>) -> Result<Self, SessionError> {
        let bus = NotificationBus::new(config.notification_capacity);
        Self::spawn_with_bus(config, transport, bus)
    }

    /// Start the worker on an existing bus
    ///
    /// Receivers subscribed to `bus` beforehand see every notification the worker
    /// emits, starting with the initial `Closed` status. The bus keeps its own
    /// capacity; `config.notification_capacity` is not consulted.
    pub fn spawn_with_bus(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        bus: NotificationBus,
    ) -> Result<Self, SessionError> {
        debug!(?config, "SessionCoordinator::spawn_with_bus: called");

        let shared = Arc::new(Shared::new());
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let handle = SessionHandle {
            shared: Arc::clone(&shared),
            requests: requests_tx,
            bus: bus.clone(),
            snapshot: snapshot_rx,
            schema_package: config.schema_package.clone(),
        };

        let worker = Worker::new(config, transport, shared, requests_rx, bus, snapshot_tx);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => {
                        let _ = ready_tx.send(Ok(()));
                        runtime
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                runtime.block_on(worker.run());
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(SessionError::Spawn(err));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(SessionError::WorkerPanicked);
            }
        }

        info!(thread = WORKER_THREAD_NAME, "Session coordinator spawned");
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Get a cloneable handle for callers
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Subscribe to notifications emitted from now on
    ///
    /// See the module docs for what a lagging receiver loses.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.handle.subscribe()
    }

    /// Set the cancellation flag and block until the worker has exited
    ///
    /// An open session is closed in order before the worker returns. Blocks for
    /// at most one poll interval (connected) or one command wait (disconnected)
    /// plus the time to close the session.
    pub fn cancel_and_join(mut self) -> Result<(), SessionError> {
        debug!("SessionCoordinator::cancel_and_join: called");
        self.join_worker()
    }

    fn join_worker(&mut self) -> Result<(), SessionError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        self.handle.shared.cancelled.store(true, Ordering::SeqCst);
        self.handle.shared.wake.notify_one();

        thread.join().map_err(|_| SessionError::WorkerPanicked)?;
        info!("Session coordinator joined");
        Ok(())
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        if let Err(err) = self.join_worker() {
            warn!(error = %err, "Session worker did not stop cleanly");
        }
    }
}

/// Cloneable caller-facing handle
///
/// Submission methods return `false` when the request is a no-op: the
/// coordinator is not ready for queries, a lifecycle command is still queued,
/// or the coordinator is shutting down. A `true` return means the request was
/// handed to the worker; the worker may still drop it if the connection goes
/// away first.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<QueryRequest>,
    bus: NotificationBus,
    snapshot: watch::Receiver<SessionSnapshot>,
    schema_package: String,
}

impl SessionHandle {
    // === Lifecycle commands ===

    /// Queue a connect to `address`
    pub fn request_connect(
        &self,
        address: impl Into<String>,
        connection_options: impl Into<String>,
        session_options: impl Into<String>,
    ) {
        let command = Command::connect(address, connection_options, session_options);
        debug!(?command, "SessionHandle::request_connect: called");
        self.shared.commands.enqueue(command);
    }

    /// Queue a connect to a broker on this host
    pub fn request_connect_localhost(&self) {
        debug!("SessionHandle::request_connect_localhost: called");
        self.request_connect("localhost", "", LOCALHOST_SESSION_OPTIONS);
    }

    /// Queue a disconnect
    pub fn request_disconnect(&self) {
        debug!("SessionHandle::request_disconnect: called");
        self.shared.commands.enqueue(Command::Disconnect);
    }

    // === Queries ===

    /// Query every object of `class_name`; results stream in over several events
    pub fn submit_streaming_query(&self, class_name: impl Into<String>, caller: CallerHandle) -> bool {
        let class_name = class_name.into();
        debug!(%class_name, "SessionHandle::submit_streaming_query: called");
        let target = QueryTarget::Class {
            package: self.schema_package.clone(),
            class_name,
        };
        self.submit(QueryRequest::Query {
            target,
            kind: QueryKind::StreamingByClass,
            caller,
        })
    }

    /// Query one object by address; the first response completes it
    pub fn submit_object_query(&self, address: ObjectAddress, caller: CallerHandle) -> bool {
        debug!(%address, "SessionHandle::submit_object_query: called");
        self.submit(QueryRequest::Query {
            target: QueryTarget::Object { address },
            kind: QueryKind::SingleObject,
            caller,
        })
    }

    /// Invoke `method` on the object at `address`
    pub fn submit_method_call(
        &self,
        method: impl Into<String>,
        arguments: Map<String, Value>,
        address: ObjectAddress,
        caller: CallerHandle,
    ) -> bool {
        let method = method.into();
        debug!(%method, %address, "SessionHandle::submit_method_call: called");
        self.submit(QueryRequest::Method {
            call: MethodCall {
                method,
                arguments,
                address,
            },
            caller,
        })
    }

    /// Invoke `method` on the broker object captured when the broker agent was discovered
    ///
    /// Returns `false` while that object is not yet known.
    pub fn submit_broker_method_call(
        &self,
        method: impl Into<String>,
        arguments: Map<String, Value>,
        caller: CallerHandle,
    ) -> bool {
        let method = method.into();
        let Some(address) = self.broker_object() else {
            debug!(%method, "SessionHandle::submit_broker_method_call: broker object unknown");
            return false;
        };
        self.submit_method_call(method, arguments, address, caller)
    }

    fn submit(&self, request: QueryRequest) -> bool {
        if self.shared.is_cancelled() {
            debug!("SessionHandle::submit: coordinator shutting down");
            return false;
        }
        if !self.snapshot.borrow().is_ready() {
            debug!(kind = ?request.kind(), "SessionHandle::submit: not ready for queries");
            return false;
        }
        if !self.shared.commands.is_empty() {
            debug!(kind = ?request.kind(), "SessionHandle::submit: lifecycle command pending");
            return false;
        }
        if self.requests.send(request).is_err() {
            debug!("SessionHandle::submit: worker gone");
            return false;
        }
        self.shared.wake.notify_one();
        true
    }

    /// Forget a pending query; its caller will not hear about it again
    pub fn cancel_query(&self, correlation_id: CorrelationId) -> bool {
        debug!(%correlation_id, "SessionHandle::cancel_query: called");
        self.shared.pending.cancel(correlation_id)
    }

    /// Suppress (or resume) idle tick notifications
    pub fn pause_refreshes(&self, paused: bool) {
        debug!(paused, "SessionHandle::pause_refreshes: called");
        self.shared.refreshes_paused.store(paused, Ordering::SeqCst);
    }

    pub fn refreshes_paused(&self) -> bool {
        self.shared.refreshes_paused.load(Ordering::SeqCst)
    }

    // === Observation ===

    /// Subscribe to notifications emitted from now on
    ///
    /// A receiver more than `notification-capacity` behind loses the oldest
    /// notifications and sees `RecvError::Lagged(skipped)` on its next `recv`.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.bus.subscribe()
    }

    /// Latest snapshot published by the worker
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// The broker's own management object, once discovered
    pub fn broker_object(&self) -> Option<ObjectAddress> {
        self.snapshot.borrow().broker_object.clone()
    }

    /// Wait until the session is connected and the broker agent is known
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        debug!(?timeout, "SessionHandle::wait_until_ready: called");
        let mut rx = self.snapshot.clone();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(SessionSnapshot::is_ready)).await,
            Ok(Ok(_))
        )
    }

    /// Wait until the worker reports `state`
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        debug!(%state, ?timeout, "SessionHandle::wait_for_state: called");
        let mut rx = self.snapshot.clone();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|snapshot| snapshot.state == state)).await,
            Ok(Ok(_))
        )
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_pending(&self, correlation_id: CorrelationId) -> bool {
        self.shared.pending.contains(correlation_id)
    }

    pub fn queued_commands(&self) -> usize {
        self.shared.commands.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }
}
