//! Pending query table - correlates transport responses back to their callers

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::transport::{CorrelationId, QueryEvent};

/// Opaque reference to whoever issued a query
///
/// The coordinator never looks inside; it only hands the handle back with each
/// resolved event. Callers recover their own type with [`CallerHandle::downcast_ref`].
#[derive(Clone)]
pub struct CallerHandle(Arc<dyn Any + Send + Sync>);

impl CallerHandle {
    pub fn new<T: Any + Send + Sync>(caller: T) -> Self {
        Self(Arc::new(caller))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.0).downcast_ref::<T>()
    }

    /// True when both handles refer to the same caller
    ///
    /// Handles to distinct zero-sized values may compare equal.
    pub fn same_caller(&self, other: &CallerHandle) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl fmt::Debug for CallerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallerHandle({:p})", Arc::as_ptr(&self.0))
    }
}

/// Expected shape of the result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryKind {
    /// One object by address; complete on the first response
    SingleObject,
    /// All objects of a class; rows arrive over several events until one is final
    StreamingByClass,
    /// Asynchronous method call; complete on the first response
    MethodCall,
}

impl QueryKind {
    pub fn completes_on_first_response(&self) -> bool {
        !matches!(self, QueryKind::StreamingByClass)
    }
}

/// An outstanding query awaiting its final response
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub correlation_id: CorrelationId,
    pub caller: CallerHandle,
    pub kind: QueryKind,
    pub created_at: DateTime<Utc>,
}

/// Thread-safe map from correlation id to pending query
///
/// The lock is held only for the map operation itself; routing callbacks run
/// after it is released.
#[derive(Default)]
pub struct PendingQueryTable {
    entries: Mutex<HashMap<CorrelationId, PendingQuery>>,
}

impl PendingQueryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a query the transport has accepted
    pub fn register(&self, correlation_id: CorrelationId, caller: CallerHandle, kind: QueryKind) {
        debug!(%correlation_id, ?kind, "PendingQueryTable::register: called");
        let entry = PendingQuery {
            correlation_id,
            caller,
            kind,
            created_at: Utc::now(),
        };
        if self.entries.lock().insert(correlation_id, entry).is_some() {
            warn!(%correlation_id, "Correlation id reused while still pending; replacing entry");
        }
    }

    /// Route `event` to the caller registered under its id
    ///
    /// Invokes `route` with the caller and the event, then drops the entry if the
    /// event is final. Single-object and method entries complete on their first
    /// response, so the event handed to `route` is marked final for them. Returns
    /// false when no entry matched.
    pub fn resolve<F>(&self, correlation_id: CorrelationId, mut event: QueryEvent, route: F) -> bool
    where
        F: FnOnce(&CallerHandle, QueryEvent),
    {
        let caller = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get(&correlation_id) else {
                debug!(%correlation_id, "PendingQueryTable::resolve: no matching entry");
                return false;
            };
            if entry.kind.completes_on_first_response() {
                event.is_final = true;
            }
            let caller = entry.caller.clone();
            if event.is_final {
                entries.remove(&correlation_id);
            }
            caller
        };

        debug!(
            %correlation_id,
            is_final = event.is_final,
            rows = event.rows.len(),
            "PendingQueryTable::resolve: routing"
        );
        route(&caller, event);
        true
    }

    /// Drop one entry without notifying its caller
    pub fn cancel(&self, correlation_id: CorrelationId) -> bool {
        debug!(%correlation_id, "PendingQueryTable::cancel: called");
        self.entries.lock().remove(&correlation_id).is_some()
    }

    /// Drop every entry without notifying callers; returns how many were dropped
    pub fn clear_all(&self) -> usize {
        let mut entries = self.entries.lock();
        let dropped = entries.len();
        entries.clear();
        debug!(dropped, "PendingQueryTable::clear_all: swept");
        dropped
    }

    /// True while any class query is still waiting for its final event
    pub fn has_outstanding_streams(&self) -> bool {
        self.entries
            .lock()
            .values()
            .any(|entry| entry.kind == QueryKind::StreamingByClass)
    }

    pub fn contains(&self, correlation_id: CorrelationId) -> bool {
        self.entries.lock().contains_key(&correlation_id)
    }

    pub fn get(&self, correlation_id: CorrelationId) -> Option<PendingQuery> {
        self.entries.lock().get(&correlation_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
