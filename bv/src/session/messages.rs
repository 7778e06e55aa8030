//! Query submissions handed from callers to the worker

use crate::transport::{MethodCall, QueryTarget};

use super::pending::{CallerHandle, QueryKind};

/// A query waiting for the worker to issue it on the live session
///
/// No correlation id exists yet: the transport assigns one when the worker
/// issues the request, and the worker registers the pending entry before it
/// polls for the next event.
#[derive(Debug, Clone)]
pub enum QueryRequest {
    Query {
        target: QueryTarget,
        kind: QueryKind,
        caller: CallerHandle,
    },
    Method { call: MethodCall, caller: CallerHandle },
}

impl QueryRequest {
    pub fn kind(&self) -> QueryKind {
        match self {
            QueryRequest::Query { kind, .. } => *kind,
            QueryRequest::Method { .. } => QueryKind::MethodCall,
        }
    }

    pub fn caller(&self) -> &CallerHandle {
        match self {
            QueryRequest::Query { caller, .. } | QueryRequest::Method { caller, .. } => caller,
        }
    }
}
