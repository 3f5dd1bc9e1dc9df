//! Lifecycle events published on the context bus.
//!
//! Start events carry a monotonically assigned `handle` (stamped by
//! [`Context::publish`](crate::context::Context::publish)); end events carry
//! the matching `start_handle` so listeners can pair them and compute
//! durations.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Event {
    Loaded {
        session_id: String,
        workflow: String,
        source: String,
    },
    Init {
        session_id: String,
        tasks: String,
    },
    WorkflowStart {
        handle: u64,
        session_id: String,
        workflow: String,
        owner_url: String,
        parent_workflow: String,
        parent_owner_url: String,
        tasks: String,
        tag_ids: String,
    },
    WorkflowEnd {
        start_handle: u64,
        session_id: String,
        workflow: String,
        owner_url: String,
        status: String,
        error: String,
    },
    TaskStart {
        handle: u64,
        session_id: String,
        workflow: String,
        owner_url: String,
        task: String,
    },
    TaskEnd {
        start_handle: u64,
        session_id: String,
        workflow: String,
        owner_url: String,
        task: String,
        status: String,
        error: String,
    },
    ActivityStart {
        handle: u64,
        session_id: String,
        service: String,
        action: String,
        tag: String,
        tag_id: String,
        description: String,
        request: Value,
    },
    ActivityEnd {
        start_handle: u64,
        session_id: String,
        service: String,
        action: String,
        tag_id: String,
        status: String,
        error: String,
        response: Value,
    },
    TaskAsyncStart {
        handle: u64,
        session_id: String,
        task: String,
        count: usize,
    },
    TaskAsyncDone {
        start_handle: u64,
        session_id: String,
        task: String,
        count: usize,
    },
    AsyncScheduled {
        session_id: String,
        service: String,
        action: String,
        tag_id: String,
    },
    ModifiedState {
        session_id: String,
        scope: String,
        names: Vec<String>,
    },
    ResetError {
        session_id: String,
    },
    Stdout {
        session_id: String,
        tag: String,
        message: String,
    },
    Error {
        session_id: String,
        message: String,
    },
    SessionEnd {
        session_id: String,
    },
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Loaded { .. } => "loaded",
            Event::Init { .. } => "init",
            Event::WorkflowStart { .. } => "workflow.start",
            Event::WorkflowEnd { .. } => "workflow.end",
            Event::TaskStart { .. } => "task.start",
            Event::TaskEnd { .. } => "task.end",
            Event::ActivityStart { .. } => "activity.start",
            Event::ActivityEnd { .. } => "activity.end",
            Event::TaskAsyncStart { .. } => "task.async.start",
            Event::TaskAsyncDone { .. } => "task.async.done",
            Event::AsyncScheduled { .. } => "async.scheduled",
            Event::ModifiedState { .. } => "state.modified",
            Event::ResetError { .. } => "error.reset",
            Event::Stdout { .. } => "stdout",
            Event::Error { .. } => "error",
            Event::SessionEnd { .. } => "session.end",
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Event::Loaded { session_id, .. }
            | Event::Init { session_id, .. }
            | Event::WorkflowStart { session_id, .. }
            | Event::WorkflowEnd { session_id, .. }
            | Event::TaskStart { session_id, .. }
            | Event::TaskEnd { session_id, .. }
            | Event::ActivityStart { session_id, .. }
            | Event::ActivityEnd { session_id, .. }
            | Event::TaskAsyncStart { session_id, .. }
            | Event::TaskAsyncDone { session_id, .. }
            | Event::AsyncScheduled { session_id, .. }
            | Event::ModifiedState { session_id, .. }
            | Event::ResetError { session_id }
            | Event::Stdout { session_id, .. }
            | Event::Error { session_id, .. }
            | Event::SessionEnd { session_id } => session_id,
        }
    }

    /// Handle of a start event, once published.
    #[must_use]
    pub fn handle(&self) -> Option<u64> {
        match self {
            Event::WorkflowStart { handle, .. }
            | Event::TaskStart { handle, .. }
            | Event::ActivityStart { handle, .. }
            | Event::TaskAsyncStart { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    /// Start-handle reference carried by an end event.
    #[must_use]
    pub fn start_handle(&self) -> Option<u64> {
        match self {
            Event::WorkflowEnd { start_handle, .. }
            | Event::TaskEnd { start_handle, .. }
            | Event::ActivityEnd { start_handle, .. }
            | Event::TaskAsyncDone { start_handle, .. } => Some(*start_handle),
            _ => None,
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<&str> {
        match self {
            Event::WorkflowEnd { status, .. }
            | Event::TaskEnd { status, .. }
            | Event::ActivityEnd { status, .. } => Some(status),
            _ => None,
        }
    }

    pub(crate) fn stamp(&mut self, assigned: u64) {
        match self {
            Event::WorkflowStart { handle, .. }
            | Event::TaskStart { handle, .. }
            | Event::ActivityStart { handle, .. }
            | Event::TaskAsyncStart { handle, .. } => *handle = assigned,
            _ => {}
        }
    }

    pub(crate) fn stamp_start(&mut self, reference: u64) {
        match self {
            Event::WorkflowEnd { start_handle, .. }
            | Event::TaskEnd { start_handle, .. }
            | Event::ActivityEnd { start_handle, .. }
            | Event::TaskAsyncDone { start_handle, .. } => *start_handle = reference,
            _ => {}
        }
    }
}
