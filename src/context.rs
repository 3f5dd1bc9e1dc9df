//! Execution context: session, state, process stack and the event bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::event::Event;
use crate::process::Process;
use crate::service::ServiceRegistry;
use crate::state::State;
use crate::udf::UdfRegistry;

/// Receives every event published on a context family.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullListener;

impl EventListener for NullListener {
    fn on_event(&self, _event: &Event) {}
}

/// Buffers events for later inspection; the tests' listener of choice.
#[derive(Debug, Default)]
pub struct CollectingListener {
    events: Mutex<Vec<Event>>,
}

impl CollectingListener {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn take(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }
}

impl EventListener for CollectingListener {
    fn on_event(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Forwards events into `tracing`; the CLI's default listener.
#[derive(Debug, Default)]
pub struct TracingListener;

impl EventListener for TracingListener {
    fn on_event(&self, event: &Event) {
        match event {
            Event::Stdout { message, .. } => info!("{message}"),
            Event::Error { message, .. } => error!("{message}"),
            other => debug!(kind = other.kind(), session = other.session_id(), "event"),
        }
    }
}

/// Bundles one session's state, service registry, listener, process stack
/// and background wait group. Cloning shares everything; [`Context::fork`]
/// yields a sibling with its own shallow state copy.
#[derive(Clone)]
pub struct Context {
    pub session_id: String,
    state: State,
    services: Arc<ServiceRegistry>,
    listener: Arc<dyn EventListener>,
    sequence: Arc<AtomicU64>,
    processes: Arc<Mutex<Vec<Arc<Process>>>>,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
    pub logging: Option<bool>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("session_id", &self.session_id)
            .field("processes", &self.process_depth())
            .finish_non_exhaustive()
    }
}

impl Context {
    #[must_use]
    pub fn new(services: Arc<ServiceRegistry>, listener: Arc<dyn EventListener>) -> Context {
        Self::with_session(uuid::Uuid::new_v4().to_string(), services, listener)
    }

    #[must_use]
    pub fn with_session(
        session_id: String,
        services: Arc<ServiceRegistry>,
        listener: Arc<dyn EventListener>,
    ) -> Context {
        Context {
            session_id,
            state: State::with_udfs(Arc::new(UdfRegistry::with_builtins())),
            services,
            listener,
            sequence: Arc::new(AtomicU64::new(0)),
            processes: Arc::new(Mutex::new(Vec::new())),
            background: Arc::new(Mutex::new(Vec::new())),
            logging: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state.clone()
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    #[must_use]
    pub fn services(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&self.services)
    }

    #[must_use]
    pub fn expand_text(&self, text: &str) -> String {
        self.state.expand_text(text)
    }

    /// A sibling context sharing listener, session, services, sequence and
    /// process stack, but owning a shallow copy of the state.
    #[must_use]
    pub fn fork(&self) -> Context {
        let mut forked = self.clone();
        forked.state = self.state.fork();
        forked
    }

    pub fn push_process(&self, process: Arc<Process>) {
        if let Ok(mut processes) = self.processes.lock() {
            processes.push(process);
        }
    }

    pub fn pop_process(&self) -> Option<Arc<Process>> {
        self.processes.lock().ok()?.pop()
    }

    #[must_use]
    pub fn last_process(&self) -> Option<Arc<Process>> {
        self.processes.lock().ok()?.last().cloned()
    }

    #[must_use]
    pub fn process_depth(&self) -> usize {
        self.processes.lock().map(|processes| processes.len()).unwrap_or(0)
    }

    /// Publishes an event, stamping start events with a fresh monotonic
    /// handle, and returns that handle.
    pub fn publish(&self, mut event: Event) -> u64 {
        let handle = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        event.stamp(handle);
        self.deliver(&event);
        handle
    }

    /// Publishes an end event paired with a previously returned start
    /// handle, letting listeners compute durations.
    pub fn publish_end(&self, mut event: Event, start_handle: u64) {
        event.stamp_start(start_handle);
        self.deliver(&event);
    }

    pub(crate) fn deliver(&self, event: &Event) {
        self.listener.on_event(event);
    }

    /// A forked context whose events buffer locally until re-published onto
    /// the parent, preserving insertion order per collector.
    #[must_use]
    pub fn make_async_safe(&self) -> AsyncEventCollector {
        let buffer = Arc::new(CollectingListener::default());
        let mut context = self.fork();
        context.listener = Arc::clone(&buffer) as Arc<dyn EventListener>;
        AsyncEventCollector { context, buffer }
    }

    /// Registers background work joined by [`Context::join_background`].
    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Ok(mut background) = self.background.lock() {
            background.push(tokio::spawn(future));
        }
    }

    /// Awaits all background work registered so far (the wait group).
    pub async fn join_background(&self) {
        let handles: Vec<JoinHandle<()>> = match self.background.lock() {
            Ok(mut background) => background.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Child event collector returned by [`Context::make_async_safe`].
pub struct AsyncEventCollector {
    pub context: Context,
    buffer: Arc<CollectingListener>,
}

impl AsyncEventCollector {
    /// Re-publishes the buffered events onto the parent in insertion order.
    pub fn replay(&self, parent: &Context) {
        for event in self.buffer.take() {
            parent.deliver(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> (Context, Arc<CollectingListener>) {
        let listener = CollectingListener::new();
        let context = Context::new(
            Arc::new(ServiceRegistry::new()),
            Arc::clone(&listener) as Arc<dyn EventListener>,
        );
        (context, listener)
    }

    #[test]
    fn test_publish_assigns_monotonic_handles() {
        let (context, listener) = context();
        let first = context.publish(Event::TaskStart {
            handle: 0,
            session_id: context.session_id.clone(),
            workflow: "w".to_string(),
            owner_url: String::new(),
            task: "a".to_string(),
        });
        let second = context.publish(Event::TaskStart {
            handle: 0,
            session_id: context.session_id.clone(),
            workflow: "w".to_string(),
            owner_url: String::new(),
            task: "b".to_string(),
        });
        assert!(second > first);
        let events = listener.events();
        assert_eq!(events[0].handle(), Some(first));
        assert_eq!(events[1].handle(), Some(second));
    }

    #[test]
    fn test_end_event_pairing() {
        let (context, listener) = context();
        let start = context.publish(Event::WorkflowStart {
            handle: 0,
            session_id: context.session_id.clone(),
            workflow: "w".to_string(),
            owner_url: String::new(),
            parent_workflow: String::new(),
            parent_owner_url: String::new(),
            tasks: "*".to_string(),
            tag_ids: String::new(),
        });
        context.publish_end(
            Event::WorkflowEnd {
                start_handle: 0,
                session_id: context.session_id.clone(),
                workflow: "w".to_string(),
                owner_url: String::new(),
                status: "ok".to_string(),
                error: String::new(),
            },
            start,
        );
        let events = listener.events();
        assert_eq!(events[1].start_handle(), Some(start));
    }

    #[test]
    fn test_async_collector_replays_in_order() {
        let (context, listener) = context();
        let collector = context.make_async_safe();
        for task in ["x", "y"] {
            collector.context.publish(Event::TaskStart {
                handle: 0,
                session_id: collector.context.session_id.clone(),
                workflow: "w".to_string(),
                owner_url: String::new(),
                task: task.to_string(),
            });
        }
        assert!(listener.events().is_empty());
        collector.replay(&context);
        let events = listener.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::TaskStart { task, .. } if task == "x"));
    }

    #[test]
    fn test_fork_isolates_state() {
        let (context, _) = context();
        context.state().put("shared", json!(1));
        let forked = context.fork();
        forked.state().put("shared", json!(2));
        assert_eq!(context.state().get("shared"), Some(json!(1)));
        assert_eq!(forked.session_id, context.session_id);
    }
}
