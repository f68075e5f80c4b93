//! Process-wide lifecycle notifications for external observers (UI, logs).
//!
//! [`EventHub`] is an explicit, cloneable publish/subscribe channel. The
//! [`super::team_manager::TeamManager`] and every
//! [`super::agent_process::AgentProcess`] it builds share one hub that is
//! passed in at construction, so tests can observe (or ignore) lifecycle
//! traffic without any global state.
//!
//! Handlers run synchronously on the emitting task, outside the hub's lock.
//! A panicking handler is logged and does not affect other handlers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use super::status::AgentStatus;

/// Lifecycle notification payloads.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TeamEvent {
    TeamCreated {
        team: String,
        members: Vec<String>,
    },
    TeamDeleted {
        team: String,
        /// Whether the team was live in this manager when deleted.
        was_active: bool,
    },
    AgentSpawned {
        team: String,
        agent_name: String,
        agent_id: String,
        pid: Option<u32>,
    },
    AgentStatusChanged {
        team: String,
        agent_name: String,
        agent_id: String,
        from: AgentStatus,
        to: AgentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

/// Event names used for filtered subscriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    TeamCreated,
    TeamDeleted,
    AgentSpawned,
    AgentStatusChanged,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            EventKind::TeamCreated => "team.created",
            EventKind::TeamDeleted => "team.deleted",
            EventKind::AgentSpawned => "agent.spawned",
            EventKind::AgentStatusChanged => "agent.statusChanged",
        }
    }
}

impl TeamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TeamEvent::TeamCreated { .. } => EventKind::TeamCreated,
            TeamEvent::TeamDeleted { .. } => EventKind::TeamDeleted,
            TeamEvent::AgentSpawned { .. } => EventKind::AgentSpawned,
            TeamEvent::AgentStatusChanged { .. } => EventKind::AgentStatusChanged,
        }
    }
}

type Handler = Arc<dyn Fn(&TeamEvent) + Send + Sync>;

struct Registration {
    id: u64,
    filter: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct HubInner {
    handlers: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

/// Shared publish/subscribe channel. Clones share the same subscribers.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

/// Handle returned by [`EventHub::on`]; call [`Subscription::unsubscribe`] to stop receiving.
///
/// Dropping the handle keeps the handler registered.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.handlers.lock().unwrap().retain(|r| r.id != self.id);
        }
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&TeamEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Register a handler for every event.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TeamEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    /// Forward every event into an unbounded channel (for async consumers).
    ///
    /// The forwarding handler unregisters itself lazily: sends to a closed
    /// receiver are ignored.
    pub fn channel(&self) -> (Subscription, UnboundedReceiver<TeamEvent>) {
        let (tx, rx) = unbounded_channel();
        let sub = self.on_any(move |event| {
            let _ = tx.send(event.clone());
        });
        (sub, rx)
    }

    /// Publish an event to all matching handlers.
    pub fn emit(&self, event: TeamEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let handlers = self.inner.handlers.lock().unwrap();
            handlers
                .iter()
                .filter(|r| r.filter.is_none_or(|k| k == kind))
                .map(|r| r.handler.clone())
                .collect()
        };

        tracing::trace!(event = kind.name(), handlers = handlers.len(), "Emitting event");

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::error!(event = kind.name(), "Event handler panicked");
            }
        }
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().unwrap().len()
    }

    fn register(&self, filter: Option<EventKind>, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().unwrap().push(Registration {
            id,
            filter,
            handler,
        });
        Subscription {
            id,
            hub: Arc::downgrade(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deleted(team: &str) -> TeamEvent {
        TeamEvent::TeamDeleted {
            team: team.to_string(),
            was_active: false,
        }
    }

    #[test]
    fn filtered_handlers_only_see_their_kind() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = hub.on(EventKind::TeamDeleted, move |e| {
            seen_clone.lock().unwrap().push(e.clone());
        });

        hub.emit(TeamEvent::TeamCreated {
            team: "alpha".into(),
            members: vec![],
        });
        hub.emit(deleted("alpha"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind(), EventKind::TeamDeleted);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let sub = hub.on_any(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(deleted("a"));
        sub.unsubscribe();
        hub.emit(deleted("b"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(hub.handler_count(), 0);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicU64::new(0));
        let _bad = hub.on_any(|_| panic!("observer bug"));
        let c = count.clone();
        let _good = hub.on_any(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(deleted("a"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_forwards_events() {
        let hub = EventHub::new();
        let (_sub, mut rx) = hub.channel();
        hub.emit(deleted("gamma"));
        assert_eq!(rx.recv().await, Some(deleted("gamma")));
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(TeamEvent::AgentStatusChanged {
            team: "alpha".into(),
            agent_name: "A".into(),
            agent_id: "id".into(),
            from: AgentStatus::Idle,
            to: AgentStatus::Active,
            task_id: Some("t1".into()),
            detail: None,
        })
        .unwrap();
        assert_eq!(json["event"], "agent_status_changed");
        assert_eq!(json["to"], "active");
        assert!(json.get("detail").is_none());
    }
}
