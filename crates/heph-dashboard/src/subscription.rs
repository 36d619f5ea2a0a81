use crate::engine::ReconciliationEngine;
use crate::fetch::Region;
use chrono::{DateTime, Utc};
use heph_core::push_wire::{EventTopic, FrameError, PushEvent, PushFrame};
use heph_core::{parse_timestamp, ActivityRecord};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// A decoded push event plus the metadata needed to turn it into activity.
#[derive(Debug, Clone, PartialEq)]
pub struct PushDelivery {
    pub event: PushEvent,
    pub event_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl PushDelivery {
    pub fn new(event: PushEvent, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event,
            event_id: None,
            occurred_at,
        }
    }

    /// `Ok(None)` for event types this dashboard does not consume.
    pub fn from_frame(
        frame: &PushFrame,
        received_at: DateTime<Utc>,
    ) -> Result<Option<Self>, FrameError> {
        let Some(event) = frame.to_event()? else {
            return Ok(None);
        };
        let occurred_at = frame
            .timestamp
            .as_deref()
            .and_then(|raw| parse_timestamp(raw).ok())
            .unwrap_or(received_at);
        Ok(Some(Self {
            event,
            event_id: frame.event_id.clone(),
            occurred_at,
        }))
    }
}

type Handler = Box<dyn FnMut(&mut ReconciliationEngine, &PushDelivery) + Send>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(u64, EventTopic, Handler)>,
}

fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes push deliveries to handlers registered per topic.
///
/// Handlers run while the registry is locked and must not subscribe or
/// unsubscribe from inside the callback.
#[derive(Clone, Default)]
pub struct PushRouter {
    registry: Arc<Mutex<Registry>>,
}

impl PushRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<H>(&self, topic: EventTopic, handler: H) -> Subscription
    where
        H: FnMut(&mut ReconciliationEngine, &PushDelivery) + Send + 'static,
    {
        let mut registry = lock_registry(&self.registry);
        registry.next_id = registry.next_id.saturating_add(1);
        let id = registry.next_id;
        registry.handlers.push((id, topic, Box::new(handler)));
        debug!(event = "push_subscribe", topic = %topic, id);
        Subscription {
            id,
            topic,
            registry: Some(Arc::downgrade(&self.registry)),
        }
    }

    /// Returns how many handlers saw the delivery.
    pub fn dispatch(&self, engine: &mut ReconciliationEngine, delivery: &PushDelivery) -> usize {
        let topic = delivery.event.topic();
        let mut registry = lock_registry(&self.registry);
        let mut invoked = 0;
        for (_, handler_topic, handler) in registry.handlers.iter_mut() {
            if *handler_topic == topic {
                handler(&mut *engine, delivery);
                invoked += 1;
            }
        }
        invoked
    }

    pub fn handler_count(&self) -> usize {
        lock_registry(&self.registry).handlers.len()
    }
}

/// Disposer returned by [`PushRouter::subscribe`]. Unregisters exactly once,
/// either through [`Subscription::unsubscribe`] or on drop.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    id: u64,
    topic: EventTopic,
    registry: Option<Weak<Mutex<Registry>>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        let mut registry = lock_registry(&registry);
        registry.handlers.retain(|(id, _, _)| *id != self.id);
        debug!(event = "push_unsubscribe", topic = %self.topic, id = self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Registers the standard dashboard handlers: counter patches, activity feed
/// entries, and suggestion invalidation.
pub fn subscribe_dashboard_handlers(
    router: &PushRouter,
    refresh_tx: mpsc::UnboundedSender<Region>,
) -> Vec<Subscription> {
    let stats = router.subscribe(EventTopic::StatsUpdate, |engine, delivery| {
        if let PushEvent::StatsUpdate(delta) = &delivery.event {
            engine.apply_delta(*delta);
        }
    });

    let tasks = router.subscribe(EventTopic::TaskCreated, |engine, delivery| {
        if let PushEvent::TaskCreated(payload) = &delivery.event {
            let id = activity_id(delivery, "task_created", payload.task_id.as_deref());
            engine.record_activity(ActivityRecord::task_created(
                id,
                payload.description.as_deref(),
                payload.agent_id.clone(),
                delivery.occurred_at,
            ));
        }
    });

    let agents = router.subscribe(EventTopic::AgentCreated, |engine, delivery| {
        if let PushEvent::AgentCreated(payload) = &delivery.event {
            let id = activity_id(delivery, "agent_created", payload.agent_id.as_deref());
            engine.record_activity(ActivityRecord::agent_created(
                id,
                payload.agent_id.clone(),
                delivery.occurred_at,
            ));
        }
    });

    let suggestions = router.subscribe(EventTopic::SuggestionStatus, move |_engine, delivery| {
        if let PushEvent::SuggestionChanged(payload) = &delivery.event {
            debug!(
                event = "suggestion_invalidated",
                id = payload.id.as_deref().unwrap_or("*")
            );
        }
        if refresh_tx.send(Region::Suggestions).is_err() {
            debug!(event = "refresh_dropped", region = %Region::Suggestions);
        }
    });

    vec![stats, tasks, agents, suggestions]
}

/// Stable identity for a pushed record so redelivery dedups: the frame's
/// event id, else the subject's id, else a fresh uuid.
fn activity_id(delivery: &PushDelivery, kind: &str, subject_id: Option<&str>) -> String {
    if let Some(event_id) = delivery.event_id.as_deref() {
        return event_id.to_string();
    }
    match subject_id {
        Some(subject) if !subject.trim().is_empty() => format!("{kind}:{subject}"),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}
