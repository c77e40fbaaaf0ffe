use crate::errors::AppResult;
use crate::models::ImportSummary;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ProviderSwitched,
    ProvidersChanged,
    DataMerged,
    DataReplaced,
    DatabaseExported,
    DatabaseReset,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProviderSwitched => "provider-switched",
            Self::ProvidersChanged => "providers-changed",
            Self::DataMerged => "data-merged",
            Self::DataReplaced => "data-replaced",
            Self::DatabaseExported => "database-exported",
            Self::DatabaseReset => "database-reset",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "provider-switched" => Some(Self::ProviderSwitched),
            "providers-changed" => Some(Self::ProvidersChanged),
            "data-merged" => Some(Self::DataMerged),
            "data-replaced" => Some(Self::DataReplaced),
            "database-exported" => Some(Self::DatabaseExported),
            "database-reset" => Some(Self::DatabaseReset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum StoreEvent {
    ProviderSwitched { name: String },
    ProvidersChanged { names: Vec<String> },
    DataMerged(ImportSummary),
    DataReplaced(ImportSummary),
    DatabaseExported { path: String },
    DatabaseReset,
}

impl StoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ProviderSwitched { .. } => EventKind::ProviderSwitched,
            Self::ProvidersChanged { .. } => EventKind::ProvidersChanged,
            Self::DataMerged(_) => EventKind::DataMerged,
            Self::DataReplaced(_) => EventKind::DataReplaced,
            Self::DatabaseExported { .. } => EventKind::DatabaseExported,
            Self::DatabaseReset => EventKind::DatabaseReset,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "type": self.kind().as_str() }))
    }
}

pub type SubscriptionId = Uuid;
pub type EventHandler = Arc<dyn Fn(&StoreEvent) -> AppResult<()> + Send + Sync>;

/// Synchronous, best-effort fan-out of store events. A subscriber that
/// errors or panics is logged and skipped; delivery to the rest continues.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&StoreEvent) -> AppResult<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        let mut subscribers = match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.entry(kind).or_default().push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut removed = false;
        for handlers in subscribers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            removed |= handlers.len() != before;
        }
        removed
    }

    /// Returns how many subscribers handled the event successfully.
    pub fn emit(&self, event: &StoreEvent) -> usize {
        let handlers: Vec<EventHandler> = {
            let subscribers = match self.subscribers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            subscribers
                .get(&event.kind())
                .map(|entries| entries.iter().map(|(_, handler)| Arc::clone(handler)).collect())
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(error)) => {
                    tracing::warn!(event = event.kind().as_str(), error = %error, "event subscriber failed");
                }
                Err(_) => {
                    tracing::warn!(event = event.kind().as_str(), "event subscriber panicked");
                }
            }
        }
        delivered
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .subscribers
            .read()
            .map(|subscribers| subscribers.values().map(Vec::len).sum::<usize>())
            .unwrap_or(0);
        f.debug_struct("EventBus").field("subscribers", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{EventBus, EventKind, StoreEvent};
    use crate::errors::AppError;
    use crate::models::ImportSummary;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn failing_subscribers_do_not_block_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::DatabaseReset, |_| Err(AppError::Internal("boom".to_string())));
        bus.subscribe(EventKind::DatabaseReset, |_| panic!("subscriber bug"));
        let counter = Arc::clone(&seen);
        bus.subscribe(EventKind::DatabaseReset, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(bus.emit(&StoreEvent::DatabaseReset), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_only_reach_their_kind_and_unsubscribe_works() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = bus.subscribe(EventKind::DataMerged, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(&StoreEvent::DatabaseReset);
        bus.emit(&StoreEvent::DataMerged(ImportSummary::default()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&StoreEvent::DataMerged(ImportSummary::default()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_payloads_render_as_tagged_json() {
        let event = StoreEvent::ProviderSwitched {
            name: "local".to_string(),
        };
        let json = event.to_json();
        assert_eq!(json["type"], "provider-switched");
        assert_eq!(json["payload"]["name"], "local");
        assert_eq!(EventKind::parse(event.kind().as_str()), Some(EventKind::ProviderSwitched));

        let merged = StoreEvent::DataMerged(ImportSummary {
            clients_added: 2,
            ..ImportSummary::default()
        })
        .to_json();
        assert_eq!(merged["payload"]["clientsAdded"], 2);
    }
}
