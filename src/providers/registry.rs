use super::{StorageBackend, Store};
use crate::errors::{AppError, AppResult};
use crate::events::{EventBus, StoreEvent};
use crate::models::{ProviderInfo, Row, SqlValue};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Clone)]
struct ActiveProvider {
    name: String,
    backend: Arc<dyn StorageBackend>,
}

#[derive(Default)]
struct RegistryState {
    providers: BTreeMap<String, Arc<dyn StorageBackend>>,
    active: Option<ActiveProvider>,
}

/// Named storage backends with exactly one routed as active.
///
/// Data-plane calls hold the read lock for their whole duration and a
/// switch holds the write lock, so no statement can be routed through a
/// backend while it is being closed.
pub struct ProviderRegistry {
    state: RwLock<RegistryState>,
    events: EventBus,
}

impl ProviderRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn read(&self) -> AppResult<RwLockReadGuard<'_, RegistryState>> {
        self.state
            .read()
            .map_err(|_| AppError::Internal("provider registry lock poisoned".to_string()))
    }

    fn write(&self) -> AppResult<RwLockWriteGuard<'_, RegistryState>> {
        self.state
            .write()
            .map_err(|_| AppError::Internal("provider registry lock poisoned".to_string()))
    }

    /// Registers or replaces a backend under `name`.
    ///
    /// Replacing the active name only swaps the map entry: statements keep
    /// routing to the old backend until the next `switch_to(name)`.
    /// A replaced inactive backend is closed.
    pub fn register(&self, name: &str, backend: Arc<dyn StorageBackend>) -> AppResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidProvider("provider name cannot be empty".to_string()));
        }
        let missing = backend.capabilities().missing();
        if !missing.is_empty() {
            return Err(AppError::InvalidProvider(format!(
                "provider '{}' ({}) is missing required capabilities: {}",
                name,
                backend.kind(),
                missing.join(", ")
            )));
        }

        let names = {
            let mut state = self.write()?;
            let routed = state.active.as_ref().map(|active| Arc::clone(&active.backend));
            if let Some(previous) = state.providers.insert(name.to_string(), Arc::clone(&backend)) {
                let still_routed = routed.as_ref().is_some_and(|routed| Arc::ptr_eq(routed, &previous));
                if !still_routed && !Arc::ptr_eq(&previous, &backend) {
                    previous.close();
                }
                tracing::info!(provider = %name, pending_switch = still_routed, "provider re-registered");
            } else {
                tracing::info!(provider = %name, "provider registered");
            }
            state.providers.keys().cloned().collect::<Vec<_>>()
        };

        self.events.emit(&StoreEvent::ProvidersChanged { names });
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> AppResult<()> {
        let names = {
            let mut state = self.write()?;
            if state.active.as_ref().is_some_and(|active| active.name == name) {
                return Err(AppError::InvalidProvider(format!(
                    "cannot unregister active provider '{}'",
                    name
                )));
            }
            let Some(backend) = state.providers.remove(name) else {
                return Err(AppError::NotFound(format!("provider '{}' is not registered", name)));
            };
            backend.close();
            state.providers.keys().cloned().collect::<Vec<_>>()
        };

        tracing::info!(provider = %name, "provider unregistered");
        self.events.emit(&StoreEvent::ProvidersChanged { names });
        Ok(())
    }

    /// Makes `name` the active backend.
    ///
    /// The target is connected and verified before anything else changes;
    /// only then is the previous backend closed and the new one published.
    /// Any failure leaves the previous active backend untouched.
    pub fn switch_to(&self, name: &str) -> AppResult<()> {
        let switch_error = |reason: String| AppError::ProviderSwitch {
            name: name.to_string(),
            reason,
        };

        {
            let mut state = self.write()?;
            let target = state
                .providers
                .get(name)
                .cloned()
                .ok_or_else(|| switch_error("provider is not registered".to_string()))?;

            if let Some(active) = state
                .active
                .as_ref()
                .filter(|active| active.name == name && Arc::ptr_eq(&active.backend, &target))
            {
                ensure_connected(active.backend.as_ref()).map_err(|error| switch_error(error.to_string()))?;
                return Ok(());
            }

            if let Some(active) = state.active.as_ref() {
                if active.backend.in_transaction() {
                    return Err(switch_error(format!(
                        "active provider '{}' has an open transaction",
                        active.name
                    )));
                }
            }

            let was_connected = target.is_connected();
            if let Err(error) = ensure_connected(target.as_ref()) {
                if !was_connected {
                    target.close();
                }
                tracing::warn!(provider = %name, error = %error, "provider switch failed");
                return Err(switch_error(error.to_string()));
            }

            let next = ActiveProvider {
                name: name.to_string(),
                backend: Arc::clone(&target),
            };
            if let Some(previous) = state.active.replace(next) {
                if !Arc::ptr_eq(&previous.backend, &target) {
                    previous.backend.close();
                }
                tracing::info!(from = %previous.name, to = %name, "switched storage provider");
            } else {
                tracing::info!(to = %name, "activated storage provider");
            }
        }

        self.events.emit(&StoreEvent::ProviderSwitched {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn active_name(&self) -> Option<String> {
        self.read()
            .ok()
            .and_then(|state| state.active.as_ref().map(|active| active.name.clone()))
    }

    pub fn active_backend(&self) -> AppResult<Arc<dyn StorageBackend>> {
        self.read()?
            .active
            .as_ref()
            .map(|active| Arc::clone(&active.backend))
            .ok_or(AppError::NoActiveProvider)
    }

    pub fn backend(&self, name: &str) -> AppResult<Option<Arc<dyn StorageBackend>>> {
        Ok(self.read()?.providers.get(name).cloned())
    }

    pub fn available_providers(&self) -> AppResult<Vec<ProviderInfo>> {
        let state = self.read()?;
        let active = state.active.as_ref().map(|active| active.name.as_str());
        Ok(state
            .providers
            .iter()
            .map(|(name, backend)| ProviderInfo {
                name: name.clone(),
                kind: backend.kind().to_string(),
                active: active == Some(name.as_str()),
                connected: backend.is_connected(),
            })
            .collect())
    }

    /// Runs `f` against the active backend while holding the read lock.
    pub fn with_active<T>(&self, f: impl FnOnce(&dyn StorageBackend) -> AppResult<T>) -> AppResult<T> {
        let state = self.read()?;
        let active = state.active.as_ref().ok_or(AppError::NoActiveProvider)?;
        f(active.backend.as_ref())
    }

    /// Closes every registered backend and clears the active pointer.
    pub fn shutdown(&self) {
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.active = None;
        for backend in state.providers.values() {
            backend.close();
        }
    }
}

fn ensure_connected(backend: &dyn StorageBackend) -> AppResult<()> {
    if !backend.is_connected() {
        backend.initialize()?;
    }
    backend.ping()
}

impl Store for ProviderRegistry {
    fn query(&self, sql: &str, params: &[SqlValue]) -> AppResult<Vec<Row>> {
        self.with_active(|backend| backend.query(sql, params))
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> AppResult<i64> {
        self.with_active(|backend| backend.execute(sql, params))
    }

    fn begin_transaction(&self) -> AppResult<()> {
        self.with_active(|backend| backend.begin_transaction())
    }

    fn commit(&self) -> AppResult<()> {
        self.with_active(|backend| backend.commit())
    }

    fn rollback(&self) -> AppResult<()> {
        self.with_active(|backend| backend.rollback())
    }

    fn metadata(&self, key: &str) -> AppResult<Option<String>> {
        self.with_active(|backend| backend.metadata(key))
    }

    fn set_metadata(&self, key: &str, value: &str) -> AppResult<()> {
        self.with_active(|backend| backend.set_metadata(key, value))
    }

    fn schema_version(&self) -> AppResult<i64> {
        self.with_active(|backend| backend.schema_version())
    }

    fn set_schema_version(&self, version: i64) -> AppResult<()> {
        self.with_active(|backend| backend.set_schema_version(version))
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self
            .available_providers()
            .map(|providers| providers.into_iter().map(|info| info.name).collect::<Vec<_>>())
            .unwrap_or_default();
        f.debug_struct("ProviderRegistry")
            .field("providers", &names)
            .field("active", &self.active_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::ProviderRegistry;
    use crate::db::SqliteBackend;
    use crate::errors::{AppError, AppResult};
    use crate::events::{EventBus, EventKind};
    use crate::models::{Row, SqlValue};
    use crate::providers::{Capabilities, StorageBackend, Store};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn backend(dir: &tempfile::TempDir, name: &str) -> Arc<dyn StorageBackend> {
        Arc::new(SqliteBackend::new(name, dir.path().join(format!("{name}.db"))))
    }

    struct QueryOnlyBackend;

    impl Store for QueryOnlyBackend {
        fn query(&self, _sql: &str, _params: &[SqlValue]) -> AppResult<Vec<Row>> {
            Ok(Vec::new())
        }
        fn execute(&self, _sql: &str, _params: &[SqlValue]) -> AppResult<i64> {
            Err(AppError::Internal("unsupported".to_string()))
        }
        fn begin_transaction(&self) -> AppResult<()> {
            Err(AppError::Internal("unsupported".to_string()))
        }
        fn commit(&self) -> AppResult<()> {
            Err(AppError::Internal("unsupported".to_string()))
        }
        fn rollback(&self) -> AppResult<()> {
            Err(AppError::Internal("unsupported".to_string()))
        }
        fn metadata(&self, _key: &str) -> AppResult<Option<String>> {
            Ok(None)
        }
        fn set_metadata(&self, _key: &str, _value: &str) -> AppResult<()> {
            Err(AppError::Internal("unsupported".to_string()))
        }
    }

    impl StorageBackend for QueryOnlyBackend {
        fn name(&self) -> &str {
            "query-only"
        }
        fn kind(&self) -> &'static str {
            "stub"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                execute: false,
                transactions: false,
                ..Capabilities::FULL
            }
        }
        fn initialize(&self) -> AppResult<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn in_transaction(&self) -> bool {
            false
        }
        fn close(&self) {}
        fn database_path(&self) -> Option<PathBuf> {
            None
        }
    }

    #[test]
    fn delegation_without_active_provider_fails() {
        let registry = ProviderRegistry::new(EventBus::new());
        assert!(matches!(registry.query("SELECT 1", &[]), Err(AppError::NoActiveProvider)));
        assert!(matches!(registry.schema_version(), Err(AppError::NoActiveProvider)));
    }

    #[test]
    fn switching_connects_target_and_closes_previous() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ProviderRegistry::new(EventBus::new());
        let local = backend(&dir, "local");
        let archive = backend(&dir, "archive");
        registry.register("local", Arc::clone(&local)).expect("register local");
        registry.register("archive", Arc::clone(&archive)).expect("register archive");

        registry.switch_to("local").expect("switch local");
        assert!(local.is_connected());
        assert_eq!(registry.schema_version().expect("version"), 4);

        registry.switch_to("archive").expect("switch archive");
        assert!(!local.is_connected());
        assert!(archive.is_connected());
        assert_eq!(registry.active_name().as_deref(), Some("archive"));

        let providers = registry.available_providers().expect("providers");
        assert_eq!(providers.len(), 2);
        assert!(providers.iter().any(|info| info.name == "archive" && info.active && info.connected));
    }

    #[test]
    fn switching_to_missing_provider_keeps_previous_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ProviderRegistry::new(EventBus::new());
        let local = backend(&dir, "local");
        registry.register("local", Arc::clone(&local)).expect("register");
        registry.switch_to("local").expect("switch");

        let error = registry.switch_to("missing").expect_err("missing provider");
        match &error {
            AppError::ProviderSwitch { name, reason } => {
                assert_eq!(name, "missing");
                assert!(reason.contains("not registered"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.active_name().as_deref(), Some("local"));
        assert!(local.is_connected());
        registry.query("SELECT 1", &[]).expect("still routed");
    }

    #[test]
    fn failed_initialization_rolls_back_to_previous_provider() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file").expect("write");

        let registry = ProviderRegistry::new(EventBus::new());
        let local = backend(&dir, "local");
        registry.register("local", Arc::clone(&local)).expect("register");
        registry
            .register("broken", Arc::new(SqliteBackend::new("broken", blocker.join("db.sqlite"))))
            .expect("register broken");
        registry.switch_to("local").expect("switch");

        assert!(matches!(registry.switch_to("broken"), Err(AppError::ProviderSwitch { .. })));
        assert_eq!(registry.active_name().as_deref(), Some("local"));
        assert!(local.is_connected());
    }

    #[test]
    fn active_provider_cannot_be_unregistered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ProviderRegistry::new(EventBus::new());
        registry.register("local", backend(&dir, "local")).expect("register");
        registry.register("spare", backend(&dir, "spare")).expect("register");
        registry.switch_to("local").expect("switch");

        assert!(matches!(registry.unregister("local"), Err(AppError::InvalidProvider(_))));
        registry.unregister("spare").expect("unregister spare");
        assert!(matches!(registry.unregister("spare"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn re_registering_an_inactive_name_overwrites_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ProviderRegistry::new(EventBus::new());
        let first = backend(&dir, "first");
        let second = backend(&dir, "second");
        registry.register("local", backend(&dir, "local")).expect("register local");
        registry.switch_to("local").expect("switch");
        registry.register("spare", Arc::clone(&first)).expect("register");
        first.initialize().expect("connect first");

        registry.register("spare", Arc::clone(&second)).expect("overwrite");
        assert!(!first.is_connected());
        let current = registry.backend("spare").expect("lookup").expect("registered");
        assert!(Arc::ptr_eq(&current, &second));

        registry.switch_to("spare").expect("switch to replacement");
        assert!(second.is_connected());
        assert_eq!(registry.available_providers().expect("providers").len(), 2);
    }

    #[test]
    fn re_registering_the_active_name_applies_on_the_next_switch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ProviderRegistry::new(EventBus::new());
        let original = backend(&dir, "original");
        let replacement = backend(&dir, "replacement");
        registry.register("local", Arc::clone(&original)).expect("register");
        registry.switch_to("local").expect("switch");
        registry
            .execute("INSERT INTO tasks (name) VALUES ('Original')", &[])
            .expect("task");

        registry.register("local", Arc::clone(&replacement)).expect("overwrite active");
        assert!(original.is_connected());
        assert!(!replacement.is_connected());
        let routed = registry
            .query("SELECT COUNT(1) AS total FROM tasks", &[])
            .expect("query");
        assert_eq!(routed[0].i64("total"), Some(1));

        registry.switch_to("local").expect("apply replacement");
        assert!(!original.is_connected());
        assert!(replacement.is_connected());
        let routed = registry
            .query("SELECT COUNT(1) AS total FROM tasks", &[])
            .expect("query");
        assert_eq!(routed[0].i64("total"), Some(0));
        assert_eq!(registry.active_name().as_deref(), Some("local"));
    }

    #[test]
    fn switch_is_refused_during_an_open_transaction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ProviderRegistry::new(EventBus::new());
        registry.register("local", backend(&dir, "local")).expect("register");
        registry.register("spare", backend(&dir, "spare")).expect("register");
        registry.switch_to("local").expect("switch");

        registry.begin_transaction().expect("begin");
        assert!(matches!(registry.switch_to("spare"), Err(AppError::ProviderSwitch { .. })));
        registry.rollback().expect("rollback");
        registry.switch_to("spare").expect("switch after rollback");
    }

    #[test]
    fn backends_missing_capabilities_are_rejected() {
        let registry = ProviderRegistry::new(EventBus::new());
        let error = registry
            .register("stub", Arc::new(QueryOnlyBackend))
            .expect_err("rejected");
        match error {
            AppError::InvalidProvider(message) => {
                assert!(message.contains("execute"));
                assert!(message.contains("transactions"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.register("  ", Arc::new(QueryOnlyBackend)).is_err());
    }

    #[test]
    fn notifies_subscribers_and_survives_failing_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let events = EventBus::new();
        let switched = Arc::new(AtomicUsize::new(0));
        let changed = Arc::new(AtomicUsize::new(0));

        events.subscribe(EventKind::ProviderSwitched, |_| panic!("broken subscriber"));
        let counter = Arc::clone(&switched);
        events.subscribe(EventKind::ProviderSwitched, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = Arc::clone(&changed);
        events.subscribe(EventKind::ProvidersChanged, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let registry = ProviderRegistry::new(events);
        registry.register("local", backend(&dir, "local")).expect("register");
        registry.switch_to("local").expect("switch");
        registry.switch_to("local").expect("re-confirm");

        assert_eq!(changed.load(Ordering::SeqCst), 1);
        assert_eq!(switched.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active_name().as_deref(), Some("local"));
    }
}
