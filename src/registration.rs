//! Handler registration: which handler runs for which event name or
//! observer key.
//!
//! Registrations are collected with a [`HandlerRegistryBuilder`] at
//! startup and frozen into a [`HandlerRegistry`]. Each event gets a fresh
//! handler built by its [`HandlerFactory`] inside a [`HandlerScope`] that is
//! torn down as soon as the handler returns.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::event::{EventEnvelope, observer_key};

/// Error type handlers return. Any error is retried by the processor.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handles one event.
///
/// `observer_id` is `Some` only for observer registrations, carrying the
/// id of the observing instance the notification was addressed to.
#[tonic::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle `event`.
    ///
    /// # Errors
    ///
    /// Any error marks the attempt as failed and is subject to retry.
    async fn handle(
        &self,
        event: &EventEnvelope,
        observer_id: Option<&str>,
    ) -> Result<(), HandlerError>;
}

/// Per-event lifetime for a handler and whatever it acquires.
///
/// Teardown callbacks run in reverse registration order when the scope is
/// dropped, whether the handler succeeded, failed, or panicked.
pub struct HandlerScope {
    event_id: String,
    teardown: Vec<Box<dyn FnOnce() + Send>>,
}

impl HandlerScope {
    pub(crate) fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            teardown: Vec::new(),
        }
    }

    /// Id of the event this scope was opened for.
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Run `f` when the scope closes.
    pub fn on_teardown(&mut self, f: impl FnOnce() + Send + 'static) {
        self.teardown.push(Box::new(f));
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        while let Some(f) = self.teardown.pop() {
            f();
        }
    }
}

impl std::fmt::Debug for HandlerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerScope")
            .field("event_id", &self.event_id)
            .field("teardown", &self.teardown.len())
            .finish()
    }
}

/// Builds a handler for one event inside its scope.
pub trait HandlerFactory: Send + Sync {
    /// Construct the handler.
    fn create(&self, scope: &mut HandlerScope) -> Box<dyn EventHandler>;
}

struct FnFactory<F>(F);

impl<F, H> HandlerFactory for FnFactory<F>
where
    F: Fn(&mut HandlerScope) -> H + Send + Sync,
    H: EventHandler + 'static,
{
    fn create(&self, scope: &mut HandlerScope) -> Box<dyn EventHandler> {
        Box::new((self.0)(scope))
    }
}

/// What a registration is looked up by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegistrationKey {
    /// A plain event type name.
    Event(String),
    /// An observer subscription.
    Observer {
        /// Observing aggregate type.
        observer_type: String,
        /// Observed aggregate type.
        observable_type: String,
        /// Observed event type name.
        event_type: String,
    },
}

impl RegistrationKey {
    /// The string the consumer resolves: the event name, or
    /// `.{observer}.{observable}.{event}`.
    pub fn lookup(&self) -> String {
        match self {
            Self::Event(name) => name.clone(),
            Self::Observer {
                observer_type,
                observable_type,
                event_type,
            } => observer_key(observer_type, observable_type, event_type),
        }
    }
}

/// One registered handler.
pub struct Registration {
    key: RegistrationKey,
    handler_type_name: String,
    factory: Option<Arc<dyn HandlerFactory>>,
}

impl Registration {
    /// What this registration is looked up by.
    pub fn key(&self) -> &RegistrationKey {
        &self.key
    }

    /// Name of the handler implementation, for logs and remote routing.
    pub fn handler_type_name(&self) -> &str {
        &self.handler_type_name
    }

    /// Returns `true` for observer registrations.
    pub fn is_observer(&self) -> bool {
        matches!(self.key, RegistrationKey::Observer { .. })
    }

    /// The local factory, absent for registrations served remotely.
    pub fn factory(&self) -> Option<&Arc<dyn HandlerFactory>> {
        self.factory.as_ref()
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("handler_type_name", &self.handler_type_name)
            .field("local", &self.factory.is_some())
            .finish()
    }
}

/// Immutable lookup table from event name or observer key to registration.
#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    by_key: HashMap<String, Arc<Registration>>,
}

impl HandlerRegistry {
    /// Start collecting registrations.
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Resolve an event name or observer key.
    pub fn resolve(&self, key: &str) -> Option<Arc<Registration>> {
        self.by_key.get(key).cloned()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Collects registrations and validates uniqueness on
/// [`build`](HandlerRegistryBuilder::build).
///
/// # Examples
///
/// ```
/// use eda_runtime::{EventEnvelope, EventHandler, HandlerError, HandlerRegistry};
///
/// struct AuditLog;
///
/// #[tonic::async_trait]
/// impl EventHandler for AuditLog {
///     async fn handle(&self, _event: &EventEnvelope, _observer: Option<&str>) -> Result<(), HandlerError> {
///         Ok(())
///     }
/// }
///
/// let registry = HandlerRegistry::builder()
///     .handler("OrderPlaced", |_scope| AuditLog)
///     .build()
///     .expect("no duplicates");
/// assert!(registry.resolve("OrderPlaced").is_some());
/// ```
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    registrations: Vec<Registration>,
}

impl HandlerRegistryBuilder {
    /// Register a local handler for `event_name`.
    pub fn handler<F, H>(mut self, event_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&mut HandlerScope) -> H + Send + Sync + 'static,
        H: EventHandler + 'static,
    {
        self.registrations.push(Registration {
            key: RegistrationKey::Event(event_name.into()),
            handler_type_name: std::any::type_name::<H>().to_string(),
            factory: Some(Arc::new(FnFactory(factory))),
        });
        self
    }

    /// Register a local observer handler, run for notifications about
    /// `event_type` raised by `observable_type` instances that an
    /// `observer_type` instance observes.
    pub fn observer<F, H>(
        mut self,
        observer_type: impl Into<String>,
        observable_type: impl Into<String>,
        event_type: impl Into<String>,
        factory: F,
    ) -> Self
    where
        F: Fn(&mut HandlerScope) -> H + Send + Sync + 'static,
        H: EventHandler + 'static,
    {
        self.registrations.push(Registration {
            key: RegistrationKey::Observer {
                observer_type: observer_type.into(),
                observable_type: observable_type.into(),
                event_type: event_type.into(),
            },
            handler_type_name: std::any::type_name::<H>().to_string(),
            factory: Some(Arc::new(FnFactory(factory))),
        });
        self
    }

    /// Register an event name whose handler lives behind a remote
    /// processor. The consumer routes it; the remote target handles it.
    pub fn remote(
        mut self,
        key: RegistrationKey,
        handler_type_name: impl Into<String>,
    ) -> Self {
        self.registrations.push(Registration {
            key,
            handler_type_name: handler_type_name.into(),
            factory: None,
        });
        self
    }

    /// Freeze the registrations.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateHandler`] if two registrations share
    /// an event name or observer key.
    pub fn build(self) -> Result<HandlerRegistry, ConfigError> {
        let mut by_key = HashMap::with_capacity(self.registrations.len());
        for registration in self.registrations {
            match by_key.entry(registration.key.lookup()) {
                Entry::Occupied(existing) => {
                    let existing: &Arc<Registration> = existing.get();
                    return Err(ConfigError::DuplicateHandler {
                        key: registration.key.lookup(),
                        existing: existing.handler_type_name.clone(),
                        duplicate: registration.handler_type_name,
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(registration));
                }
            }
        }
        Ok(HandlerRegistry { by_key })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Noop;

    #[tonic::async_trait]
    impl EventHandler for Noop {
        async fn handle(&self, _: &EventEnvelope, _: Option<&str>) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct Other;

    #[tonic::async_trait]
    impl EventHandler for Other {
        async fn handle(&self, _: &EventEnvelope, _: Option<&str>) -> Result<(), HandlerError> {
            Err("always fails".into())
        }
    }

    #[test]
    fn resolves_events_and_observers() {
        let registry = HandlerRegistry::builder()
            .handler("OrderPlaced", |_| Noop)
            .observer("Customer", "Order", "Shipped", |_| Noop)
            .build()
            .expect("build should succeed");
        assert_eq!(registry.len(), 2);

        let event = registry.resolve("OrderPlaced").expect("event registered");
        assert!(!event.is_observer());
        assert!(event.handler_type_name().ends_with("Noop"));

        let observer = registry
            .resolve(".Customer.Order.Shipped")
            .expect("observer registered");
        assert!(observer.is_observer());
        assert!(registry.resolve("Unknown").is_none());
    }

    #[test]
    fn duplicate_event_name_is_fatal() {
        let err = HandlerRegistry::builder()
            .handler("OrderPlaced", |_| Noop)
            .handler("OrderPlaced", |_| Other)
            .build()
            .unwrap_err();
        match err {
            ConfigError::DuplicateHandler {
                key,
                existing,
                duplicate,
            } => {
                assert_eq!(key, "OrderPlaced");
                assert!(existing.ends_with("Noop"));
                assert!(duplicate.ends_with("Other"));
            }
            other => panic!("expected DuplicateHandler, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_observer_key_is_fatal() {
        let result = HandlerRegistry::builder()
            .observer("Customer", "Order", "Shipped", |_| Noop)
            .remote(
                RegistrationKey::Observer {
                    observer_type: "Customer".to_string(),
                    observable_type: "Order".to_string(),
                    event_type: "Shipped".to_string(),
                },
                "RemoteShipped",
            )
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn remote_registration_has_no_factory() {
        let registry = HandlerRegistry::builder()
            .remote(RegistrationKey::Event("Billed".to_string()), "BillingHandler")
            .build()
            .expect("build should succeed");
        let registration = registry.resolve("Billed").expect("registered");
        assert!(registration.factory().is_none());
        assert_eq!(registration.handler_type_name(), "BillingHandler");
    }

    #[test]
    fn scope_teardown_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let mut scope = HandlerScope::new("e-1");
            assert_eq!(scope.event_id(), "e-1");
            for i in 0..3 {
                let order = Arc::clone(&order);
                scope.on_teardown(move || order.lock().unwrap().push(i));
            }
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn factory_receives_scope() {
        let registry = HandlerRegistry::builder()
            .handler("A", |scope: &mut HandlerScope| {
                scope.on_teardown(|| {});
                Noop
            })
            .build()
            .expect("build should succeed");
        let registration = registry.resolve("A").expect("registered");
        let mut scope = HandlerScope::new("e");
        let _handler = registration
            .factory()
            .expect("local factory")
            .create(&mut scope);
        assert_eq!(scope.teardown.len(), 1);
    }
}
