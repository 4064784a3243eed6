//! Event envelopes, observer notifications, and routed work.
//!
//! An [`EventEnvelope`] is the only shape the runtime knows about: an `id`,
//! a `name`, a `partitionKey`, and whatever other fields the domain puts
//! next to them. The runtime never interprets those extra fields; handlers
//! recover their own types with [`EventEnvelope::decode`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registration::Registration;

/// Name of the control event that wipes a consumer's tracked-id set.
pub const CLEAR_TRACKED_KEYS_EVENT: &str = "__clear_tracked_keys";

/// Name of the envelope that wraps an event for one observer.
pub const OBSERVER_NOTIFICATION_EVENT: &str = "__observer_notification";

/// Identity of the aggregate that raised an event, used for observer
/// fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observable {
    /// Aggregate type name (e.g. `"Order"`).
    pub observable_type: String,
    /// Aggregate instance id.
    pub observable_id: String,
}

/// A serialized domain event as it travels through the log.
///
/// # Examples
///
/// ```
/// use eda_runtime::EventEnvelope;
///
/// let event = EventEnvelope::new("OrderPlaced", "order-7")
///     .with_field("total", serde_json::json!(42));
/// let json = serde_json::to_value(&event).expect("serialize");
/// assert_eq!(json["name"], "OrderPlaced");
/// assert_eq!(json["partitionKey"], "order-7");
/// assert_eq!(json["total"], 42);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Unique event id. Used for replay de-duplication.
    pub id: String,
    /// Event type name. Used for handler lookup.
    pub name: String,
    /// Key that picks the partition and serializes processing order.
    pub partition_key: String,
    /// Aggregate that raised the event, if observers may care about it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observable: Option<Observable>,
    /// All remaining fields, untouched.
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Create an envelope with a fresh UUID v4 id and an empty payload.
    pub fn new(name: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            partition_key: partition_key.into(),
            observable: None,
            payload: serde_json::Map::new(),
        }
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add or overwrite a single payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Merge the fields of a serializable struct into the payload.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if `data` does not serialize to a JSON
    /// object.
    pub fn with_payload<T: Serialize>(mut self, data: &T) -> serde_json::Result<Self> {
        match serde_json::to_value(data)? {
            serde_json::Value::Object(fields) => {
                self.payload.extend(fields);
                Ok(self)
            }
            other => Err(serde::ser::Error::custom(format!(
                "event payload must be a JSON object, got {other}"
            ))),
        }
    }

    /// Tag the envelope with the aggregate that raised it.
    pub fn observed_as(
        mut self,
        observable_type: impl Into<String>,
        observable_id: impl Into<String>,
    ) -> Self {
        self.observable = Some(Observable {
            observable_type: observable_type.into(),
            observable_id: observable_id.into(),
        });
        self
    }

    /// Deserialize the whole envelope (id, name and payload fields) into a
    /// concrete event type.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the fields do not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(serde_json::to_value(self)?)
    }

    /// Build the control event that clears tracked ids on whichever
    /// consumer reads it.
    pub fn clear_tracked_keys(partition_key: impl Into<String>) -> Self {
        Self::new(CLEAR_TRACKED_KEYS_EVENT, partition_key)
    }

    /// Returns `true` for the tracked-id clearing control event.
    pub fn is_clear_tracked_keys(&self) -> bool {
        self.name == CLEAR_TRACKED_KEYS_EVENT
    }

    /// Returns `true` for an observer notification envelope.
    pub fn is_observer_notification(&self) -> bool {
        self.name == OBSERVER_NOTIFICATION_EVENT
    }
}

/// Key under which observer handlers are registered and looked up.
pub fn observer_key(observer_type: &str, observable_type: &str, event_type: &str) -> String {
    format!(".{observer_type}.{observable_type}.{event_type}")
}

/// An event delivered to one specific observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserverNotification {
    /// Observer aggregate type.
    pub observer_type: String,
    /// Observer instance id.
    pub observer_id: String,
    /// The original event, carrying its `observable` tag.
    pub event: EventEnvelope,
}

impl ObserverNotification {
    /// The key an observer handler for this notification is registered
    /// under, or `None` if the wrapped event has no observable tag.
    pub fn observer_key(&self) -> Option<String> {
        self.event.observable.as_ref().map(|o| {
            observer_key(&self.observer_type, &o.observable_type, &self.event.name)
        })
    }

    /// Wrap into a log envelope partitioned by observer id.
    pub fn into_envelope(self) -> EventEnvelope {
        let mut envelope = EventEnvelope::new(OBSERVER_NOTIFICATION_EVENT, self.observer_id.clone());
        envelope
            .payload
            .insert("observerType".to_string(), self.observer_type.into());
        envelope
            .payload
            .insert("observerId".to_string(), self.observer_id.into());
        // Serializing an envelope into a Value cannot fail: every field is a
        // string or already a JSON value.
        if let Ok(inner) = serde_json::to_value(self.event) {
            envelope.payload.insert("event".to_string(), inner);
        }
        envelope
    }

    /// Unwrap a log envelope produced by [`into_envelope`](Self::into_envelope).
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the envelope is not a well-formed
    /// notification.
    pub fn from_envelope(envelope: &EventEnvelope) -> serde_json::Result<Self> {
        serde_json::from_value(serde_json::Value::Object(envelope.payload.clone()))
    }
}

/// An event resolved to its handler and ready for scheduling.
#[derive(Debug, Clone)]
pub struct RoutedEvent {
    /// The event handed to the handler. For observer notifications this is
    /// the wrapped original event.
    pub event: EventEnvelope,
    /// Key that serializes processing order in the scheduler.
    pub partition_key: String,
    /// Topic the event was read from.
    pub topic: String,
    /// Partition the event was read from.
    pub partition: u32,
    /// Id of the consumer that read it.
    pub consumer_id: String,
    /// Handler registration resolved for the event.
    pub registration: Arc<Registration>,
    /// Observer instance id for observer notifications.
    pub observer_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct OrderPlaced {
        id: String,
        partition_key: String,
        total: u64,
    }

    #[test]
    fn new_generates_distinct_ids() {
        let a = EventEnvelope::new("A", "k");
        let b = EventEnvelope::new("A", "k");
        assert_ne!(a.id, b.id);
        assert!(Uuid::parse_str(&a.id).is_ok());
    }

    #[test]
    fn payload_fields_are_flattened() {
        let event = EventEnvelope::new("OrderPlaced", "o-1")
            .with_id("e-1")
            .with_field("total", serde_json::json!(10));
        let json = serde_json::to_string(&event).expect("serialize");
        let back: EventEnvelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
        assert!(json.contains("\"total\":10"));
        assert!(!json.contains("observable"));
    }

    #[test]
    fn decode_into_concrete_type() {
        let event = EventEnvelope::new("OrderPlaced", "o-1")
            .with_id("e-1")
            .with_field("total", serde_json::json!(10));
        let order: OrderPlaced = event.decode().expect("decode should succeed");
        assert_eq!(
            order,
            OrderPlaced {
                id: "e-1".to_string(),
                partition_key: "o-1".to_string(),
                total: 10,
            }
        );
    }

    #[test]
    fn with_payload_rejects_non_objects() {
        let result = EventEnvelope::new("A", "k").with_payload(&42);
        assert!(result.is_err());
    }

    #[test]
    fn with_payload_merges_fields() {
        #[derive(Serialize)]
        struct Data {
            sku: &'static str,
            qty: u32,
        }
        let event = EventEnvelope::new("A", "k")
            .with_payload(&Data { sku: "x", qty: 2 })
            .expect("object payload");
        assert_eq!(event.payload["sku"], "x");
        assert_eq!(event.payload["qty"], 2);
    }

    #[test]
    fn clear_tracked_keys_control_event() {
        let event = EventEnvelope::clear_tracked_keys("p");
        assert!(event.is_clear_tracked_keys());
        assert!(!event.is_observer_notification());
    }

    #[test]
    fn observer_notification_survives_envelope() {
        let original = EventEnvelope::new("Shipped", "order-1").observed_as("Order", "order-1");
        let notification = ObserverNotification {
            observer_type: "Customer".to_string(),
            observer_id: "cust-9".to_string(),
            event: original.clone(),
        };
        let envelope = notification.clone().into_envelope();
        assert!(envelope.is_observer_notification());
        assert_eq!(envelope.partition_key, "cust-9");

        let back = ObserverNotification::from_envelope(&envelope).expect("unwrap");
        assert_eq!(back, notification);
        assert_eq!(back.observer_key().as_deref(), Some(".Customer.Order.Shipped"));
    }

    #[test]
    fn observer_key_requires_observable_tag() {
        let notification = ObserverNotification {
            observer_type: "Customer".to_string(),
            observer_id: "c".to_string(),
            event: EventEnvelope::new("Shipped", "o"),
        };
        assert_eq!(notification.observer_key(), None);
    }
}
