//! JSONL log of events whose processing failed after every retry.
//!
//! The partition still advances past such an event; this file is the only
//! record left of it besides the error log.

use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::event::{EventEnvelope, RoutedEvent};

/// One line of the dead-letter log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    /// Topic the event was read from.
    pub topic: String,
    /// Partition the event was read from.
    pub partition: u32,
    /// Consumer that read it.
    pub consumer_id: String,
    /// Handler it was routed to.
    pub handler: String,
    /// Observer instance, for observer notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observer_id: Option<String>,
    /// The event itself.
    pub event: EventEnvelope,
    /// Error from the final attempt.
    pub error: String,
    /// Unix timestamp (seconds) of the failure.
    pub ts: u64,
}

/// Append a dead-letter entry for `routed` to the JSONL file at `path`.
///
/// Creates the file and its parent directory if needed.
///
/// # Errors
///
/// Returns `io::Error` if serialization or file I/O fails.
pub(crate) fn append_dead_letter(path: &Path, routed: &RoutedEvent, error: &str) -> io::Result<()> {
    let ts = std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let entry = DeadLetterEntry {
        topic: routed.topic.clone(),
        partition: routed.partition,
        consumer_id: routed.consumer_id.clone(),
        handler: routed.registration.handler_type_name().to_string(),
        observer_id: routed.observer_id.clone(),
        event: routed.event.clone(),
        error: error.to_string(),
        ts,
    };
    let json = serde_json::to_string(&entry).map_err(io::Error::other)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{json}")?;
    Ok(())
}

/// Read every entry from a dead-letter file.
///
/// # Errors
///
/// Returns `io::Error` if the file cannot be read or a line is not a valid
/// entry.
pub fn read_dead_letters(path: &Path) -> io::Result<Vec<DeadLetterEntry>> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(io::Error::other))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::registration::{HandlerRegistry, RegistrationKey};

    fn routed() -> RoutedEvent {
        let registry = HandlerRegistry::builder()
            .remote(RegistrationKey::Event("Billed".to_string()), "BillingHandler")
            .build()
            .expect("build should succeed");
        RoutedEvent {
            event: EventEnvelope::new("Billed", "acct-1").with_id("e-1"),
            partition_key: "acct-1".to_string(),
            topic: "billing".to_string(),
            partition: 2,
            consumer_id: "{app-billing-2}-default".to_string(),
            registration: registry.resolve("Billed").expect("registered"),
            observer_id: None,
        }
    }

    #[test]
    fn dead_letter_append_creates_readable_jsonl() {
        let tmp = tempfile::tempdir().expect("failed to create tmpdir");
        let path = tmp.path().join("nested").join("dead_letters.jsonl");

        append_dead_letter(&path, &routed(), "first").expect("append should succeed");
        append_dead_letter(&path, &routed(), "second").expect("append should succeed");

        let entries = read_dead_letters(&path).expect("read should succeed");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].error, "first");
        assert_eq!(entries[1].error, "second");
        assert_eq!(entries[0].event.id, "e-1");
        assert_eq!(entries[0].partition, 2);
        assert_eq!(entries[0].handler, "BillingHandler");
    }

    #[test]
    fn registration_is_shared_not_copied() {
        let event = routed();
        let again = event.clone();
        assert!(Arc::ptr_eq(&event.registration, &again.registration));
    }
}
