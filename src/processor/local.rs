//! In-process handler invocation.

use crate::error::ProcessError;
use crate::event::RoutedEvent;
use crate::processor::EventProcessor;
use crate::registration::HandlerScope;

/// Runs the registered handler in this process.
///
/// Every attempt opens a fresh [`HandlerScope`], builds the handler inside
/// it, and closes the scope once the handler returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProcessor;

impl LocalProcessor {
    /// Create a local processor.
    pub fn new() -> Self {
        Self
    }
}

#[tonic::async_trait]
impl EventProcessor for LocalProcessor {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn process_once(&self, routed: &RoutedEvent) -> Result<(), ProcessError> {
        let registration = &routed.registration;
        let Some(factory) = registration.factory() else {
            return Err(ProcessError::Handler(format!(
                "no local handler for '{}' ({} is served remotely)",
                registration.key().lookup(),
                registration.handler_type_name()
            )));
        };

        let mut scope = HandlerScope::new(routed.event.id.clone());
        let handler = factory.create(&mut scope);
        let result = handler
            .handle(&routed.event, routed.observer_id.as_deref())
            .await;
        // Handler first, then the scope it was built in.
        drop(handler);
        drop(scope);

        result.map_err(|e| ProcessError::Handler(e.to_string()))
    }
}
