//! Consumer-side handler contract and kind-based dispatch

use crate::{BusError, EventEnvelope, EventKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Failure signalled by application logic inside a handler
///
/// Causes the message to be rejected without requeue.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<BusError> for HandlerError {
    fn from(e: BusError) -> Self {
        Self::new(e.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Processes decoded contact events
///
/// Handlers may run concurrently with themselves when messages arrive close
/// together; implementations needing serialization must impose it. Messages
/// are delivered at least once, so the same `event_id` can arrive twice.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Kind this handler accepts. `None` accepts every kind; a message of
    /// any other kind is treated as undecodable for this handler.
    fn expected_kind(&self) -> Option<EventKind> {
        None
    }

    /// Name used to derive the default queue (`queue_<name>`)
    fn event_type_name(&self) -> &str {
        match self.expected_kind() {
            Some(kind) => kind.type_name(),
            None => "ContactEvent",
        }
    }

    async fn handle(&self, envelope: EventEnvelope, routing_key: &str) -> Result<(), HandlerError>;
}

/// Maps each event kind to the handler responsible for it
///
/// Lets one queue and one connection serve several kinds. Kinds without a
/// registered handler are acknowledged and skipped.
///
/// # Example
/// ```rust
/// use contact_bus::{handler_fn, EventKind, HandlerRegistry};
///
/// let registry = HandlerRegistry::new()
///     .with(EventKind::Created, handler_fn(|_, _| async { Ok(()) }))
///     .with(EventKind::Deleted, handler_fn(|_, _| async { Ok(()) }));
/// assert!(registry.get(EventKind::Created).is_some());
/// assert!(registry.get(EventKind::Updated).is_none());
/// ```
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a kind
    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> &mut Self {
        if self.handlers.insert(kind, handler).is_some() {
            tracing::debug!(event_kind = %kind, "Replaced handler");
        }
        self
    }

    pub fn with(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: EventKind) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl EventHandler for HandlerRegistry {
    async fn handle(&self, envelope: EventEnvelope, routing_key: &str) -> Result<(), HandlerError> {
        match self.handlers.get(&envelope.kind()) {
            Some(handler) => handler.handle(envelope, routing_key).await,
            None => {
                tracing::debug!(
                    event_kind = %envelope.kind(),
                    subject_id = envelope.subject_id(),
                    routing_key = %routing_key,
                    "No handler registered for event kind, skipping"
                );
                Ok(())
            }
        }
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
    kind: Option<EventKind>,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f, kind: None }
    }

    /// Restrict the handler to one kind
    pub fn for_kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// Wrap an async closure `(envelope, routing_key) -> Result<(), HandlerError>`
/// as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(EventEnvelope, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler::new(f))
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn expected_kind(&self) -> Option<EventKind> {
        self.kind
    }

    async fn handle(&self, envelope: EventEnvelope, routing_key: &str) -> Result<(), HandlerError> {
        (self.f)(envelope, routing_key.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContactDetails;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn details() -> ContactDetails {
        ContactDetails {
            name: "Ana".to_string(),
            area_code: "11".to_string(),
            phone_number: "987654321".to_string(),
            email: "a@x.com".to_string(),
        }
    }

    fn counting() -> (Arc<AtomicUsize>, Arc<dyn EventHandler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler: Arc<dyn EventHandler> = handler_fn(move |_, _| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        (count, handler)
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_kind() {
        let (created, created_handler) = counting();
        let (deleted, deleted_handler) = counting();
        let registry = HandlerRegistry::new()
            .with(EventKind::Created, created_handler)
            .with(EventKind::Deleted, deleted_handler);

        registry
            .handle(EventEnvelope::created(1, details()), "contact.created")
            .await
            .unwrap();
        registry
            .handle(EventEnvelope::deleted(1, "Ana".to_string()), "contact.deleted")
            .await
            .unwrap();
        registry
            .handle(EventEnvelope::deleted(2, "Bia".to_string()), "contact.deleted")
            .await
            .unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(deleted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_registry_skips_unregistered_kind() {
        let registry = HandlerRegistry::new();
        let result = registry
            .handle(EventEnvelope::updated(1, details(), chrono::Utc::now()), "contact.updated")
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_registry_propagates_handler_error() {
        let failing = handler_fn(|_, _| async { Err(HandlerError::new("smtp down")) });
        let registry = HandlerRegistry::new().with(EventKind::Created, failing);

        let err = registry
            .handle(EventEnvelope::created(1, details()), "contact.created")
            .await
            .unwrap_err();
        assert_eq!(err.message(), "smtp down");
    }

    #[test]
    fn test_event_type_name() {
        let any = handler_fn(|_, _| async { Ok(()) });
        assert_eq!(any.event_type_name(), "ContactEvent");

        let created = FnHandler::new(|_: EventEnvelope, _: String| async {
            Ok::<(), HandlerError>(())
        })
        .for_kind(EventKind::Created);
        assert_eq!(created.event_type_name(), "ContactCreatedEvent");
    }
}
