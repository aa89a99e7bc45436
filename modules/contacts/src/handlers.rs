use async_trait::async_trait;
use chrono::{DateTime, Utc};
use contact_bus::{ContactDetails, EventEnvelope, EventHandler, EventPayload, HandlerError};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Event ids remembered for redelivery checks before the oldest is forgotten
pub const DEFAULT_RECENT_EVENTS: usize = 10_000;

/// Bounded set of recently seen event ids, oldest evicted first
struct RecentEvents {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    capacity: usize,
}

impl RecentEvents {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    fn remember(&mut self, id: Uuid) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct DirectoryState {
    entries: HashMap<i32, ContactDetails>,
    // Newest event applied per contact, deletions included
    last_applied: HashMap<i32, (DateTime<Utc>, Uuid)>,
    recent: RecentEvents,
    applied_total: usize,
}

/// Read model of contacts built from contact events
///
/// Safe under at-least-once delivery:
/// - an event id seen recently, or the last one applied for its contact, is skipped
/// - an event older than the last one applied for its contact is skipped
///
/// Memory for redelivery checks is one entry per contact plus at most
/// `recent_capacity` event ids.
pub struct ContactDirectory {
    state: RwLock<DirectoryState>,
}

impl ContactDirectory {
    pub fn new() -> Self {
        Self::with_recent_capacity(DEFAULT_RECENT_EVENTS)
    }

    pub fn with_recent_capacity(recent_capacity: usize) -> Self {
        Self {
            state: RwLock::new(DirectoryState {
                entries: HashMap::new(),
                last_applied: HashMap::new(),
                recent: RecentEvents::new(recent_capacity),
                applied_total: 0,
            }),
        }
    }

    pub async fn get(&self, subject_id: i32) -> Option<ContactDetails> {
        self.state.read().await.entries.get(&subject_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    /// Events applied so far, duplicates and stale events excluded
    pub async fn applied_events(&self) -> usize {
        self.state.read().await.applied_total
    }

    /// Event ids currently held for redelivery checks
    pub async fn remembered_events(&self) -> usize {
        self.state.read().await.recent.len()
    }
}

impl Default for ContactDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventHandler for ContactDirectory {
    async fn handle(&self, envelope: EventEnvelope, routing_key: &str) -> Result<(), HandlerError> {
        let subject_id = envelope.subject_id();
        let mut state = self.state.write().await;

        let event_id = envelope.event_id();
        let last = state.last_applied.get(&subject_id).copied();

        if state.recent.contains(&event_id) || last.is_some_and(|(_, id)| id == event_id) {
            tracing::debug!(
                event_id = %envelope.event_id(),
                subject_id = subject_id,
                "Event already applied, skipping"
            );
            return Ok(());
        }

        if let Some((last_at, _)) = last {
            if envelope.timestamp() < last_at {
                tracing::warn!(
                    event_id = %envelope.event_id(),
                    event_kind = %envelope.kind(),
                    subject_id = subject_id,
                    "Event older than directory entry, skipping"
                );
                state.recent.remember(event_id);
                return Ok(());
            }
        }

        match envelope.payload() {
            EventPayload::Created(details) => {
                state.entries.insert(subject_id, details.clone());
            }
            EventPayload::Updated(changed) => {
                state.entries.insert(subject_id, changed.details.clone());
            }
            EventPayload::Deleted(_) => {
                state.entries.remove(&subject_id);
            }
        }
        state
            .last_applied
            .insert(subject_id, (envelope.timestamp(), event_id));
        state.recent.remember(event_id);
        state.applied_total += 1;

        tracing::info!(
            event_kind = %envelope.kind(),
            subject_id = subject_id,
            routing_key = %routing_key,
            entries = state.entries.len(),
            "Directory updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn details(name: &str) -> ContactDetails {
        ContactDetails {
            name: name.to_string(),
            area_code: "11".to_string(),
            phone_number: "987654321".to_string(),
            email: "a@x.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_applies_lifecycle() {
        let directory = ContactDirectory::new();

        directory
            .handle(EventEnvelope::created(1, details("Ana")), "contact.created")
            .await
            .unwrap();
        assert_eq!(directory.get(1).await.map(|d| d.name), Some("Ana".to_string()));

        directory
            .handle(
                EventEnvelope::updated(1, details("Ana Maria"), Utc::now()),
                "contact.updated",
            )
            .await
            .unwrap();
        assert_eq!(directory.get(1).await.map(|d| d.name), Some("Ana Maria".to_string()));

        directory
            .handle(EventEnvelope::deleted(1, "Ana Maria".to_string()), "contact.deleted")
            .await
            .unwrap();
        assert!(directory.is_empty().await);
        assert_eq!(directory.applied_events().await, 3);
    }

    #[tokio::test]
    async fn test_duplicate_event_is_applied_once() {
        let directory = ContactDirectory::new();
        let created = EventEnvelope::created(1, details("Ana"));
        let deleted = EventEnvelope::deleted(1, "Ana".to_string());

        directory.handle(created.clone(), "contact.created").await.unwrap();
        directory.handle(deleted, "contact.deleted").await.unwrap();
        // Redelivery of the Created event must not resurrect the contact
        directory.handle(created, "contact.created").await.unwrap();

        assert!(directory.get(1).await.is_none());
        assert_eq!(directory.applied_events().await, 2);
    }

    #[tokio::test]
    async fn test_redelivery_memory_is_bounded() {
        let directory = ContactDirectory::with_recent_capacity(100);
        let mut last = None;

        for id in 1..=1000 {
            let created = EventEnvelope::created(id, details("Ana"));
            directory.handle(created.clone(), "contact.created").await.unwrap();
            let deleted = EventEnvelope::deleted(id, "Ana".to_string());
            directory.handle(deleted, "contact.deleted").await.unwrap();
            last = Some(created);
        }

        assert!(directory.is_empty().await);
        assert_eq!(directory.applied_events().await, 2000);
        assert_eq!(directory.remembered_events().await, 100);

        // A recent redelivery is still skipped
        let created = last.unwrap();
        directory.handle(created, "contact.created").await.unwrap();
        assert!(directory.get(1000).await.is_none());
        assert_eq!(directory.applied_events().await, 2000);
    }

    #[tokio::test]
    async fn test_forgotten_redelivery_is_caught_by_contact_history() {
        let directory = ContactDirectory::with_recent_capacity(1);
        let created = EventEnvelope::created(1, details("Ana"));
        let deleted = EventEnvelope::deleted(1, "Ana".to_string());

        directory.handle(created.clone(), "contact.created").await.unwrap();
        directory.handle(deleted.clone(), "contact.deleted").await.unwrap();
        directory
            .handle(EventEnvelope::created(2, details("Bia")), "contact.created")
            .await
            .unwrap();

        // Both ids for contact 1 have left the recent set
        directory.handle(deleted, "contact.deleted").await.unwrap();
        assert_eq!(directory.applied_events().await, 3);
        assert_eq!(directory.get(2).await.map(|d| d.name), Some("Bia".to_string()));
    }

    #[tokio::test]
    async fn test_stale_event_is_skipped() {
        let directory = ContactDirectory::new();
        let newer = EventEnvelope::updated(1, details("New"), Utc::now());
        let older = EventEnvelope::updated(1, details("Old"), Utc::now());
        // Build an event whose timestamp precedes the newer one
        let mut older_json = serde_json::to_value(&older).unwrap();
        older_json["timestamp"] =
            serde_json::json!((newer.timestamp() - Duration::seconds(5)).to_rfc3339());
        let older: EventEnvelope = serde_json::from_value(older_json).unwrap();

        directory.handle(newer, "contact.updated").await.unwrap();
        directory.handle(older, "contact.updated").await.unwrap();

        assert_eq!(directory.get(1).await.map(|d| d.name), Some("New".to_string()));
    }
}
