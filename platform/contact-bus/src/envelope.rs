//! # Event Envelope
//!
//! The wire contract for every contact domain event.
//!
//! ## Envelope Fields
//!
//! - `eventId`: Unique identifier, advisory idempotency key for consumers
//! - `timestamp`: UTC creation time
//! - `subjectId`: Id of the contact the event concerns
//! - `kind`: `Created` | `Updated` | `Deleted`
//! - `payload`: Kind-specific fields
//!
//! Field names are lower-camel-case on the wire so consumers written in any
//! language can decode them. The `kind` tag fully determines the payload
//! shape; a payload that does not fit its tag fails to decode.
//!
//! ```json
//! {
//!   "eventId": "550e8400-e29b-41d4-a716-446655440000",
//!   "timestamp": "2024-01-01T00:00:00Z",
//!   "subjectId": 1,
//!   "kind": "Created",
//!   "payload": { "name": "Ana", "areaCode": "11", "phoneNumber": "987654321", "email": "a@x.com" }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{BusError, BusResult};

/// Closed set of contact event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Created, EventKind::Updated, EventKind::Deleted];

    /// Tag as it appears on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "Created",
            EventKind::Updated => "Updated",
            EventKind::Deleted => "Deleted",
        }
    }

    /// Event type name used to derive default queue names
    /// (`queue_ContactCreatedEvent`, ...)
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::Created => "ContactCreatedEvent",
            EventKind::Updated => "ContactUpdatedEvent",
            EventKind::Deleted => "ContactDeletedEvent",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contact fields carried by `Created` and `Updated` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactDetails {
    pub name: String,
    pub area_code: String,
    pub phone_number: String,
    pub email: String,
}

/// Payload of an `Updated` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactChanged {
    #[serde(flatten)]
    pub details: ContactDetails,
    pub updated_at: DateTime<Utc>,
}

/// Payload of a `Deleted` event. Only the name survives a deletion; phone and
/// email fields on the wire are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContactRemoved {
    pub name: String,
}

/// Kind-tagged payload, flattened into the envelope as `kind` + `payload`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum EventPayload {
    Created(ContactDetails),
    Updated(ContactChanged),
    Deleted(ContactRemoved),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Created(_) => EventKind::Created,
            EventPayload::Updated(_) => EventKind::Updated,
            EventPayload::Deleted(_) => EventKind::Deleted,
        }
    }
}

/// Immutable contact domain event
///
/// # Examples
///
/// ```rust
/// use contact_bus::{ContactDetails, EventEnvelope, EventKind};
///
/// let envelope = EventEnvelope::created(
///     1,
///     ContactDetails {
///         name: "Ana".to_string(),
///         area_code: "11".to_string(),
///         phone_number: "987654321".to_string(),
///         email: "a@x.com".to_string(),
///     },
/// );
/// assert_eq!(envelope.kind(), EventKind::Created);
/// assert_eq!(envelope.routing_key(), "contact.created");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    event_id: Uuid,
    timestamp: DateTime<Utc>,
    subject_id: i32,
    #[serde(flatten)]
    payload: EventPayload,
}

impl EventEnvelope {
    /// Create an envelope with a fresh event id and the current time
    pub fn new(subject_id: i32, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            subject_id,
            payload,
        }
    }

    pub fn created(subject_id: i32, details: ContactDetails) -> Self {
        Self::new(subject_id, EventPayload::Created(details))
    }

    pub fn updated(subject_id: i32, details: ContactDetails, updated_at: DateTime<Utc>) -> Self {
        Self::new(
            subject_id,
            EventPayload::Updated(ContactChanged {
                details,
                updated_at,
            }),
        )
    }

    pub fn deleted(subject_id: i32, name: String) -> Self {
        Self::new(subject_id, EventPayload::Deleted(ContactRemoved { name }))
    }

    /// Replace the generated event id (useful for testing redelivery)
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn subject_id(&self) -> i32 {
        self.subject_id
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Default routing key for this envelope (`contact.<kind>`)
    pub fn routing_key(&self) -> String {
        crate::routing::derive_routing_key(self.kind())
    }

    /// Encode to the canonical UTF-8 JSON wire form
    pub fn to_bytes(&self) -> BusResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BusError::SerializationError(e.to_string()))
    }

    /// Decode from the wire form
    pub fn from_slice(bytes: &[u8]) -> BusResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| BusError::DecodeError(e.to_string()))
    }
}
