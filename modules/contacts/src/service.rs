//! Contact commands: validate, write to the store, announce the change
//!
//! Every successful write is followed by exactly one event on the bus. When
//! the broker rejects that event the write is undone so the store and the
//! event stream do not diverge.

use crate::models::{
    Contact, ContactChanges, ContactPage, NewContact, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
use crate::store::{ContactStore, StoreError};
use chrono::Utc;
use contact_bus::{BusError, EventEnvelope, Publisher};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ContactError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("contact {0} not found")]
    NotFound(i32),

    #[error("{0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("failed to publish contact event: {0}")]
    Publish(#[from] BusError),
}

impl From<StoreError> for ContactError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateEmail(email) => Self::Conflict(conflict_message(&email)),
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

fn conflict_message(email: &str) -> String {
    format!("a contact with email {} already exists", email)
}

fn validate(input: &NewContact) -> Result<NewContact, ContactError> {
    let input = input.trimmed();
    let errors = input.violations();
    if errors.is_empty() {
        Ok(input)
    } else {
        Err(ContactError::Validation(errors))
    }
}

fn validate_id(id: i32) -> Result<(), ContactError> {
    if id <= 0 {
        return Err(ContactError::Validation(vec![
            "id must be greater than zero".to_string(),
        ]));
    }
    Ok(())
}

pub struct ContactService {
    store: Arc<dyn ContactStore>,
    publisher: Arc<Publisher>,
}

impl ContactService {
    pub fn new(store: Arc<dyn ContactStore>, publisher: Arc<Publisher>) -> Self {
        Self { store, publisher }
    }

    /// Validate, store and publish `Created`
    ///
    /// # Errors
    /// * `Validation` for rule violations
    /// * `Conflict` if the email is already registered
    /// * `Publish` if the broker rejected the event (the contact is removed again)
    pub async fn create_contact(&self, input: NewContact) -> Result<Contact, ContactError> {
        let input = validate(&input)?;

        if self.store.get_by_email(&input.email).await?.is_some() {
            tracing::warn!(email = %input.email, "Contact email already registered");
            return Err(ContactError::Conflict(conflict_message(&input.email)));
        }

        let contact = self.store.create(input, Utc::now()).await?;
        let envelope = EventEnvelope::created(contact.id, contact.details());

        if let Err(e) = self.publisher.publish(&envelope, None).await {
            let undo = self.store.delete(contact.id).await.map(|_| ());
            self.compensate(contact.id, "create", undo);
            return Err(e.into());
        }

        tracing::info!(
            subject_id = contact.id,
            event_id = %envelope.event_id(),
            "Contact created"
        );
        Ok(contact)
    }

    /// Replace a contact's fields, store and publish `Updated`
    ///
    /// # Errors
    /// * `Validation` for a non-positive id or rule violations
    /// * `NotFound` if no contact has this id
    /// * `Conflict` if the email belongs to another contact
    /// * `Publish` if the broker rejected the event (the previous row is restored)
    pub async fn update_contact(
        &self,
        id: i32,
        changes: ContactChanges,
    ) -> Result<Contact, ContactError> {
        validate_id(id)?;
        let changes = validate(&changes)?;

        let existing = self
            .store
            .get_by_id(id)
            .await?
            .ok_or(ContactError::NotFound(id))?;

        if let Some(other) = self.store.get_by_email(&changes.email).await? {
            if other.id != id {
                tracing::warn!(subject_id = id, email = %changes.email, "Email belongs to another contact");
                return Err(ContactError::Conflict(conflict_message(&changes.email)));
            }
        }

        let updated_at = Utc::now();
        let updated = self
            .store
            .update(Contact {
                id,
                name: changes.name,
                area_code: changes.area_code,
                phone_number: changes.phone_number,
                email: changes.email,
                created_at: existing.created_at,
                updated_at: Some(updated_at),
            })
            .await?;
        let envelope = EventEnvelope::updated(id, updated.details(), updated_at);

        if let Err(e) = self.publisher.publish(&envelope, None).await {
            let undo = self.store.update(existing).await.map(|_| ());
            self.compensate(id, "update", undo);
            return Err(e.into());
        }

        tracing::info!(subject_id = id, event_id = %envelope.event_id(), "Contact updated");
        Ok(updated)
    }

    /// Delete a contact and publish `Deleted`; returns the removed record
    ///
    /// # Errors
    /// * `Validation` for a non-positive id
    /// * `NotFound` if no contact has this id
    /// * `Publish` if the broker rejected the event (the row is re-inserted)
    pub async fn delete_contact(&self, id: i32) -> Result<Contact, ContactError> {
        validate_id(id)?;

        let existing = self
            .store
            .get_by_id(id)
            .await?
            .ok_or(ContactError::NotFound(id))?;

        if !self.store.delete(id).await? {
            // Removed concurrently between the read and the delete
            return Err(ContactError::NotFound(id));
        }

        let envelope = EventEnvelope::deleted(id, existing.name.clone());
        if let Err(e) = self.publisher.publish(&envelope, None).await {
            let undo = self.store.restore(existing).await;
            self.compensate(id, "delete", undo);
            return Err(e.into());
        }

        tracing::info!(subject_id = id, event_id = %envelope.event_id(), "Contact deleted");
        Ok(existing)
    }

    pub async fn get_contact(&self, id: i32) -> Result<Contact, ContactError> {
        validate_id(id)?;
        self.store
            .get_by_id(id)
            .await?
            .ok_or(ContactError::NotFound(id))
    }

    /// A page of contacts, newest first
    ///
    /// Out-of-range input is clamped: page below 1 becomes 1, page size
    /// outside 1..=100 becomes 10.
    pub async fn list_contacts(
        &self,
        page: u32,
        page_size: u32,
        search: Option<&str>,
    ) -> Result<ContactPage, ContactError> {
        let page = page.max(1);
        let page_size = if (1..=MAX_PAGE_SIZE).contains(&page_size) {
            page_size
        } else {
            DEFAULT_PAGE_SIZE
        };

        let items = self.store.list(page, page_size, search).await?;
        let total = self.store.count(search).await?;
        tracing::debug!(page, page_size, total, returned = items.len(), "Listed contacts");

        Ok(ContactPage {
            items,
            page,
            page_size,
            total,
        })
    }

    fn compensate(&self, id: i32, operation: &str, undo: Result<(), StoreError>) {
        match undo {
            Ok(()) => tracing::warn!(
                subject_id = id,
                operation = operation,
                "Event not published, store write undone"
            ),
            Err(e) => tracing::error!(
                subject_id = id,
                operation = operation,
                error = %e,
                "Event not published and store write could not be undone"
            ),
        }
    }
}
