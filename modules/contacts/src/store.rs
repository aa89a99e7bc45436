//! Contact persistence seam and its in-memory implementation

use crate::models::{Contact, NewContact};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("a contact with email {0} already exists")]
    DuplicateEmail(String),

    #[error("contact {0} not found")]
    NotFound(i32),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Contact persistence
///
/// Emails are unique across the store. Listings are newest first.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn get_by_id(&self, id: i32) -> StoreResult<Option<Contact>>;

    async fn get_by_email(&self, email: &str) -> StoreResult<Option<Contact>>;

    /// One page (1-based) of contacts matching `search`
    async fn list(&self, page: u32, page_size: u32, search: Option<&str>)
        -> StoreResult<Vec<Contact>>;

    async fn count(&self, search: Option<&str>) -> StoreResult<usize>;

    /// Insert under a freshly assigned id
    async fn create(&self, contact: NewContact, created_at: DateTime<Utc>) -> StoreResult<Contact>;

    /// Replace the stored row with the same id
    async fn update(&self, contact: Contact) -> StoreResult<Contact>;

    /// Returns false when there was nothing to delete
    async fn delete(&self, id: i32) -> StoreResult<bool>;

    async fn exists(&self, id: i32) -> StoreResult<bool>;

    /// Re-insert a previously deleted row under its original id
    async fn restore(&self, contact: Contact) -> StoreResult<()>;
}

#[derive(Default)]
struct Rows {
    contacts: BTreeMap<i32, Contact>,
    last_id: i32,
}

impl Rows {
    fn email_taken(&self, email: &str, except: Option<i32>) -> bool {
        self.contacts
            .values()
            .any(|c| Some(c.id) != except && c.email.eq_ignore_ascii_case(email))
    }
}

/// Store held in process memory; ids are assigned sequentially from 1
#[derive(Default)]
pub struct InMemoryContactStore {
    rows: Mutex<Rows>,
}

impl InMemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, Rows> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ContactStore for InMemoryContactStore {
    async fn get_by_id(&self, id: i32) -> StoreResult<Option<Contact>> {
        Ok(self.rows().contacts.get(&id).cloned())
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<Option<Contact>> {
        Ok(self
            .rows()
            .contacts
            .values()
            .find(|c| c.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn list(
        &self,
        page: u32,
        page_size: u32,
        search: Option<&str>,
    ) -> StoreResult<Vec<Contact>> {
        let skip = (page.max(1) as usize - 1) * page_size as usize;
        Ok(self
            .rows()
            .contacts
            .values()
            .rev()
            .filter(|c| c.matches_search(search))
            .skip(skip)
            .take(page_size as usize)
            .cloned()
            .collect())
    }

    async fn count(&self, search: Option<&str>) -> StoreResult<usize> {
        Ok(self
            .rows()
            .contacts
            .values()
            .filter(|c| c.matches_search(search))
            .count())
    }

    async fn create(&self, contact: NewContact, created_at: DateTime<Utc>) -> StoreResult<Contact> {
        let mut rows = self.rows();
        if rows.email_taken(&contact.email, None) {
            return Err(StoreError::DuplicateEmail(contact.email));
        }

        rows.last_id += 1;
        let stored = Contact {
            id: rows.last_id,
            name: contact.name,
            area_code: contact.area_code,
            phone_number: contact.phone_number,
            email: contact.email,
            created_at,
            updated_at: None,
        };
        rows.contacts.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, contact: Contact) -> StoreResult<Contact> {
        let mut rows = self.rows();
        if !rows.contacts.contains_key(&contact.id) {
            return Err(StoreError::NotFound(contact.id));
        }
        if rows.email_taken(&contact.email, Some(contact.id)) {
            return Err(StoreError::DuplicateEmail(contact.email));
        }
        rows.contacts.insert(contact.id, contact.clone());
        Ok(contact)
    }

    async fn delete(&self, id: i32) -> StoreResult<bool> {
        Ok(self.rows().contacts.remove(&id).is_some())
    }

    async fn exists(&self, id: i32) -> StoreResult<bool> {
        Ok(self.rows().contacts.contains_key(&id))
    }

    async fn restore(&self, contact: Contact) -> StoreResult<()> {
        let mut rows = self.rows();
        if rows.email_taken(&contact.email, Some(contact.id)) {
            return Err(StoreError::DuplicateEmail(contact.email));
        }
        rows.last_id = rows.last_id.max(contact.id);
        rows.contacts.insert(contact.id, contact);
        Ok(())
    }
}
