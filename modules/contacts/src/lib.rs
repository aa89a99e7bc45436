//! Contact registry around the contact event bus
//!
//! - [`ContactService`]: validated create/update/delete against a
//!   [`ContactStore`], each write announced as a contact event
//! - [`ContactDirectory`]: consumer-side read model fed by those events

pub mod config;
pub mod handlers;
pub mod models;
pub mod service;
pub mod store;

pub use config::ConsumerSettings;
pub use handlers::ContactDirectory;
pub use models::{Contact, ContactChanges, ContactPage, NewContact};
pub use service::{ContactError, ContactService};
pub use store::{ContactStore, InMemoryContactStore, StoreError};
