//! Contact commands through the bus into the directory read model

use contact_bus::{
    BrokerConnection, Consumer, EventEnvelope, EventKind, EventPayload, HandlerRegistry,
    InMemoryBroker, Publisher,
};
use contacts::{
    ContactDirectory, ContactError, ContactService, ContactStore, InMemoryContactStore, NewContact,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const EXCHANGE: &str = "contact_events";

async fn eventually<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

struct Harness {
    broker: InMemoryBroker,
    connection: Arc<BrokerConnection>,
    store: Arc<InMemoryContactStore>,
    service: ContactService,
}

async fn harness() -> Harness {
    let broker = InMemoryBroker::new();
    let connection = Arc::new(
        BrokerConnection::open(Arc::new(broker.clone()), EXCHANGE)
            .await
            .unwrap(),
    );
    let store = Arc::new(InMemoryContactStore::new());
    let publisher = Arc::new(Publisher::new(connection.clone()));
    let service = ContactService::new(store.clone(), publisher);
    Harness {
        broker,
        connection,
        store,
        service,
    }
}

fn ana() -> NewContact {
    NewContact {
        name: "Ana".to_string(),
        area_code: "11".to_string(),
        phone_number: "987654321".to_string(),
        email: "a@x.com".to_string(),
    }
}

fn bia() -> NewContact {
    NewContact {
        name: "Bia".to_string(),
        area_code: "21".to_string(),
        phone_number: "87654321".to_string(),
        email: "b@x.com".to_string(),
    }
}

#[tokio::test]
async fn test_directory_follows_contact_lifecycle() {
    let h = harness().await;
    let directory = Arc::new(ContactDirectory::new());
    let registry = HandlerRegistry::new()
        .with(EventKind::Created, directory.clone())
        .with(EventKind::Updated, directory.clone())
        .with(EventKind::Deleted, directory.clone());
    let consumer = Consumer::new(h.connection.clone());
    consumer
        .start_consuming(Arc::new(registry), Some("directory"), None)
        .await
        .unwrap();

    let id = h.service.create_contact(ana()).await.unwrap().id;
    eventually("created", || {
        let d = directory.clone();
        async move { d.get(id).await.is_some() }
    })
    .await;

    let changes = NewContact {
        name: "Ana Maria".to_string(),
        ..ana()
    };
    h.service.update_contact(id, changes).await.unwrap();
    eventually("updated", || {
        let d = directory.clone();
        async move { d.get(id).await.map(|c| c.name) == Some("Ana Maria".to_string()) }
    })
    .await;

    h.service.delete_contact(id).await.unwrap();
    eventually("deleted", || {
        let d = directory.clone();
        async move { d.is_empty().await }
    })
    .await;

    assert_eq!(directory.applied_events().await, 3);
    assert_eq!(h.broker.rejected_count("directory"), 0);
    consumer.stop_consuming().await;
}

#[tokio::test]
async fn test_create_publishes_created_event() {
    let h = harness().await;
    let seen = Arc::new(tokio::sync::Mutex::new(Vec::<EventEnvelope>::new()));
    let s = seen.clone();
    let consumer = Consumer::new(h.connection.clone());
    consumer
        .start_consuming(
            contact_bus::handler_fn(move |envelope, _| {
                let s = s.clone();
                async move {
                    s.lock().await.push(envelope);
                    Ok(())
                }
            }),
            Some("audit"),
            Some("contact.created"),
        )
        .await
        .unwrap();

    let contact = h.service.create_contact(ana()).await.unwrap();
    eventually("event", || {
        let s = seen.clone();
        async move { s.lock().await.len() == 1 }
    })
    .await;

    let envelope = seen.lock().await[0].clone();
    assert_eq!(envelope.subject_id(), contact.id);
    match envelope.payload() {
        EventPayload::Created(details) => assert_eq!(details, &contact.details()),
        other => panic!("unexpected payload {:?}", other),
    }
    consumer.stop_consuming().await;
}

#[tokio::test]
async fn test_duplicate_email_is_conflict() {
    let h = harness().await;
    h.service.create_contact(ana()).await.unwrap();

    let result = h
        .service
        .create_contact(NewContact {
            name: "Other".to_string(),
            ..ana()
        })
        .await;

    assert!(matches!(result, Err(ContactError::Conflict(_))));
    assert_eq!(h.broker.published_count(), 1);
}

#[tokio::test]
async fn test_update_to_foreign_email_is_conflict() {
    let h = harness().await;
    h.service.create_contact(ana()).await.unwrap();
    let bia = h.service.create_contact(bia()).await.unwrap();

    let result = h
        .service
        .update_contact(
            bia.id,
            NewContact {
                email: "a@x.com".to_string(),
                ..NewContact::from(bia.details())
            },
        )
        .await;

    assert!(matches!(result, Err(ContactError::Conflict(_))));
}

#[tokio::test]
async fn test_update_keeps_own_email_and_sets_updated_at() {
    let h = harness().await;
    let created = h.service.create_contact(ana()).await.unwrap();

    let updated = h
        .service
        .update_contact(
            created.id,
            NewContact {
                phone_number: "912345678".to_string(),
                ..ana()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.phone_number, "912345678");
    assert_eq!(updated.created_at, created.created_at);
    assert!(updated.updated_at.is_some());
}

#[tokio::test]
async fn test_missing_and_invalid_ids() {
    let h = harness().await;

    assert!(matches!(
        h.service.update_contact(0, ana()).await,
        Err(ContactError::Validation(_))
    ));
    assert!(matches!(
        h.service.update_contact(9, ana()).await,
        Err(ContactError::NotFound(9))
    ));
    assert!(matches!(
        h.service.delete_contact(9).await,
        Err(ContactError::NotFound(9))
    ));
    assert!(matches!(
        h.service.get_contact(-1).await,
        Err(ContactError::Validation(_))
    ));
    assert_eq!(h.broker.published_count(), 0);
}

#[tokio::test]
async fn test_invalid_input_is_not_stored() {
    let h = harness().await;

    let result = h
        .service
        .create_contact(NewContact {
            area_code: "123".to_string(),
            ..ana()
        })
        .await;

    match result {
        Err(ContactError::Validation(errors)) => {
            assert_eq!(errors, ["area code must be exactly 2 digits"]);
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert_eq!(h.store.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_input_is_trimmed() {
    let h = harness().await;
    let contact = h
        .service
        .create_contact(NewContact {
            name: "  Ana ".to_string(),
            email: " a@x.com ".to_string(),
            ..ana()
        })
        .await
        .unwrap();

    assert_eq!(contact.name, "Ana");
    assert_eq!(contact.email, "a@x.com");
}

#[tokio::test]
async fn test_rejected_create_is_undone() {
    let h = harness().await;
    h.broker.reject_publishes(true);

    let result = h.service.create_contact(ana()).await;

    assert!(matches!(result, Err(ContactError::Publish(_))));
    assert_eq!(h.store.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_rejected_update_restores_previous_row() {
    let h = harness().await;
    let created = h.service.create_contact(ana()).await.unwrap();
    h.broker.reject_publishes(true);

    let result = h
        .service
        .update_contact(
            created.id,
            NewContact {
                name: "Changed".to_string(),
                ..ana()
            },
        )
        .await;

    assert!(matches!(result, Err(ContactError::Publish(_))));
    assert_eq!(h.store.get_by_id(created.id).await.unwrap(), Some(created));
}

#[tokio::test]
async fn test_rejected_delete_reinserts_row() {
    let h = harness().await;
    let created = h.service.create_contact(ana()).await.unwrap();
    h.broker.reject_publishes(true);

    let result = h.service.delete_contact(created.id).await;

    assert!(matches!(result, Err(ContactError::Publish(_))));
    assert_eq!(h.service.get_contact(created.id).await.unwrap(), created);
}

#[tokio::test]
async fn test_disconnected_broker_keeps_write_and_drops_event() {
    let h = harness().await;
    h.broker.disconnect();

    let contact = h.service.create_contact(ana()).await.unwrap();

    assert!(h.store.exists(contact.id).await.unwrap());
    assert_eq!(h.broker.published_count(), 0);
}

#[tokio::test]
async fn test_list_contacts_pages_and_clamps() {
    let h = harness().await;
    h.service.create_contact(ana()).await.unwrap();
    h.service.create_contact(bia()).await.unwrap();

    let page = h.service.list_contacts(0, 0, None).await.unwrap();
    assert_eq!(page.page, 1);
    assert_eq!(page.page_size, 10);
    assert_eq!(page.total, 2);
    let names: Vec<&str> = page.items.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["Bia", "Ana"]);

    let page = h.service.list_contacts(2, 1, None).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].name, "Ana");

    let page = h.service.list_contacts(1, 500, Some("bia")).await.unwrap();
    assert_eq!(page.page_size, 10);
    assert_eq!(page.total, 1);
}
