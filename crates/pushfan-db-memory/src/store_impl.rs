//! Storage port implementations for InMemoryStorage.

use std::ops::Bound;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use pushfan_core::{
    ContactRow, ContactStore, DispatchScope, EventStore, MessageId, MessageStatsBucket,
    MessageStore, PushMessage, StatsStore, StorageError, WebPushEvent, WebPushEventType,
};

use crate::storage::InMemoryStorage;

fn in_scope(row: &ContactRow, scope: &DispatchScope) -> bool {
    if !row.domain.eq_ignore_ascii_case(scope.domain_name()) {
        return false;
    }
    match scope.visitor_guid() {
        Some(visitor) => row.visitor_guid.as_deref() == Some(visitor),
        None => true,
    }
}

#[async_trait]
impl ContactStore for InMemoryStorage {
    async fn fetch_contacts_page(
        &self,
        scope: &DispatchScope,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ContactRow>, StorageError> {
        self.page_fetches.fetch_add(1, Ordering::SeqCst);

        let lower = match after {
            Some(id) => Bound::Excluded(id.to_string()),
            None => Bound::Unbounded,
        };

        let contacts = self.contacts.read().await;
        Ok(contacts
            .range((lower, Bound::Unbounded))
            .map(|(_, row)| row)
            .filter(|row| in_scope(row, scope))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_contact_domain(
        &self,
        push_contact_id: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(self
            .contacts
            .read()
            .await
            .get(push_contact_id)
            .map(|row| row.domain.clone()))
    }

    async fn mark_tokens_undeliverable(
        &self,
        scope: &DispatchScope,
        device_tokens: &[String],
    ) -> Result<u64, StorageError> {
        if device_tokens.is_empty() {
            return Ok(0);
        }

        let mut contacts = self.contacts.write().await;
        let mut updated = 0;
        for row in contacts.values_mut().filter(|row| in_scope(row, scope)) {
            if row
                .device_token
                .as_ref()
                .is_some_and(|token| device_tokens.contains(token))
            {
                row.device_token = None;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[async_trait]
impl MessageStore for InMemoryStorage {
    async fn save_message(&self, message: &PushMessage) -> Result<(), StorageError> {
        match self.messages.entry(message.message_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StorageError::duplicate(
                "PushMessage",
                message.message_id.to_string(),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(message.clone());
                Ok(())
            }
        }
    }

    async fn get_message(
        &self,
        message_id: MessageId,
    ) -> Result<Option<PushMessage>, StorageError> {
        Ok(self.messages.get(&message_id).map(|m| m.value().clone()))
    }

    async fn get_message_domain(
        &self,
        message_id: MessageId,
    ) -> Result<Option<String>, StorageError> {
        Ok(self.messages.get(&message_id).map(|m| m.domain.clone()))
    }
}

#[async_trait]
impl EventStore for InMemoryStorage {
    async fn event_exists(
        &self,
        push_contact_id: &str,
        message_id: MessageId,
        event_type: WebPushEventType,
    ) -> Result<bool, StorageError> {
        Ok(self
            .event_keys
            .contains(&(push_contact_id.to_string(), message_id, event_type)))
    }

    async fn insert_event(&self, event: &WebPushEvent) -> Result<(), StorageError> {
        if !self.claim_event_key(event) {
            return Err(StorageError::duplicate(
                "WebPushEvent",
                format!(
                    "{}/{}/{}",
                    event.push_contact_id().unwrap_or_default(),
                    event.message_id,
                    event.event_type
                ),
            ));
        }
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn insert_events(&self, events: &[WebPushEvent]) -> Result<u64, StorageError> {
        let mut stored = self.events.write().await;
        let mut inserted = 0;
        for event in events {
            if self.claim_event_key(event) {
                stored.push(event.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[async_trait]
impl StatsStore for InMemoryStorage {
    async fn increment_buckets(&self, buckets: &[MessageStatsBucket]) -> Result<(), StorageError> {
        for bucket in buckets {
            self.stats
                .entry(bucket.key.clone())
                .or_default()
                .add(&bucket.counters);
        }
        Ok(())
    }

    async fn get_message_stats(
        &self,
        domain: &str,
        message_id: MessageId,
    ) -> Result<Vec<MessageStatsBucket>, StorageError> {
        let mut buckets: Vec<MessageStatsBucket> = self
            .stats
            .iter()
            .filter(|entry| {
                entry.key().message_id == message_id
                    && entry.key().domain.eq_ignore_ascii_case(domain)
            })
            .map(|entry| MessageStatsBucket {
                key: entry.key().clone(),
                counters: *entry.value(),
            })
            .collect();
        buckets.sort_by(|a, b| a.key.date.cmp(&b.key.date));
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use pushfan_core::{
        EventTarget, StatsCounters, StatsKey, WebPushEventSubType, hour_bucket,
    };
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn contact(id: &str, domain: &str, visitor: Option<&str>, token: Option<&str>) -> ContactRow {
        ContactRow {
            push_contact_id: id.into(),
            domain: domain.into(),
            visitor_guid: visitor.map(String::from),
            device_token: token.map(String::from),
            ..Default::default()
        }
    }

    fn engagement(contact: &str, message_id: Uuid, event_type: WebPushEventType) -> WebPushEvent {
        WebPushEvent {
            domain: "a.com".into(),
            message_id,
            target: EventTarget::PushContact(contact.into()),
            date: OffsetDateTime::now_utc(),
            event_type,
            sub_type: WebPushEventSubType::None,
            error_message: None,
            action_id: None,
        }
    }

    #[tokio::test]
    async fn test_keyset_pages_are_scoped_and_ordered() {
        let storage = InMemoryStorage::new();
        storage
            .insert_contacts(vec![
                contact("c3", "a.com", Some("v1"), Some("t3")),
                contact("c1", "a.com", Some("v1"), Some("t1")),
                contact("c2", "b.com", None, Some("t2")),
                contact("c4", "A.COM", Some("v2"), Some("t4")),
            ])
            .await;

        let scope = DispatchScope::domain("a.com");
        let first = storage.fetch_contacts_page(&scope, None, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|r| r.push_contact_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c3"]);

        let second = storage
            .fetch_contacts_page(&scope, Some("c3"), 2)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].push_contact_id, "c4");

        let visitor = DispatchScope::visitor("a.com", "v1");
        let rows = storage.fetch_contacts_page(&visitor, None, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(storage.page_fetches(), 3);
    }

    #[tokio::test]
    async fn test_mark_tokens_undeliverable_is_scoped() {
        let storage = InMemoryStorage::new();
        storage
            .insert_contacts(vec![
                contact("c1", "a.com", None, Some("shared")),
                contact("c2", "b.com", None, Some("shared")),
            ])
            .await;

        let updated = storage
            .mark_tokens_undeliverable(&DispatchScope::domain("a.com"), &["shared".to_string()])
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert!(storage.contact("c1").await.unwrap().device_token.is_none());
        assert!(storage.contact("c2").await.unwrap().device_token.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_event_is_rejected() {
        let storage = InMemoryStorage::new();
        let id = Uuid::new_v4();
        let event = engagement("c1", id, WebPushEventType::Clicked);

        storage.insert_event(&event).await.unwrap();
        let err = storage.insert_event(&event).await.unwrap_err();
        assert!(err.is_duplicate());
        assert!(
            storage
                .event_exists("c1", id, WebPushEventType::Clicked)
                .await
                .unwrap()
        );
        assert!(
            !storage
                .event_exists("c1", id, WebPushEventType::Received)
                .await
                .unwrap()
        );

        let inserted = storage
            .insert_events(&[
                event.clone(),
                engagement("c1", id, WebPushEventType::Received),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(storage.event_count().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_increments_do_not_lose_updates() {
        let storage = Arc::new(InMemoryStorage::new());
        let message_id = Uuid::new_v4();
        let key = StatsKey {
            domain: "a.com".into(),
            message_id,
            date: hour_bucket(OffsetDateTime::now_utc()),
        };
        let bucket = MessageStatsBucket {
            key,
            counters: StatsCounters {
                sent: 1,
                delivered: 1,
                ..Default::default()
            },
        };

        let mut handles = Vec::new();
        for _ in 0..50 {
            let storage = Arc::clone(&storage);
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move {
                storage.increment_buckets(&[bucket]).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = storage.get_message_stats("a.com", message_id).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].counters.sent, 50);
        assert_eq!(stats[0].counters.delivered, 50);
    }

    #[tokio::test]
    async fn test_message_lookup() {
        let storage = InMemoryStorage::new();
        let message = PushMessage {
            message_id: Uuid::new_v4(),
            domain: "a.com".into(),
            title: "t".into(),
            body: "b".into(),
            on_click_link: None,
            image_url: None,
        };
        storage.save_message(&message).await.unwrap();
        assert!(storage.save_message(&message).await.unwrap_err().is_duplicate());

        assert_eq!(
            storage
                .get_message_domain(message.message_id)
                .await
                .unwrap()
                .as_deref(),
            Some("a.com")
        );
        assert!(
            storage
                .get_message(Uuid::new_v4())
                .await
                .unwrap()
                .is_none()
        );
    }
}
