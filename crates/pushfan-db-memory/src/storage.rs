use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use pushfan_core::{
    ContactRow, MessageId, PushMessage, StatsCounters, StatsKey, WebPushEvent, WebPushEventType,
};
use tokio::sync::RwLock;

/// Key of the event uniqueness constraint: (push contact, message, type).
pub(crate) type EventKey = (String, MessageId, WebPushEventType);

/// In-memory storage for contacts, messages, events and stats.
///
/// Contacts sit in an ordered map so keyset pagination is a range scan.
/// Event uniqueness and stats increments go through `DashMap` entries, which
/// lock the affected shard for the duration of the check-and-write.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    pub(crate) contacts: RwLock<BTreeMap<String, ContactRow>>,
    pub(crate) messages: DashMap<MessageId, PushMessage>,
    pub(crate) events: RwLock<Vec<WebPushEvent>>,
    pub(crate) event_keys: DashSet<EventKey>,
    pub(crate) stats: DashMap<StatsKey, StatsCounters>,
    /// Number of page fetches served, for tests asserting storage was not touched.
    pub(crate) page_fetches: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a contact.
    pub async fn insert_contact(&self, row: ContactRow) {
        self.contacts
            .write()
            .await
            .insert(row.push_contact_id.clone(), row);
    }

    pub async fn insert_contacts(&self, rows: impl IntoIterator<Item = ContactRow>) {
        let mut contacts = self.contacts.write().await;
        for row in rows {
            contacts.insert(row.push_contact_id.clone(), row);
        }
    }

    pub async fn contact(&self, push_contact_id: &str) -> Option<ContactRow> {
        self.contacts.read().await.get(push_contact_id).cloned()
    }

    /// Snapshot of every stored event in insertion order.
    pub async fn events(&self) -> Vec<WebPushEvent> {
        self.events.read().await.clone()
    }

    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    /// Number of contact pages served so far.
    pub fn page_fetches(&self) -> u64 {
        self.page_fetches.load(Ordering::SeqCst)
    }

    /// Reserves the uniqueness slot of an event. Returns false when taken.
    ///
    /// Events without a push contact (device-token outcomes) are never unique,
    /// the same way a NULL column escapes a SQL unique index.
    pub(crate) fn claim_event_key(&self, event: &WebPushEvent) -> bool {
        match event.push_contact_id() {
            Some(id) => self
                .event_keys
                .insert((id.to_string(), event.message_id, event.event_type)),
            None => true,
        }
    }
}
