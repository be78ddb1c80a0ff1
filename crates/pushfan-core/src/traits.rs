//! Storage ports implemented by every backend.
//!
//! The pipeline only talks to storage through these traits. Implementations
//! must be thread-safe (`Send + Sync`) since dispatch runs and callback
//! handlers share them concurrently.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::{
    ContactRow, DispatchScope, MessageId, MessageStatsBucket, PushMessage, WebPushEvent,
    WebPushEventType,
};

/// Subscriber contacts, owned by the contact registry.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Fetches one page of contacts in the scope, ordered by `push_contact_id`.
    ///
    /// `after` is the last `push_contact_id` of the previous page (keyset
    /// pagination). Returns fewer than `limit` rows on the last page.
    async fn fetch_contacts_page(
        &self,
        scope: &DispatchScope,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ContactRow>, StorageError>;

    /// Returns the domain a contact belongs to.
    async fn get_contact_domain(
        &self,
        push_contact_id: &str,
    ) -> Result<Option<String>, StorageError>;

    /// Marks device tokens in the scope as undeliverable so later runs skip them.
    ///
    /// Returns the number of contacts updated.
    async fn mark_tokens_undeliverable(
        &self,
        scope: &DispatchScope,
        device_tokens: &[String],
    ) -> Result<u64, StorageError>;
}

/// Message metadata, owned by the message store.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message(&self, message: &PushMessage) -> Result<(), StorageError>;

    async fn get_message(
        &self,
        message_id: MessageId,
    ) -> Result<Option<PushMessage>, StorageError>;

    /// Returns the domain a message was sent for.
    async fn get_message_domain(
        &self,
        message_id: MessageId,
    ) -> Result<Option<String>, StorageError>;
}

/// Append-only web push events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Checks whether an event of this exact kind was already recorded.
    async fn event_exists(
        &self,
        push_contact_id: &str,
        message_id: MessageId,
        event_type: WebPushEventType,
    ) -> Result<bool, StorageError>;

    /// Inserts one event.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Duplicate` when the `(push_contact_id, message_id, type)`
    /// uniqueness constraint rejects the event.
    async fn insert_event(&self, event: &WebPushEvent) -> Result<(), StorageError>;

    /// Inserts many events in one round trip, skipping duplicates.
    ///
    /// Returns the number of events actually stored.
    async fn insert_events(&self, events: &[WebPushEvent]) -> Result<u64, StorageError>;
}

/// Hourly stats buckets.
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Adds each bucket's counters onto the stored bucket with the same key,
    /// creating it when absent.
    ///
    /// Implementations must apply every bucket as an atomic increment so that
    /// concurrent writers landing in the same bucket never lose updates.
    async fn increment_buckets(&self, buckets: &[MessageStatsBucket]) -> Result<(), StorageError>;

    /// Reads the buckets of a message, ordered by date.
    async fn get_message_stats(
        &self,
        domain: &str,
        message_id: MessageId,
    ) -> Result<Vec<MessageStatsBucket>, StorageError>;
}
