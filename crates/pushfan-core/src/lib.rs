//! # pushfan-core
//!
//! Domain types and storage ports for the pushfan web push delivery pipeline.
//!
//! This crate does not contain any storage implementation. Backends live in
//! `pushfan-db-memory` and `pushfan-db-postgres`; the pipeline itself lives in
//! `pushfan-notifications`.

mod error;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use traits::{ContactStore, EventStore, MessageStore, StatsStore};
pub use types::{
    ContactRow, DeliveryOutcome, DispatchScope, EventTarget, MessageId, MessageStatsBucket,
    PushMessage, PushTarget, StatsCounters, StatsKey, SubscriptionRecord, WebPushEvent,
    WebPushEventSubType, WebPushEventType, WebPushSubscription, hour_bucket,
};

/// Shareable contact store.
pub type DynContactStore = std::sync::Arc<dyn ContactStore>;
/// Shareable message store.
pub type DynMessageStore = std::sync::Arc<dyn MessageStore>;
/// Shareable event store.
pub type DynEventStore = std::sync::Arc<dyn EventStore>;
/// Shareable stats store.
pub type DynStatsStore = std::sync::Arc<dyn StatsStore>;
