//! In-memory storage backend for pushfan.
//!
//! Implements every storage port of `pushfan-core` with the same uniqueness
//! and atomic increment semantics as the PostgreSQL backend. Used by tests and
//! local development.
//!
//! # Example
//!
//! ```ignore
//! use pushfan_db_memory::InMemoryStorage;
//!
//! let storage = InMemoryStorage::new();
//! storage.insert_contact(contact_row).await;
//! let page = storage.fetch_contacts_page(&scope, None, 500).await?;
//! ```

mod store_impl;
pub mod storage;

pub use storage::InMemoryStorage;

/// Creates a new shareable in-memory storage.
pub fn create_storage() -> std::sync::Arc<InMemoryStorage> {
    std::sync::Arc::new(InMemoryStorage::new())
}
