//! Subscriber stream source.
//!
//! Turns the paged contact store into a flat, lazily pulled stream of
//! deliverable records, so the dispatcher never sees storage paging.

use std::sync::Arc;

use async_stream::try_stream;
use futures_util::stream::BoxStream;
use pushfan_core::{ContactStore, DispatchScope, StorageError, SubscriptionRecord};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default number of contacts fetched per storage page.
pub const DEFAULT_CURSOR_BATCH_SIZE: usize = 500;

pub type SubscriptionStream<'a> = BoxStream<'a, Result<SubscriptionRecord, StorageError>>;

/// Yields the deliverable subscription records of a scope.
pub trait SubscriberSource: Send + Sync {
    /// Streams records lazily. Once `cancel` fires no further page is fetched;
    /// records of the page already fetched are still yielded.
    fn stream_subscriptions<'a>(
        &'a self,
        scope: &'a DispatchScope,
        cancel: &'a CancellationToken,
    ) -> SubscriptionStream<'a>;
}

/// [`SubscriberSource`] over a keyset-paged [`ContactStore`].
pub struct PagedSubscriberSource {
    contacts: Arc<dyn ContactStore>,
    page_size: usize,
}

impl PagedSubscriberSource {
    pub fn new(contacts: Arc<dyn ContactStore>) -> Self {
        Self {
            contacts,
            page_size: DEFAULT_CURSOR_BATCH_SIZE,
        }
    }

    /// Set the storage page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

impl SubscriberSource for PagedSubscriberSource {
    fn stream_subscriptions<'a>(
        &'a self,
        scope: &'a DispatchScope,
        cancel: &'a CancellationToken,
    ) -> SubscriptionStream<'a> {
        let contacts = Arc::clone(&self.contacts);
        let page_size = self.page_size;

        Box::pin(try_stream! {
            let mut after: Option<String> = None;
            let mut pages = 0usize;

            loop {
                if cancel.is_cancelled() {
                    debug!(scope = %scope, pages, "Cancelled, not fetching further pages");
                    break;
                }

                let page = contacts
                    .fetch_contacts_page(scope, after.as_deref(), page_size)
                    .await?;
                pages += 1;

                let fetched = page.len();
                trace!(scope = %scope, page = pages, fetched, "Fetched contact page");
                after = page.last().map(|row| row.push_contact_id.clone());

                for row in page {
                    let push_contact_id = row.push_contact_id.clone();
                    if let Some(record) = row.into_record() {
                        yield record;
                    } else {
                        trace!(
                            push_contact_id = %push_contact_id,
                            "Skipping contact without a delivery target"
                        );
                    }
                }

                if fetched < page_size {
                    break;
                }
            }
        })
    }
}
