//! Batch dispatcher: drains the subscriber stream and fans out batches.
//!
//! Records are partitioned as they arrive into a subscription buffer and a
//! token buffer. A full buffer is flushed right away, so memory stays bounded
//! by the batch size and delivery starts before the stream ends. Flushes run
//! in stream order; publishes inside one subscription batch run concurrently.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::future::join_all;
use pushfan_core::{
    ContactStore, DispatchScope, PushMessage, PushTarget, WebPushSubscription,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::personalize::{FieldReplacements, Personalization, personalize};
use crate::recorder::EventRecorder;
use crate::router::ProviderRouter;
use crate::source::SubscriberSource;
use crate::tracking::TrackingUrls;
use crate::transport::{PushTransport, QueuePublisher, WebPushEnvelope};

/// Default number of records per subscription or token batch.
pub const DEFAULT_PROCESS_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub process_batch_size: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            process_batch_size: DEFAULT_PROCESS_BATCH_SIZE,
        }
    }
}

/// One unit of dispatch work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub scope: DispatchScope,
    pub message: PushMessage,
    #[serde(default)]
    pub replacements: Option<FieldReplacements>,
}

/// What a dispatch run did. Only used for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub subscription_batches: usize,
    pub token_batches: usize,
    pub published: usize,
    pub publish_failures: usize,
    pub tokens_sent: usize,
    pub tokens_marked_undeliverable: u64,
    pub skipped: usize,
    /// The run stopped early because its token was cancelled.
    pub cancelled: bool,
    /// The subscriber stream failed and the run ended early.
    pub aborted: bool,
}

/// Collaborators of a dispatch run.
pub struct BatchDispatcher {
    source: Arc<dyn SubscriberSource>,
    router: Arc<ProviderRouter>,
    urls: Arc<TrackingUrls>,
    publisher: Arc<dyn QueuePublisher>,
    transport: Arc<dyn PushTransport>,
    contacts: Arc<dyn ContactStore>,
    recorder: EventRecorder,
    settings: DispatchSettings,
}

impl BatchDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn SubscriberSource>,
        router: Arc<ProviderRouter>,
        urls: Arc<TrackingUrls>,
        publisher: Arc<dyn QueuePublisher>,
        transport: Arc<dyn PushTransport>,
        contacts: Arc<dyn ContactStore>,
        recorder: EventRecorder,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            source,
            router,
            urls,
            publisher,
            transport,
            contacts,
            recorder,
            settings: DispatchSettings {
                process_batch_size: settings.process_batch_size.max(1),
            },
        }
    }

    /// Runs one dispatch to completion. Never fails; problems are logged.
    pub async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: &CancellationToken,
    ) -> DispatchSummary {
        let scope = &request.scope;
        let message_id = request.message.message_id;
        let mut summary = DispatchSummary::default();

        if cancel.is_cancelled() {
            info!(scope = %scope, %message_id, "Dispatch cancelled before start");
            summary.cancelled = true;
            return summary;
        }

        let (message, unresolved) = match &request.replacements {
            None => (request.message.clone(), None),
            Some(replacements) => match personalize(&request.message, replacements) {
                Personalization::Unchanged => (request.message.clone(), None),
                Personalization::Rendered(rendered) => (rendered, None),
                Personalization::Unresolved(fields) => (request.message.clone(), Some(fields)),
            },
        };

        let batch_size = self.settings.process_batch_size;
        let mut subscriptions: Vec<(String, WebPushSubscription)> = Vec::with_capacity(batch_size);
        let mut tokens: Vec<String> = Vec::with_capacity(batch_size);

        let mut stream = self.source.stream_subscriptions(scope, cancel);
        while let Some(item) = stream.next().await {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    error!(
                        error = %e,
                        scope = %scope,
                        %message_id,
                        "Subscriber stream failed, flushing buffered targets"
                    );
                    summary.aborted = true;
                    break;
                }
            };

            if let Some(fields) = &unresolved {
                warn!(
                    push_contact_id = %record.push_contact_id,
                    %message_id,
                    missing = ?fields,
                    "Skipping target: mandatory replacement fields are missing"
                );
                summary.skipped += 1;
                continue;
            }

            match record.target {
                PushTarget::Subscription(subscription) => {
                    subscriptions.push((record.push_contact_id, subscription));
                    if subscriptions.len() >= batch_size {
                        let batch = std::mem::replace(
                            &mut subscriptions,
                            Vec::with_capacity(batch_size),
                        );
                        self.flush_subscriptions(&message, batch, cancel, &mut summary)
                            .await;
                    }
                }
                PushTarget::DeviceToken(token) => {
                    tokens.push(token);
                    if tokens.len() >= batch_size {
                        let batch =
                            std::mem::replace(&mut tokens, Vec::with_capacity(batch_size));
                        self.flush_tokens(scope, &message, batch, &mut summary).await;
                    }
                }
            }
        }
        drop(stream);

        if !subscriptions.is_empty() {
            self.flush_subscriptions(&message, subscriptions, cancel, &mut summary)
                .await;
        }
        if !tokens.is_empty() {
            self.flush_tokens(scope, &message, tokens, &mut summary).await;
        }

        summary.cancelled = cancel.is_cancelled();
        info!(
            scope = %scope,
            %message_id,
            subscription_batches = summary.subscription_batches,
            token_batches = summary.token_batches,
            published = summary.published,
            publish_failures = summary.publish_failures,
            tokens_sent = summary.tokens_sent,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            aborted = summary.aborted,
            "Dispatch finished"
        );
        summary
    }

    async fn flush_subscriptions(
        &self,
        message: &PushMessage,
        batch: Vec<(String, WebPushSubscription)>,
        cancel: &CancellationToken,
        summary: &mut DispatchSummary,
    ) {
        summary.subscription_batches += 1;
        debug!(message_id = %message.message_id, size = batch.len(), "Flushing subscription batch");

        let results = join_all(batch.into_iter().map(|(push_contact_id, subscription)| {
            self.publish_one(message, push_contact_id, subscription, cancel)
        }))
        .await;

        let published = results.iter().filter(|ok| **ok).count();
        summary.published += published;
        summary.publish_failures += results.len() - published;
    }

    async fn publish_one(
        &self,
        message: &PushMessage,
        push_contact_id: String,
        subscription: WebPushSubscription,
        cancel: &CancellationToken,
    ) -> bool {
        let callbacks = match self.urls.for_target(&push_contact_id, message.message_id) {
            Ok(callbacks) => callbacks,
            Err(e) => {
                error!(
                    error = %e,
                    %push_contact_id,
                    message_id = %message.message_id,
                    "Failed to build callback URLs"
                );
                return false;
            }
        };

        let queue = self.router.resolve_queue(&subscription.endpoint);
        let envelope = WebPushEnvelope::new(message, push_contact_id, subscription, callbacks);

        match self.publisher.publish(&envelope, queue, cancel).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    error = %e,
                    %queue,
                    push_contact_id = %envelope.push_contact_id,
                    message_id = %message.message_id,
                    "Failed to publish web push envelope"
                );
                false
            }
        }
    }

    async fn flush_tokens(
        &self,
        scope: &DispatchScope,
        message: &PushMessage,
        batch: Vec<String>,
        summary: &mut DispatchSummary,
    ) {
        summary.token_batches += 1;
        summary.tokens_sent += batch.len();
        debug!(message_id = %message.message_id, size = batch.len(), "Flushing token batch");

        let outcomes = match self.transport.send_tokens(message, &batch).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                error!(
                    error = %e,
                    scope = %scope,
                    message_id = %message.message_id,
                    tokens = batch.len(),
                    "Token transport failed"
                );
                return;
            }
        };

        self.recorder.register_bulk(message, &outcomes).await;

        let invalid: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.is_target_still_valid)
            .map(|o| o.target_id.clone())
            .collect();
        if invalid.is_empty() {
            return;
        }

        match self.contacts.mark_tokens_undeliverable(scope, &invalid).await {
            Ok(updated) => {
                summary.tokens_marked_undeliverable += updated;
                info!(
                    scope = %scope,
                    message_id = %message.message_id,
                    tokens = invalid.len(),
                    updated,
                    "Marked device tokens undeliverable"
                );
            }
            Err(e) => error!(
                error = %e,
                scope = %scope,
                message_id = %message.message_id,
                tokens = invalid.len(),
                "Failed to mark device tokens undeliverable"
            ),
        }
    }
}
