//! Shared fakes and fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use pushfan_core::{ContactRow, DeliveryOutcome, PushMessage};
use pushfan_db_memory::InMemoryStorage;
use pushfan_notifications::{
    BatchDispatcher, DispatchSettings, EventRecorder, NotificationError, PagedSubscriberSource,
    ProviderRouter, PushTransport, QueuePublisher, StatsAggregator, TrackingCodec, TrackingUrls,
    WebPushEnvelope,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const BASE_URL: &str = "https://track.example.com";

pub fn codec() -> TrackingCodec {
    TrackingCodec::new([42u8; 32], b"fixed-iv-material").unwrap()
}

pub fn router() -> ProviderRouter {
    let mut mappings = BTreeMap::new();
    mappings.insert(
        "google".to_string(),
        vec!["https://fcm.googleapis.com".to_string()],
    );
    mappings.insert(
        "mozilla".to_string(),
        vec!["https://updates.push.services.mozilla.com".to_string()],
    );
    ProviderRouter::new(&mappings)
}

pub fn message(domain: &str, title: &str, body: &str) -> PushMessage {
    PushMessage {
        message_id: Uuid::new_v4(),
        domain: domain.into(),
        title: title.into(),
        body: body.into(),
        on_click_link: Some("https://example.com/landing".into()),
        image_url: None,
    }
}

pub fn subscription_contact(id: &str, domain: &str, endpoint: &str) -> ContactRow {
    ContactRow {
        push_contact_id: id.into(),
        domain: domain.into(),
        endpoint: Some(endpoint.into()),
        auth: Some(format!("auth-{id}")),
        p256dh: Some(format!("p256dh-{id}")),
        ..Default::default()
    }
}

pub fn token_contact(id: &str, domain: &str, token: &str) -> ContactRow {
    ContactRow {
        push_contact_id: id.into(),
        domain: domain.into(),
        device_token: Some(token.into()),
        ..Default::default()
    }
}

/// Records every publish; fails for endpoints containing `fail_marker`.
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(String, WebPushEnvelope)>>,
    pub fail_marker: Option<String>,
}

impl RecordingPublisher {
    pub fn failing_on(marker: &str) -> Self {
        Self {
            published: Mutex::default(),
            fail_marker: Some(marker.to_string()),
        }
    }

    pub async fn envelopes(&self) -> Vec<(String, WebPushEnvelope)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl QueuePublisher for RecordingPublisher {
    async fn publish(
        &self,
        envelope: &WebPushEnvelope,
        queue_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), NotificationError> {
        if let Some(marker) = &self.fail_marker
            && envelope.subscription.endpoint.contains(marker.as_str())
        {
            return Err(NotificationError::PublishFailed("broker unavailable".into()));
        }
        self.published
            .lock()
            .await
            .push((queue_name.to_string(), envelope.clone()));
        Ok(())
    }
}

/// Token transport fake.
///
/// Tokens starting with `dead-` fail as invalid, `flaky-` fail transiently,
/// everything else is delivered. Optionally cancels a token on first call.
#[derive(Default)]
pub struct RecordingTransport {
    pub batches: Mutex<Vec<Vec<String>>>,
    pub cancel_on_first_call: Option<CancellationToken>,
}

impl RecordingTransport {
    pub async fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().await.clone()
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn send_tokens(
        &self,
        _message: &PushMessage,
        device_tokens: &[String],
    ) -> Result<Vec<DeliveryOutcome>, NotificationError> {
        self.batches.lock().await.push(device_tokens.to_vec());
        if let Some(token) = &self.cancel_on_first_call {
            token.cancel();
        }

        Ok(device_tokens
            .iter()
            .map(|token| {
                if token.starts_with("dead-") {
                    DeliveryOutcome::failed(token, "unregistered", false)
                } else if token.starts_with("flaky-") {
                    DeliveryOutcome::failed(token, "timeout", true)
                } else {
                    DeliveryOutcome::delivered(token)
                }
            })
            .collect())
    }
}

pub struct Harness {
    pub storage: Arc<InMemoryStorage>,
    pub publisher: Arc<RecordingPublisher>,
    pub transport: Arc<RecordingTransport>,
    pub recorder: EventRecorder,
    pub dispatcher: Arc<BatchDispatcher>,
}

impl Harness {
    pub fn new(batch_size: usize, page_size: usize) -> Self {
        Self::with(
            batch_size,
            page_size,
            RecordingPublisher::default(),
            RecordingTransport::default(),
        )
    }

    pub fn with(
        batch_size: usize,
        page_size: usize,
        publisher: RecordingPublisher,
        transport: RecordingTransport,
    ) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        let publisher = Arc::new(publisher);
        let transport = Arc::new(transport);

        let recorder = EventRecorder::new(
            storage.clone(),
            storage.clone(),
            storage.clone(),
            StatsAggregator::new(storage.clone()),
        );
        let source = PagedSubscriberSource::new(storage.clone()).with_page_size(page_size);
        let dispatcher = BatchDispatcher::new(
            Arc::new(source),
            Arc::new(router()),
            Arc::new(TrackingUrls::new(BASE_URL, codec())),
            publisher.clone(),
            transport.clone(),
            storage.clone(),
            recorder.clone(),
            DispatchSettings {
                process_batch_size: batch_size,
            },
        );

        Self {
            storage,
            publisher,
            transport,
            recorder,
            dispatcher: Arc::new(dispatcher),
        }
    }
}
