//! Outbound collaborators: queue publisher for Web Push, transport for tokens.

use async_trait::async_trait;
use pushfan_core::{DeliveryOutcome, MessageId, PushMessage, WebPushSubscription};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::NotificationError;
use crate::tracking::CallbackUrls;

/// Payload published to a provider queue for one Web Push subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebPushEnvelope {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_click_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub subscription: WebPushSubscription,
    pub message_id: MessageId,
    pub push_contact_id: String,
    pub clicked_event_endpoint: String,
    pub received_event_endpoint: String,
}

impl WebPushEnvelope {
    pub fn new(
        message: &PushMessage,
        push_contact_id: impl Into<String>,
        subscription: WebPushSubscription,
        callbacks: CallbackUrls,
    ) -> Self {
        Self {
            title: message.title.clone(),
            body: message.body.clone(),
            on_click_link: message.on_click_link.clone(),
            image_url: message.image_url.clone(),
            subscription,
            message_id: message.message_id,
            push_contact_id: push_contact_id.into(),
            clicked_event_endpoint: callbacks.clicked,
            received_event_endpoint: callbacks.received,
        }
    }
}

/// Message broker client.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Publishes one envelope onto the named queue.
    async fn publish(
        &self,
        envelope: &WebPushEnvelope,
        queue_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), NotificationError>;
}

/// Legacy device-token push transport.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Attempts delivery to every token and returns one outcome per token.
    async fn send_tokens(
        &self,
        message: &PushMessage,
        device_tokens: &[String],
    ) -> Result<Vec<DeliveryOutcome>, NotificationError>;
}
