//! Entry point for sending a push message.
//!
//! The message is validated and stored, then its fan-out is handed to the
//! background queue; callers get the stored message back without waiting.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pushfan_core::{DispatchScope, MessageStore, PushMessage};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatcher::{BatchDispatcher, DispatchRequest};
use crate::error::NotificationError;
use crate::personalize::FieldReplacements;
use crate::queue::{BackgroundQueue, work_item};

/// Content of a send request, before it becomes a [`PushMessage`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPushMessage {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub on_click_link: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    /// Values for `[[[field]]]` placeholders.
    #[serde(default)]
    pub fields: Option<HashMap<String, String>>,
    #[serde(default)]
    pub replacement_is_mandatory: bool,
}

#[async_trait]
pub trait PushService: Send + Sync {
    /// Sends to every subscriber of a domain
    async fn send_to_domain(
        &self,
        domain: &str,
        message: NewPushMessage,
    ) -> Result<PushMessage, NotificationError>;

    /// Sends to every device of one visitor
    async fn send_to_visitor(
        &self,
        domain: &str,
        visitor_guid: &str,
        message: NewPushMessage,
    ) -> Result<PushMessage, NotificationError>;
}

/// Stores the message and hands the dispatch run to a background queue.
pub struct QueuedPushService {
    messages: Arc<dyn MessageStore>,
    dispatcher: Arc<BatchDispatcher>,
    queue: Arc<dyn BackgroundQueue>,
}

impl QueuedPushService {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        dispatcher: Arc<BatchDispatcher>,
        queue: Arc<dyn BackgroundQueue>,
    ) -> Self {
        Self {
            messages,
            dispatcher,
            queue,
        }
    }

    async fn send(
        &self,
        scope: DispatchScope,
        new_message: NewPushMessage,
    ) -> Result<PushMessage, NotificationError> {
        validate(&scope, &new_message)?;

        let NewPushMessage {
            title,
            body,
            on_click_link,
            image_url,
            fields,
            replacement_is_mandatory,
        } = new_message;

        let message = PushMessage {
            message_id: Uuid::new_v4(),
            domain: scope.domain_name().to_string(),
            title,
            body,
            on_click_link: on_click_link.filter(|v| !v.trim().is_empty()),
            image_url: image_url.filter(|v| !v.trim().is_empty()),
        };
        self.messages.save_message(&message).await?;

        let request = DispatchRequest {
            scope,
            message: message.clone(),
            replacements: fields
                .map(|values| FieldReplacements::new(values, replacement_is_mandatory)),
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        let enqueued = self
            .queue
            .enqueue(work_item(move |cancel| async move {
                dispatcher.dispatch(&request, &cancel).await;
            }))
            .await;

        match enqueued {
            Ok(()) => {
                info!(
                    message_id = %message.message_id,
                    domain = %message.domain,
                    "Push message queued"
                );
                Ok(message)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    message_id = %message.message_id,
                    domain = %message.domain,
                    "Push message stored but not queued"
                );
                Err(e)
            }
        }
    }
}

fn validate(scope: &DispatchScope, message: &NewPushMessage) -> Result<(), NotificationError> {
    if scope.domain_name().trim().is_empty() {
        return Err(NotificationError::InvalidMessage("domain is required".into()));
    }
    if scope.visitor_guid().is_some_and(|v| v.trim().is_empty()) {
        return Err(NotificationError::InvalidMessage(
            "visitor guid is required".into(),
        ));
    }
    if message.title.trim().is_empty() {
        return Err(NotificationError::InvalidMessage("title is required".into()));
    }
    if message.body.trim().is_empty() {
        return Err(NotificationError::InvalidMessage("body is required".into()));
    }
    Ok(())
}

#[async_trait]
impl PushService for QueuedPushService {
    async fn send_to_domain(
        &self,
        domain: &str,
        message: NewPushMessage,
    ) -> Result<PushMessage, NotificationError> {
        self.send(DispatchScope::domain(domain), message).await
    }

    async fn send_to_visitor(
        &self,
        domain: &str,
        visitor_guid: &str,
        message: NewPushMessage,
    ) -> Result<PushMessage, NotificationError> {
        self.send(DispatchScope::visitor(domain, visitor_guid), message)
            .await
    }
}
