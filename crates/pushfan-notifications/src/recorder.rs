//! Idempotent recording of delivery and engagement events.

use std::sync::Arc;

use pushfan_core::{
    ContactStore, DeliveryOutcome, EventStore, EventTarget, MessageId, MessageStore, PushMessage,
    StorageError, WebPushEvent, WebPushEventSubType, WebPushEventType,
};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::stats::StatsAggregator;

/// Records web push events and forwards them to the stats aggregator.
#[derive(Clone)]
pub struct EventRecorder {
    contacts: Arc<dyn ContactStore>,
    messages: Arc<dyn MessageStore>,
    events: Arc<dyn EventStore>,
    stats: StatsAggregator,
}

impl EventRecorder {
    pub fn new(
        contacts: Arc<dyn ContactStore>,
        messages: Arc<dyn MessageStore>,
        events: Arc<dyn EventStore>,
        stats: StatsAggregator,
    ) -> Self {
        Self {
            contacts,
            messages,
            events,
            stats,
        }
    }

    /// Records a single event for a contact and message.
    ///
    /// Only engagement events (received, clicked, action click) are accepted;
    /// delivery outcomes go through [`EventRecorder::register_bulk`].
    ///
    /// Returns `false` when the event was not recorded: contact and message
    /// belong to different domains (or either is unknown), the event already
    /// exists, the call was cancelled, or storage failed.
    pub async fn register_event(
        &self,
        push_contact_id: &str,
        message_id: MessageId,
        event_type: WebPushEventType,
        action_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> bool {
        if cancel.is_cancelled() {
            debug!(%push_contact_id, %message_id, "Event registration cancelled");
            return false;
        }
        if !event_type.is_engagement() {
            warn!(
                %push_contact_id,
                %message_id,
                event_type = %event_type,
                "Rejected non-engagement event"
            );
            return false;
        }

        match self
            .try_register_event(push_contact_id, message_id, event_type, action_id)
            .await
        {
            Ok(registered) => registered,
            Err(e) => {
                error!(
                    error = %e,
                    category = %e.category(),
                    %push_contact_id,
                    %message_id,
                    event_type = %event_type,
                    "Failed to register web push event"
                );
                false
            }
        }
    }

    async fn try_register_event(
        &self,
        push_contact_id: &str,
        message_id: MessageId,
        event_type: WebPushEventType,
        action_id: Option<&str>,
    ) -> Result<bool, StorageError> {
        let (contact_domain, message_domain) = tokio::try_join!(
            self.contacts.get_contact_domain(push_contact_id),
            self.messages.get_message_domain(message_id),
        )?;

        let domain = match (contact_domain, message_domain) {
            (Some(contact), Some(message)) if contact.eq_ignore_ascii_case(&message) => contact,
            (contact, message) => {
                warn!(
                    %push_contact_id,
                    %message_id,
                    contact_domain = ?contact,
                    message_domain = ?message,
                    "Rejected event: contact and message domains do not match"
                );
                return Ok(false);
            }
        };

        // Fast path only; the unique index is the authoritative guard.
        if self
            .events
            .event_exists(push_contact_id, message_id, event_type)
            .await?
        {
            debug!(
                %push_contact_id,
                %message_id,
                event_type = %event_type,
                "Event already recorded"
            );
            return Ok(false);
        }

        let event = WebPushEvent {
            domain,
            message_id,
            target: EventTarget::PushContact(push_contact_id.to_string()),
            date: OffsetDateTime::now_utc(),
            event_type,
            sub_type: WebPushEventSubType::None,
            error_message: None,
            action_id: action_id.map(str::to_string),
        };

        match self.events.insert_event(&event).await {
            Ok(()) => {}
            Err(e) if e.is_duplicate() => {
                debug!(
                    %push_contact_id,
                    %message_id,
                    event_type = %event_type,
                    "Lost insert race for event"
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        self.stats.register_stats(std::slice::from_ref(&event)).await;
        Ok(true)
    }

    /// Records the outcomes of one token batch. Failures are logged, never raised.
    pub async fn register_bulk(&self, message: &PushMessage, outcomes: &[DeliveryOutcome]) {
        if outcomes.is_empty() {
            return;
        }

        let now = OffsetDateTime::now_utc();
        let events: Vec<WebPushEvent> = outcomes
            .iter()
            .map(|outcome| outcome_event(message, outcome, now))
            .collect();

        match self.events.insert_events(&events).await {
            Ok(stored) => {
                info!(
                    message_id = %message.message_id,
                    domain = %message.domain,
                    outcomes = outcomes.len(),
                    stored,
                    "Registered delivery outcomes"
                );
                self.stats.register_stats(&events).await;
            }
            Err(e) => error!(
                error = %e,
                category = %e.category(),
                message_id = %message.message_id,
                domain = %message.domain,
                outcomes = outcomes.len(),
                "Failed to register delivery outcomes"
            ),
        }
    }
}

fn outcome_event(
    message: &PushMessage,
    outcome: &DeliveryOutcome,
    date: OffsetDateTime,
) -> WebPushEvent {
    let (event_type, sub_type) = if outcome.success {
        (WebPushEventType::Delivered, WebPushEventSubType::None)
    } else if outcome.is_target_still_valid {
        (
            WebPushEventType::DeliveryFailed,
            WebPushEventSubType::UnknownFailure,
        )
    } else {
        (
            WebPushEventType::DeliveryFailed,
            WebPushEventSubType::InvalidSubscription,
        )
    };

    WebPushEvent {
        domain: message.domain.clone(),
        message_id: message.message_id,
        target: EventTarget::DeviceToken(outcome.target_id.clone()),
        date,
        event_type,
        sub_type,
        error_message: outcome.failure_reason.clone(),
        action_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn message() -> PushMessage {
        PushMessage {
            message_id: Uuid::new_v4(),
            domain: "example.com".into(),
            title: "t".into(),
            body: "b".into(),
            on_click_link: None,
            image_url: None,
        }
    }

    #[test]
    fn test_outcome_mapping() {
        let msg = message();
        let now = OffsetDateTime::now_utc();

        let ok = outcome_event(&msg, &DeliveryOutcome::delivered("tok-1"), now);
        assert_eq!(ok.event_type, WebPushEventType::Delivered);
        assert_eq!(ok.sub_type, WebPushEventSubType::None);
        assert_eq!(ok.device_token(), Some("tok-1"));
        assert_eq!(ok.domain, "example.com");

        let transient = outcome_event(
            &msg,
            &DeliveryOutcome::failed("tok-2", "timeout", true),
            now,
        );
        assert_eq!(transient.event_type, WebPushEventType::DeliveryFailed);
        assert_eq!(transient.sub_type, WebPushEventSubType::UnknownFailure);
        assert_eq!(transient.error_message.as_deref(), Some("timeout"));

        let gone = outcome_event(&msg, &DeliveryOutcome::failed("tok-3", "gone", false), now);
        assert_eq!(gone.sub_type, WebPushEventSubType::InvalidSubscription);
    }
}
