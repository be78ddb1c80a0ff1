//! Domain types of the delivery pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, Time, UtcOffset};
use uuid::Uuid;

/// Identifier of a push message.
pub type MessageId = Uuid;

/// The audience of one dispatch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DispatchScope {
    /// Every subscriber of a domain.
    Domain { domain: String },
    /// Every device of one visitor within a domain.
    #[serde(rename_all = "camelCase")]
    Visitor { domain: String, visitor_guid: String },
}

impl DispatchScope {
    pub fn domain(domain: impl Into<String>) -> Self {
        Self::Domain {
            domain: domain.into(),
        }
    }

    pub fn visitor(domain: impl Into<String>, visitor_guid: impl Into<String>) -> Self {
        Self::Visitor {
            domain: domain.into(),
            visitor_guid: visitor_guid.into(),
        }
    }

    /// Domain the scope belongs to.
    pub fn domain_name(&self) -> &str {
        match self {
            Self::Domain { domain } | Self::Visitor { domain, .. } => domain,
        }
    }

    pub fn visitor_guid(&self) -> Option<&str> {
        match self {
            Self::Domain { .. } => None,
            Self::Visitor { visitor_guid, .. } => Some(visitor_guid),
        }
    }
}

impl fmt::Display for DispatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain { domain } => write!(f, "domain:{domain}"),
            Self::Visitor {
                domain,
                visitor_guid,
            } => write!(f, "visitor:{domain}/{visitor_guid}"),
        }
    }
}

/// A push message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub message_id: MessageId,
    pub domain: String,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_click_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Standards-based Web Push subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebPushSubscription {
    pub endpoint: String,
    pub auth: String,
    pub p256dh: String,
}

/// Delivery mechanism of a subscriber device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushTarget {
    /// Legacy token push, delivered through the push transport.
    DeviceToken(String),
    /// Web Push subscription, delivered through a provider queue.
    Subscription(WebPushSubscription),
}

/// One deliverable subscriber device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub push_contact_id: String,
    pub target: PushTarget,
}

/// A contact as persisted, where both delivery mechanisms are nullable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRow {
    pub push_contact_id: String,
    pub domain: String,
    #[serde(default)]
    pub visitor_guid: Option<String>,
    #[serde(default)]
    pub device_token: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub p256dh: Option<String>,
}

impl ContactRow {
    /// Resolves the stored shape into a deliverable record.
    ///
    /// A complete subscription wins over a device token. Returns `None` when the
    /// row carries neither.
    pub fn into_record(self) -> Option<SubscriptionRecord> {
        let push_contact_id = self.push_contact_id;

        let subscription = match (
            non_empty(self.endpoint),
            non_empty(self.auth),
            non_empty(self.p256dh),
        ) {
            (Some(endpoint), Some(auth), Some(p256dh)) => Some(WebPushSubscription {
                endpoint,
                auth,
                p256dh,
            }),
            _ => None,
        };

        let target = match (subscription, non_empty(self.device_token)) {
            (Some(subscription), _) => PushTarget::Subscription(subscription),
            (None, Some(token)) => PushTarget::DeviceToken(token),
            (None, None) => return None,
        };

        Some(SubscriptionRecord {
            push_contact_id,
            target,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Result of one delivery attempt against one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    pub target_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// `false` means the token or subscription should be purged.
    pub is_target_still_valid: bool,
}

impl DeliveryOutcome {
    pub fn delivered(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            success: true,
            failure_reason: None,
            is_target_still_valid: true,
        }
    }

    pub fn failed(
        target_id: impl Into<String>,
        reason: impl Into<String>,
        is_target_still_valid: bool,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            success: false,
            failure_reason: Some(reason.into()),
            is_target_still_valid,
        }
    }
}

/// Kind of a recorded web push event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WebPushEventType {
    Delivered,
    DeliveryFailed,
    ProcessingFailed,
    DeliveryFailedButRetry,
    Received,
    Clicked,
    ActionClick,
}

impl WebPushEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::DeliveryFailed => "deliveryFailed",
            Self::ProcessingFailed => "processingFailed",
            Self::DeliveryFailedButRetry => "deliveryFailedButRetry",
            Self::Received => "received",
            Self::Clicked => "clicked",
            Self::ActionClick => "actionClick",
        }
    }

    /// Post-delivery user actions, at most one per contact and message.
    pub fn is_engagement(&self) -> bool {
        matches!(self, Self::Received | Self::Clicked | Self::ActionClick)
    }
}

impl fmt::Display for WebPushEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebPushEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(Self::Delivered),
            "deliveryFailed" => Ok(Self::DeliveryFailed),
            "processingFailed" => Ok(Self::ProcessingFailed),
            "deliveryFailedButRetry" => Ok(Self::DeliveryFailedButRetry),
            "received" => Ok(Self::Received),
            "clicked" => Ok(Self::Clicked),
            "actionClick" => Ok(Self::ActionClick),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WebPushEventSubType {
    #[default]
    None,
    UnknownFailure,
    InvalidSubscription,
}

impl WebPushEventSubType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::UnknownFailure => "unknownFailure",
            Self::InvalidSubscription => "invalidSubscription",
        }
    }
}

impl FromStr for WebPushEventSubType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "unknownFailure" => Ok(Self::UnknownFailure),
            "invalidSubscription" => Ok(Self::InvalidSubscription),
            other => Err(format!("unknown event sub type: {other}")),
        }
    }
}

/// Who an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum EventTarget {
    PushContact(String),
    DeviceToken(String),
}

/// Append-only delivery or engagement fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebPushEvent {
    pub domain: String,
    pub message_id: MessageId,
    pub target: EventTarget,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    #[serde(rename = "type")]
    pub event_type: WebPushEventType,
    #[serde(default)]
    pub sub_type: WebPushEventSubType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
}

impl WebPushEvent {
    pub fn push_contact_id(&self) -> Option<&str> {
        match &self.target {
            EventTarget::PushContact(id) => Some(id),
            EventTarget::DeviceToken(_) => None,
        }
    }

    pub fn device_token(&self) -> Option<&str> {
        match &self.target {
            EventTarget::PushContact(_) => None,
            EventTarget::DeviceToken(token) => Some(token),
        }
    }
}

/// Truncates a timestamp to the start of its UTC hour.
pub fn hour_bucket(date: OffsetDateTime) -> OffsetDateTime {
    let utc = date.to_offset(UtcOffset::UTC);
    utc.replace_time(Time::MIDNIGHT + time::Duration::hours(i64::from(utc.hour())))
}

/// Key of an hourly stats bucket.
///
/// Domains compare case-insensitively, so the key holds the lowercased form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsKey {
    pub domain: String,
    pub message_id: MessageId,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
}

impl StatsKey {
    pub fn for_event(event: &WebPushEvent) -> Self {
        Self {
            domain: event.domain.to_ascii_lowercase(),
            message_id: event.message_id,
            date: hour_bucket(event.date),
        }
    }
}

/// Monotonic counters of a stats bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsCounters {
    pub sent: i64,
    pub delivered: i64,
    pub not_delivered: i64,
    pub received: i64,
    pub click: i64,
    pub action_click: i64,
    pub billable_sends: i64,
}

impl StatsCounters {
    /// Counts a single event.
    pub fn record(&mut self, event: &WebPushEvent) {
        self.sent += 1;
        match event.event_type {
            WebPushEventType::Delivered => {
                self.delivered += 1;
                self.billable_sends += 1;
            }
            WebPushEventType::DeliveryFailed => {
                self.not_delivered += 1;
                if event.sub_type == WebPushEventSubType::InvalidSubscription {
                    self.billable_sends += 1;
                }
            }
            WebPushEventType::ProcessingFailed => self.not_delivered += 1,
            WebPushEventType::Received => self.received += 1,
            WebPushEventType::Clicked => self.click += 1,
            WebPushEventType::ActionClick => self.action_click += 1,
            WebPushEventType::DeliveryFailedButRetry => {}
        }
    }

    /// Adds another set of counters onto this one.
    pub fn add(&mut self, other: &StatsCounters) {
        self.sent += other.sent;
        self.delivered += other.delivered;
        self.not_delivered += other.not_delivered;
        self.received += other.received;
        self.click += other.click;
        self.action_click += other.action_click;
        self.billable_sends += other.billable_sends;
    }
}

/// Hourly aggregate for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatsBucket {
    #[serde(flatten)]
    pub key: StatsKey,
    #[serde(flatten)]
    pub counters: StatsCounters,
}
