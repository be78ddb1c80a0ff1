use async_trait::async_trait;
use pushfan_core::{DeliveryOutcome, PushMessage};
use pushfan_notifications::{NotificationError, PushTransport};
use tracing::warn;

pub const UNCONFIGURED_REASON: &str = "token transport not configured";

/// Stands in for the device-token transport until one is wired.
///
/// Every token fails as still valid, so nothing is purged.
#[derive(Debug, Default, Clone)]
pub struct UnconfiguredTokenTransport;

#[async_trait]
impl PushTransport for UnconfiguredTokenTransport {
    async fn send_tokens(
        &self,
        message: &PushMessage,
        device_tokens: &[String],
    ) -> Result<Vec<DeliveryOutcome>, NotificationError> {
        warn!(
            message_id = %message.message_id,
            tokens = device_tokens.len(),
            "Device tokens skipped, no token transport configured"
        );
        Ok(device_tokens
            .iter()
            .map(|token| DeliveryOutcome::failed(token.clone(), UNCONFIGURED_REASON, true))
            .collect())
    }
}
