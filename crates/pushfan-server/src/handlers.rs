use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use pushfan_core::{MessageId, WebPushEventType};
use pushfan_notifications::NewPushMessage;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAccepted {
    pub message_id: MessageId,
}

pub async fn send_to_domain(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Json(body): Json<NewPushMessage>,
) -> Result<(StatusCode, Json<SendAccepted>), ApiError> {
    let message = state.push.send_to_domain(&domain, body).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SendAccepted {
            message_id: message.message_id,
        }),
    ))
}

pub async fn send_to_visitor(
    State(state): State<AppState>,
    Path((domain, visitor_guid)): Path<(String, String)>,
    Json(body): Json<NewPushMessage>,
) -> Result<(StatusCode, Json<SendAccepted>), ApiError> {
    let message = state
        .push
        .send_to_visitor(&domain, &visitor_guid, body)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SendAccepted {
            message_id: message.message_id,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackQuery {
    pub action_id: Option<String>,
}

/// Maps the last path segment of a callback URL to an event type.
pub fn parse_callback_event(segment: &str) -> Option<WebPushEventType> {
    match segment {
        "received" => Some(WebPushEventType::Received),
        "clicked" => Some(WebPushEventType::Clicked),
        "action-click" => Some(WebPushEventType::ActionClick),
        _ => None,
    }
}

/// `POST /{contact}/messages/{message}/{event}` from the service worker.
pub async fn record_callback(
    State(state): State<AppState>,
    Path((contact_token, message_token, event)): Path<(String, String, String)>,
    Query(query): Query<CallbackQuery>,
) -> Result<StatusCode, ApiError> {
    let event_type = parse_callback_event(&event)
        .ok_or_else(|| ApiError::bad_request(format!("Unknown event '{event}'")))?;

    let action_id = match event_type {
        WebPushEventType::ActionClick => Some(
            query
                .action_id
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| ApiError::bad_request("actionId is required for action-click"))?,
        ),
        _ => None,
    };

    let codec = state.urls.codec();
    let push_contact_id = codec
        .decrypt(&contact_token)
        .map_err(|e| ApiError::bad_request(format!("Invalid contact id: {e}")))?;
    let message_id: MessageId = codec
        .decrypt(&message_token)
        .map_err(|e| ApiError::bad_request(format!("Invalid message id: {e}")))?
        .parse()
        .map_err(|e| ApiError::bad_request(format!("Invalid message id: {e}")))?;

    // A fresh token, so callbacks in flight during shutdown still land.
    let cancel = CancellationToken::new();
    let registered = state
        .recorder
        .register_event(
            &push_contact_id,
            message_id,
            event_type,
            action_id.as_deref(),
            &cancel,
        )
        .await;

    if registered {
        Ok(StatusCode::ACCEPTED)
    } else {
        debug!(%push_contact_id, %message_id, event_type = %event_type, "Callback rejected");
        Err(ApiError::bad_request("Event was not recorded"))
    }
}
