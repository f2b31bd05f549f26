//! Session RPC for collaborators that resolve customers outside the webhook path

use axum::{extract::State, Json};
use relaydesk_shared::Channel;
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::session::SessionSummary;
use crate::state::AppState;
use crate::webhook::Identity;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOrCreateRequest {
    pub external_id: String,
    #[serde(default)]
    pub display_name_hint: Option<String>,
}

/// POST /api/v1/sessions/find-or-create
pub async fn find_or_create(
    State(state): State<AppState>,
    Json(req): Json<FindOrCreateRequest>,
) -> ApiResult<Json<SessionSummary>> {
    let external_id = state
        .extractor
        .normalize(&req.external_id)
        .ok_or_else(|| ApiError::Validation("externalId is not a valid phone number".to_string()))?;

    let display_name = req
        .display_name_hint
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());
    let identity = Identity {
        channel: Channel::Whatsapp,
        external_id,
        display_name,
    };

    let resolution = state
        .resolver
        .resolve(&identity, identity.display_name.as_deref())
        .await?;
    Ok(Json(SessionSummary::from(&resolution)))
}
