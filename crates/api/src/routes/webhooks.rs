//! Provider webhook receiver
//!
//! Every delivery is acknowledged with 200 unless a transient store failure
//! means the provider should redeliver, which is answered with 503.

use axum::{extract::State, Json};
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::webhook::IngestResult;

/// POST /api/v1/webhooks/whatsapp
pub async fn receive_whatsapp(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<IngestResult>> {
    match state.ingestor.handle(body).await {
        IngestResult::Retry { error } => {
            tracing::warn!(error = %error, "Webhook deferred for redelivery");
            Err(ApiError::ServiceUnavailable)
        }
        result => Ok(Json(result)),
    }
}
