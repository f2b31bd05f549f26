//! Ticket routes used by the agent console

use axum::{
    extract::{Path, Query, State},
    Json,
};
use relaydesk_shared::{Message, MessageCursor, Ticket, TicketStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::websocket::ServerEvent;

/// Largest page served by the message listing
const MAX_PAGE_SIZE: usize = 200;

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

/// PATCH /api/v1/tickets/:ticket_id/status
pub async fn update_status(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
    Json(req): Json<UpdateStatusRequest>,
) -> ApiResult<Json<Ticket>> {
    let status = TicketStatus::from_alias(&req.status)
        .ok_or_else(|| ApiError::Validation(format!("Unknown ticket status: {}", req.status)))?;

    let ticket = state.sessions.update_ticket_status(ticket_id, status).await?;
    tracing::info!(ticket_id = %ticket_id, status = %ticket.status, "Ticket status updated");

    state
        .hub
        .publish(
            ticket_id,
            ServerEvent::TicketUpdated {
                ticket_id,
                status: ticket.status,
            },
        )
        .await;
    Ok(Json(ticket))
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<MessageCursor>,
}

/// GET /api/v1/tickets/:ticket_id/messages
pub async fn list_messages(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiResult<Json<MessagePage>> {
    let cursor = query
        .after
        .as_deref()
        .map(str::parse::<MessageCursor>)
        .transpose()
        .map_err(|_| ApiError::BadRequest("Invalid cursor".to_string()))?;
    let limit = query
        .limit
        .unwrap_or(state.config.catchup_limit)
        .clamp(1, MAX_PAGE_SIZE);

    // Unknown tickets are a 404, not an empty page.
    state.sessions.get_ticket(ticket_id).await?;
    let messages = state.messages.list_since(ticket_id, cursor, limit).await?;
    let next_cursor = messages.last().map(Message::cursor);

    Ok(Json(MessagePage {
        messages,
        next_cursor,
    }))
}
