//! WebSocket handler for Axum
//!
//! Handles WebSocket connections and event routing. Each socket gets a
//! writer task draining the connection's outbound queue and a reader loop
//! dispatching client events.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{stream::StreamExt, SinkExt};
use relaydesk_shared::{Direction, NewMessage, StoreError};
use serde::Deserialize;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::state::AppState;

use super::{
    connection::Connection,
    events::{ClientEvent, ServerEvent},
    hub::HubError,
};

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    user_id: Uuid,
    #[serde(default)]
    user_name: Option<String>,
}

/// WebSocket handler - upgrades HTTP connection to WebSocket
///
/// Agents are identified by query parameters; authentication happens upstream.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> Response {
    tracing::info!(user_id = %params.user_id, "WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, params, app_state))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, params: WebSocketQuery, app_state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let hub = app_state.hub.clone();

    let user_name = params
        .user_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "Agent".to_string());
    let conn = hub.connect(params.user_id, user_name).await;
    let connection_id = conn.connection_id;
    let _ = conn.send(hub.get_stats().await.into());

    // Spawn task to drain the outbound queue into the socket
    let writer_conn = Arc::clone(&conn);
    let writer_hub = hub.clone();
    let send_task = tokio::spawn(async move {
        while let Some(event) = writer_conn.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        writer_hub.disconnect(writer_conn.connection_id).await;
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Failed to serialize WebSocket event");
                }
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            _ = conn.closed() => {
                tracing::info!(connection_id = %connection_id, "Connection closed by server");
                break;
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    conn.touch();
                    match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => handle_client_event(event, &conn, &app_state).await,
                        Err(e) => {
                            tracing::warn!(
                                connection_id = %connection_id,
                                error = %e,
                                "Failed to parse client event"
                            );
                            let _ = conn.send(ServerEvent::error("Invalid event format"));
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(connection_id = %connection_id, "WebSocket close frame received");
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Axum answers pings; any frame still counts as liveness.
                    conn.touch();
                }
                Some(Ok(Message::Binary(_))) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                    break;
                }
            }
        }
    }

    let subscriptions = conn.get_subscriptions().await;
    hub.disconnect(connection_id).await;
    app_state.presence.clear_user(conn.user_id, &subscriptions).await;
    send_task.abort();
}

fn hub_error_event(err: &HubError) -> ServerEvent {
    match err {
        HubError::ConnectionNotFound(_) => ServerEvent::error("Connection is closed"),
        HubError::SubscriptionNotFound(ticket_id) => {
            ServerEvent::error(format!("Not subscribed to ticket {ticket_id}"))
        }
        HubError::Store(e) => store_error_event(e),
    }
}

fn store_error_event(err: &StoreError) -> ServerEvent {
    match err {
        StoreError::NotFound(_) => ServerEvent::error("Ticket not found"),
        StoreError::TicketClosed(ticket_id) => {
            ServerEvent::error(format!("Ticket {ticket_id} is closed"))
        }
        StoreError::Unavailable(_) | StoreError::Conflict(_) => {
            ServerEvent::error("Storage temporarily unavailable, try again")
        }
        StoreError::InvalidData(_) => ServerEvent::error("Internal error"),
    }
}

/// Dispatch one client event
pub(crate) async fn handle_client_event(event: ClientEvent, conn: &Arc<Connection>, state: &AppState) {
    let hub = &state.hub;
    let connection_id = conn.connection_id;

    match event {
        ClientEvent::JoinTicket {
            ticket_id,
            user_id,
            after,
        } => {
            if user_id.is_some_and(|id| id != conn.user_id) {
                let _ = conn.send(ServerEvent::error("userId does not match this connection"));
                return;
            }
            if let Err(e) = state.sessions.get_ticket(ticket_id).await {
                let _ = conn.send(store_error_event(&e));
                return;
            }
            if let Err(e) = hub.subscribe(connection_id, ticket_id, after).await {
                tracing::warn!(connection_id = %connection_id, ticket_id = %ticket_id, error = %e, "Join failed");
                let _ = conn.send(hub_error_event(&e));
            }
        }

        ClientEvent::LeaveTicket { ticket_id } => {
            state.presence.stop_typing(ticket_id, conn.user_id).await;
            if let Err(e) = hub.unsubscribe(connection_id, ticket_id).await {
                let _ = conn.send(hub_error_event(&e));
            }
        }

        ClientEvent::RequestMessages {
            ticket_id,
            limit,
            after,
        } => {
            if let Err(e) = hub.load_messages(connection_id, ticket_id, limit, after).await {
                let _ = conn.send(hub_error_event(&e));
            }
        }

        ClientEvent::SendMessage {
            ticket_id,
            content,
            is_internal,
        } => {
            send_agent_message(state, conn, ticket_id, content, is_internal).await;
        }

        ClientEvent::TypingStart { ticket_id } => {
            if !conn.is_subscribed(&ticket_id).await {
                let _ = conn.send(hub_error_event(&HubError::SubscriptionNotFound(ticket_id)));
                return;
            }
            state
                .presence
                .start_typing(ticket_id, conn.user_id, &conn.user_name)
                .await;
        }

        ClientEvent::TypingStop { ticket_id } => {
            state.presence.stop_typing(ticket_id, conn.user_id).await;
        }

        ClientEvent::Ping => {
            conn.touch();
            let _ = conn.send(ServerEvent::Pong {
                timestamp: (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
            });
        }
    }
}

/// Persist an agent reply or note, publish it, and hand replies to the provider.
async fn send_agent_message(
    state: &AppState,
    conn: &Arc<Connection>,
    ticket_id: Uuid,
    content: String,
    is_internal: bool,
) {
    let content = content.trim();
    if content.is_empty() {
        let _ = conn.send(ServerEvent::error("Message content is empty"));
        return;
    }
    if !conn.is_subscribed(&ticket_id).await {
        let _ = conn.send(hub_error_event(&HubError::SubscriptionNotFound(ticket_id)));
        return;
    }

    let direction = if is_internal {
        Direction::InternalNote
    } else {
        Direction::Outbound
    };
    let appended = state
        .hub
        .append_and_publish(NewMessage {
            ticket_id,
            provider_message_id: None,
            direction,
            sender_ref: conn.user_id.to_string(),
            body: content.to_string(),
            provider_timestamp: None,
        })
        .await;

    let message = match appended {
        Ok(appended) => appended.message,
        Err(e) => {
            tracing::warn!(ticket_id = %ticket_id, error = %e, "Agent message rejected");
            let _ = conn.send(store_error_event(&e));
            return;
        }
    };
    state.presence.stop_typing(ticket_id, conn.user_id).await;

    if is_internal {
        return;
    }

    let state = state.clone();
    let connection_id = conn.connection_id;
    tokio::spawn(async move {
        match deliver_reply(&state, ticket_id, &message.body).await {
            Ok(provider_message_id) => {
                tracing::info!(
                    ticket_id = %ticket_id,
                    message_id = %message.id,
                    provider = state.outbound.name(),
                    "Reply handed to provider"
                );
                state
                    .hub
                    .publish(
                        ticket_id,
                        ServerEvent::MessageAck {
                            ticket_id,
                            message_id: message.id,
                            provider_message_id,
                        },
                    )
                    .await;
            }
            Err(e) => {
                tracing::error!(
                    ticket_id = %ticket_id,
                    message_id = %message.id,
                    error = %e,
                    "Reply delivery failed"
                );
                let _ = state
                    .hub
                    .send_to(
                        connection_id,
                        ServerEvent::error(format!("Message {} was saved but not delivered", message.id)),
                    )
                    .await;
            }
        }
    });
}

async fn deliver_reply(
    state: &AppState,
    ticket_id: Uuid,
    body: &str,
) -> Result<Option<String>, crate::outbound::OutboundError> {
    use crate::outbound::OutboundError;

    let ticket = state
        .sessions
        .get_ticket(ticket_id)
        .await
        .map_err(|e| OutboundError::Recipient(e.to_string()))?;
    let customer = state
        .sessions
        .get_customer(ticket.customer_id)
        .await
        .map_err(|e| OutboundError::Recipient(e.to_string()))?;
    state.outbound.send_text(&customer.external_id, body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{MemoryStore, SessionStore};
    use crate::webhook::Identity;
    use relaydesk_shared::{Channel, TicketStatus};
    use std::time::Duration;

    async fn setup() -> (AppState, Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::with_store(
            Config::default(),
            store.clone(),
            Arc::new(crate::outbound::LogSender),
        );
        let resolution = state
            .resolver
            .resolve(
                &Identity {
                    channel: Channel::Whatsapp,
                    external_id: "+5511999998888".to_string(),
                    display_name: None,
                },
                None,
            )
            .await
            .unwrap();
        (state, store, resolution.ticket.id)
    }

    fn drain(conn: &Connection) -> Vec<ServerEvent> {
        std::iter::from_fn(|| conn.try_recv()).collect()
    }

    fn errors(events: &[ServerEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Error { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_join_unknown_ticket_reports_error() {
        let (state, _store, _ticket) = setup().await;
        let conn = state.hub.connect(Uuid::new_v4(), "Bia").await;
        drain(&conn);

        let event = ClientEvent::JoinTicket {
            ticket_id: Uuid::new_v4(),
            user_id: None,
            after: None,
        };
        handle_client_event(event, &conn, &state).await;
        assert_eq!(errors(&drain(&conn)), vec!["Ticket not found"]);
    }

    #[tokio::test]
    async fn test_join_with_foreign_user_id_is_rejected() {
        let (state, _store, ticket_id) = setup().await;
        let conn = state.hub.connect(Uuid::new_v4(), "Bia").await;
        drain(&conn);

        let event = ClientEvent::JoinTicket {
            ticket_id,
            user_id: Some(Uuid::new_v4()),
            after: None,
        };
        handle_client_event(event, &conn, &state).await;
        assert_eq!(errors(&drain(&conn)).len(), 1);
        assert!(!conn.is_subscribed(&ticket_id).await);
    }

    #[tokio::test]
    async fn test_request_messages_without_join() {
        let (state, _store, ticket_id) = setup().await;
        let conn = state.hub.connect(Uuid::new_v4(), "Bia").await;
        drain(&conn);

        let event = ClientEvent::RequestMessages {
            ticket_id,
            limit: None,
            after: None,
        };
        handle_client_event(event, &conn, &state).await;
        assert_eq!(
            errors(&drain(&conn)),
            vec![format!("Not subscribed to ticket {ticket_id}")]
        );
    }

    #[tokio::test]
    async fn test_agent_reply_is_stored_published_and_acked() {
        let (state, _store, ticket_id) = setup().await;
        let author = state.hub.connect(Uuid::new_v4(), "Bia").await;
        let colleague = state.hub.connect(Uuid::new_v4(), "Caio").await;
        for conn in [&author, &colleague] {
            let join = ClientEvent::JoinTicket {
                ticket_id,
                user_id: None,
                after: None,
            };
            handle_client_event(join, conn, &state).await;
            drain(conn);
        }

        let send = ClientEvent::SendMessage {
            ticket_id,
            content: "  Olá, como posso ajudar?  ".to_string(),
            is_internal: false,
        };
        handle_client_event(send, &author, &state).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = drain(&colleague);
        let kinds: Vec<&str> = events.iter().map(ServerEvent::kind).collect();
        assert_eq!(kinds, vec!["new-message", "message-ack"]);
        match &events[0] {
            ServerEvent::NewMessage { message } => {
                assert_eq!(message.body, "Olá, como posso ajudar?");
                assert_eq!(message.direction, Direction::Outbound);
                assert_eq!(message.sender_ref, author.user_id.to_string());
            }
            other => panic!("Expected new-message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_internal_note_is_not_delivered() {
        let (state, _store, ticket_id) = setup().await;
        let conn = state.hub.connect(Uuid::new_v4(), "Bia").await;
        let join = ClientEvent::JoinTicket {
            ticket_id,
            user_id: None,
            after: None,
        };
        handle_client_event(join, &conn, &state).await;
        drain(&conn);

        let note = ClientEvent::SendMessage {
            ticket_id,
            content: "cliente VIP".to_string(),
            is_internal: true,
        };
        handle_client_event(note, &conn, &state).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let kinds: Vec<&str> = drain(&conn).iter().map(ServerEvent::kind).collect();
        assert_eq!(kinds, vec!["new-message"]);
    }

    #[tokio::test]
    async fn test_reply_to_closed_ticket_is_rejected() {
        let (state, store, ticket_id) = setup().await;
        let conn = state.hub.connect(Uuid::new_v4(), "Bia").await;
        let join = ClientEvent::JoinTicket {
            ticket_id,
            user_id: None,
            after: None,
        };
        handle_client_event(join, &conn, &state).await;
        store
            .update_ticket_status(ticket_id, TicketStatus::Closed)
            .await
            .unwrap();
        drain(&conn);

        let send = ClientEvent::SendMessage {
            ticket_id,
            content: "oi".to_string(),
            is_internal: false,
        };
        handle_client_event(send, &conn, &state).await;
        assert_eq!(
            errors(&drain(&conn)),
            vec![format!("Ticket {ticket_id} is closed")]
        );
    }

    #[tokio::test]
    async fn test_typing_requires_join_and_ping_answers() {
        let (state, _store, ticket_id) = setup().await;
        let conn = state.hub.connect(Uuid::new_v4(), "Bia").await;
        drain(&conn);

        handle_client_event(ClientEvent::TypingStart { ticket_id }, &conn, &state).await;
        assert_eq!(errors(&drain(&conn)).len(), 1);

        handle_client_event(ClientEvent::Ping, &conn, &state).await;
        assert!(matches!(drain(&conn).as_slice(), [ServerEvent::Pong { .. }]));
    }
}
