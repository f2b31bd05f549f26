//! WebSocket support for real-time ticket updates
//!
//! Provides the agent-facing real-time channel:
//! - Live delivery of new messages per ticket, in commit order
//! - Catch-up on join and resume after reconnect
//! - Typing indicators
//! - Heartbeat monitoring and slow-consumer protection
//!
//! # Architecture
//!
//! - **Connection**: One agent socket with its bounded outbound queue
//! - **Room**: Ticket-based pub/sub for broadcasting events
//! - **Hub**: Connection registry and the only publisher of message events
//! - **Presence**: Ephemeral typing state
//! - **Handler**: Axum WebSocket route handler
//! - **Events**: Type-safe event definitions for client/server communication

pub mod connection;
pub mod events;
pub mod handler;
pub mod hub;
pub mod presence;
pub mod queue;
pub mod room;

pub use connection::{Connection, ConnectionState};
pub use events::{ClientEvent, ServerEvent, PROTOCOL_VERSION};
pub use handler::ws_handler;
pub use hub::{ConnectionHub, HubConfig, HubError, HubStats};
pub use presence::PresenceTracker;
