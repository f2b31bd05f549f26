//! Relaydesk API Library
//!
//! Customer-support conversation pipeline: provider webhooks in, one active
//! ticket per customer, an ordered message log, and real-time fan-out to
//! agent consoles over WebSocket.

pub mod config;
pub mod error;
pub mod keyed_lock;
pub mod outbound;
pub mod reconnect;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
pub mod webhook;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use session::{InboundResolution, Resolution, SessionResolver, SessionSummary};
pub use state::AppState;
