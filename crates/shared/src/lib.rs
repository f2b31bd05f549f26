//! Relaydesk Shared Types and Utilities
//!
//! This crate contains the domain types, store errors and database helpers
//! shared by the Relaydesk services.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
