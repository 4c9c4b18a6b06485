//! Shared types for the LISTEN.moe terminal client: catalog and gateway
//! payloads, the session model owned by the reconciler, configuration and
//! on-disk state.

pub mod auth;
pub mod config;
pub mod error;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod state;
pub mod types;

pub use error::ClientError;
