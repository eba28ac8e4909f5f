//! pincer library
//!
//! Session bridging engine for remote shells: a device-facing and a
//! user-facing WebSocket endpoint glued together through a pub/sub
//! message bus, with device presence and session records behind a store
//! gateway.

pub mod auth;
pub mod bus;
pub mod config;
pub mod logging;
pub mod proto;
pub mod server;
pub mod store;
