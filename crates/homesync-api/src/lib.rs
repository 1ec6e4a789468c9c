// homesync-api: Async WebSocket client for Home Assistant-style hubs

pub mod backoff;
pub mod client;
pub mod error;
mod registry;
pub mod wire;

pub use backoff::ReconnectConfig;
pub use client::{ClientConfig, ConnectionState, DEFAULT_REQUEST_TIMEOUT, HubClient};
pub use error::Error;
pub use registry::{EntityHandler, EntitySubscription};
pub use wire::{EntityState, Request, STATE_CHANGED};
