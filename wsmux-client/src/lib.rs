//! # wsmux-client
//!
//! Client library for wsmux.
//!
//! This crate provides:
//! - Capability negotiation over plain HTTP
//! - Many concurrent HTTP-style requests over one WebSocket, with chunked
//!   bodies and per-request timeouts
//! - WebSocket tunnels to remote endpoints
//! - YAML/env configuration
//!
//! ```no_run
//! use wsmux_client::{Client, ClientConfig};
//!
//! # async fn run() -> Result<(), wsmux_client::ClientError> {
//! let client = Client::new(ClientConfig::new("https://relay.example.com/"))?;
//! let response = client.get("https://example.com/").await?;
//! println!("{} {}", response.status, response.text());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod multiplexer;
pub mod negotiate;
pub mod pending;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use client::Client;
pub use config::{ClientConfig, ConfigError};
pub use error::ClientError;
pub use http::{FetchRequest, HttpResponse};
pub use multiplexer::{ConnectionEvent, Multiplexer};
pub use transport::{Connector, Outgoing, Transport, WebSocketConnector};
pub use tunnel::{Tunnel, TunnelMessage};
