//! Upstream sources
//!
//! Each configured source gets an `UpstreamClient` that keeps a subscription
//! open and merges every update into the hub under the source's root name.

mod client;
mod transport;

pub use client::{ConnectionState, StatusCallback, UpstreamClient};
pub use transport::{Connector, Transport, WsConnector, WsTransport};
