//! Skylight GW - printer state relay
//!
//! Mirrors the state of one or more upstream JSON-RPC sources (Moonraker
//! style `objects.subscribe`) into a single state tree and fans changes out
//! to any number of downstream subscribers with minimal traffic.

pub mod config;
pub mod display;
pub mod error;
pub mod protocol;
pub mod server;
pub mod state;
pub mod upstream;

pub use error::{RelayError, Result};
