//! Command enum for the StateHub actor
//!
//! Hot path commands (merges, local sets, connection bookkeeping) are
//! fire-and-forget. Reads and subscriptions carry a oneshot channel for the
//! reply.

use super::broadcast::FrameSink;
use super::registry::Subscription;
use super::tree::StateTree;
use super::types::{ConnectionId, Mapping, Path};
use serde_json::Value;
use tokio::sync::oneshot;

pub enum StateCommand {
    // -------------------------------------------------------------------------
    // Hot path commands (no response)
    // -------------------------------------------------------------------------
    /// Deep-merge an upstream update under `root`, then broadcast
    Merge { root: String, update: Mapping },

    /// Write a locally originated value, then broadcast
    SetLocal { path: Path, value: Value },

    /// Register the outbound queue of a connection
    Attach {
        connection_id: ConnectionId,
        sink: FrameSink,
    },

    /// Forget a connection and all of its subscriptions
    Detach { connection_id: ConnectionId },

    /// Remove all subscriptions of a connection but keep it attached
    Unsubscribe { connection_id: ConnectionId },

    // -------------------------------------------------------------------------
    // Request-response commands
    // -------------------------------------------------------------------------
    /// Expand and register a subscription.
    ///
    /// With `ack` set, a `{"result": {}}` response is queued before the
    /// immediate notification.
    Subscribe {
        connection_id: ConnectionId,
        subscription_id: Value,
        objects: Value,
        ack: bool,
        response: oneshot::Sender<Subscription>,
    },

    /// Read an object spec
    Query {
        objects: Value,
        response: oneshot::Sender<Mapping>,
    },

    /// Read a single path
    Get {
        path: Path,
        response: oneshot::Sender<Option<Value>>,
    },

    /// Immutable copy of the whole tree
    Snapshot {
        response: oneshot::Sender<StateTree>,
    },

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------
    Shutdown,
}

// FrameSink and the oneshot senders carry nothing worth printing
impl std::fmt::Debug for StateCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateCommand::Merge { root, update } => f
                .debug_struct("Merge")
                .field("root", root)
                .field("keys", &update.len())
                .finish(),
            StateCommand::SetLocal { path, value } => f
                .debug_struct("SetLocal")
                .field("path", &path.to_string())
                .field("value", value)
                .finish(),
            StateCommand::Attach { connection_id, .. } => f
                .debug_struct("Attach")
                .field("connection_id", connection_id)
                .finish_non_exhaustive(),
            StateCommand::Detach { connection_id } => f
                .debug_struct("Detach")
                .field("connection_id", connection_id)
                .finish(),
            StateCommand::Unsubscribe { connection_id } => f
                .debug_struct("Unsubscribe")
                .field("connection_id", connection_id)
                .finish(),
            StateCommand::Subscribe {
                connection_id,
                subscription_id,
                ack,
                ..
            } => f
                .debug_struct("Subscribe")
                .field("connection_id", connection_id)
                .field("subscription_id", subscription_id)
                .field("ack", ack)
                .finish_non_exhaustive(),
            StateCommand::Query { objects, .. } => f
                .debug_struct("Query")
                .field("objects", objects)
                .finish_non_exhaustive(),
            StateCommand::Get { path, .. } => f
                .debug_struct("Get")
                .field("path", &path.to_string())
                .finish_non_exhaustive(),
            StateCommand::Snapshot { .. } => f.debug_struct("Snapshot").finish_non_exhaustive(),
            StateCommand::Shutdown => write!(f, "Shutdown"),
        }
    }
}
