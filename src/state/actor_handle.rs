//! StateHubHandle - public API of the StateHub
//!
//! Fire-and-forget methods for the hot path, async methods with oneshot
//! replies for reads and subscriptions.

use super::broadcast::FrameSink;
use super::commands::StateCommand;
use super::registry::Subscription;
use super::tree::StateTree;
use super::types::{ConnectionId, Mapping, Path};
use crate::error::{RelayError, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Cloneable handle to the StateHub
///
/// # Hot path (fire-and-forget)
/// - `merge`, `set_local`
/// - `attach`, `detach`, `unsubscribe`
///
/// # Requests (async)
/// - `subscribe`, `subscribe_with_ack`
/// - `query`, `get`, `snapshot`
#[derive(Clone)]
pub struct StateHubHandle {
    cmd_tx: mpsc::UnboundedSender<StateCommand>,
    next_id: Arc<AtomicU64>,
}

impl StateHubHandle {
    pub fn new(cmd_tx: mpsc::UnboundedSender<StateCommand>) -> Self {
        Self {
            cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Spawn a StateHub seeded with `initial` and return its handle
    pub fn spawn(initial: StateTree) -> Self {
        super::actor::StateHub::spawn(initial)
    }

    /// Allocate a fresh connection id (unique across clones of this handle)
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    // =========================================================================
    // Hot path
    // =========================================================================

    pub fn merge(&self, root: impl Into<String>, update: Mapping) {
        let _ = self.cmd_tx.send(StateCommand::Merge {
            root: root.into(),
            update,
        });
    }

    /// Write a locally originated field
    pub fn set_local(&self, path: Path, value: Value) {
        let _ = self.cmd_tx.send(StateCommand::SetLocal { path, value });
    }

    pub fn attach(&self, connection_id: ConnectionId, sink: FrameSink) {
        let _ = self.cmd_tx.send(StateCommand::Attach {
            connection_id,
            sink,
        });
    }

    pub fn detach(&self, connection_id: ConnectionId) {
        let _ = self.cmd_tx.send(StateCommand::Detach { connection_id });
    }

    pub fn unsubscribe(&self, connection_id: ConnectionId) {
        let _ = self.cmd_tx.send(StateCommand::Unsubscribe { connection_id });
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(StateCommand::Shutdown);
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Register a subscription; the current values are pushed right away
    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        subscription_id: Value,
        objects: Value,
    ) -> Result<Subscription> {
        self.request(|response| StateCommand::Subscribe {
            connection_id,
            subscription_id,
            objects,
            ack: false,
            response,
        })
        .await
    }

    /// Like `subscribe`, but queues an empty result response first
    pub async fn subscribe_with_ack(
        &self,
        connection_id: ConnectionId,
        subscription_id: Value,
        objects: Value,
    ) -> Result<Subscription> {
        self.request(|response| StateCommand::Subscribe {
            connection_id,
            subscription_id,
            objects,
            ack: true,
            response,
        })
        .await
    }

    pub async fn query(&self, objects: Value) -> Result<Mapping> {
        self.request(|response| StateCommand::Query { objects, response })
            .await
    }

    pub async fn get(&self, path: Path) -> Result<Option<Value>> {
        self.request(|response| StateCommand::Get { path, response })
            .await
    }

    pub async fn snapshot(&self) -> Result<StateTree> {
        self.request(|response| StateCommand::Snapshot { response })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> StateCommand,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(response_tx))
            .map_err(|_| RelayError::HubClosed)?;
        response_rx.await.map_err(|_| RelayError::HubClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_connection_ids_are_unique_across_clones() {
        let handle = StateHubHandle::spawn(StateTree::new());
        let other = handle.clone();
        let a = handle.next_connection_id();
        let b = other.next_connection_id();
        assert_ne!(a, b);
        assert!(handle.is_alive());
    }

    #[tokio::test]
    async fn test_query_and_snapshot() {
        let handle = StateHubHandle::spawn(StateTree::new());
        let Value::Object(update) = json!({"extruder": {"temperature": 20, "target": 0}}) else {
            unreachable!()
        };
        handle.merge("printer", update);

        let values = handle
            .query(json!({"printer": {"extruder": ["target"]}}))
            .await
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["printer.extruder.target"], json!(0));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(
            snapshot.get(&Path::parse("printer.extruder.temperature").unwrap()),
            Some(&json!(20))
        );
    }

    #[tokio::test]
    async fn test_requests_fail_once_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = StateHubHandle::new(tx);
        assert!(!handle.is_alive());
        assert!(matches!(
            handle.query(json!({})).await,
            Err(RelayError::HubClosed)
        ));
        // Fire-and-forget never panics on a closed hub
        handle.merge("x", Mapping::new());
    }
}
