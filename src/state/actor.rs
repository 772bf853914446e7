//! StateHub - single owner of the state tree
//!
//! All mutation, diffing and fan-out happens inside this actor's run loop, one
//! command at a time. A merge and the broadcast it triggers are handled in the
//! same loop iteration, so no other command can observe the tree between the
//! two.
//!
//! ```text
//! UpstreamClient ──Merge──┐
//! DisplayWatcher ─SetLocal┤        ┌──────────────────────────┐
//! Session ──Subscribe─────┼──cmd──▶│ StateHub                 │──frames──▶ sinks
//! HTTP ─────Query─────────┘        │ tree / registry / coord. │
//!                                  └──────────────────────────┘
//! ```

use super::actor_handle::StateHubHandle;
use super::broadcast::BroadcastCoordinator;
use super::commands::StateCommand;
use super::query::query_objects;
use super::registry::{Subscription, SubscriptionRegistry};
use super::tree::StateTree;
use super::types::ConnectionId;
use crate::error::RelayError;
use crate::protocol::Response;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

pub struct StateHub {
    tree: StateTree,
    registry: SubscriptionRegistry,
    coordinator: BroadcastCoordinator,
    command_rx: mpsc::UnboundedReceiver<StateCommand>,
    /// Mutations processed so far
    update_count: u64,
}

impl StateHub {
    /// Spawn the hub on the current runtime, seeded with `initial`
    pub fn spawn(initial: StateTree) -> StateHubHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let hub = StateHub {
            coordinator: BroadcastCoordinator::new(initial.snapshot()),
            tree: initial,
            registry: SubscriptionRegistry::new(),
            command_rx: cmd_rx,
            update_count: 0,
        };

        tokio::spawn(hub.run());
        info!("StateHub spawned");

        StateHubHandle::new(cmd_tx)
    }

    async fn run(mut self) {
        debug!("StateHub run loop started");

        while let Some(cmd) = self.command_rx.recv().await {
            trace!(?cmd, "Processing command");

            match cmd {
                StateCommand::Merge { root, update } => {
                    let conflicts = self.tree.merge_deep(&root, &update);
                    self.after_mutation(conflicts);
                }
                StateCommand::SetLocal { path, value } => {
                    let conflicts = self.tree.set(&path, value);
                    self.after_mutation(conflicts);
                }
                StateCommand::Attach {
                    connection_id,
                    sink,
                } => {
                    self.coordinator.attach(connection_id, sink);
                    debug!(connection_id, "Connection attached");
                }
                StateCommand::Detach { connection_id } => {
                    let removed = self.registry.unsubscribe(connection_id);
                    self.coordinator.detach(connection_id);
                    debug!(connection_id, removed, "Connection detached");
                }
                StateCommand::Unsubscribe { connection_id } => {
                    let removed = self.registry.unsubscribe(connection_id);
                    debug!(connection_id, removed, "Subscriptions removed");
                }
                StateCommand::Subscribe {
                    connection_id,
                    subscription_id,
                    objects,
                    ack,
                    response,
                } => {
                    self.handle_subscribe(connection_id, subscription_id, &objects, ack, response);
                }
                StateCommand::Query { objects, response } => {
                    let _ = response.send(query_objects(&self.tree, &objects));
                }
                StateCommand::Get { path, response } => {
                    let _ = response.send(self.tree.get(&path).cloned());
                }
                StateCommand::Snapshot { response } => {
                    let _ = response.send(self.tree.snapshot());
                }
                StateCommand::Shutdown => {
                    info!("StateHub shutting down");
                    break;
                }
            }
        }

        info!(
            "StateHub stopped (processed {} updates, {} subscriptions left)",
            self.update_count,
            self.registry.len()
        );
    }

    fn after_mutation(&mut self, conflicts: Vec<RelayError>) {
        for conflict in conflicts {
            warn!("{}", conflict);
        }
        self.update_count += 1;
        self.coordinator.publish(&self.tree, &mut self.registry);
    }

    fn handle_subscribe(
        &mut self,
        connection_id: ConnectionId,
        subscription_id: Value,
        objects: &Value,
        ack: bool,
        response: oneshot::Sender<Subscription>,
    ) {
        if ack {
            let frame = Response::ok(subscription_id.clone(), json!({}));
            if let Err(e) = self.coordinator.send(connection_id, frame.into()) {
                warn!("Subscribe ack failed: {}", e);
            }
        }

        let subscription = self
            .registry
            .subscribe(connection_id, subscription_id, objects, &self.tree);

        if let Err(e) = self.coordinator.notify_snapshot(&subscription, &self.tree) {
            warn!("Dropping subscriber: {}", e);
            self.registry.unsubscribe(connection_id);
            self.coordinator.detach(connection_id);
        }

        let _ = response.send(subscription);
    }
}
