//! BroadcastCoordinator - diff, match and fan-out
//!
//! Holds the last diffed snapshot and the outbound channel of every attached
//! connection. Each publish diffs the current tree against the previous
//! snapshot and resends the full requested value set to every subscriber
//! whose paths overlap a change.

use super::diff::compare_trees;
use super::query::handle_query;
use super::registry::{Subscription, SubscriptionRegistry};
use super::tree::StateTree;
use super::types::ConnectionId;
use crate::error::{RelayError, Result};
use crate::protocol::{Notification, OutboundFrame};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound frame queue of one connection
pub type FrameSink = mpsc::UnboundedSender<OutboundFrame>;

/// Summary of one publish pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastOutcome {
    pub changed_paths: usize,
    pub delivered: usize,
    pub dropped: Vec<ConnectionId>,
}

pub struct BroadcastCoordinator {
    previous: StateTree,
    sinks: HashMap<ConnectionId, FrameSink>,
}

impl BroadcastCoordinator {
    /// `initial` is the baseline for the first diff
    pub fn new(initial: StateTree) -> Self {
        Self {
            previous: initial,
            sinks: HashMap::new(),
        }
    }

    pub fn attach(&mut self, connection_id: ConnectionId, sink: FrameSink) {
        self.sinks.insert(connection_id, sink);
    }

    pub fn detach(&mut self, connection_id: ConnectionId) -> bool {
        self.sinks.remove(&connection_id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn send(&self, connection_id: ConnectionId, frame: OutboundFrame) -> Result<()> {
        let sink = self.sinks.get(&connection_id).ok_or_else(|| RelayError::Send {
            connection_id,
            reason: "connection not attached".to_string(),
        })?;
        sink.send(frame).map_err(|_| RelayError::Send {
            connection_id,
            reason: "connection closed".to_string(),
        })
    }

    /// Current values for a fresh subscription, sent regardless of changes
    pub fn notify_snapshot(&self, subscription: &Subscription, tree: &StateTree) -> Result<()> {
        let values = handle_query(tree, &subscription.requested_paths);
        let frame = Notification::status_update(subscription.subscription_id.clone(), values);
        self.send(subscription.connection_id, frame.into())
    }

    /// Diff `current` against the last published snapshot and notify every
    /// interested subscriber.
    ///
    /// Connections whose send fails are removed from both the registry and
    /// the sink table. The baseline is only advanced after all sends.
    pub fn publish(
        &mut self,
        current: &StateTree,
        registry: &mut SubscriptionRegistry,
    ) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();

        let changes = compare_trees(&self.previous, current);
        if changes.is_empty() {
            self.previous = current.snapshot();
            return outcome;
        }

        let changed = changes.changed_paths();
        outcome.changed_paths = changed.len();

        let mut failed = BTreeSet::new();
        for subscription in registry.matching(&changed) {
            if failed.contains(&subscription.connection_id) {
                continue;
            }
            let values = handle_query(current, &subscription.requested_paths);
            let frame = Notification::status_update(subscription.subscription_id.clone(), values);
            match self.send(subscription.connection_id, frame.into()) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    warn!("Dropping subscriber: {}", e);
                    failed.insert(subscription.connection_id);
                }
            }
        }

        for connection_id in failed {
            registry.unsubscribe(connection_id);
            self.sinks.remove(&connection_id);
            outcome.dropped.push(connection_id);
        }

        debug!(
            changed = outcome.changed_paths,
            delivered = outcome.delivered,
            dropped = outcome.dropped.len(),
            "Broadcast complete"
        );

        self.previous = current.snapshot();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::Mapping;
    use serde_json::{json, Value};

    fn mapping(value: Value) -> Mapping {
        match value {
            Value::Object(map) => map,
            other => panic!("expected mapping, got {other}"),
        }
    }

    fn notification(frame: OutboundFrame) -> Notification {
        match frame {
            OutboundFrame::Notification(n) => n,
            other => panic!("expected notification, got {other:?}"),
        }
    }

    struct Fixture {
        tree: StateTree,
        registry: SubscriptionRegistry,
        coordinator: BroadcastCoordinator,
    }

    impl Fixture {
        fn new() -> Self {
            let tree = StateTree::new();
            Self {
                coordinator: BroadcastCoordinator::new(tree.snapshot()),
                tree,
                registry: SubscriptionRegistry::new(),
            }
        }

        fn connect(&mut self, id: ConnectionId, objects: Value) -> mpsc::UnboundedReceiver<OutboundFrame> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.coordinator.attach(id, tx);
            self.registry.subscribe(id, json!(id), &objects, &self.tree);
            rx
        }

        fn merge(&mut self, root: &str, update: Value) -> BroadcastOutcome {
            self.tree.merge_deep(root, &mapping(update));
            self.coordinator.publish(&self.tree, &mut self.registry)
        }
    }

    #[test]
    fn test_first_merge_notifies_then_identical_merge_does_not() {
        let mut fx = Fixture::new();
        let mut rx = fx.connect(1, json!({"printer": {"extruder": ["temperature"]}}));

        let outcome = fx.merge("printer", json!({"extruder": {"temperature": 20}}));
        assert_eq!(outcome.delivered, 1);
        let n = notification(rx.try_recv().unwrap());
        assert_eq!(n.values()["printer.extruder.temperature"], json!(20));
        assert_eq!(n.id, json!(1));

        let outcome = fx.merge("printer", json!({"extruder": {"temperature": 20}}));
        assert_eq!(outcome, BroadcastOutcome::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unrelated_change_is_not_sent() {
        let mut fx = Fixture::new();
        let mut rx = fx.connect(1, json!({"a": {"b": null}}));

        fx.merge("a", json!({"c": 1}));
        assert!(rx.try_recv().is_err());

        fx.merge("a", json!({"b": {"x": 1}}));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_full_requested_set_is_resent() {
        let mut fx = Fixture::new();
        fx.merge("p", json!({"t": 1, "u": 2}));
        let mut rx = fx.connect(1, json!({"p": ["t", "u"]}));

        fx.merge("p", json!({"t": 5}));
        let n = notification(rx.try_recv().unwrap());
        assert_eq!(n.values().len(), 2);
        assert_eq!(n.values()["p.t"], json!(5));
        assert_eq!(n.values()["p.u"], json!(2));
    }

    #[test]
    fn test_change_under_empty_key_reaches_subtree_subscriber() {
        let mut fx = Fixture::new();
        let mut rx = fx.connect(1, json!({"m": null}));

        let outcome = fx.merge("m", json!({"": 5}));
        assert_eq!(outcome.delivered, 1);
        let n = notification(rx.try_recv().unwrap());
        assert_eq!(n.values()["m"], json!({"": 5}));
    }

    #[test]
    fn test_float_form_of_same_number_is_not_sent() {
        let mut fx = Fixture::new();
        let mut rx = fx.connect(1, json!({"p": ["t"]}));
        fx.merge("p", json!({"t": 20}));
        assert!(rx.try_recv().is_ok());

        let outcome = fx.merge("p", json!({"t": 20.0}));
        assert_eq!(outcome.delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_frozen_wildcard_ignores_new_children() {
        let mut fx = Fixture::new();
        fx.merge("p", json!({"group": {"a": 1}}));
        let mut rx = fx.connect(1, json!({"p": {"group": "*"}}));

        fx.merge("p", json!({"group": {"b": 2}}));
        assert!(rx.try_recv().is_err());

        fx.merge("p", json!({"group": {"a": 3, "b": 4}}));
        let n = notification(rx.try_recv().unwrap());
        assert_eq!(n.values().len(), 1);
        assert_eq!(n.values()["p.group.a"], json!(3));
    }

    #[test]
    fn test_failed_send_drops_only_that_subscriber() {
        let mut fx = Fixture::new();
        let rx_dead = fx.connect(1, json!({"p": null}));
        let mut rx_live = fx.connect(2, json!({"p": null}));
        drop(rx_dead);

        let outcome = fx.merge("p", json!({"x": 1}));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.dropped, vec![1]);
        assert_eq!(fx.registry.len(), 1);
        assert_eq!(fx.coordinator.connection_count(), 1);
        assert!(rx_live.try_recv().is_ok());
        assert_eq!(fx.tree.get(&"p.x".parse().unwrap()), Some(&json!(1)));
    }

    #[test]
    fn test_notify_snapshot_sends_current_values() {
        let mut fx = Fixture::new();
        fx.merge("p", json!({"x": 1}));
        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.coordinator.attach(9, tx);
        let sub = fx.registry.subscribe(9, json!("s"), &json!({"p": ["x", "missing"]}), &fx.tree);

        fx.coordinator.notify_snapshot(&sub, &fx.tree).unwrap();
        let n = notification(rx.try_recv().unwrap());
        assert_eq!(n.id, json!("s"));
        assert_eq!(n.values().len(), 1);
    }
}
