//! State synchronization core
//!
//! A path-addressable tree of last-known values, a structural diff engine,
//! a subscription registry with subscribe-time wildcard expansion, and the
//! broadcast coordinator that turns each mutation into per-subscriber
//! notifications. Everything here is owned by the `StateHub` actor and
//! reached through a `StateHubHandle`.

mod actor;
mod actor_handle;
mod broadcast;
mod commands;
pub mod diff;
pub mod query;
pub mod registry;
mod tree;
mod types;

pub use actor::StateHub;
pub use actor_handle::StateHubHandle;
pub use broadcast::{BroadcastCoordinator, BroadcastOutcome, FrameSink};
pub use diff::{compare, compare_trees, values_equal, Change, ChangeSet, Slot};
pub use query::{handle_query, object_spec_from_query, query_objects};
pub use registry::{expand_object_spec, Subscription, SubscriptionRegistry};
pub use tree::StateTree;
pub use types::{value_kind, ConnectionId, Mapping, Path, WILDCARD};
