//! # netlem
//!
//! The control plane of a single-host network emulator. Nodes live in their own network
//! namespaces and are wired through an Open vSwitch bridge; the links between them are shaped
//! with a per-node HTB hierarchy (rate) and netem stages (latency, loss).
//!
//! Two control planes are kept consistent while the topology grows one node and one link at a
//! time:
//!
//! - [`shaping`]: per node, an HTB root `1:0` with one class, one u32 destination filter and an
//!   optional netem stage per classified destination.
//! - [`forwarding`]: per node, an OpenFlow `all` group whose buckets are the reachable peers,
//!   bound to the node's switch port.
//!
//! The [`manager::Manager`] composes both against the [`topology::Topology`] state.
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod command;
pub mod dynch;
pub mod forwarding;
pub mod ip;
pub mod manager;
pub mod namespace;
pub mod ovs;
pub mod provision;
pub mod shaping;
pub mod sysctl;
pub mod tc;
pub mod topology;
pub mod wrappers;

#[cfg(test)]
mod testing;

pub use manager::{Manager, ManagerConfig};
pub use topology::{LinkProperties, LinkRequest, NodeId, NodeSpec};
