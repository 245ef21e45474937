//! Topology state: nodes, their per-destination shaping records and forwarding groups.
//!
//! Plain data owned by the [`Manager`](crate::Manager). The shaping and forwarding controllers
//! receive `&mut Node` and write to it only after the corresponding kernel or switch call has
//! succeeded.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::ip::Ipv4Cidr;
use crate::tc::handle::Handle;
use crate::tc::netem::DelayStage;

/// Identifier of a node, assigned sequentially from 1 and never reused.
///
/// Doubles as the node's forwarding group id.
pub type NodeId = u32;

/// Shaping characteristics of a directed link.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkProperties {
    /// One-way delay in milliseconds.
    pub latency: u32,
    /// Random loss in percent.
    pub loss: f64,
    /// Rate in binary megabits per second.
    pub rate: u64,
}

impl LinkProperties {
    pub fn new(latency: u32, loss: f64, rate: u64) -> Self {
        Self { latency, loss, rate }
    }

    /// A link without any shaping. Traffic stays in the default class.
    pub fn is_trivial(&self) -> bool {
        self.latency == 0 && self.loss == 0.0 && self.rate == 0
    }

    /// Whether a netem stage is needed.
    pub fn has_delay_stage(&self) -> bool {
        self.latency != 0 || self.loss != 0.0
    }

    pub fn delay_stage(&self) -> DelayStage {
        DelayStage { latency_ms: self.latency, loss_percent: self.loss }
    }
}

/// A request to shape the link between two nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRequest {
    pub source: String,
    pub destination: String,
    /// Only shape `source -> destination`; otherwise the reverse direction gets the same
    /// properties.
    pub uni_directional: bool,
    pub properties: LinkProperties,
}

impl LinkRequest {
    /// A bi-directional link.
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        properties: LinkProperties,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            uni_directional: false,
            properties,
        }
    }

    pub fn uni_directional(mut self, uni: bool) -> Self {
        self.uni_directional = uni;
        self
    }

    /// The directed pairs this request shapes.
    pub fn directions(&self) -> Vec<(&str, &str)> {
        let mut dirs = vec![(self.source.as_str(), self.destination.as_str())];
        if !self.uni_directional {
            dirs.push((self.destination.as_str(), self.source.as_str()));
        }
        dirs
    }
}

/// A node to add. Without an address, or with an unusable one, the node gets one from the
/// auto-assignment range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub ipv4: Option<String>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ipv4: None }
    }

    pub fn with_ipv4(mut self, ipv4: impl Into<String>) -> Self {
        self.ipv4 = Some(ipv4.into());
        self
    }
}

/// The node's interface inside its namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    /// Hardware address, as reported once the interface exists.
    pub mac: String,
    pub ipv4: Ipv4Cidr,
}

/// What a node installed towards one destination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapingRecord {
    /// Last applied properties.
    pub properties: LinkProperties,
    /// HTB class, `1:(slot+2)`.
    pub class_id: Handle,
    /// Netem handle, `(slot+2):0`. Allocated with the class even when no stage is installed.
    pub queue_handle: Handle,
    /// Whether a netem stage exists at `queue_handle`.
    pub delay_stage: bool,
    /// The destination address the filter matches.
    pub destination: Ipv4Addr,
}

/// Shaping records of a node, keyed by destination node name.
///
/// Entries are only ever added or updated in place: the number of entries is the slot of the
/// next destination, so removing one would hand out a class id twice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rules(BTreeMap<String, ShapingRecord>);

impl Rules {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, peer: &str) -> Option<&ShapingRecord> {
        self.0.get(peer)
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.0.contains_key(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ShapingRecord)> {
        self.0.iter()
    }

    /// Add the record of a newly classified destination. Returns `false`, leaving the existing
    /// record untouched, if the destination was already classified.
    pub(crate) fn insert_new(&mut self, peer: impl Into<String>, record: ShapingRecord) -> bool {
        match self.0.entry(peer.into()) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(record);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub(crate) fn get_mut(&mut self, peer: &str) -> Option<&mut ShapingRecord> {
        self.0.get_mut(peer)
    }
}

/// A node's forwarding group: the OpenFlow `all` group its switch port sends into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingGroup {
    pub id: NodeId,
    /// Switch ports of the peers traffic is flooded to.
    pub members: BTreeSet<String>,
}

/// An emulated node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// The network namespace all shaping of this node happens in.
    pub netns: PathBuf,
    pub interface: Interface,
    /// Switch side of the node's veth pair.
    pub switch_port: String,
    pub rules: Rules,
    /// Set once the forwarding group exists.
    pub group: Option<ForwardingGroup>,
}

/// Where a node's shaping is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapingTarget {
    pub node_id: NodeId,
    pub netns: PathBuf,
    pub interface: String,
}

impl Node {
    pub fn shaping_target(&self) -> ShapingTarget {
        ShapingTarget {
            node_id: self.id,
            netns: self.netns.clone(),
            interface: self.interface.name.clone(),
        }
    }

    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id,
            name: self.name.clone(),
            interface: self.interface.name.clone(),
            mac: self.interface.mac.clone(),
            ipv4: self.interface.ipv4,
        }
    }
}

/// All nodes, by name, plus the id counter.
#[derive(Debug)]
pub struct Topology {
    nodes: BTreeMap<String, Node>,
    next_id: NodeId,
}

impl Default for Topology {
    fn default() -> Self {
        Self { nodes: BTreeMap::new(), next_id: 1 }
    }
}

impl Topology {
    /// Hand out the next node id. Ids are never handed out twice, even across replacement.
    pub fn allocate_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, node: Node) -> Option<Node> {
        self.nodes.insert(node.name.clone(), node)
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Node> {
        self.nodes.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Remove every node, keeping the id counter.
    pub fn drain(&mut self) -> Vec<Node> {
        std::mem::take(&mut self.nodes).into_values().collect()
    }
}

/// Read-only view of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub id: NodeId,
    pub name: String,
    pub interface: String,
    pub mac: String,
    pub ipv4: Ipv4Cidr,
}

/// Read-only view of one shaping record.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSummary {
    pub node: String,
    pub peer: String,
    pub rate: u64,
    pub latency: u32,
    pub loss: f64,
    pub class_id: Handle,
}
