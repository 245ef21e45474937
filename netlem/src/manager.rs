//! The orchestrator: adds nodes and links, and tears everything down again.

use std::collections::BTreeSet;

use tracing::Instrument as _;

use crate::forwarding::{self, Forwarder, SwitchBackend};
use crate::ip::{self, AutoAssignRange, Ipv4Cidr};
use crate::ovs::{self, OvsSwitch};
use crate::provision::{self, NetnsProvisioner, NodePlan, NodeProvisioner};
use crate::shaping::{self, NetlinkShaping, ShapingBackend, TrafficShaper};
use crate::topology::{
    Interface, LinkProperties, LinkRequest, Node, NodeId, NodeSpec, NodeSummary, Rules,
    RuleSummary, Topology,
};

/// Longest interface name the kernel accepts, `IFNAMSIZ` minus the terminating nul.
const MAX_INTERFACE_NAME: usize = 15;

// -------------------------------------------------------------------------------------
// Configuration
// -------------------------------------------------------------------------------------

/// Naming and addressing of the emulated nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// The switch bridge every node port is attached to.
    pub bridge: String,
    /// Appended to a node's name to form its interface name, inside the namespace.
    pub interface_suffix: String,
    /// Appended to a node's name to form its switch port name.
    pub switch_port_suffix: String,
    /// Addresses handed to nodes without a usable one.
    pub auto_assign: AutoAssignRange,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bridge: ovs::DEFAULT_BRIDGE.to_string(),
            interface_suffix: "-veth0".to_string(),
            switch_port_suffix: "-ovs".to_string(),
            auto_assign: AutoAssignRange::default(),
        }
    }
}

impl ManagerConfig {
    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = bridge.into();
        self
    }

    pub fn with_interface_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.interface_suffix = suffix.into();
        self
    }

    pub fn with_switch_port_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.switch_port_suffix = suffix.into();
        self
    }

    pub fn with_auto_assign(mut self, range: AutoAssignRange) -> Self {
        self.auto_assign = range;
        self
    }

    fn interface_name(&self, node: &str) -> String {
        format!("{node}{}", self.interface_suffix)
    }

    fn switch_port_name(&self, node: &str) -> String {
        format!("{node}{}", self.switch_port_suffix)
    }
}

// -------------------------------------------------------------------------------------
// Error Handling
// -------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("link from {0} to itself")]
    SelfLink(String),

    #[error("interface name {0} exceeds {MAX_INTERFACE_NAME} bytes")]
    NameTooLong(String),

    #[error("no address left for node {node}: {source}")]
    AddressPoolExhausted {
        node: String,
        #[source]
        source: ip::Error,
    },

    #[error("shaping error: {0}")]
    Shaping(#[from] shaping::Error),

    #[error("forwarding error: {0}")]
    Forwarding(#[from] forwarding::Error),

    #[error("provisioning error: {0}")]
    Provision(#[from] provision::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// -------------------------------------------------------------------------------------
// Manager
// -------------------------------------------------------------------------------------

/// Owns the topology and keeps the shaping and forwarding control planes consistent with it.
///
/// # Example
///
/// ```no_run
/// use netlem::{LinkProperties, LinkRequest, Manager, ManagerConfig, NodeSpec};
///
/// #[tokio::main]
/// async fn main() {
///     let mut manager = Manager::new(ManagerConfig::default()).await.unwrap();
///
///     manager.add_node(NodeSpec::new("n1").with_ipv4("10.0.0.1/24")).await.unwrap();
///     manager.add_node(NodeSpec::new("n2").with_ipv4("10.0.0.2/24")).await.unwrap();
///
///     // 10 Mbit/s, 50ms and 1% loss, both ways.
///     let link = LinkRequest::new("n1", "n2", LinkProperties::new(50, 1.0, 10));
///     manager.add_link(link).await.unwrap();
///
///     manager.destroy().await;
/// }
/// ```
#[derive(Debug)]
pub struct Manager<P = NetnsProvisioner, B = NetlinkShaping, S = OvsSwitch> {
    config: ManagerConfig,
    topology: Topology,
    provisioner: P,
    shaper: TrafficShaper<B>,
    forwarder: Forwarder<S>,
}

impl Manager {
    /// A manager over network namespaces, rtnetlink and Open vSwitch. Creates the bridge.
    pub async fn new(config: ManagerConfig) -> Result<Self> {
        let provisioner = NetnsProvisioner::new()?;
        let switch = OvsSwitch::new(config.bridge.clone());

        Self::with_backends(config, provisioner, NetlinkShaping::new(), switch).await
    }
}

impl<P, B, S> Manager<P, B, S>
where
    P: NodeProvisioner,
    B: ShapingBackend,
    S: SwitchBackend,
{
    /// A manager over the given backends. Creates the bridge.
    pub async fn with_backends(
        config: ManagerConfig,
        provisioner: P,
        shaping: B,
        switch: S,
    ) -> Result<Self> {
        let mut forwarder = Forwarder::new(switch);
        forwarder.init().await?;

        Ok(Self {
            config,
            topology: Topology::default(),
            provisioner,
            shaper: TrafficShaper::new(shaping),
            forwarder,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Add a node, replacing any node of the same name.
    ///
    /// The node gets the next id, its namespace and switch port, an HTB root and an empty
    /// forwarding group. Returns the id.
    pub async fn add_node(&mut self, spec: NodeSpec) -> Result<NodeId> {
        let interface = self.config.interface_name(&spec.name);
        let switch_port = self.config.switch_port_name(&spec.name);
        for name in [&interface, &switch_port] {
            if name.len() > MAX_INTERFACE_NAME {
                return Err(Error::NameTooLong(name.clone()));
            }
        }

        let id = self.topology.allocate_id();
        let span = tracing::debug_span!("add_node", node = %spec.name, id);

        async move {
            let ipv4 = self.resolve_address(&spec, id)?;

            if let Some(previous) = self.topology.remove(&spec.name) {
                tracing::debug!(previous = previous.id, "replacing node");
                self.teardown_node(previous).await;
            }

            let plan = NodePlan { name: spec.name.clone(), interface, switch_port, ipv4 };
            let realized = self.provisioner.provision(&plan).await?;

            self.topology.insert(Node {
                id,
                name: plan.name,
                netns: realized.netns,
                interface: Interface { name: plan.interface, mac: realized.mac, ipv4 },
                switch_port: plan.switch_port,
                rules: Rules::default(),
                group: None,
            });

            let node =
                self.topology.get_mut(&spec.name).ok_or_else(|| Error::NodeNotFound(spec.name))?;

            self.forwarder.attach_port(&node.switch_port).await?;
            self.shaper.install_root(node).await?;
            self.forwarder.ensure_group(node).await?;

            tracing::info!(node = %node.name, id, ipv4 = %node.interface.ipv4, "node added");
            Ok::<_, Error>(id)
        }
        .instrument(span)
        .await
    }

    /// The node's address as requested, or one from the auto-assignment range if it was
    /// missing or unusable.
    fn resolve_address(&self, spec: &NodeSpec, id: NodeId) -> Result<Ipv4Cidr> {
        let range = self.config.auto_assign;

        match spec.ipv4.as_deref().map(|s| range.validate(s)) {
            Some(Ok(cidr)) => return Ok(cidr),
            Some(Err(e)) => {
                tracing::warn!(
                    node = %spec.name,
                    requested = ?spec.ipv4,
                    %e,
                    "unusable address, assigning one"
                );
            }
            None => tracing::debug!(node = %spec.name, "no address requested, assigning one"),
        }

        range
            .assign(id)
            .map_err(|source| Error::AddressPoolExhausted { node: spec.name.clone(), source })
    }

    /// Shape and forward the link, in both directions unless it is uni-directional.
    ///
    /// Applying the same link again only replaces what changed.
    pub async fn add_link(&mut self, link: LinkRequest) -> Result<()> {
        for name in [&link.source, &link.destination] {
            if !self.topology.contains(name) {
                return Err(Error::NodeNotFound(name.clone()));
            }
        }
        if link.source == link.destination {
            return Err(Error::SelfLink(link.source));
        }

        let span = tracing::debug_span!(
            "add_link",
            source = %link.source,
            destination = %link.destination,
            uni_directional = link.uni_directional,
        );

        async move {
            for (source, destination) in link.directions() {
                self.apply_direction(source, destination, link.properties).await?;
            }
            Ok::<_, Error>(())
        }
        .instrument(span)
        .await
    }

    async fn apply_direction(
        &mut self,
        source: &str,
        destination: &str,
        properties: LinkProperties,
    ) -> Result<()> {
        let peer = self
            .topology
            .get(destination)
            .ok_or_else(|| Error::NodeNotFound(destination.to_string()))?;
        let peer_port = peer.switch_port.clone();
        let peer_address = peer.interface.ipv4.address.to_string();

        let node =
            self.topology.get_mut(source).ok_or_else(|| Error::NodeNotFound(source.to_string()))?;

        if node.rules.contains(destination) {
            tracing::debug!(source, destination, "link known, updating");
            self.shaper.update_destination(node, destination, properties).await?;
            return Ok(());
        }

        let mut members: BTreeSet<String> =
            node.group.as_ref().map(|g| g.members.clone()).unwrap_or_default();
        members.insert(peer_port);

        self.forwarder.extend_group(node, members).await?;
        self.shaper.classify_destination(node, destination, properties, &peer_address).await?;

        Ok(())
    }

    /// Remove every node and the bridge. Failures are logged and skipped.
    pub async fn destroy(&mut self) {
        for node in self.topology.drain() {
            self.teardown_node(node).await;
        }

        if let Err(e) = self.forwarder.teardown().await {
            tracing::warn!(%e, bridge = %self.config.bridge, "failed to delete bridge");
        }
    }

    async fn teardown_node(&mut self, node: Node) {
        tracing::debug!(node = %node.name, id = node.id, "tearing down node");

        if let Err(e) = self.forwarder.detach_port(&node.switch_port).await {
            tracing::warn!(%e, node = %node.name, "failed to detach switch port");
        }
        self.shaper.release(node.id).await;
        if let Err(e) = self.provisioner.teardown(&node).await {
            tracing::warn!(%e, node = %node.name, "failed to tear down node");
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.topology.get(name)
    }

    /// All nodes, by name.
    pub fn nodes(&self) -> Vec<NodeSummary> {
        self.topology.iter().map(Node::summary).collect()
    }

    /// Every shaping record of every node, by node and then peer name.
    pub fn rules(&self) -> Vec<RuleSummary> {
        self.topology
            .iter()
            .flat_map(|node| {
                node.rules.iter().map(|(peer, record)| RuleSummary {
                    node: node.name.clone(),
                    peer: peer.clone(),
                    rate: record.properties.rate,
                    latency: record.properties.latency,
                    loss: record.properties.loss,
                    class_id: record.class_id,
                })
            })
            .collect()
    }
}
