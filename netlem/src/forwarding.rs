//! Topology forwarding controller.
//!
//! Every node sends into its own OpenFlow `all` group, keyed by the node id, whose buckets are
//! the switch ports of the peers it has links to. Traffic that enters the bridge from a node's
//! port is thus flooded to exactly its peers.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::command;
use crate::topology::{ForwardingGroup, Node, NodeId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no forwarding group for node {node}")]
    GroupNotFound { node: String },
    #[error("switch rejected {operation}: {source}")]
    SwitchRejected {
        operation: &'static str,
        #[source]
        source: command::Error,
    },
    #[error("switch reported no usable ofport for {port}: {output:?}")]
    InvalidOfport { port: String, output: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Switch operations the forwarding controller needs.
#[async_trait]
pub trait SwitchBackend: Send {
    /// Create the bridge without its default `NORMAL` flow. Succeeds if it already exists.
    async fn create_bridge(&mut self) -> Result<()>;

    async fn delete_bridge(&mut self) -> Result<()>;

    async fn add_port(&mut self, port: &str) -> Result<()>;

    async fn delete_port(&mut self, port: &str) -> Result<()>;

    /// Create an empty `all` group.
    async fn add_group(&mut self, group_id: NodeId) -> Result<()>;

    /// Send everything entering on `port` into group `group_id`.
    async fn bind_port(&mut self, port: &str, group_id: NodeId) -> Result<()>;

    /// Replace the group's buckets with one `output` bucket per port.
    async fn replace_group(&mut self, group_id: NodeId, ports: &[String]) -> Result<()>;
}

/// Keeps the switch's groups in line with the nodes' recorded [`ForwardingGroup`]s.
#[derive(Debug)]
pub struct Forwarder<S> {
    switch: S,
}

impl<S: SwitchBackend> Forwarder<S> {
    pub fn new(switch: S) -> Self {
        Self { switch }
    }

    pub fn switch(&self) -> &S {
        &self.switch
    }

    /// Prepare the bridge.
    pub async fn init(&mut self) -> Result<()> {
        self.switch.create_bridge().await
    }

    pub async fn attach_port(&mut self, port: &str) -> Result<()> {
        tracing::debug!(port, "attaching switch port");
        self.switch.add_port(port).await
    }

    pub async fn detach_port(&mut self, port: &str) -> Result<()> {
        tracing::debug!(port, "detaching switch port");
        self.switch.delete_port(port).await
    }

    /// Create the node's group and bind its port to it. A no-op if the node has one already.
    pub async fn ensure_group(&mut self, node: &mut Node) -> Result<()> {
        if node.group.is_some() {
            return Ok(());
        }

        tracing::debug!(
            node = %node.name,
            group_id = node.id,
            port = %node.switch_port,
            "creating forwarding group"
        );
        self.switch.add_group(node.id).await?;
        self.switch.bind_port(&node.switch_port, node.id).await?;

        node.group = Some(ForwardingGroup { id: node.id, members: BTreeSet::new() });
        Ok(())
    }

    /// Make `members` the complete set of ports the node's group forwards to.
    ///
    /// An empty or unchanged set does not touch the switch.
    pub async fn extend_group(&mut self, node: &mut Node, members: BTreeSet<String>) -> Result<()> {
        let Some(group) = node.group.as_mut() else {
            return Err(Error::GroupNotFound { node: node.name.clone() });
        };

        if members.is_empty() || group.members == members {
            return Ok(());
        }

        let ports: Vec<String> = members.iter().cloned().collect();
        tracing::debug!(node = %node.name, group_id = group.id, ?ports, "replacing group buckets");
        self.switch.replace_group(group.id, &ports).await?;

        group.members = members;
        Ok(())
    }

    /// Remove the bridge and with it every port, group and flow.
    pub async fn teardown(&mut self) -> Result<()> {
        self.switch.delete_bridge().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSwitch, SwitchCall, node};

    fn set(ports: &[&str]) -> BTreeSet<String> {
        ports.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn ensure_group_binds_port_once() {
        let fake = FakeSwitch::default();
        let mut forwarder = Forwarder::new(fake.clone());
        let mut n1 = node(3, "n1", "10.0.0.1/24");

        forwarder.ensure_group(&mut n1).await.unwrap();
        forwarder.ensure_group(&mut n1).await.unwrap();

        assert_eq!(
            fake.calls(),
            vec![
                SwitchCall::AddGroup(3),
                SwitchCall::BindPort { port: "n1-ovs".to_string(), group_id: 3 },
            ]
        );
        assert_eq!(n1.group.unwrap().id, 3);
    }

    #[tokio::test]
    async fn extend_replaces_whole_bucket_list() {
        let fake = FakeSwitch::default();
        let mut forwarder = Forwarder::new(fake.clone());
        let mut a = node(1, "a", "10.0.0.1/24");
        forwarder.ensure_group(&mut a).await.unwrap();
        fake.clear();

        forwarder.extend_group(&mut a, set(&["b-ovs"])).await.unwrap();
        forwarder.extend_group(&mut a, set(&["b-ovs", "c-ovs"])).await.unwrap();

        assert_eq!(
            fake.calls(),
            vec![
                SwitchCall::ReplaceGroup { group_id: 1, ports: vec!["b-ovs".to_string()] },
                SwitchCall::ReplaceGroup {
                    group_id: 1,
                    ports: vec!["b-ovs".to_string(), "c-ovs".to_string()]
                },
            ]
        );
        assert_eq!(a.group.unwrap().members, set(&["b-ovs", "c-ovs"]));
    }

    #[tokio::test]
    async fn empty_or_unchanged_membership_skips_switch() {
        let fake = FakeSwitch::default();
        let mut forwarder = Forwarder::new(fake.clone());
        let mut a = node(1, "a", "10.0.0.1/24");
        forwarder.ensure_group(&mut a).await.unwrap();
        forwarder.extend_group(&mut a, set(&["b-ovs"])).await.unwrap();
        fake.clear();

        forwarder.extend_group(&mut a, BTreeSet::new()).await.unwrap();
        forwarder.extend_group(&mut a, set(&["b-ovs"])).await.unwrap();

        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn extend_without_group_fails() {
        let mut forwarder = Forwarder::new(FakeSwitch::default());
        let mut a = node(1, "a", "10.0.0.1/24");

        let err = forwarder.extend_group(&mut a, set(&["b-ovs"])).await.unwrap_err();
        assert!(matches!(err, Error::GroupNotFound { .. }));
    }

    #[tokio::test]
    async fn rejected_replace_keeps_old_membership() {
        let fake = FakeSwitch::default();
        let mut forwarder = Forwarder::new(fake.clone());
        let mut a = node(1, "a", "10.0.0.1/24");
        forwarder.ensure_group(&mut a).await.unwrap();
        forwarder.extend_group(&mut a, set(&["b-ovs"])).await.unwrap();

        fake.fail_on("replace_group");
        let err = forwarder.extend_group(&mut a, set(&["b-ovs", "c-ovs"])).await.unwrap_err();

        assert!(matches!(err, Error::SwitchRejected { .. }));
        assert_eq!(a.group.unwrap().members, set(&["b-ovs"]));
    }
}
