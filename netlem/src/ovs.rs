//! Open vSwitch, driven through `ovs-vsctl` and `ovs-ofctl`.

use async_trait::async_trait;
use tokio::process::Command;

use crate::command;
use crate::forwarding::{Error, Result, SwitchBackend};
use crate::topology::NodeId;

/// Bridge all node ports are attached to, unless configured otherwise.
pub const DEFAULT_BRIDGE: &str = "netlem-br0";

fn vsctl() -> Command {
    Command::new("ovs-vsctl")
}

fn ofctl() -> Command {
    Command::new("ovs-ofctl")
}

/// Command builders for one bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    name: String,
}

impl Bridge {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self) -> Command {
        let mut cmd = vsctl();
        cmd.args(["--may-exist", "add-br", &self.name]);
        cmd
    }

    /// Use the kernel datapath.
    pub fn set_system_datapath(&self) -> Command {
        let mut cmd = vsctl();
        cmd.args(["set", "bridge", &self.name, "datapath_type=system"]);
        cmd
    }

    /// Remove all flows, including the default `NORMAL` one that would act as a learning
    /// switch between every port.
    pub fn clear_flows(&self) -> Command {
        let mut cmd = ofctl();
        cmd.args(["del-flows", &self.name]);
        cmd
    }

    pub fn delete(&self) -> Command {
        let mut cmd = vsctl();
        cmd.args(["--if-exists", "del-br", &self.name]);
        cmd
    }

    pub fn add_port(&self, port: &str) -> Command {
        let mut cmd = vsctl();
        cmd.args(["--may-exist", "add-port", &self.name, port]);
        cmd
    }

    pub fn delete_port(&self, port: &str) -> Command {
        let mut cmd = vsctl();
        cmd.args(["--if-exists", "del-port", &self.name, port]);
        cmd
    }

    /// Query the OpenFlow port number of an interface.
    pub fn ofport(&self, port: &str) -> Command {
        let mut cmd = vsctl();
        cmd.args(["get", "Interface", port, "ofport"]);
        cmd
    }

    pub fn add_group(&self, group_id: NodeId) -> Command {
        let mut cmd = ofctl();
        cmd.args(["add-group", &self.name, &format!("group_id={group_id},type=all")]);
        cmd
    }

    pub fn add_group_flow(&self, ofport: u32, group_id: NodeId) -> Command {
        let mut cmd = ofctl();
        cmd.args(["add-flow", &self.name, &format!("in_port={ofport},actions=group:{group_id}")]);
        cmd
    }

    pub fn mod_group(&self, group_id: NodeId, ports: &[String]) -> Command {
        let mut spec = format!("group_id={group_id},type=all");
        for port in ports {
            spec.push_str(",bucket=output:");
            spec.push_str(port);
        }

        let mut cmd = ofctl();
        cmd.args(["mod-group", &self.name, &spec]);
        cmd
    }
}

/// Parse `ovs-vsctl get Interface <port> ofport` output. OVS reports `-1` for ports it could
/// not attach, and `[]` before it assigned one.
pub fn parse_ofport(output: &str) -> Option<u32> {
    output.trim().parse::<i64>().ok().and_then(|n| u32::try_from(n).ok()).filter(|n| *n > 0)
}

/// [`SwitchBackend`] over the Open vSwitch command line tools.
#[derive(Debug, Clone)]
pub struct OvsSwitch {
    bridge: Bridge,
}

impl OvsSwitch {
    pub fn new(bridge: impl Into<String>) -> Self {
        Self { bridge: Bridge::new(bridge) }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    async fn exec(operation: &'static str, mut cmd: Command) -> Result<command::Output> {
        command::run(&mut cmd).await.map_err(|source| Error::SwitchRejected { operation, source })
    }
}

impl Default for OvsSwitch {
    fn default() -> Self {
        Self::new(DEFAULT_BRIDGE)
    }
}

#[async_trait]
impl SwitchBackend for OvsSwitch {
    async fn create_bridge(&mut self) -> Result<()> {
        tracing::debug!(bridge = self.bridge.name(), "creating bridge");
        Self::exec("add-br", self.bridge.add()).await?;
        Self::exec("del-flows", self.bridge.clear_flows()).await?;
        Self::exec("set datapath_type", self.bridge.set_system_datapath()).await?;
        Ok(())
    }

    async fn delete_bridge(&mut self) -> Result<()> {
        tracing::debug!(bridge = self.bridge.name(), "deleting bridge");
        Self::exec("del-br", self.bridge.delete()).await.map(drop)
    }

    async fn add_port(&mut self, port: &str) -> Result<()> {
        Self::exec("add-port", self.bridge.add_port(port)).await.map(drop)
    }

    async fn delete_port(&mut self, port: &str) -> Result<()> {
        Self::exec("del-port", self.bridge.delete_port(port)).await.map(drop)
    }

    async fn add_group(&mut self, group_id: NodeId) -> Result<()> {
        Self::exec("add-group", self.bridge.add_group(group_id)).await.map(drop)
    }

    async fn bind_port(&mut self, port: &str, group_id: NodeId) -> Result<()> {
        let output = Self::exec("get ofport", self.bridge.ofport(port)).await?;
        let ofport = parse_ofport(&output.stdout).ok_or_else(|| Error::InvalidOfport {
            port: port.to_string(),
            output: output.stdout.trim().to_string(),
        })?;

        tracing::debug!(port, ofport, group_id, "binding port to group");
        Self::exec("add-flow", self.bridge.add_group_flow(ofport, group_id)).await.map(drop)
    }

    async fn replace_group(&mut self, group_id: NodeId, ports: &[String]) -> Result<()> {
        Self::exec("mod-group", self.bridge.mod_group(group_id, ports)).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::render;

    #[test]
    fn bridge_lifecycle_commands() {
        let br = Bridge::new("br0");

        assert_eq!(render(&br.add()), "ovs-vsctl --may-exist add-br br0");
        assert_eq!(render(&br.clear_flows()), "ovs-ofctl del-flows br0");
        assert_eq!(
            render(&br.set_system_datapath()),
            "ovs-vsctl set bridge br0 datapath_type=system"
        );
        assert_eq!(render(&br.delete()), "ovs-vsctl --if-exists del-br br0");
    }

    #[test]
    fn port_commands() {
        let br = Bridge::new("br0");

        assert_eq!(render(&br.add_port("n1-ovs")), "ovs-vsctl --may-exist add-port br0 n1-ovs");
        assert_eq!(render(&br.delete_port("n1-ovs")), "ovs-vsctl --if-exists del-port br0 n1-ovs");
        assert_eq!(render(&br.ofport("n1-ovs")), "ovs-vsctl get Interface n1-ovs ofport");
    }

    #[test]
    fn group_commands() {
        let br = Bridge::new("br0");

        assert_eq!(render(&br.add_group(2)), "ovs-ofctl add-group br0 group_id=2,type=all");
        assert_eq!(
            render(&br.add_group_flow(7, 2)),
            "ovs-ofctl add-flow br0 in_port=7,actions=group:2"
        );
        assert_eq!(
            render(&br.mod_group(2, &["n1-ovs".to_string(), "n3-ovs".to_string()])),
            "ovs-ofctl mod-group br0 group_id=2,type=all,bucket=output:n1-ovs,bucket=output:n3-ovs"
        );
    }

    #[test]
    fn ofport_parsing() {
        assert_eq!(parse_ofport("7\n"), Some(7));
        assert_eq!(parse_ofport("-1\n"), None);
        assert_eq!(parse_ofport("[]\n"), None);
    }
}
