//! Recording fakes of the kernel, switch and provisioning seams.

use std::collections::HashSet;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::command;
use crate::forwarding::{self, SwitchBackend};
use crate::ip::Ipv4Cidr;
use crate::namespace;
use crate::provision::{self, NodePlan, NodeProvisioner, Realized};
use crate::shaping::{self, ShapingBackend};
use crate::tc::handle::Handle;
use crate::tc::netem::DelayStage;
use crate::topology::{Interface, Node, NodeId, Rules, ShapingTarget};

/// A node as the manager would record it after provisioning, without a group.
pub(crate) fn node(id: NodeId, name: &str, ipv4: &str) -> Node {
    Node {
        id,
        name: name.to_string(),
        netns: namespace::named_path(name),
        interface: Interface {
            name: format!("{name}-veth0"),
            mac: String::new(),
            ipv4: ipv4.parse::<Ipv4Cidr>().unwrap(),
        },
        switch_port: format!("{name}-ovs"),
        rules: Rules::default(),
        group: None,
    }
}

/// Calls recorded in order, plus the operations that should fail.
#[derive(Debug)]
struct Recorder<C> {
    calls: Vec<C>,
    failing: HashSet<String>,
}

impl<C> Default for Recorder<C> {
    fn default() -> Self {
        Self { calls: Vec::new(), failing: HashSet::new() }
    }
}

impl<C> Recorder<C> {
    /// Record `call`, then report whether `operation` was set to fail.
    fn record(&mut self, operation: &str, call: C) -> bool {
        self.calls.push(call);
        self.failing.contains(operation)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ShapingCall {
    Root { node: NodeId },
    Class { node: NodeId, class_id: Handle, rate_mbit: u64, replace: bool },
    Filter { node: NodeId, destination: Ipv4Addr, class_id: Handle },
    DelayStage {
        node: NodeId,
        class_id: Handle,
        queue_handle: Handle,
        stage: DelayStage,
        replace: bool,
    },
    Release { node: NodeId },
}

/// [`ShapingBackend`] that records every request. Clones share the recording.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeShaping {
    inner: Arc<Mutex<Recorder<ShapingCall>>>,
}

impl FakeShaping {
    pub(crate) fn calls(&self) -> Vec<ShapingCall> {
        self.inner.lock().calls.clone()
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().calls.clear();
    }

    /// Make `operation` (`root`, `class`, `filter` or `delay_stage`) fail from now on.
    pub(crate) fn fail_on(&self, operation: &str) {
        self.inner.lock().failing.insert(operation.to_string());
    }

    fn record(&self, operation: &'static str, call: ShapingCall) -> shaping::Result<()> {
        if self.inner.lock().record(operation, call) {
            return Err(shaping::Error::KernelRejected {
                operation,
                source: rtnetlink::Error::RequestFailed,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ShapingBackend for FakeShaping {
    async fn install_root(&mut self, target: &ShapingTarget) -> shaping::Result<()> {
        self.record("root", ShapingCall::Root { node: target.node_id })
    }

    async fn install_class(
        &mut self,
        target: &ShapingTarget,
        class_id: Handle,
        rate_mbit: u64,
        replace: bool,
    ) -> shaping::Result<()> {
        self.record(
            "class",
            ShapingCall::Class { node: target.node_id, class_id, rate_mbit, replace },
        )
    }

    async fn install_filter(
        &mut self,
        target: &ShapingTarget,
        destination: Ipv4Addr,
        class_id: Handle,
    ) -> shaping::Result<()> {
        self.record("filter", ShapingCall::Filter { node: target.node_id, destination, class_id })
    }

    async fn install_delay_stage(
        &mut self,
        target: &ShapingTarget,
        class_id: Handle,
        queue_handle: Handle,
        stage: DelayStage,
        replace: bool,
    ) -> shaping::Result<()> {
        self.record(
            "delay_stage",
            ShapingCall::DelayStage {
                node: target.node_id,
                class_id,
                queue_handle,
                stage,
                replace,
            },
        )
    }

    async fn release(&mut self, node: NodeId) {
        self.inner.lock().calls.push(ShapingCall::Release { node });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SwitchCall {
    CreateBridge,
    DeleteBridge,
    AddPort(String),
    DeletePort(String),
    AddGroup(NodeId),
    BindPort { port: String, group_id: NodeId },
    ReplaceGroup { group_id: NodeId, ports: Vec<String> },
}

/// [`SwitchBackend`] that records every command. Clones share the recording.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeSwitch {
    inner: Arc<Mutex<Recorder<SwitchCall>>>,
}

impl FakeSwitch {
    pub(crate) fn calls(&self) -> Vec<SwitchCall> {
        self.inner.lock().calls.clone()
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().calls.clear();
    }

    /// Make `operation`, named after the [`SwitchBackend`] method, fail from now on.
    pub(crate) fn fail_on(&self, operation: &str) {
        self.inner.lock().failing.insert(operation.to_string());
    }

    fn record(&self, operation: &'static str, call: SwitchCall) -> forwarding::Result<()> {
        if self.inner.lock().record(operation, call) {
            return Err(forwarding::Error::SwitchRejected {
                operation,
                source: command::Error::Io(io::Error::other("injected failure")),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SwitchBackend for FakeSwitch {
    async fn create_bridge(&mut self) -> forwarding::Result<()> {
        self.record("create_bridge", SwitchCall::CreateBridge)
    }

    async fn delete_bridge(&mut self) -> forwarding::Result<()> {
        self.record("delete_bridge", SwitchCall::DeleteBridge)
    }

    async fn add_port(&mut self, port: &str) -> forwarding::Result<()> {
        self.record("add_port", SwitchCall::AddPort(port.to_string()))
    }

    async fn delete_port(&mut self, port: &str) -> forwarding::Result<()> {
        self.record("delete_port", SwitchCall::DeletePort(port.to_string()))
    }

    async fn add_group(&mut self, group_id: NodeId) -> forwarding::Result<()> {
        self.record("add_group", SwitchCall::AddGroup(group_id))
    }

    async fn bind_port(&mut self, port: &str, group_id: NodeId) -> forwarding::Result<()> {
        self.record("bind_port", SwitchCall::BindPort { port: port.to_string(), group_id })
    }

    async fn replace_group(
        &mut self,
        group_id: NodeId,
        ports: &[String],
    ) -> forwarding::Result<()> {
        self.record("replace_group", SwitchCall::ReplaceGroup { group_id, ports: ports.to_vec() })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProvisionCall {
    Provision(NodePlan),
    Teardown(String),
}

/// [`NodeProvisioner`] that records plans and hands out fake hardware addresses.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeProvisioner {
    inner: Arc<Mutex<Recorder<ProvisionCall>>>,
}

impl FakeProvisioner {
    pub(crate) fn calls(&self) -> Vec<ProvisionCall> {
        self.inner.lock().calls.clone()
    }

    /// Make `provision` or `teardown` fail from now on.
    pub(crate) fn fail_on(&self, operation: &str) {
        self.inner.lock().failing.insert(operation.to_string());
    }

    fn injected() -> provision::Error {
        provision::Error::Io(io::Error::other("injected failure"))
    }
}

#[async_trait]
impl NodeProvisioner for FakeProvisioner {
    async fn provision(&mut self, plan: &NodePlan) -> provision::Result<Realized> {
        let mut inner = self.inner.lock();
        if inner.record("provision", ProvisionCall::Provision(plan.clone())) {
            return Err(Self::injected());
        }

        let n = inner.calls.len();
        Ok(Realized {
            netns: namespace::named_path(&plan.name),
            mac: provision::format_mac(&[0x02, 0, 0, 0, (n >> 8) as u8, n as u8]),
        })
    }

    async fn teardown(&mut self, node: &Node) -> provision::Result<()> {
        if self.inner.lock().record("teardown", ProvisionCall::Teardown(node.name.clone())) {
            return Err(Self::injected());
        }
        Ok(())
    }
}
