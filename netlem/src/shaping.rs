//! Traffic shaping controller.
//!
//! Keeps each node's HTB tree in line with its [`Rules`](crate::topology::Rules): one class, one
//! destination filter and an optional netem stage per classified destination. The kernel side
//! sits behind [`ShapingBackend`]; [`NetlinkShaping`] drives it over rtnetlink from a worker
//! pinned to the node's namespace.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::ip;
use crate::namespace::{self, NetworkNamespace};
use crate::tc::handle::Handle;
use crate::tc::netem::DelayStage;
use crate::tc::requests;
use crate::topology::{LinkProperties, Node, NodeId, ShapingRecord, ShapingTarget};
use crate::wrappers;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("network namespace {} unavailable: {source}", path.display())]
    NamespaceUnavailable {
        path: PathBuf,
        #[source]
        source: namespace::Error,
    },
    #[error("interface {0} not found")]
    InterfaceNotFound(String),
    #[error("kernel rejected {operation}: {source}")]
    KernelRejected {
        operation: &'static str,
        #[source]
        source: rtnetlink::Error,
    },
    #[error("invalid destination address: {0}")]
    InvalidAddress(#[from] ip::Error),
    #[error("destination {peer} was never classified on {node}")]
    DestinationNotClassified { node: String, peer: String },
    #[error("no class handles left on {0}")]
    HandleSpaceExhausted(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The kernel operations the shaping controller needs, one netlink request each.
#[async_trait]
pub trait ShapingBackend: Send {
    /// Install the HTB root `1:0` with default class `1:1`. Refused if already present.
    async fn install_root(&mut self, target: &ShapingTarget) -> Result<()>;

    /// Create, or with `replace` update in place, a destination class.
    async fn install_class(
        &mut self,
        target: &ShapingTarget,
        class_id: Handle,
        rate_mbit: u64,
        replace: bool,
    ) -> Result<()>;

    /// Send traffic for `destination` to `class_id`.
    async fn install_filter(
        &mut self,
        target: &ShapingTarget,
        destination: Ipv4Addr,
        class_id: Handle,
    ) -> Result<()>;

    /// Create, or with `replace` create-or-replace, the netem stage under `class_id`.
    async fn install_delay_stage(
        &mut self,
        target: &ShapingTarget,
        class_id: Handle,
        queue_handle: Handle,
        stage: DelayStage,
        replace: bool,
    ) -> Result<()>;

    /// Drop any per-node resources. The kernel objects go away with the namespace.
    async fn release(&mut self, node: NodeId);
}

/// State owned by a shaping worker inside a node's namespace.
#[derive(Debug)]
struct ShapingContext {
    handle: rtnetlink::Handle,
    _connection_task: tokio::task::JoinHandle<()>,
}

impl ShapingContext {
    /// Open an rtnetlink connection in the calling thread's namespace.
    fn connect() -> std::io::Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        Ok(Self { handle, _connection_task: tokio::spawn(connection) })
    }
}

/// A single shaping request, executed inside the node's namespace.
#[derive(Debug, Clone, Copy)]
enum ShapingJob {
    Root,
    Class { class_id: Handle, rate_mbit: u64, replace: bool },
    Filter { destination: Ipv4Addr, class_id: Handle },
    DelayStage { class_id: Handle, queue_handle: Handle, stage: DelayStage, replace: bool },
}

impl ShapingJob {
    fn operation(&self) -> &'static str {
        match self {
            Self::Root => "htb root qdisc",
            Self::Class { .. } => "htb class",
            Self::Filter { .. } => "u32 filter",
            Self::DelayStage { .. } => "netem qdisc",
        }
    }

    async fn execute(
        self,
        handle: &mut rtnetlink::Handle,
        if_index: i32,
    ) -> std::result::Result<(), rtnetlink::Error> {
        match self {
            Self::Root => requests::install_htb_root(handle, if_index).await,
            Self::Class { class_id, rate_mbit, replace } => {
                requests::install_htb_class(handle, if_index, class_id, rate_mbit, replace).await
            }
            Self::Filter { destination, class_id } => {
                requests::install_destination_filter(handle, if_index, destination, class_id)
                    .await
            }
            Self::DelayStage { class_id, queue_handle, stage, replace } => {
                requests::install_netem(handle, if_index, class_id, queue_handle, stage, replace)
                    .await
            }
        }
    }
}

/// [`ShapingBackend`] over rtnetlink, with one namespace worker per node.
#[derive(Debug, Default)]
pub struct NetlinkShaping {
    workers: HashMap<NodeId, NetworkNamespace<ShapingContext>>,
}

impl NetlinkShaping {
    pub fn new() -> Self {
        Self::default()
    }

    async fn submit(&mut self, target: &ShapingTarget, job: ShapingJob) -> Result<()> {
        let unavailable =
            |source| Error::NamespaceUnavailable { path: target.netns.clone(), source };

        let worker = match self.workers.entry(target.node_id) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                tracing::debug!(
                    node = target.node_id,
                    netns = %target.netns.display(),
                    "opening shaping worker"
                );
                let worker =
                    NetworkNamespace::open(&target.netns, ShapingContext::connect)
                        .await
                        .map_err(unavailable)?;
                e.insert(worker)
            }
        };

        let interface = target.interface.clone();
        worker
            .run(move |ctx: &mut ShapingContext| {
                Box::pin(async move {
                    let if_index = wrappers::if_nametoindex(&interface)
                        .ok_or_else(|| Error::InterfaceNotFound(interface.clone()))?;

                    job.execute(&mut ctx.handle, if_index.get() as i32)
                        .await
                        .map_err(|source| Error::KernelRejected {
                            operation: job.operation(),
                            source,
                        })
                })
            })
            .await
            .map_err(unavailable)?
    }
}

#[async_trait]
impl ShapingBackend for NetlinkShaping {
    async fn install_root(&mut self, target: &ShapingTarget) -> Result<()> {
        self.submit(target, ShapingJob::Root).await
    }

    async fn install_class(
        &mut self,
        target: &ShapingTarget,
        class_id: Handle,
        rate_mbit: u64,
        replace: bool,
    ) -> Result<()> {
        self.submit(target, ShapingJob::Class { class_id, rate_mbit, replace }).await
    }

    async fn install_filter(
        &mut self,
        target: &ShapingTarget,
        destination: Ipv4Addr,
        class_id: Handle,
    ) -> Result<()> {
        self.submit(target, ShapingJob::Filter { destination, class_id }).await
    }

    async fn install_delay_stage(
        &mut self,
        target: &ShapingTarget,
        class_id: Handle,
        queue_handle: Handle,
        stage: DelayStage,
        replace: bool,
    ) -> Result<()> {
        self.submit(target, ShapingJob::DelayStage { class_id, queue_handle, stage, replace })
            .await
    }

    async fn release(&mut self, node: NodeId) {
        if self.workers.remove(&node).is_some() {
            tracing::debug!(node, "released shaping worker");
        }
    }
}

/// Applies link properties to nodes' shaping trees and records what was installed.
#[derive(Debug)]
pub struct TrafficShaper<B> {
    backend: B,
}

impl<B: ShapingBackend> TrafficShaper<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Install the node's HTB root. Exactly once per node.
    pub async fn install_root(&mut self, node: &Node) -> Result<()> {
        tracing::debug!(
            node = %node.name,
            interface = %node.interface.name,
            "installing shaping root"
        );
        self.backend.install_root(&node.shaping_target()).await
    }

    /// Start shaping traffic from `node` to `peer` at `destination` (bare or CIDR address).
    ///
    /// A no-op if `peer` is already classified, and for trivial properties, which leave the
    /// traffic in the default class. The record is written once every request succeeded.
    pub async fn classify_destination(
        &mut self,
        node: &mut Node,
        peer: &str,
        properties: LinkProperties,
        destination: &str,
    ) -> Result<()> {
        if node.rules.contains(peer) {
            tracing::debug!(node = %node.name, peer, "destination already classified");
            return Ok(());
        }
        if properties.is_trivial() {
            tracing::debug!(node = %node.name, peer, "trivial properties, leaving default class");
            return Ok(());
        }

        let destination = ip::parse_host(destination)?;

        let slot = node.rules.len();
        let exhausted = || Error::HandleSpaceExhausted(node.name.clone());
        let class_id = Handle::destination_class(slot).ok_or_else(exhausted)?;
        let queue_handle = Handle::delay_stage(slot).ok_or_else(exhausted)?;

        tracing::debug!(
            node = %node.name,
            peer,
            %destination,
            %class_id,
            %queue_handle,
            ?properties,
            "classifying destination"
        );

        let target = node.shaping_target();
        self.backend.install_class(&target, class_id, properties.rate, false).await?;
        self.backend.install_filter(&target, destination, class_id).await?;

        let delay_stage = properties.has_delay_stage();
        if delay_stage {
            self.backend
                .install_delay_stage(
                    &target,
                    class_id,
                    queue_handle,
                    properties.delay_stage(),
                    false,
                )
                .await?;
        }

        node.rules.insert_new(
            peer,
            ShapingRecord { properties, class_id, queue_handle, delay_stage, destination },
        );

        Ok(())
    }

    /// Re-apply `properties` to an already classified destination, replacing only what
    /// changed. Identifiers and destination stay as recorded.
    pub async fn update_destination(
        &mut self,
        node: &mut Node,
        peer: &str,
        properties: LinkProperties,
    ) -> Result<()> {
        let record = node.rules.get(peer).copied().ok_or_else(|| {
            Error::DestinationNotClassified { node: node.name.clone(), peer: peer.to_string() }
        })?;

        let rate_changed = record.properties.rate != properties.rate;
        let stage_changed = record.properties.latency != properties.latency
            || record.properties.loss != properties.loss;

        if !rate_changed && !stage_changed {
            tracing::debug!(node = %node.name, peer, "link properties unchanged");
            return Ok(());
        }

        tracing::debug!(
            node = %node.name,
            peer,
            class_id = %record.class_id,
            rate_changed,
            stage_changed,
            ?properties,
            "updating destination"
        );

        let target = node.shaping_target();
        if rate_changed {
            self.backend.install_class(&target, record.class_id, properties.rate, true).await?;
        }
        if stage_changed {
            self.backend
                .install_delay_stage(
                    &target,
                    record.class_id,
                    record.queue_handle,
                    properties.delay_stage(),
                    true,
                )
                .await?;
        }

        if let Some(stored) = node.rules.get_mut(peer) {
            stored.properties = properties;
            stored.delay_stage |= stage_changed;
        }

        Ok(())
    }

    /// Forget a node that is going away.
    pub async fn release(&mut self, node: NodeId) {
        self.backend.release(node).await;
    }
}
