//! Node provisioning: the namespace, veth pair and address a node lives behind.
//!
//! ```text
//!   ┌──────────── netns <name> ─────────────┐
//!   │  <name>-veth0  (address, up)  lo (up) │
//!   └──────────────────┬────────────────────┘
//!                      │ veth pair
//!               <name>-ovs  (host netns, up) ──► switch port
//! ```

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::TryStreamExt as _;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::{LinkUnspec, LinkVeth};
use tracing::Instrument as _;

use crate::ip::Ipv4Cidr;
use crate::namespace::{self, NetworkNamespace};
use crate::sysctl;
use crate::topology::Node;
use crate::wrappers;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("rtnetlink error: {0}")]
    RtNetlink(#[from] rtnetlink::Error),
    #[error(transparent)]
    Namespace(#[from] namespace::Error),
    #[error("link {0} not found")]
    LinkNotFound(String),
    #[error("failed to set sysctl {name}: {source}")]
    Sysctl {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Everything needed to realize a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePlan {
    pub name: String,
    /// Node side of the veth pair, inside the namespace.
    pub interface: String,
    /// Host side of the veth pair, attached to the switch.
    pub switch_port: String,
    pub ipv4: Ipv4Cidr,
}

/// What provisioning produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realized {
    pub netns: PathBuf,
    /// Hardware address of the node's interface, `aa:bb:cc:dd:ee:ff`.
    pub mac: String,
}

#[async_trait]
pub trait NodeProvisioner: Send {
    async fn provision(&mut self, plan: &NodePlan) -> Result<Realized>;

    /// Remove whatever [`NodeProvisioner::provision`] created for `node`.
    async fn teardown(&mut self, node: &Node) -> Result<()>;
}

/// Context of the short-lived worker that configures a fresh namespace.
struct SetupContext {
    handle: rtnetlink::Handle,
    _connection_task: tokio::task::JoinHandle<()>,
}

impl SetupContext {
    fn connect() -> io::Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        Ok(Self { handle, _connection_task: tokio::spawn(connection) })
    }
}

/// Realizes nodes as named network namespaces connected through veth pairs.
#[derive(Debug)]
pub struct NetnsProvisioner {
    /// Handle in the host namespace, for the veth pair and the switch side.
    handle: rtnetlink::Handle,
    _connection_task: tokio::task::JoinHandle<()>,
}

impl NetnsProvisioner {
    /// Open an rtnetlink connection in the host namespace. Must be called within a runtime.
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        Ok(Self { handle, _connection_task: tokio::spawn(connection) })
    }

    async fn create_link_pair(&self, plan: &NodePlan, netns_fd: i32) -> Result<()> {
        self.handle
            .link()
            .add(LinkVeth::new(&plan.interface, &plan.switch_port).build())
            .execute()
            .await
            .inspect_err(|e| tracing::debug!(?e, "failed to add veth pair"))?;

        self.handle
            .link()
            .set(LinkUnspec::new_with_name(&plan.interface).setns_by_fd(netns_fd).build())
            .execute()
            .await
            .inspect_err(|e| tracing::debug!(?e, "failed to move veth into namespace"))?;

        self.handle
            .link()
            .set(LinkUnspec::new_with_name(&plan.switch_port).up().build())
            .execute()
            .await
            .inspect_err(|e| tracing::debug!(?e, "failed to bring switch side up"))?;

        Ok(())
    }
}

/// Configure the node side from inside its namespace and report its hardware address.
async fn configure_inside(
    ctx: &mut SetupContext,
    interface: &str,
    ipv4: Ipv4Cidr,
) -> Result<String> {
    let index = wrappers::if_nametoindex(interface)
        .ok_or_else(|| Error::LinkNotFound(interface.to_string()))?
        .get();

    ctx.handle.link().set(LinkUnspec::new_with_name(interface).up().build()).execute().await?;
    ctx.handle.address().add(index, ipv4.address.into(), ipv4.prefix).execute().await?;
    // Loopback, for traffic to the node's own address.
    ctx.handle.link().set(LinkUnspec::new_with_name("lo").up().build()).execute().await?;

    for &(name, value) in sysctl::NODE_DEFAULTS {
        sysctl::write(name, value).map_err(|source| Error::Sysctl { name, source })?;
    }

    let mut links = ctx.handle.link().get().match_index(index).execute();
    let link =
        links.try_next().await?.ok_or_else(|| Error::LinkNotFound(interface.to_string()))?;

    let mac = link
        .attributes
        .iter()
        .find_map(|attr| match attr {
            LinkAttribute::Address(bytes) => Some(format_mac(bytes)),
            _ => None,
        })
        .unwrap_or_default();

    Ok(mac)
}

/// Render a hardware address as colon separated lowercase hex.
pub fn format_mac(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

#[async_trait]
impl NodeProvisioner for NetnsProvisioner {
    async fn provision(&mut self, plan: &NodePlan) -> Result<Realized> {
        let span = tracing::debug_span!("provision", node = %plan.name);

        async move {
            rtnetlink::NetworkNamespace::add(plan.name.clone()).await?;
            let netns = namespace::named_path(&plan.name);

            let worker = NetworkNamespace::open(netns.clone(), SetupContext::connect).await?;
            self.create_link_pair(plan, worker.fd()).await?;

            let interface = plan.interface.clone();
            let ipv4 = plan.ipv4;
            let mac = worker
                .run(move |ctx: &mut SetupContext| {
                    Box::pin(async move { configure_inside(ctx, &interface, ipv4).await })
                })
                .await??;

            tracing::debug!(%ipv4, %mac, "node provisioned");

            Ok::<_, Error>(Realized { netns, mac })
        }
        .instrument(span)
        .await
    }

    async fn teardown(&mut self, node: &Node) -> Result<()> {
        tracing::debug!(node = %node.name, "deleting network namespace");
        // Deleting the namespace destroys the veth pair with it.
        rtnetlink::NetworkNamespace::del(node.name.clone()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_colon_separated_hex() {
        assert_eq!(format_mac(&[0x02, 0x42, 0xac, 0x11, 0x00, 0x0a]), "02:42:ac:11:00:0a");
        assert_eq!(format_mac(&[]), "");
    }
}
