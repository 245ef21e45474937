//! Helpers to send traffic control requests, given a [`rtnetlink::Handle`].
//!
//! Each helper sends exactly one netlink message and waits for the kernel's acknowledgement.

use std::net::Ipv4Addr;

use futures::StreamExt as _;
use rtnetlink::packet_core::{NetlinkMessage, NetlinkPayload};
use rtnetlink::packet_route::RouteNetlinkMessage;

use crate::tc::filter::U32DestinationFilterRequest;
use crate::tc::handle::{Handle, TcTarget};
use crate::tc::htb::{HtbClassRequest, QdiscHtbRequest};
use crate::tc::netem::{DelayStage, QdiscNetemRequest};

/// Send `request` and drain the responses, failing on the first error the kernel reports.
async fn send(
    handle: &mut rtnetlink::Handle,
    request: NetlinkMessage<RouteNetlinkMessage>,
) -> Result<(), rtnetlink::Error> {
    let mut res = handle.request(request)?;
    while let Some(msg) = res.next().await {
        if let NetlinkPayload::Error(e) = msg.payload {
            // An error message without a code is the acknowledgement.
            if e.code.is_some() {
                return Err(rtnetlink::Error::NetlinkError(e));
            }
        }
    }
    Ok(())
}

/// Install the HTB root qdisc `1:0` with default class `1:1`.
pub async fn install_htb_root(
    handle: &mut rtnetlink::Handle,
    if_index: i32,
) -> Result<(), rtnetlink::Error> {
    tracing::debug!(if_index, handle = %Handle::root(), "installing htb root qdisc");

    send(handle, QdiscHtbRequest::new(if_index).build()).await.inspect_err(|e| {
        tracing::debug!(?e, "failed to create htb root qdisc");
    })
}

/// Create, or replace in place, the class of a destination under the HTB root.
pub async fn install_htb_class(
    handle: &mut rtnetlink::Handle,
    if_index: i32,
    class_id: Handle,
    rate_mbit: u64,
    replace: bool,
) -> Result<(), rtnetlink::Error> {
    tracing::debug!(if_index, %class_id, rate_mbit, replace, "installing htb class");

    let request = HtbClassRequest::new(
        TcTarget::new(if_index).with_parent(Handle::root()).with_handle(class_id),
    )
    .with_rate_mbit(rate_mbit)
    .with_replace(replace)
    .build();

    send(handle, request).await.inspect_err(|e| {
        tracing::debug!(?e, %class_id, "failed to create htb class");
    })
}

/// Add a u32 filter sending traffic for `destination` to `class_id`.
pub async fn install_destination_filter(
    handle: &mut rtnetlink::Handle,
    if_index: i32,
    destination: Ipv4Addr,
    class_id: Handle,
) -> Result<(), rtnetlink::Error> {
    tracing::debug!(if_index, %destination, %class_id, "installing u32 destination filter");

    let request = U32DestinationFilterRequest::new(
        TcTarget::new(if_index).with_parent(Handle::root()),
        destination,
        class_id,
    )
    .build();

    send(handle, request).await.inspect_err(|e| {
        tracing::debug!(?e, %destination, "failed to create u32 filter");
    })
}

/// Create, or create-or-replace, the netem stage `queue_handle` under `class_id`.
pub async fn install_netem(
    handle: &mut rtnetlink::Handle,
    if_index: i32,
    class_id: Handle,
    queue_handle: Handle,
    stage: DelayStage,
    replace: bool,
) -> Result<(), rtnetlink::Error> {
    tracing::debug!(
        if_index,
        parent = %class_id,
        handle = %queue_handle,
        latency_ms = stage.latency_ms,
        loss_pct = stage.loss_percent,
        replace,
        "installing netem qdisc"
    );

    let request = QdiscNetemRequest::new(
        TcTarget::new(if_index).with_parent(class_id).with_handle(queue_handle),
        stage,
    )
    .with_replace(replace)
    .build();

    send(handle, request).await.inspect_err(|e| {
        tracing::debug!(?e, %queue_handle, "failed to create netem qdisc");
    })
}
