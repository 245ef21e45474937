//! u32 filters classifying traffic by IPv4 destination address.
//!
//! The `u32` classifier is part of `cls_u32`, which is built into practically every kernel,
//! and is enough to match a 32-bit destination address at a fixed offset of the IP header.

use std::net::Ipv4Addr;

use rtnetlink::packet_core::{NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST, NetlinkMessage};
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    tc::{TcAttribute, TcHandle, TcMessage},
};

use super::handle::{Handle, TcTarget};
use super::nla::{build_nested_options, build_nla};

/// EtherType for IPv4 packets (0x0800).
const ETH_P_IP: u16 = nix::libc::ETH_P_IP as u16;

// U32 filter TCA_OPTIONS sub-attributes (from linux/pkt_cls.h)
/// U32 class ID attribute type.
const TCA_U32_CLASSID: u16 = 1;
/// U32 selector attribute type.
const TCA_U32_SEL: u16 = 5;

/// Marks a u32 filter as terminal, required for the filter to return a classification result.
const TC_U32_TERMINAL: u8 = 1;

/// Offset of the destination address in the IPv4 header.
pub const IPV4_DST_OFFSET: i32 = 16;

/// Priority of destination filters.
pub const DESTINATION_FILTER_PRIO: u16 = 1;

/// The kernel's `tc_u32_sel` header, followed on the wire by `nkeys` [`TcU32Key`]s.
///
/// ```c
/// struct tc_u32_sel {
///     unsigned char flags;
///     unsigned char offshift;
///     unsigned char nkeys;
///     __be16        offmask;
///     __u16         off;
///     short         offoff;
///     short         hoff;
///     __be32        hmask;
///     struct tc_u32_key keys[0];
/// };
/// ```
#[derive(Debug, Clone, Copy, Default)]
struct TcU32Sel {
    flags: u8,
    offshift: u8,
    nkeys: u8,
    offmask: u16,
    off: u16,
    offoff: i16,
    hoff: i16,
    hmask: u32,
}

impl TcU32Sel {
    fn to_bytes(self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(16);
        vec.push(self.flags);
        vec.push(self.offshift);
        vec.push(self.nkeys);
        vec.push(0); // padding
        vec.extend_from_slice(&self.offmask.to_be_bytes());
        vec.extend_from_slice(&self.off.to_ne_bytes());
        vec.extend_from_slice(&self.offoff.to_ne_bytes());
        vec.extend_from_slice(&self.hoff.to_ne_bytes());
        vec.extend_from_slice(&self.hmask.to_be_bytes());
        vec
    }
}

/// The kernel's `tc_u32_key`: match `packet[off..off+4] & mask == val`.
///
/// `mask` and `val` are in network byte order, like the packet bytes they are compared with.
#[derive(Debug, Clone, Copy, Default)]
struct TcU32Key {
    mask: u32,
    val: u32,
    off: i32,
    offmask: i32,
}

impl TcU32Key {
    fn to_bytes(self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(16);
        vec.extend_from_slice(&self.mask.to_be_bytes());
        vec.extend_from_slice(&self.val.to_be_bytes());
        vec.extend_from_slice(&self.off.to_ne_bytes());
        vec.extend_from_slice(&self.offmask.to_ne_bytes());
        vec
    }
}

/// Builder for a filter sending IPv4 traffic for one destination address to a class.
///
/// Equivalent to
/// `tc filter add dev <if> parent 1:0 protocol ip prio 1 u32 match ip dst <addr>/32 flowid <class>`.
///
/// # Example
///
/// ```
/// use std::net::Ipv4Addr;
/// use netlem::tc::filter::U32DestinationFilterRequest;
/// use netlem::tc::handle::{Handle, TcTarget};
///
/// let if_index = 1;
/// let request = U32DestinationFilterRequest::new(
///     TcTarget::new(if_index).with_parent(Handle::root()),
///     Ipv4Addr::new(10, 0, 0, 2),
///     Handle::new(1, 2),
/// )
/// .build();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U32DestinationFilterRequest {
    pub target: TcTarget,
    /// The destination address to match exactly.
    pub destination: Ipv4Addr,
    /// The class matching traffic is sent to.
    pub class_id: Handle,
    /// Filter priority, lower is checked first.
    pub priority: u16,
}

impl U32DestinationFilterRequest {
    pub fn new(target: TcTarget, destination: Ipv4Addr, class_id: Handle) -> Self {
        Self { target, destination, class_id, priority: DESTINATION_FILTER_PRIO }
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    /// Encoded `TCA_OPTIONS` payload: the flow id and a one-key selector.
    fn options(&self) -> Vec<Vec<u8>> {
        let sel = TcU32Sel { flags: TC_U32_TERMINAL, nkeys: 1, ..Default::default() };
        let key = TcU32Key {
            mask: u32::MAX,
            val: self.destination.to_bits(),
            off: IPV4_DST_OFFSET,
            offmask: 0,
        };

        let mut sel_bytes = sel.to_bytes();
        sel_bytes.extend(key.to_bytes());

        vec![
            build_nla(TCA_U32_CLASSID, &self.class_id.as_u32().to_ne_bytes()),
            build_nla(TCA_U32_SEL, &sel_bytes),
        ]
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_msg = TcMessage::with_index(self.target.interface_index);
        tc_msg.header.parent = self.target.parent;
        // Let the kernel pick the filter handle.
        tc_msg.header.handle = TcHandle::from(0u32);
        // Priority in the upper half, protocol in network byte order in the lower half.
        tc_msg.header.info = ((self.priority as u32) << 16) | (ETH_P_IP.to_be() as u32);

        tc_msg.attributes.push(TcAttribute::Kind("u32".to_string()));
        tc_msg.attributes.push(TcAttribute::Other(build_nested_options(self.options())));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewTrafficFilter(tc_msg));
        nl_req.header.flags = NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL;

        nl_req
    }
}

#[cfg(test)]
mod tests {
    use rtnetlink::packet_core::NetlinkPayload;

    use super::*;

    fn request() -> U32DestinationFilterRequest {
        U32DestinationFilterRequest::new(
            TcTarget::new(7).with_parent(Handle::root()),
            Ipv4Addr::new(10, 0, 0, 2),
            Handle::new(1, 3),
        )
    }

    #[test]
    fn filter_header_carries_priority_and_protocol() {
        let req = request().build();
        assert_eq!(req.header.flags & NLM_F_EXCL, NLM_F_EXCL);

        let NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewTrafficFilter(msg)) = req.payload
        else {
            panic!("not a filter request");
        };
        assert_eq!(msg.header.index, 7);
        assert_eq!(msg.header.parent, TcHandle::from(0x0001_0000));
        assert_eq!(msg.header.info >> 16, 1);
        assert_eq!((msg.header.info & 0xFFFF) as u16, 0x0800u16.to_be());
    }

    #[test]
    fn selector_matches_destination_at_offset_16() {
        let opts = request().options();

        let classid = &opts[0];
        assert_eq!(u32::from_ne_bytes(classid[4..8].try_into().unwrap()), 0x0001_0003);

        let sel = &opts[1][4..];
        assert_eq!(sel.len(), 32);
        assert_eq!(sel[0], TC_U32_TERMINAL);
        assert_eq!(sel[2], 1, "one key");

        let key = &sel[16..];
        assert_eq!(&key[0..4], &[0xff; 4]);
        assert_eq!(&key[4..8], &[10, 0, 0, 2]);
        assert_eq!(i32::from_ne_bytes(key[8..12].try_into().unwrap()), 16);
    }
}
