//! HTB (Hierarchical Token Bucket) root qdisc and per-destination classes.
//!
//! The root qdisc only classifies; each destination class carries the link's rate. HTB also
//! copes with non-work-conserving children such as netem: when netem holds a delayed packet,
//! HTB moves on to the next class instead of blocking the whole interface.

use rtnetlink::packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST, NetlinkMessage,
};
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    tc::{TcAttribute, TcMessage},
};

use super::core::burst_to_ticks;
use super::handle::{DEFAULT_CLASS_MINOR, Handle, TcTarget};
use super::nla::{build_nested_options, build_nla};

// HTB-specific TCA_OPTIONS sub-attributes (from linux/pkt_sched.h)
/// HTB class parameters attribute type.
const TCA_HTB_PARMS: u16 = 1;
/// HTB qdisc initialization attribute type.
const TCA_HTB_INIT: u16 = 2;
/// HTB ceil rate table attribute type.
const TCA_HTB_CTAB: u16 = 3;
/// HTB rate table attribute type.
const TCA_HTB_RTAB: u16 = 4;
/// 64-bit rate, for rates that overflow `tc_ratespec.rate`.
const TCA_HTB_RATE64: u16 = 6;
/// 64-bit ceil.
const TCA_HTB_CEIL64: u16 = 7;

/// HTB protocol version (current kernel version).
const HTB_VERSION: u32 = 3;

/// Rate-to-quantum conversion factor, `quantum = rate / rate2quantum`.
const HTB_RATE2QUANTUM: u32 = 10;

/// Bits in a link rate unit: rates are configured in binary megabits per second.
pub const MEBIBIT: u64 = 1024 * 1024;

/// Burst allowance of every destination class, in bytes.
pub const HTB_BURST_BYTES: u32 = 10_000;

/// Priority of every destination class.
pub const HTB_CLASS_PRIO: u32 = 1;

/// Effectively unlimited rate in bytes per second (~10 Gbit/s).
///
/// The kernel refuses a class without a rate, so a link that only configures delay or loss
/// gets a class that never throttles.
pub const HTB_UNLIMITED_RATE_BPS: u64 = 1_250_000_000;

/// Zeroed rate table (256 x 4-byte entries).
///
/// Modern kernels compute rates internally. The zeroed table triggers the kernel's
/// `rtab[0] == 0` fast path in `__detect_linklayer()`, i.e. plain Ethernet.
const DEFAULT_RATE_TABLE: [u8; 1024] = [0u8; 1024];

/// `TC_LINKLAYER_ETHERNET`.
const LINKLAYER_ETHERNET: u8 = 1;

/// The kernel's `tc_ratespec` structure.
///
/// ```c
/// struct tc_ratespec {
///     unsigned char cell_log;
///     __u8          linklayer;
///     unsigned short overhead;
///     short         cell_align;
///     unsigned short mpu;
///     __u32         rate;
/// };
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcRateSpec {
    pub cell_log: u8,
    pub linklayer: u8,
    pub overhead: u16,
    pub cell_align: i16,
    pub mpu: u16,
    /// Rate in bytes per second, saturated at [`u32::MAX`] (see `TCA_HTB_RATE64`).
    pub rate: u32,
}

impl TcRateSpec {
    /// An Ethernet rate spec for the given rate in bytes per second.
    pub fn ethernet(rate_bytes_per_sec: u64) -> Self {
        Self {
            rate: u32::try_from(rate_bytes_per_sec).unwrap_or(u32::MAX),
            linklayer: LINKLAYER_ETHERNET,
            cell_align: -1,
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(12);
        vec.push(self.cell_log);
        vec.push(self.linklayer);
        vec.extend_from_slice(&self.overhead.to_ne_bytes());
        vec.extend_from_slice(&self.cell_align.to_ne_bytes());
        vec.extend_from_slice(&self.mpu.to_ne_bytes());
        vec.extend_from_slice(&self.rate.to_ne_bytes());
        vec
    }
}

/// The kernel's `tc_htb_glob` structure for HTB qdisc initialization.
///
/// ```c
/// struct tc_htb_glob {
///     __u32 version;        /* HTB version */
///     __u32 rate2quantum;   /* Rate-to-quantum conversion */
///     __u32 defcls;         /* Default class minor number */
///     __u32 debug;          /* Debug flags */
///     __u32 direct_pkts;    /* Stats: packets sent directly (read-only) */
/// };
/// ```
#[derive(Debug, Clone, Copy)]
struct HtbGlob {
    version: u32,
    rate2quantum: u32,
    defcls: u32,
    debug: u32,
    direct_pkts: u32,
}

impl HtbGlob {
    fn as_bytes(self) -> Vec<u8> {
        [self.version, self.rate2quantum, self.defcls, self.debug, self.direct_pkts]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect()
    }
}

impl Default for HtbGlob {
    fn default() -> Self {
        Self {
            version: HTB_VERSION,
            rate2quantum: HTB_RATE2QUANTUM,
            defcls: DEFAULT_CLASS_MINOR as u32,
            debug: 0,
            direct_pkts: 0,
        }
    }
}

/// The kernel's `tc_htb_opt` structure for HTB class configuration.
///
/// ```c
/// struct tc_htb_opt {
///     struct tc_ratespec rate;   /* Guaranteed rate */
///     struct tc_ratespec ceil;   /* Ceiling rate */
///     __u32 buffer;              /* Burst size in ticks */
///     __u32 cbuffer;             /* Ceil burst size in ticks */
///     __u32 quantum;             /* Quantum for deficit round-robin (0 = auto) */
///     __u32 level;               /* Class level (0 = leaf) */
///     __u32 prio;                /* Priority (0 = highest) */
/// };
/// ```
#[derive(Debug, Clone, Copy)]
struct HtbOpt {
    rate: TcRateSpec,
    ceil: TcRateSpec,
    buffer: u32,
    cbuffer: u32,
    quantum: u32,
    level: u32,
    prio: u32,
}

impl HtbOpt {
    fn as_bytes(self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(44);
        vec.extend_from_slice(&self.rate.to_bytes());
        vec.extend_from_slice(&self.ceil.to_bytes());
        for v in [self.buffer, self.cbuffer, self.quantum, self.level, self.prio] {
            vec.extend_from_slice(&v.to_ne_bytes());
        }
        vec
    }
}

/// Builder for the HTB root qdisc, `1:0`, with `defcls` pointing at `1:1`.
///
/// Installed with exclusive-create semantics: a second install on the same interface is
/// refused by the kernel.
#[derive(Debug, Clone)]
pub struct QdiscHtbRequest {
    pub target: TcTarget,
}

impl QdiscHtbRequest {
    /// Create the root request for the given interface; parent and handle are fixed.
    pub fn new(interface_index: i32) -> Self {
        Self { target: TcTarget::new(interface_index).with_handle(Handle::root()) }
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.target.interface_index);
        tc_message.header.parent = self.target.parent;
        tc_message.header.handle = self.target.handle;

        tc_message.attributes.push(TcAttribute::Kind("htb".to_string()));

        let init_nla = build_nla(TCA_HTB_INIT, &HtbGlob::default().as_bytes());
        tc_message.attributes.push(TcAttribute::Other(build_nested_options([init_nla])));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(tc_message));
        nl_req.header.flags = NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}

/// Builder for a destination class under the HTB root.
///
/// Rate and ceil are equal, so a destination can never borrow beyond its configured rate.
///
/// # Example
///
/// ```
/// use netlem::tc::handle::{Handle, TcTarget};
/// use netlem::tc::htb::HtbClassRequest;
///
/// let if_index = 1;
/// // 10 Mbit/s towards the destination classified first on this node.
/// let request = HtbClassRequest::new(
///     TcTarget::new(if_index)
///         .with_parent(Handle::root())
///         .with_handle(Handle::destination_class(0).unwrap()),
/// )
/// .with_rate_mbit(10)
/// .build();
/// ```
#[derive(Debug, Clone)]
pub struct HtbClassRequest {
    pub target: TcTarget,
    /// Rate and ceil in bytes per second.
    pub rate_bytes: u64,
    /// If true, replace an existing class instead of failing if it exists.
    pub replace: bool,
}

impl HtbClassRequest {
    /// Create a class request with the unlimited rate.
    pub fn new(target: TcTarget) -> Self {
        Self { target, rate_bytes: HTB_UNLIMITED_RATE_BPS, replace: false }
    }

    /// Set the rate in binary megabits per second. Zero means unlimited.
    pub fn with_rate_mbit(mut self, rate_mbit: u64) -> Self {
        self.rate_bytes = match rate_mbit.saturating_mul(MEBIBIT) / 8 {
            0 => HTB_UNLIMITED_RATE_BPS,
            bytes => bytes,
        };
        self
    }

    /// When `true`, uses `NLM_F_REPLACE` to update an existing class in place.
    /// When `false` (default), uses `NLM_F_EXCL` to fail if the class exists.
    pub fn with_replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    /// Encoded `TCA_OPTIONS` payload: parameters, rate tables and, for rates over 32 bits,
    /// the 64-bit rate and ceil.
    fn options(&self) -> Vec<Vec<u8>> {
        let buffer_ticks = burst_to_ticks(HTB_BURST_BYTES, self.rate_bytes);
        let rate_spec = TcRateSpec::ethernet(self.rate_bytes);

        let opt = HtbOpt {
            rate: rate_spec,
            ceil: rate_spec,
            buffer: buffer_ticks,
            cbuffer: buffer_ticks,
            quantum: 0, // Let kernel compute from rate
            level: 0,   // Leaf class
            prio: HTB_CLASS_PRIO,
        };

        let mut attrs = vec![
            build_nla(TCA_HTB_PARMS, &opt.as_bytes()),
            build_nla(TCA_HTB_RTAB, &DEFAULT_RATE_TABLE),
            build_nla(TCA_HTB_CTAB, &DEFAULT_RATE_TABLE),
        ];
        if self.rate_bytes > u32::MAX as u64 {
            attrs.push(build_nla(TCA_HTB_RATE64, &self.rate_bytes.to_ne_bytes()));
            attrs.push(build_nla(TCA_HTB_CEIL64, &self.rate_bytes.to_ne_bytes()));
        }
        attrs
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.target.interface_index);
        tc_message.header.parent = self.target.parent;
        tc_message.header.handle = self.target.handle;

        tc_message.attributes.push(TcAttribute::Kind("htb".to_string()));
        tc_message.attributes.push(TcAttribute::Other(build_nested_options(self.options())));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewTrafficClass(tc_message));
        nl_req.header.flags = if self.replace {
            NLM_F_CREATE | NLM_F_REPLACE | NLM_F_REQUEST | NLM_F_ACK
        } else {
            NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK
        };

        nl_req
    }
}

#[cfg(test)]
mod tests {
    use rtnetlink::packet_core::NetlinkPayload;
    use rtnetlink::packet_route::tc::TcHandle;

    use super::*;

    fn tc_message(req: NetlinkMessage<RouteNetlinkMessage>) -> TcMessage {
        match req.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewQueueDiscipline(m))
            | NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewTrafficClass(m)) => m,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn root_is_exclusive_at_1_0() {
        let req = QdiscHtbRequest::new(4).build();
        assert_eq!(req.header.flags & NLM_F_EXCL, NLM_F_EXCL);
        assert_eq!(req.header.flags & NLM_F_REPLACE, 0);

        let msg = tc_message(req);
        assert_eq!(msg.header.index, 4);
        assert_eq!(msg.header.parent, TcHandle::ROOT);
        assert_eq!(msg.header.handle, TcHandle::from(0x0001_0000));
        assert!(msg.attributes.contains(&TcAttribute::Kind("htb".to_string())));
    }

    #[test]
    fn glob_points_default_class_at_1_1() {
        let bytes = HtbGlob::default().as_bytes();
        assert_eq!(bytes.len(), 20);
        assert_eq!(u32::from_ne_bytes(bytes[8..12].try_into().unwrap()), 1);
    }

    #[test]
    fn class_rate_is_binary_megabits() {
        let req = HtbClassRequest::new(TcTarget::new(1)).with_rate_mbit(10);
        assert_eq!(req.rate_bytes, 10 * 1024 * 1024 / 8);

        let opts = req.options();
        assert_eq!(opts.len(), 3);
        // Skip the NLA header, then rate.rate is the last field of the first ratespec.
        let parms = &opts[0][4..];
        assert_eq!(u32::from_ne_bytes(parms[8..12].try_into().unwrap()), 1_310_720);
        // ceil == rate
        assert_eq!(u32::from_ne_bytes(parms[20..24].try_into().unwrap()), 1_310_720);
        // prio is the last field.
        assert_eq!(u32::from_ne_bytes(parms[40..44].try_into().unwrap()), HTB_CLASS_PRIO);
    }

    #[test]
    fn zero_rate_is_unlimited() {
        let req = HtbClassRequest::new(TcTarget::new(1)).with_rate_mbit(0);
        assert_eq!(req.rate_bytes, HTB_UNLIMITED_RATE_BPS);
    }

    #[test]
    fn large_rates_use_64_bit_attributes() {
        // 40 Gibit/s overflows a u32 of bytes per second.
        let req = HtbClassRequest::new(TcTarget::new(1)).with_rate_mbit(40 * 1024);
        let opts = req.options();
        assert_eq!(opts.len(), 5);

        let parms = &opts[0][4..];
        assert_eq!(u32::from_ne_bytes(parms[8..12].try_into().unwrap()), u32::MAX);
        let rate64 = &opts[3];
        assert_eq!(u16::from_ne_bytes([rate64[2], rate64[3]]), TCA_HTB_RATE64);
        assert_eq!(u64::from_ne_bytes(rate64[4..12].try_into().unwrap()), req.rate_bytes);
    }

    #[test]
    fn class_replace_toggles_flags() {
        let target = TcTarget::new(1).with_parent(Handle::root()).with_handle(Handle::new(1, 2));

        let create = HtbClassRequest::new(target).build();
        assert_eq!(create.header.flags & NLM_F_EXCL, NLM_F_EXCL);

        let replace = HtbClassRequest::new(target).with_replace(true).build();
        assert_eq!(replace.header.flags & NLM_F_REPLACE, NLM_F_REPLACE);
        assert_eq!(replace.header.flags & NLM_F_EXCL, 0);

        let msg = tc_message(replace);
        assert_eq!(msg.header.parent, TcHandle::from(0x0001_0000));
        assert_eq!(msg.header.handle, TcHandle::from(0x0001_0002));
    }
}
