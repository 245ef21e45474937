//! Netem (Network Emulator) qdisc, the delay and loss stage under a destination class.

use nix::libc::TCA_OPTIONS;
use rtnetlink::packet_core::{
    DefaultNla, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST, NetlinkMessage,
};
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    tc::{TcAttribute, TcMessage},
};

use super::core::usec_to_ticks;
use super::handle::TcTarget;

/// Queue limit of every delay stage, in packets.
pub const NETEM_LIMIT: u32 = 300_000;

/// Delay and loss applied to traffic towards one destination.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DelayStage {
    /// Fixed one-way delay in milliseconds.
    pub latency_ms: u32,
    /// Random loss in percent, `0.0..=100.0`.
    pub loss_percent: f64,
}

/// The kernel's `tc_netem_qopt` structure.
///
/// ```c
/// struct tc_netem_qopt {
///     __u32 latency;    /* Delay in scheduler ticks */
///     __u32 limit;      /* Queue size limit in packets */
///     __u32 loss;       /* Loss probability (0 to 2^32-1) */
///     __u32 gap;        /* Reordering gap */
///     __u32 duplicate;  /* Duplication probability */
///     __u32 jitter;     /* Jitter in scheduler ticks */
/// };
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetemQopt {
    /// Latency in packet scheduler ticks (not microseconds!).
    pub latency: u32,
    pub limit: u32,
    /// Loss probability, scaled to the u32 range.
    pub loss: u32,
    pub gap: u32,
    pub duplicate: u32,
    pub jitter: u32,
}

impl NetemQopt {
    /// Convert a percentage to the kernel's probability, where [`u32::MAX`] is 100%.
    pub fn u32_probability(percent: f64) -> u32 {
        (percent.clamp(0.0, 100.0) / 100.0 * u32::MAX as f64) as u32
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        [self.latency, self.limit, self.loss, self.gap, self.duplicate, self.jitter]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect()
    }
}

impl From<DelayStage> for NetemQopt {
    fn from(value: DelayStage) -> Self {
        Self {
            latency: usec_to_ticks(value.latency_ms.saturating_mul(1000)),
            limit: NETEM_LIMIT,
            loss: Self::u32_probability(value.loss_percent),
            gap: 0,
            duplicate: 0,
            jitter: 0,
        }
    }
}

/// Builder for a netem qdisc attached under a destination class.
///
/// # Example
///
/// ```
/// use netlem::tc::handle::{Handle, TcTarget};
/// use netlem::tc::netem::{DelayStage, QdiscNetemRequest};
///
/// let if_index = 1;
/// let stage = DelayStage { latency_ms: 50, loss_percent: 1.0 };
///
/// let request = QdiscNetemRequest::new(
///     TcTarget::new(if_index)
///         .with_parent(Handle::destination_class(0).unwrap()) // 1:2
///         .with_handle(Handle::delay_stage(0).unwrap()),      // 2:0
///     stage,
/// )
/// .build();
/// ```
#[derive(Debug)]
pub struct QdiscNetemRequest {
    pub target: TcTarget,
    pub options: NetemQopt,
    /// If true, create or replace the qdisc instead of failing if it exists.
    pub replace: bool,
}

impl QdiscNetemRequest {
    pub fn new(target: TcTarget, stage: DelayStage) -> Self {
        Self { target, options: NetemQopt::from(stage), replace: false }
    }

    /// When `true`, uses `NLM_F_REPLACE` so the stage is created if missing and replaced
    /// otherwise. When `false` (default), uses `NLM_F_EXCL` to fail if it exists.
    pub fn with_replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.target.interface_index);
        tc_message.header.parent = self.target.parent;
        tc_message.header.handle = self.target.handle;

        tc_message.attributes.push(TcAttribute::Kind("netem".to_string()));
        // Netem takes its options struct directly in TCA_OPTIONS, not nested.
        tc_message
            .attributes
            .push(TcAttribute::Other(DefaultNla::new(TCA_OPTIONS, self.options.to_bytes())));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(tc_message));
        nl_req.header.flags = if self.replace {
            NLM_F_CREATE | NLM_F_REPLACE | NLM_F_REQUEST | NLM_F_ACK
        } else {
            NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK
        };

        nl_req
    }
}
