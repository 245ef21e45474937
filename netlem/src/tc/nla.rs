//! Netlink attribute encoding for the qdisc, class and filter options rtnetlink has no typed
//! representation for.

use nix::libc::TCA_OPTIONS;
use rtnetlink::packet_core::{DefaultNla, NLA_HEADER_SIZE};

/// Encode a single attribute: 4-byte header (length and type, native endian), value, and zero
/// padding to a 4-byte boundary. The length field excludes the padding.
///
/// ```text
/// ┌─────────────────────────────────────────┐
/// │  Length (2 bytes) │  Type (2 bytes)     │
/// ├─────────────────────────────────────────┤
/// │  Value (variable length, padded to 4)   │
/// └─────────────────────────────────────────┘
/// ```
pub(crate) fn build_nla(nla_type: u16, value: &[u8]) -> Vec<u8> {
    let nla_len = NLA_HEADER_SIZE + value.len();
    let padded_len = (nla_len + 3) & !3;

    let mut buf = Vec::with_capacity(padded_len);
    buf.extend_from_slice(&(nla_len as u16).to_ne_bytes());
    buf.extend_from_slice(&nla_type.to_ne_bytes());
    buf.extend_from_slice(value);
    buf.resize(padded_len, 0);

    buf
}

/// Concatenate already encoded attributes into a `TCA_OPTIONS` container.
pub(crate) fn build_nested_options<I>(sub_attrs: I) -> DefaultNla
where
    I: IntoIterator<Item = Vec<u8>>,
{
    DefaultNla::new(TCA_OPTIONS, sub_attrs.into_iter().flatten().collect())
}
