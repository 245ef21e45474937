//! TC handles and the addressing shared by all requests.
//!
//! TC handles are 32-bit values split into major:minor (16:16 bits). See the
//! [module docs](super) for the numbering scheme.

use std::fmt;

use rtnetlink::packet_route::tc::TcHandle;

/// Major number of the HTB root and of every destination class.
pub const ROOT_MAJOR: u16 = 1;

/// Minor of the default class unclassified traffic falls into.
pub const DEFAULT_CLASS_MINOR: u16 = 1;

/// First destination slot maps to minor (and netem major) 2, after the root and default class.
pub const SLOT_OFFSET: u32 = 2;

/// A `major:minor` traffic control handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub major: u16,
    pub minor: u16,
}

impl Handle {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// The HTB root qdisc, `1:0`.
    pub const fn root() -> Self {
        Self::new(ROOT_MAJOR, 0)
    }

    /// The class unclassified traffic is sent to, `1:1`.
    pub const fn default_class() -> Self {
        Self::new(ROOT_MAJOR, DEFAULT_CLASS_MINOR)
    }

    /// Class of the destination classified in `slot`, `1:(slot+2)`.
    ///
    /// `None` once the 16-bit handle space is exhausted.
    pub fn destination_class(slot: usize) -> Option<Self> {
        Some(Self::new(ROOT_MAJOR, slot_number(slot)?))
    }

    /// Netem qdisc of the destination classified in `slot`, `(slot+2):0`.
    pub fn delay_stage(slot: usize) -> Option<Self> {
        Some(Self::new(slot_number(slot)?, 0))
    }

    pub const fn as_u32(self) -> u32 {
        ((self.major as u32) << 16) | self.minor as u32
    }
}

/// `slot + 2`, staying clear of `0xFFFF` which the kernel treats as special (e.g. `ffff:` is
/// the ingress handle).
fn slot_number(slot: usize) -> Option<u16> {
    let n = u32::try_from(slot).ok()?.checked_add(SLOT_OFFSET)?;
    u16::try_from(n).ok().filter(|n| *n < u16::MAX)
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.major, self.minor)
    }
}

impl From<Handle> for TcHandle {
    fn from(value: Handle) -> Self {
        TcHandle::from(value.as_u32())
    }
}

/// Addressing shared by qdisc, class and filter requests: which interface, attached where,
/// with which handle of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcTarget {
    /// The network interface index (from `if_nametoindex`).
    pub interface_index: i32,
    /// Where this qdisc, class or filter attaches.
    pub parent: TcHandle,
    /// This object's own handle. Zero lets the kernel pick one (filters).
    pub handle: TcHandle,
}

impl TcTarget {
    /// Create a target on the given interface, defaulting to the root parent.
    pub fn new(index: i32) -> Self {
        Self { interface_index: index, parent: TcHandle::ROOT, handle: TcHandle::from(0u32) }
    }

    pub fn with_parent(mut self, parent: impl Into<TcHandle>) -> Self {
        self.parent = parent.into();
        self
    }

    pub fn with_handle(mut self, handle: impl Into<TcHandle>) -> Self {
        self.handle = handle.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_handles() {
        assert_eq!(Handle::root().as_u32(), 0x0001_0000);
        assert_eq!(Handle::default_class().as_u32(), 0x0001_0001);
        assert_eq!(Handle::root().to_string(), "1:0");
    }

    #[test]
    fn slots_map_past_root_and_default_class() {
        assert_eq!(Handle::destination_class(0), Some(Handle::new(1, 2)));
        assert_eq!(Handle::delay_stage(0), Some(Handle::new(2, 0)));
        assert_eq!(Handle::destination_class(14).unwrap().to_string(), "1:10");
        assert_eq!(Handle::delay_stage(14).unwrap().as_u32(), 0x0010_0000);
    }

    #[test]
    fn handle_space_is_bounded() {
        assert!(Handle::destination_class(0xFFFC).is_some());
        assert!(Handle::destination_class(0xFFFD).is_none());
        assert!(Handle::delay_stage(usize::MAX).is_none());
    }

    #[test]
    fn target_converts_handles() {
        let target = TcTarget::new(3).with_parent(Handle::root()).with_handle(Handle::new(1, 2));
        assert_eq!(target.parent, TcHandle::from(0x0001_0000));
        assert_eq!(target.handle, TcHandle::from(0x0001_0002));
    }
}
