//! Network sysctls, addressed by their dotted `sysctl(8)` names.
//!
//! The `net.*` tree is per network namespace: the kernel resolves `/proc/sys/net` against the
//! namespace of the calling thread, so writing from a
//! [`NetworkNamespace`](crate::namespace::NetworkNamespace) worker configures that node only.

use std::io;
use std::path::{Path, PathBuf};

pub const IPV4_FORWARDING: &str = "net.ipv4.ip_forward";
pub const IPV6_FORWARDING: &str = "net.ipv6.conf.all.forwarding";

/// Set on every node, which routes between its interfaces like a small host.
pub const NODE_DEFAULTS: &[(&str, &str)] = &[(IPV4_FORWARDING, "1"), (IPV6_FORWARDING, "1")];

/// `net.ipv4.ip_forward` -> `/proc/sys/net/ipv4/ip_forward`.
pub fn proc_path(name: &str) -> PathBuf {
    name.split('.').fold(Path::new("/proc/sys").to_path_buf(), |path, part| path.join(part))
}

/// Current value, without the trailing newline.
pub fn read(name: &str) -> io::Result<String> {
    std::fs::read_to_string(proc_path(name)).map(|s| s.trim_end().to_string())
}

/// Fails without `CAP_NET_ADMIN` over the namespace, or if this kernel lacks the sysctl.
pub fn write(name: &str, value: &str) -> io::Result<()> {
    std::fs::write(proc_path(name), value)
}
