use std::{ffi::CString, num::NonZeroU32};

/// Resolve an interface name to its index in the calling thread's network namespace.
///
/// Returns `None` if the interface does not exist or the name contains a NUL byte.
pub fn if_nametoindex(name: &str) -> Option<NonZeroU32> {
    let string = CString::new(name).ok()?;
    let index = unsafe { nix::libc::if_nametoindex(string.as_ptr()) };
    NonZeroU32::new(index)
}
