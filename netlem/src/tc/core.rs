//! Packet scheduler time base.
//!
//! The kernel's traffic control subsystem measures time in its own "ticks". Netem latencies and
//! HTB buffers are passed in ticks, so microsecond values are converted with the factor the
//! kernel exposes in `/proc/net/psched`.

use std::io;
use std::sync::LazyLock;

/// Path to the kernel's packet scheduler timing information.
pub const PSCHED_PATH: &str = "/proc/net/psched";

/// Ticks per microsecond on kernels with high resolution timers (`t2us / us2t = 1000 / 64`).
const FALLBACK_TICK_IN_USEC: f64 = 15.625;

/// Parse the contents of `/proc/net/psched` into ticks per microsecond.
///
/// The file format is `t2us us2t clock resolution`, all hex. The ratio `t2us / us2t` is the
/// number of ticks in a microsecond.
///
/// Adapted from `iproute2/tc/tc_core.c`.
pub fn parse_psched(contents: &str) -> io::Result<f64> {
    let invalid = |what: &str| io::Error::new(io::ErrorKind::InvalidData, what.to_string());

    let mut iter = contents.split_whitespace();
    let mut next_hex = |field: &str| -> io::Result<u32> {
        let raw = iter.next().ok_or_else(|| invalid(field))?;
        u32::from_str_radix(raw, 16).map_err(|_| invalid(field))
    };

    let t2us = next_hex("t2us")?;
    let us2t = next_hex("us2t")?;
    if us2t == 0 {
        return Err(invalid("us2t"));
    }

    Ok(t2us as f64 / us2t as f64)
}

/// Read the packet scheduler time base of the running kernel.
pub fn tc_core_init() -> io::Result<f64> {
    let contents = std::fs::read_to_string(PSCHED_PATH)?;
    let tick_in_usec = parse_psched(&contents)?;

    tracing::debug!(tick_in_usec, "read {PSCHED_PATH}");

    Ok(tick_in_usec)
}

/// Cached value of ticks per microsecond, initialized lazily on first use.
///
/// Falls back to the common high resolution value if the kernel file cannot be read.
pub static TICK_IN_USEC: LazyLock<f64> = LazyLock::new(|| {
    tc_core_init().unwrap_or_else(|e| {
        tracing::warn!(?e, FALLBACK_TICK_IN_USEC, "failed to read {PSCHED_PATH}, using fallback");
        FALLBACK_TICK_IN_USEC
    })
});

/// Convert microseconds to kernel packet scheduler ticks.
pub fn usec_to_ticks(delay_usec: u32) -> u32 {
    (delay_usec as f64 * *TICK_IN_USEC) as u32
}

/// Ticks needed to send `burst_bytes` at `rate_bytes_per_sec`, the HTB `buffer` field.
///
/// Uses the iproute2 formula `burst * tick_in_usec * 1e6 / rate`.
pub fn burst_to_ticks(burst_bytes: u32, rate_bytes_per_sec: u64) -> u32 {
    if rate_bytes_per_sec == 0 {
        return 0;
    }
    let ticks = burst_bytes as f64 * *TICK_IN_USEC * 1_000_000.0 / rate_bytes_per_sec as f64;
    ticks.min(u32::MAX as f64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_psched_ratio() {
        let tick = parse_psched("000003e8 00000040 000f4240 3b9aca00\n").unwrap();
        assert_eq!(tick, 15.625);
    }

    #[test]
    fn rejects_truncated_or_garbled_psched() {
        assert!(parse_psched("000003e8").is_err());
        assert!(parse_psched("zz 40").is_err());
        assert!(parse_psched("3e8 0").is_err());
    }

    #[test]
    fn burst_ticks_shrink_with_rate() {
        let slow = burst_to_ticks(10_000, 125_000);
        let fast = burst_to_ticks(10_000, 1_250_000);
        assert!(slow > fast);
        assert_eq!(burst_to_ticks(10_000, 0), 0);
    }
}
