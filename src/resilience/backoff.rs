//! Exponential backoff with jitter.

use std::io;
use std::time::Duration;

use rand::Rng;

/// First delay after a transient accept failure.
pub const ACCEPT_BACKOFF_BASE_MS: u64 = 5;
/// Ceiling for accept retry delays.
pub const ACCEPT_BACKOFF_MAX_MS: u64 = 1000;

/// Calculate exponential backoff delay with jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Delay before retrying the `attempt`-th consecutive failed accept.
pub fn accept_backoff(attempt: u32) -> Duration {
    calculate_backoff(attempt, ACCEPT_BACKOFF_BASE_MS, ACCEPT_BACKOFF_MAX_MS)
}

/// Accept errors worth retrying: the peer went away before we got to it, or
/// the process is out of descriptors for a moment.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) {
        return true;
    }
    // EMFILE / ENFILE
    cfg!(unix) && matches!(err.raw_os_error(), Some(23) | Some(24))
}
