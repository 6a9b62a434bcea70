//! Host services the engine expects from its operating system layer:
//! randomness, sleeping and wall-clock time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::{OsRng, SmallRng};
use rand::{RngCore, SeedableRng};

/// Julian day number of the Unix epoch (1970-01-01T00:00:00Z).
pub const UNIX_EPOCH_JULIAN_DAY: f64 = 2_440_587.5;

/// Milliseconds in one day.
pub const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Where the bytes from [`fill_random`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomSource {
    /// The operating system's cryptographically secure generator.
    Os,
    /// A non-cryptographic generator seeded from the clock.
    ///
    /// Only used when the OS generator fails. These bytes are predictable
    /// and must not be treated as secure.
    Fallback,
}

/// Fill `buf` with random bytes, preferring the OS generator.
///
/// If the OS generator is unavailable the bytes come from a clock-seeded
/// [`SmallRng`] instead and a warning is logged. Callers that need secure
/// randomness must check for [`RandomSource::Fallback`].
pub fn fill_random(buf: &mut [u8]) -> RandomSource {
    match OsRng.try_fill_bytes(buf) {
        Ok(()) => RandomSource::Os,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "OS randomness unavailable, falling back to non-cryptographic generator"
            );
            fallback_rng().fill_bytes(buf);
            RandomSource::Fallback
        }
    }
}

fn fallback_rng() -> SmallRng {
    static CALLS: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let calls = CALLS.fetch_add(1, Ordering::Relaxed);
    SmallRng::seed_from_u64(nanos ^ calls.rotate_left(32) ^ u64::from(std::process::id()))
}

/// Block the current thread for `duration`.
pub fn sleep(duration: Duration) -> Duration {
    std::thread::sleep(duration);
    duration
}

/// Convert a wall-clock time to a Julian day number.
///
/// The scale is milliseconds since the Unix epoch divided by milliseconds
/// per day, offset by the epoch's Julian day. Times before the epoch clamp
/// to the epoch.
#[must_use]
pub fn julian_day(time: SystemTime) -> f64 {
    let millis = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0);
    millis / MILLIS_PER_DAY + UNIX_EPOCH_JULIAN_DAY
}

/// The current time as a Julian day number.
#[must_use]
pub fn julian_day_now() -> f64 {
    julian_day(SystemTime::now())
}
