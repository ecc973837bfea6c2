/// Utility functions for tick arithmetic and formatting
use std::mem::MaybeUninit;
use time::{macros::format_description, OffsetDateTime};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    dt.format(format_description!(
        "[day].[month].[year] - [hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| dt.to_string())
}

/// Microseconds from `earlier` to `later` in the wrapping 32-bit tick space.
pub fn tick_diff(earlier: u32, later: u32) -> u32 {
    later.wrapping_sub(earlier)
}

/// Truncate a CLOCK_MONOTONIC nanosecond stamp to a wrapping microsecond tick.
///
/// Ticks wrap roughly every 71.6 minutes, so they must only ever be compared
/// through [`tick_diff`].
pub fn nanos_to_ticks(nanos: u64) -> u32 {
    (nanos / 1_000) as u32
}

/// CLOCK_MONOTONIC in nanoseconds, the clock kernel GPIO line events are stamped with.
pub fn monotonic_ns() -> Option<u64> {
    let mut now = MaybeUninit::<libc::timespec>::uninit();
    // SAFETY: clock_gettime only writes the timespec, which is read back only on success.
    let now = unsafe {
        if libc::clock_gettime(libc::CLOCK_MONOTONIC, now.as_mut_ptr()) != 0 {
            return None;
        }
        now.assume_init()
    };
    Some((now.tv_sec as u64) * 1_000_000_000 + now.tv_nsec as u64)
}

/// Current CLOCK_MONOTONIC time as a wrapping microsecond tick, comparable
/// with the timestamps of kernel edge events.
pub fn monotonic_us() -> u32 {
    monotonic_ns().map_or(0, nanos_to_ticks)
}
