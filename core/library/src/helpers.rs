//! Various small helper functions

use std::num::ParseIntError;
use std::time::Duration;
use tokio::time::Instant;

/// Roughly 30 years, used in place of deadlines which do not fit into an [`Instant`]
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Parses a Duration from a string containing seconds.
/// Useful for command line parsing
pub fn parse_seconds(src: &str) -> Result<Duration, ParseIntError> {
    let seconds = src.parse::<u64>()?;
    Ok(Duration::from_secs(seconds))
}

/// Converts a duration into whole milliseconds as expected by AMQP queue arguments,
/// saturating at the largest value the protocol field can carry
pub fn duration_as_millis_u32(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Point in time at which a timeout starting now elapses
///
/// Timeouts too large to be represented are clamped to a point far in the future.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn parse_whole_seconds() {
        assert_eq!(parse_seconds("10800").unwrap(), Duration::from_secs(3 * 60 * 60));
        assert!(parse_seconds("ten").is_err());
        assert!(parse_seconds("-1").is_err());
    }

    #[test]
    fn saturate_millis() {
        assert_eq!(duration_as_millis_u32(Duration::from_secs(10)), 10_000);
        assert_eq!(
            duration_as_millis_u32(Duration::from_secs(u64::from(u32::MAX))),
            u32::MAX
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clamp_unrepresentable_deadlines() {
        let now = Instant::now();

        assert_eq!(deadline_after(Duration::from_secs(5)), now + Duration::from_secs(5));
        assert_eq!(deadline_after(Duration::MAX), now + FAR_FUTURE);
        assert_eq!(deadline_after(Duration::from_secs(u64::MAX)), now + FAR_FUTURE);
    }
}
