//! Second-resolution timestamps used throughout the miIO protocol
//!
//! miIO packets carry 32-bit second counters (device uptime on the wire,
//! UNIX time on the host side). `TimeStamp` keeps that width explicit instead
//! of scattering `u32` casts through the codec and the device state.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds-since-epoch (or seconds-of-uptime) value, 32-bit like the wire format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeStamp(u32);

impl TimeStamp {
    pub const ZERO: TimeStamp = TimeStamp(0);

    /// Current wall-clock time as UNIX seconds
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        TimeStamp(secs as u32)
    }

    pub const fn from_secs(secs: u32) -> Self {
        TimeStamp(secs)
    }

    pub const fn secs(self) -> u32 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Unsigned absolute difference between two timestamps
    pub fn diff(a: TimeStamp, b: TimeStamp) -> TimeStamp {
        if a.0 > b.0 {
            TimeStamp(a.0 - b.0)
        } else {
            TimeStamp(b.0 - a.0)
        }
    }

    pub const fn saturating_sub(self, rhs: TimeStamp) -> TimeStamp {
        TimeStamp(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for TimeStamp {
    /// Renders as an elapsed duration (`1h2m3s`), matching how the stamps
    /// appear in device logs: they count seconds, not calendar time.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = self.0 / 3600;
        let minutes = (self.0 % 3600) / 60;
        let seconds = self.0 % 60;
        if hours > 0 {
            write!(f, "{}h{}m{}s", hours, minutes, seconds)
        } else if minutes > 0 {
            write!(f, "{}m{}s", minutes, seconds)
        } else {
            write!(f, "{}s", seconds)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_is_symmetric() {
        let a = TimeStamp::from_secs(100);
        let b = TimeStamp::from_secs(90);
        assert_eq!(TimeStamp::diff(a, b), TimeStamp::from_secs(10));
        assert_eq!(TimeStamp::diff(b, a), TimeStamp::from_secs(10));
        assert_eq!(TimeStamp::diff(a, a), TimeStamp::ZERO);
    }

    #[test]
    fn test_now_is_nonzero() {
        assert!(!TimeStamp::now().is_zero());
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(TimeStamp::from_secs(7).to_string(), "7s");
        assert_eq!(TimeStamp::from_secs(65).to_string(), "1m5s");
        assert_eq!(TimeStamp::from_secs(3600 + 120 + 3).to_string(), "1h2m3s");
        // 0x00061e39 = 111h22m33s, the stamp used by the codec test vectors
        assert_eq!(TimeStamp::from_secs(0x0006_1e39).to_string(), "111h22m33s");
    }

    #[test]
    fn test_saturating_sub() {
        let a = TimeStamp::from_secs(5);
        let b = TimeStamp::from_secs(8);
        assert_eq!(b.saturating_sub(a), TimeStamp::from_secs(3));
        assert_eq!(a.saturating_sub(b), TimeStamp::ZERO);
    }
}
