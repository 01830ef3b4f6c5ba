use std::{
    fmt,
    time::Duration,
};

use number_prefix::NumberPrefix;

/// A byte count in base 2 units.
#[derive(Debug)]
pub struct BinarySize(pub u64);

impl fmt::Display for BinarySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NumberPrefix::binary(self.0 as f64) {
            NumberPrefix::Standalone(n) => write!(f, "{n:.0}B"),
            NumberPrefix::Prefixed(prefix, n) => write!(f, "{n:.2}{prefix}B"),
        }
    }
}

/// Elapsed time as `hh:mm:ss`. Hours are not wrapped.
#[derive(Debug)]
pub struct ClockDuration(pub Duration);

impl fmt::Display for ClockDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        write!(f, "{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
    }
}

/// Remaining time in its two most significant units, eg. `1h 5m` or `42s`.
#[derive(Debug)]
pub struct Eta(pub Duration);

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        let units = [(secs / 86400, "d"), (secs / 3600 % 24, "h"), (secs / 60 % 60, "m"), (secs % 60, "s")];

        let mut parts = units.iter()
            .skip_while(|(v, _)| *v == 0)
            .take(2)
            .peekable();

        if parts.peek().is_none() {
            return f.write_str("0s");
        }

        let mut first = true;
        for (value, unit) in parts {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{value}{unit}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_size() {
        assert_eq!(BinarySize(0).to_string(), "0B");
        assert_eq!(BinarySize(1023).to_string(), "1023B");
        assert_eq!(BinarySize(1536).to_string(), "1.50KiB");
        assert_eq!(BinarySize(5669940496).to_string(), "5.28GiB");
    }

    #[test]
    fn test_clock_duration() {
        assert_eq!(ClockDuration(Duration::ZERO).to_string(), "00:00:00");
        assert_eq!(ClockDuration(Duration::from_millis(61_999)).to_string(), "00:01:01");
        assert_eq!(ClockDuration(Duration::from_secs(100 * 3600 + 5)).to_string(), "100:00:05");
    }

    #[test]
    fn test_eta() {
        assert_eq!(Eta(Duration::ZERO).to_string(), "0s");
        assert_eq!(Eta(Duration::from_secs(42)).to_string(), "42s");
        assert_eq!(Eta(Duration::from_secs(3900)).to_string(), "1h 5m");
        // Zero units in the middle are kept
        assert_eq!(Eta(Duration::from_secs(3605)).to_string(), "1h 0m");
        assert_eq!(Eta(Duration::from_secs(2 * 86400 + 7200)).to_string(), "2d 2h");
    }
}
