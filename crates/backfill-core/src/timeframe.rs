//! Bar timeframe definitions.
//!
//! This module defines [`Timeframe`], the fixed set of bar granularities the engine
//! maintains. Each timeframe has a step and is either intraday (slotted inside a
//! trading session) or end-of-day.

use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::BackfillError;

/// Granularity of a bar series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    /// Fifteen-minute bars.
    #[serde(rename = "15m")]
    M15,
    /// Hourly bars.
    #[serde(rename = "1h")]
    H1,
    /// Four-hour bars.
    #[serde(rename = "4h")]
    H4,
    /// Daily bars.
    #[serde(rename = "1d")]
    D1,
    /// Weekly bars.
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    /// Every supported timeframe, finest first.
    pub const ALL: [Self; 5] = [Self::M15, Self::H1, Self::H4, Self::D1, Self::W1];

    /// Returns the canonical string form used in storage and configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    /// Returns true for timeframes slotted inside a trading session.
    #[must_use]
    pub const fn is_intraday(&self) -> bool {
        matches!(self, Self::M15 | Self::H1 | Self::H4)
    }

    /// Returns the length of one bar.
    #[must_use]
    pub fn step(&self) -> Duration {
        match self {
            Self::M15 => Duration::minutes(15),
            Self::H1 => Duration::hours(1),
            Self::H4 => Duration::hours(4),
            Self::D1 => Duration::days(1),
            Self::W1 => Duration::weeks(1),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "15m" | "m15" | "15min" => Ok(Self::M15),
            "1h" | "h1" | "60m" | "hourly" => Ok(Self::H1),
            "4h" | "h4" => Ok(Self::H4),
            "1d" | "d1" | "day" | "daily" => Ok(Self::D1),
            "1w" | "w1" | "week" | "weekly" => Ok(Self::W1),
            other => Err(BackfillError::InvalidParameter(format!(
                "Unknown timeframe: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("daily".parse::<Timeframe>().unwrap(), Timeframe::D1);
        assert_eq!("M15".parse::<Timeframe>().unwrap(), Timeframe::M15);
        assert_eq!("weekly".parse::<Timeframe>().unwrap(), Timeframe::W1);
        assert!("2h".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_round_trip_str() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
    }

    #[test]
    fn test_intraday() {
        assert!(Timeframe::H4.is_intraday());
        assert!(!Timeframe::D1.is_intraday());
        assert_eq!(Timeframe::H4.step(), Duration::hours(4));
    }
}
