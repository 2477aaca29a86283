//! Funding settlement window detection.

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};

const MINUTES_PER_DAY: i64 = 1440;

/// Parse "HH:MM" into minutes since midnight.
pub fn parse_settlement_time(raw: &str) -> Result<u32> {
    let (hours, minutes) = raw
        .trim()
        .split_once(':')
        .context("expected HH:MM")?;
    let hours: u32 = hours.parse().context("invalid hour")?;
    let minutes: u32 = minutes.parse().context("invalid minute")?;
    anyhow::ensure!(hours < 24 && minutes < 60, "time out of range");
    Ok(hours * 60 + minutes)
}

/// Settlement schedule with a pre-settlement window.
#[derive(Debug, Clone)]
pub struct SettlementWindow {
    settlements: Vec<u32>,
    window_minutes: u32,
}

impl SettlementWindow {
    /// Build from configured "HH:MM" strings.
    pub fn new(times: &[String], window_minutes: u32) -> Result<Self> {
        let settlements = times
            .iter()
            .map(|t| parse_settlement_time(t).with_context(|| format!("settlement time '{}'", t)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            settlements,
            window_minutes,
        })
    }

    /// True if `minute_of_day` is within the window of any settlement,
    /// measured circularly around midnight.
    pub fn is_near_minute(&self, minute_of_day: u32) -> bool {
        let now = i64::from(minute_of_day);
        self.settlements.iter().any(|settlement| {
            let delta = (now - i64::from(*settlement)).abs();
            delta.min(MINUTES_PER_DAY - delta) <= i64::from(self.window_minutes)
        })
    }

    pub fn is_near(&self, now: DateTime<Utc>) -> bool {
        self.is_near_minute(now.hour() * 60 + now.minute())
    }
}
