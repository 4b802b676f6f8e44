//! # Expected Activity Windows
//!
//! Inactivity alarms only make sense while a meter is expected to
//! transmit: an office-building heat meter may be silent over the
//! weekend. The window pattern is a compact cron-like form,
//! `mon-fri(08-17),sat(10-12)`: day ranges with hour ranges in
//! parentheses, comma separated. Hours are inclusive on both ends.

use crate::error::GatewayError;
use chrono::{DateTime, Datelike, Local, Timelike, Weekday};

/// Default window: always expected.
pub const ALWAYS: &str = "mon-sun(00-23)";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Span {
    /// Days, monday = 0.
    day_from: u8,
    day_to: u8,
    hour_from: u8,
    hour_to: u8,
}

/// A parsed expected-activity pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityWindow {
    pattern: String,
    spans: Vec<Span>,
}

fn day_index(name: &str) -> Option<u8> {
    match name {
        "mon" => Some(0),
        "tue" => Some(1),
        "wed" => Some(2),
        "thu" => Some(3),
        "fri" => Some(4),
        "sat" => Some(5),
        "sun" => Some(6),
        _ => None,
    }
}

impl ActivityWindow {
    /// Parse a pattern like `mon-sun(00-23)`.
    pub fn parse(pattern: &str) -> Result<Self, GatewayError> {
        let bad = |why: &str| {
            GatewayError::ConfigInvalid(format!("bad activity pattern \"{pattern}\": {why}"))
        };

        let mut spans = Vec::new();
        for part in pattern.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let open = part.find('(').ok_or_else(|| bad("missing hour range"))?;
            if !part.ends_with(')') {
                return Err(bad("missing closing parenthesis"));
            }
            let days = &part[..open];
            let hours = &part[open + 1..part.len() - 1];

            let (day_from, day_to) = match days.split_once('-') {
                Some((a, b)) => (
                    day_index(a).ok_or_else(|| bad("unknown day"))?,
                    day_index(b).ok_or_else(|| bad("unknown day"))?,
                ),
                None => {
                    let d = day_index(days).ok_or_else(|| bad("unknown day"))?;
                    (d, d)
                }
            };

            let (hour_from, hour_to) = hours
                .split_once('-')
                .ok_or_else(|| bad("hour range must be hh-hh"))?;
            let hour_from: u8 = hour_from.parse().map_err(|_| bad("bad hour"))?;
            let hour_to: u8 = hour_to.parse().map_err(|_| bad("bad hour"))?;
            if hour_from > 23 || hour_to > 23 || day_from > day_to || hour_from > hour_to {
                return Err(bad("range out of order"));
            }

            spans.push(Span {
                day_from,
                day_to,
                hour_from,
                hour_to,
            });
        }

        if spans.is_empty() {
            return Err(bad("empty pattern"));
        }

        Ok(ActivityWindow {
            pattern: pattern.to_string(),
            spans,
        })
    }

    /// The always-on window.
    pub fn always() -> Self {
        ActivityWindow::parse(ALWAYS).expect("static pattern parses")
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Is `when` inside the expected activity window?
    pub fn contains(&self, when: DateTime<Local>) -> bool {
        let day = match when.weekday() {
            Weekday::Mon => 0u8,
            Weekday::Tue => 1,
            Weekday::Wed => 2,
            Weekday::Thu => 3,
            Weekday::Fri => 4,
            Weekday::Sat => 5,
            Weekday::Sun => 6,
        };
        let hour = when.hour() as u8;
        self.spans.iter().any(|s| {
            day >= s.day_from && day <= s.day_to && hour >= s.hour_from && hour <= s.hour_to
        })
    }
}

impl Default for ActivityWindow {
    fn default() -> Self {
        ActivityWindow::always()
    }
}
