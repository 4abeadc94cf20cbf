use std::{fmt, str::FromStr};

use chrono::Weekday;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::astro::SunMinutes;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Largest sunrise/sunset offset accepted, in minutes either way.
pub const MAX_SUN_OFFSET_MINUTES: i16 = 12 * 60;

/// Largest fuzz half-width accepted.
pub const MAX_FUZZ_MINUTES: u16 = 2 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeFormatError {
    #[error("invalid clock time `{0}` (expected HH:MM)")]
    InvalidClockTime(String),
    #[error("invalid trigger `{0}` (expected HH:MM, sunrise[+/-N] or sunset[+/-N])")]
    InvalidTrigger(String),
    #[error("sun offset {0} is outside ±720 minutes")]
    OffsetOutOfRange(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Applicability {
    #[default]
    Daily,
    Weekday,
    Weekend,
}

impl Applicability {
    pub fn applies_on(self, weekday: Weekday) -> bool {
        let weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
        match self {
            Self::Daily => true,
            Self::Weekday => !weekend,
            Self::Weekend => weekend,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekday => "weekday",
            Self::Weekend => "weekend",
        }
    }
}

impl FromStr for Applicability {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekday" | "weekdays" => Ok(Self::Weekday),
            "weekend" | "weekends" => Ok(Self::Weekend),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SunEvent {
    Sunrise,
    Sunset,
}

impl SunEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sunrise => "sunrise",
            Self::Sunset => "sunset",
        }
    }

    fn minute(self, sun: &SunMinutes) -> u16 {
        match self {
            Self::Sunrise => sun.sunrise,
            Self::Sunset => sun.sunset,
        }
    }
}

/// When one edge of a cycle fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Trigger {
    Clock {
        minute: u16,
    },
    Sun {
        event: SunEvent,
        #[serde(rename = "offsetMinutes")]
        offset_minutes: i16,
    },
}

impl Default for Trigger {
    fn default() -> Self {
        Self::Clock { minute: 0 }
    }
}

impl Trigger {
    /// Minute-of-day this trigger lands on today, before fuzz.
    ///
    /// Sun triggers need today's sun times; without them they have no
    /// minute.
    pub fn base_minute(&self, sun: Option<&SunMinutes>) -> Option<u16> {
        match *self {
            Self::Clock { minute } => Some(minute % MINUTES_PER_DAY),
            Self::Sun {
                event,
                offset_minutes,
            } => {
                let event_minute = event.minute(sun?);
                Some(wrap_minute(i32::from(event_minute) + i32::from(offset_minutes)))
            }
        }
    }

    pub fn is_sun_relative(&self) -> bool {
        matches!(self, Self::Sun { .. })
    }

    pub fn sanitize(&mut self) {
        match self {
            Self::Clock { minute } => *minute %= MINUTES_PER_DAY,
            Self::Sun { offset_minutes, .. } => {
                *offset_minutes =
                    (*offset_minutes).clamp(-MAX_SUN_OFFSET_MINUTES, MAX_SUN_OFFSET_MINUTES);
            }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Clock { minute } => f.write_str(&format_clock_time(minute)),
            Self::Sun {
                event,
                offset_minutes: 0,
            } => f.write_str(event.as_str()),
            Self::Sun {
                event,
                offset_minutes,
            } => write!(f, "{}{:+}", event.as_str(), offset_minutes),
        }
    }
}

impl FromStr for Trigger {
    type Err = TimeFormatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let lower = trimmed.to_ascii_lowercase();

        for event in [SunEvent::Sunrise, SunEvent::Sunset] {
            let Some(rest) = lower.strip_prefix(event.as_str()) else {
                continue;
            };
            let rest = rest.trim();
            if rest.is_empty() {
                return Ok(Self::Sun {
                    event,
                    offset_minutes: 0,
                });
            }

            let (sign, digits) = if let Some(digits) = rest.strip_prefix('+') {
                (1, digits.trim())
            } else if let Some(digits) = rest.strip_prefix('-') {
                (-1, digits.trim())
            } else {
                return Err(TimeFormatError::InvalidTrigger(trimmed.to_string()));
            };
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) || digits.len() > 4
            {
                return Err(TimeFormatError::InvalidTrigger(trimmed.to_string()));
            }
            let magnitude: i32 = digits
                .parse()
                .map_err(|_| TimeFormatError::InvalidTrigger(trimmed.to_string()))?;
            let offset = sign * magnitude;
            if offset.abs() > i32::from(MAX_SUN_OFFSET_MINUTES) {
                return Err(TimeFormatError::OffsetOutOfRange(offset));
            }
            return Ok(Self::Sun {
                event,
                offset_minutes: offset as i16,
            });
        }

        parse_clock_time(trimmed)
            .map(|minute| Self::Clock { minute })
            .map_err(|_| TimeFormatError::InvalidTrigger(trimmed.to_string()))
    }
}

/// One configurable on/off rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cycle {
    pub enabled: bool,
    #[serde(rename = "days")]
    pub applicability: Applicability,
    pub on: Trigger,
    pub off: Trigger,
    #[serde(rename = "fuzzMinutes")]
    pub fuzz_minutes: u16,
}

impl Cycle {
    pub fn sanitize(&mut self) {
        self.on.sanitize();
        self.off.sanitize();
        self.fuzz_minutes = self.fuzz_minutes.min(MAX_FUZZ_MINUTES);
    }

    pub fn uses_sun(&self) -> bool {
        self.on.is_sun_relative() || self.off.is_sun_relative()
    }
}

/// Parse `H:MM` or `HH:MM` (24-hour) into minute-of-day.
pub fn parse_clock_time(value: &str) -> Result<u16, TimeFormatError> {
    let invalid = || TimeFormatError::InvalidClockTime(value.to_string());

    let (hours, minutes) = value.trim().split_once(':').ok_or_else(invalid)?;
    let digits_ok = |part: &str, max_len: usize| {
        !part.is_empty() && part.len() <= max_len && part.bytes().all(|b| b.is_ascii_digit())
    };
    if !digits_ok(hours, 2) || !digits_ok(minutes, 2) || minutes.len() != 2 {
        return Err(invalid());
    }

    let hours: u16 = hours.parse().map_err(|_| invalid())?;
    let minutes: u16 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }

    Ok(hours * 60 + minutes)
}

pub fn format_clock_time(minute_of_day: u16) -> String {
    let minute_of_day = minute_of_day % MINUTES_PER_DAY;
    format!("{:02}:{:02}", minute_of_day / 60, minute_of_day % 60)
}

fn wrap_minute(minute: i32) -> u16 {
    minute.rem_euclid(i32::from(MINUTES_PER_DAY)) as u16
}
