//! Calendar and clock values in MySQL's own ranges.
//!
//! MySQL allows "zero" dates (`0000-00-00`) and TIME values outside a
//! single day (`-838:59:59` to `838:59:59`), so these are plain field
//! structs rather than wrappers around a calendar library.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, TypeError};

/// A DATE value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

/// A TIME value, which is a signed duration up to 838 hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Time {
    pub negative: bool,
    pub hours: u32,
    pub minutes: u8,
    pub seconds: u8,
    pub microseconds: u32,
}

/// A DATETIME or TIMESTAMP value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: u32,
}

impl Date {
    pub const fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }

    /// `0000-00-00`, which MySQL uses for "no date" in non-strict modes.
    pub const fn is_zero(&self) -> bool {
        self.year == 0 && self.month == 0 && self.day == 0
    }

    /// Midnight on this date.
    pub const fn and_midnight(self) -> DateTime {
        DateTime {
            year: self.year,
            month: self.month,
            day: self.day,
            hour: 0,
            minute: 0,
            second: 0,
            microsecond: 0,
        }
    }
}

impl Time {
    pub const fn new(hours: u32, minutes: u8, seconds: u8) -> Self {
        Self {
            negative: false,
            hours,
            minutes,
            seconds,
            microseconds: 0,
        }
    }

    pub const fn with_micros(mut self, microseconds: u32) -> Self {
        self.microseconds = microseconds;
        self
    }

    pub const fn negated(mut self) -> Self {
        self.negative = !self.negative;
        self
    }

    /// Total length in microseconds, negative for negative times.
    pub fn total_micros(&self) -> i64 {
        let secs = i64::from(self.hours) * 3600
            + i64::from(self.minutes) * 60
            + i64::from(self.seconds);
        let micros = secs * 1_000_000 + i64::from(self.microseconds);
        if self.negative { -micros } else { micros }
    }
}

impl DateTime {
    pub const fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
            microsecond: 0,
        }
    }

    pub const fn with_micros(mut self, microsecond: u32) -> Self {
        self.microsecond = microsecond;
        self
    }

    pub const fn date(&self) -> Date {
        Date {
            year: self.year,
            month: self.month,
            day: self.day,
        }
    }

    /// Time of day, always non-negative.
    pub const fn time(&self) -> Time {
        Time {
            negative: false,
            hours: self.hour as u32,
            minutes: self.minute,
            seconds: self.second,
            microseconds: self.microsecond,
        }
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }
        write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)?;
        if self.microseconds != 0 {
            write!(f, ".{:06}", self.microseconds)?;
        }
        Ok(())
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )?;
        if self.microsecond != 0 {
            write!(f, ".{:06}", self.microsecond)?;
        }
        Ok(())
    }
}

fn parse_error(expected: &'static str, input: &str) -> Error {
    Error::Type(TypeError {
        expected,
        actual: format!("'{}'", input),
        column: None,
        rust_type: None,
    })
}

fn parse_num<T: FromStr>(part: &str, expected: &'static str, input: &str) -> Result<T, Error> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(parse_error(expected, input));
    }
    part.parse().map_err(|_| parse_error(expected, input))
}

/// Parse up to six fractional digits, right-padded to microseconds.
fn parse_fraction(frac: &str, expected: &'static str, input: &str) -> Result<u32, Error> {
    if frac.is_empty() || frac.len() > 6 {
        return Err(parse_error(expected, input));
    }
    let digits: u32 = parse_num(frac, expected, input)?;
    Ok(digits * 10u32.pow(6 - frac.len() as u32))
}

fn split_fraction<'a>(
    s: &'a str,
    expected: &'static str,
    input: &str,
) -> Result<(&'a str, u32), Error> {
    match s.split_once('.') {
        Some((whole, frac)) => Ok((whole, parse_fraction(frac, expected, input)?)),
        None => Ok((s, 0)),
    }
}

impl FromStr for Date {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '-');
        let (Some(y), Some(m), Some(d)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(parse_error("DATE", s));
        };
        let date = Date {
            year: parse_num(y, "DATE", s)?,
            month: parse_num(m, "DATE", s)?,
            day: parse_num(d, "DATE", s)?,
        };
        if date.month > 12 || date.day > 31 {
            return Err(parse_error("DATE", s));
        }
        Ok(date)
    }
}

impl FromStr for Time {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (negative, rest) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (clock, microseconds) = split_fraction(rest, "TIME", s)?;
        let mut parts = clock.splitn(3, ':');
        let (Some(h), Some(m), Some(sec)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(parse_error("TIME", s));
        };
        let time = Time {
            negative,
            hours: parse_num(h, "TIME", s)?,
            minutes: parse_num(m, "TIME", s)?,
            seconds: parse_num(sec, "TIME", s)?,
            microseconds,
        };
        if time.minutes > 59 || time.seconds > 59 {
            return Err(parse_error("TIME", s));
        }
        Ok(time)
    }
}

impl FromStr for DateTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((date_part, time_part)) = s.split_once([' ', 'T']) else {
            return s.parse::<Date>().map(Date::and_midnight);
        };
        let date: Date = date_part.parse().map_err(|_| parse_error("DATETIME", s))?;
        let time: Time = time_part.parse().map_err(|_| parse_error("DATETIME", s))?;
        if time.negative || time.hours > 23 {
            return Err(parse_error("DATETIME", s));
        }
        Ok(DateTime {
            year: date.year,
            month: date.month,
            day: date.day,
            hour: time.hours as u8,
            minute: time.minutes,
            second: time.seconds,
            microsecond: time.microseconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_display_and_parse() {
        let d: Date = "2024-02-29".parse().unwrap();
        assert_eq!(d, Date::new(2024, 2, 29));
        assert_eq!(d.to_string(), "2024-02-29");

        let zero: Date = "0000-00-00".parse().unwrap();
        assert!(zero.is_zero());

        assert!("2024-13-01".parse::<Date>().is_err());
        assert!("2024-1".parse::<Date>().is_err());
        assert!("20x4-01-01".parse::<Date>().is_err());
    }

    #[test]
    fn time_beyond_one_day_and_negative() {
        let t: Time = "-838:59:59".parse().unwrap();
        assert!(t.negative);
        assert_eq!(t.hours, 838);
        assert_eq!(t.to_string(), "-838:59:59");
        assert_eq!(t.total_micros(), -(838 * 3600 + 59 * 60 + 59) * 1_000_000);

        let frac: Time = "01:02:03.5".parse().unwrap();
        assert_eq!(frac.microseconds, 500_000);
        assert_eq!(frac.to_string(), "01:02:03.500000");

        assert!("01:60:00".parse::<Time>().is_err());
        assert!("01:02:03.1234567".parse::<Time>().is_err());
    }

    #[test]
    fn datetime_parse_variants() {
        let dt: DateTime = "2023-07-01 12:34:56.000123".parse().unwrap();
        assert_eq!(dt, DateTime::new(2023, 7, 1, 12, 34, 56).with_micros(123));
        assert_eq!(dt.to_string(), "2023-07-01 12:34:56.000123");

        let iso: DateTime = "2023-07-01T00:00:01".parse().unwrap();
        assert_eq!(iso.second, 1);

        let date_only: DateTime = "2023-07-01".parse().unwrap();
        assert_eq!(date_only, Date::new(2023, 7, 1).and_midnight());

        assert!("2023-07-01 24:00:00".parse::<DateTime>().is_err());
    }
}
