//! Integer timekeeping for correlation scheduling.
//!
//! All scheduling arithmetic uses [`Time`], an instant counted in integer
//! ticks of a fixed reference rate since MJD 50000.0. The rate, 4096 ticks
//! per microsecond, is divided exactly by every power-of-two sample rate up
//! to 4.096 GHz and by the microsecond, so slice boundaries, sample indices
//! and integration grids never accumulate rounding error. Wall-clock
//! rendering is display-only.

use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Rem, Sub, SubAssign};

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Ticks per second of the reference clock.
pub const TICKS_PER_SEC: i64 = 4_096_000_000;

/// Ticks per microsecond.
pub const TICKS_PER_USEC: i64 = TICKS_PER_SEC / 1_000_000;

/// The MJD that tick 0 corresponds to.
pub const EPOCH_MJD: i64 = 50_000;

const SECS_PER_DAY: i64 = 86_400;

/// An instant on the reference clock.
///
/// Ordered, and exact: two instants derived from the same sample grid
/// compare equal iff they are the same sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Time {
    ticks: i64,
}

/// The difference between two [`Time`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeDelta {
    ticks: i64,
}

impl Time {
    /// The instant `seconds` (which may be fractional) into MJD day `mjd`.
    pub fn from_mjd_seconds(mjd: i64, seconds: f64) -> Self {
        let day_ticks = (mjd - EPOCH_MJD) * SECS_PER_DAY * TICKS_PER_SEC;
        Self {
            ticks: day_ticks + (seconds * TICKS_PER_SEC as f64).round() as i64,
        }
    }

    pub const fn from_ticks(ticks: i64) -> Self {
        Self { ticks }
    }

    pub const fn ticks(self) -> i64 {
        self.ticks
    }

    /// Parse a VEX-style date string, e.g. `2023y081d12h34m56.25s`.
    pub fn parse_vex(s: &str) -> Option<Self> {
        let (year, rest) = s.split_once('y')?;
        let (doy, rest) = rest.split_once('d')?;
        let (hour, rest) = rest.split_once('h')?;
        let (min, rest) = rest.split_once('m')?;
        let sec = rest.strip_suffix('s')?;
        let date = NaiveDate::from_yo_opt(year.parse().ok()?, doy.parse().ok()?)?;
        let mjd = date.num_days_from_ce() as i64 - 678_576;
        let seconds = hour.parse::<i64>().ok()? * 3600 + min.parse::<i64>().ok()? * 60;
        Some(Self::from_mjd_seconds(mjd, seconds as f64 + sec.parse::<f64>().ok()?))
    }

    /// Modified Julian Day number of the day containing this instant.
    pub fn mjd(self) -> i64 {
        EPOCH_MJD + self.ticks.div_euclid(SECS_PER_DAY * TICKS_PER_SEC)
    }

    /// Seconds since midnight of the MJD day, as a float (display only).
    pub fn seconds_of_day(self) -> f64 {
        self.ticks.rem_euclid(SECS_PER_DAY * TICKS_PER_SEC) as f64 / TICKS_PER_SEC as f64
    }

    /// (year, day-of-year) of the day containing this instant.
    pub fn year_day(self) -> (i32, u32) {
        let date = self.naive_datetime().date();
        (date.year(), date.ordinal())
    }

    /// Sample index of this instant on a grid of `sample_rate` Hz anchored
    /// at `origin`. Exact for rates dividing the reference rate.
    pub fn samples_since(self, origin: Time, sample_rate: u64) -> i64 {
        let ticks_per_sample = TICKS_PER_SEC / sample_rate as i64;
        (self.ticks - origin.ticks) / ticks_per_sample
    }

    fn naive_datetime(self) -> NaiveDateTime {
        let days = self.ticks.div_euclid(SECS_PER_DAY * TICKS_PER_SEC);
        let rem = self.ticks.rem_euclid(SECS_PER_DAY * TICKS_PER_SEC);
        let date = NaiveDate::from_num_days_from_ce_opt((EPOCH_MJD + days + 678_576) as i32)
            .expect("time outside calendar range");
        let secs = rem / TICKS_PER_SEC;
        let nanos = ((rem % TICKS_PER_SEC) as f64 / TICKS_PER_SEC as f64 * 1e9) as u32;
        date.and_hms_nano_opt(
            (secs / 3600) as u32,
            ((secs / 60) % 60) as u32,
            (secs % 60) as u32,
            nanos,
        )
        .expect("invalid time of day")
    }

    /// Human-readable VEX-style date string.
    pub fn date_string(self) -> String {
        let dt = self.naive_datetime();
        format!(
            "{:04}y{:03}d{:02}h{:02}m{:06.3}s",
            dt.year(),
            dt.ordinal(),
            dt.hour(),
            dt.minute(),
            dt.second() as f64 + dt.nanosecond() as f64 * 1e-9,
        )
    }
}

impl TimeDelta {
    pub const fn from_ticks(ticks: i64) -> Self {
        Self { ticks }
    }

    pub fn from_usec(usec: i64) -> Self {
        Self { ticks: usec * TICKS_PER_USEC }
    }

    pub fn from_seconds(seconds: f64) -> Self {
        Self {
            ticks: (seconds * TICKS_PER_SEC as f64).round() as i64,
        }
    }

    /// The span of `n` samples at `sample_rate` Hz.
    pub fn from_samples(n: i64, sample_rate: u64) -> Self {
        Self {
            ticks: n * (TICKS_PER_SEC / sample_rate as i64),
        }
    }

    pub const fn ticks(self) -> i64 {
        self.ticks
    }

    pub const fn is_zero(self) -> bool {
        self.ticks == 0
    }

    pub fn as_seconds(self) -> f64 {
        self.ticks as f64 / TICKS_PER_SEC as f64
    }

    pub fn as_usec(self) -> i64 {
        self.ticks / TICKS_PER_USEC
    }

    /// Number of whole samples at `sample_rate` Hz spanned by this delta.
    pub fn samples(self, sample_rate: u64) -> i64 {
        self.ticks / (TICKS_PER_SEC / sample_rate as i64)
    }

    /// Integer division of two deltas, rounding towards negative infinity.
    pub fn div_floor(self, other: TimeDelta) -> i64 {
        self.ticks.div_euclid(other.ticks)
    }
}

impl Add<TimeDelta> for Time {
    type Output = Time;
    fn add(self, rhs: TimeDelta) -> Time {
        Time { ticks: self.ticks + rhs.ticks }
    }
}

impl AddAssign<TimeDelta> for Time {
    fn add_assign(&mut self, rhs: TimeDelta) {
        self.ticks += rhs.ticks;
    }
}

impl Sub<TimeDelta> for Time {
    type Output = Time;
    fn sub(self, rhs: TimeDelta) -> Time {
        Time { ticks: self.ticks - rhs.ticks }
    }
}

impl SubAssign<TimeDelta> for Time {
    fn sub_assign(&mut self, rhs: TimeDelta) {
        self.ticks -= rhs.ticks;
    }
}

impl Sub for Time {
    type Output = TimeDelta;
    fn sub(self, rhs: Time) -> TimeDelta {
        TimeDelta { ticks: self.ticks - rhs.ticks }
    }
}

impl Rem<TimeDelta> for TimeDelta {
    type Output = TimeDelta;
    fn rem(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta { ticks: self.ticks.rem_euclid(rhs.ticks) }
    }
}

impl Add for TimeDelta {
    type Output = TimeDelta;
    fn add(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta { ticks: self.ticks + rhs.ticks }
    }
}

impl Sub for TimeDelta {
    type Output = TimeDelta;
    fn sub(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta { ticks: self.ticks - rhs.ticks }
    }
}

impl Neg for TimeDelta {
    type Output = TimeDelta;
    fn neg(self) -> TimeDelta {
        TimeDelta { ticks: -self.ticks }
    }
}

impl Mul<i64> for TimeDelta {
    type Output = TimeDelta;
    fn mul(self, rhs: i64) -> TimeDelta {
        TimeDelta { ticks: self.ticks * rhs }
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.date_string())
    }
}

impl fmt::Display for TimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}s", self.as_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_tick_rate_divides_common_sample_rates() {
        for rate in [2_000_000u64, 4_000_000, 8_000_000, 16_000_000, 32_000_000, 64_000_000] {
            assert_eq!(TICKS_PER_SEC % rate as i64, 0, "rate {rate}");
        }
    }

    #[test]
    fn test_integration_grid_is_exact() {
        let start = Time::from_mjd_seconds(57203, 3600.0);
        let integr = TimeDelta::from_usec(1_000_000);
        let t = start + integr * 7;
        assert_eq!((t - start).div_floor(integr), 7);
        assert!(((t - start) % integr).is_zero());
    }

    #[test]
    fn test_samples_since_round_trips() {
        let origin = Time::from_mjd_seconds(57203, 0.0);
        let t = origin + TimeDelta::from_samples(12_345, 32_000_000);
        assert_eq!(t.samples_since(origin, 32_000_000), 12_345);
    }

    #[test]
    fn test_date_string() {
        // MJD 57203 is 2015-06-30.
        let t = Time::from_mjd_seconds(57203, 12.0 * 3600.0 + 34.0 * 60.0 + 56.25);
        assert_eq!(t.date_string(), "2015y181d12h34m56.250s");
        assert_eq!(t.mjd(), 57203);
        assert_eq!(t.year_day(), (2015, 181));
    }

    #[test]
    fn test_parse_vex_round_trips() {
        let t = Time::parse_vex("2015y181d12h34m56.250s").unwrap();
        assert_eq!(t.date_string(), "2015y181d12h34m56.250s");
        assert!(Time::parse_vex("not a date").is_none());
    }

    #[test]
    fn test_seconds_of_day() {
        let t = Time::from_mjd_seconds(57203, 61.5);
        assert_abs_diff_eq!(t.seconds_of_day(), 61.5);
    }

    #[test]
    fn test_delta_ordering_and_negation() {
        let a = TimeDelta::from_usec(250);
        let b = TimeDelta::from_usec(1000);
        assert!(a < b);
        assert_eq!(-(b - a), a - b);
        assert_eq!((b - a).as_usec(), 750);
    }
}
