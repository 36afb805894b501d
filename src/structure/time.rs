use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MICROS_IN_SEC: i64 = 1_000_000;

/// Wall-clock instant with microsecond precision, as seconds and
/// microseconds since the Unix epoch.
///
/// Billing timestamps are interchanged as (seconds, microseconds) pairs, so
/// we keep that representation instead of an opaque duration type.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CdrTimestamp {
  sec: i64,
  usec: u32,
}

impl CdrTimestamp {
  pub fn new(sec: i64, usec: u32) -> Self {
    CdrTimestamp {
      sec: sec + i64::from(usec) / MICROS_IN_SEC,
      usec: usec % (MICROS_IN_SEC as u32),
    }
  }

  pub fn seconds(&self) -> i64 {
    self.sec
  }

  pub fn microseconds(&self) -> u32 {
    self.usec
  }

  pub fn as_micros(&self) -> i64 {
    self.sec * MICROS_IN_SEC + i64::from(self.usec)
  }

  /// Microseconds elapsed from `earlier` to `self`, clamped at zero.
  pub fn micros_since(&self, earlier: CdrTimestamp) -> i64 {
    (self.as_micros() - earlier.as_micros()).max(0)
  }

  /// Whole seconds elapsed from `earlier` to `self`, floored, clamped at
  /// zero.
  pub fn seconds_since(&self, earlier: CdrTimestamp) -> i64 {
    self.micros_since(earlier) / MICROS_IN_SEC
  }

  /// Renders as `seconds.microseconds`, the classic billing column format.
  pub fn as_column(&self) -> String {
    format!("{}.{:06}", self.sec, self.usec)
  }

  pub fn to_utc(&self) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(self.sec, self.usec * 1000)
  }
}

impl fmt::Display for CdrTimestamp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.to_utc() {
      Some(utc) => write!(f, "{}", utc.format("%Y-%m-%d %H:%M:%S%.6f")),
      None => write!(f, "{}", self.as_column()),
    }
  }
}

/// Source of record timestamps.
///
/// The engine stamps record start/answer/end with its clock, not with the
/// timestamps carried by upstream snapshots. Production uses [`SystemClock`];
/// tests substitute a manually advanced clock.
pub trait Clock: Send + Sync {
  fn now(&self) -> CdrTimestamp;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> CdrTimestamp {
    let utc = Utc::now();
    CdrTimestamp::new(utc.timestamp(), utc.timestamp_subsec_micros())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn microsecond_overflow_normalizes_into_seconds() {
    let ts = CdrTimestamp::new(10, 2_500_000);
    assert_eq!(ts.seconds(), 12);
    assert_eq!(ts.microseconds(), 500_000);
  }

  #[test]
  fn elapsed_time_is_floored_and_clamped() {
    let start = CdrTimestamp::new(100, 900_000);
    let end = CdrTimestamp::new(105, 200_000);
    assert_eq!(end.seconds_since(start), 4);
    assert_eq!(start.seconds_since(end), 0, "negative elapsed time must clamp to zero");
  }

  #[test]
  fn ordering_compares_seconds_then_microseconds() {
    let a = CdrTimestamp::new(5, 100);
    let b = CdrTimestamp::new(5, 200);
    let c = CdrTimestamp::new(6, 0);
    assert!(a < b);
    assert!(b < c);
  }

  #[test]
  fn column_format_pads_microseconds() {
    assert_eq!(CdrTimestamp::new(42, 7).as_column(), "42.000007");
  }

  #[test]
  fn system_clock_advances() {
    let clock = SystemClock;
    let a = clock.now();
    let b = clock.now();
    assert!(b >= a);
  }
}
