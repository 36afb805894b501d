//! Engine configuration.
//!
//! The configuration file parser lives upstream; it hands the engine a
//! deserialized `[general]` table. Reload goes through
//! [`CdrEngine::reload`](crate::CdrEngine::reload) with a fresh value.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

/// Upper bound on the batch size trigger.
pub const MAX_BATCH_SIZE: u32 = 1000;
/// Upper bound on the batch time trigger, in seconds.
pub const MAX_BATCH_TIME: u32 = 86_400;
/// Default batch size trigger.
pub const DEFAULT_BATCH_SIZE: u32 = 100;
/// Default batch time trigger, in seconds.
pub const DEFAULT_BATCH_TIME: u32 = 300;

/// Call detail record engine settings, keys as in the `[general]` section of
/// the configuration source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdrConfig {
  /// Master switch. When off, inbound events are dropped and no records are
  /// produced.
  pub enable: bool,
  /// Verbose per-event tracing of the state machine.
  pub debug: bool,
  /// Also emit records whose disposition never reached ANSWERED.
  pub unanswered: bool,
  /// Report CONGESTION as its own disposition instead of folding it into
  /// FAILED.
  pub congestion: bool,
  /// Freeze the end timestamp already on entering the finalized state, so
  /// that hangup-time dialplan execution observes final values.
  #[serde(rename = "endbeforehexten")]
  pub end_before_h_exten: bool,
  /// Round billsec up when the millisecond remainder is 500 or more.
  #[serde(rename = "initiatedseconds")]
  pub initiated_seconds: bool,
  /// Buffer finalized records and post them in batches instead of one by
  /// one.
  pub batch: bool,
  /// Queue length that triggers an immediate batch drain.
  pub size: u32,
  /// Seconds between scheduled batch drains.
  pub time: u32,
  /// Drain on the scheduler thread instead of spawning a posting thread per
  /// drain.
  #[serde(rename = "scheduleronly")]
  pub scheduler_only: bool,
  /// Drain pending batches synchronously on shutdown.
  #[serde(rename = "safeshutdown")]
  pub safe_shutdown: bool,
}

impl Default for CdrConfig {
  fn default() -> Self {
    CdrConfig {
      enable: true,
      debug: false,
      unanswered: false,
      congestion: false,
      end_before_h_exten: false,
      initiated_seconds: false,
      batch: false,
      size: DEFAULT_BATCH_SIZE,
      time: DEFAULT_BATCH_TIME,
      scheduler_only: false,
      safe_shutdown: true,
    }
  }
}

impl CdrConfig {
  /// Returns the configuration with out-of-range batch parameters replaced
  /// by their defaults. Bad values are logged, not fatal.
  pub fn validated(mut self) -> Self {
    if self.size > MAX_BATCH_SIZE {
      warn!(
        "Batch size {} exceeds the maximum of {}, using default {}",
        self.size, MAX_BATCH_SIZE, DEFAULT_BATCH_SIZE
      );
      self.size = DEFAULT_BATCH_SIZE;
    }
    if self.time == 0 || self.time > MAX_BATCH_TIME {
      warn!(
        "Batch time {} is outside 1..={}, using default {}",
        self.time, MAX_BATCH_TIME, DEFAULT_BATCH_TIME
      );
      self.time = DEFAULT_BATCH_TIME;
    }
    self
  }
}
