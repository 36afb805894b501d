use std::fmt;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::structure::channel::HangupCause;

/// Outcome classification of a call record.
///
/// The discriminants preserve the historical numeric values; the unanswered
/// post filter compares dispositions numerically against `Answered`, and
/// downstream databases store the raw numbers.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  FromPrimitive,
  Serialize_repr,
  Deserialize_repr,
  Default,
)]
#[repr(u32)]
pub enum Disposition {
  #[default]
  Null = 0,
  Failed = 1,
  Busy = 2,
  NoAnswer = 4,
  Answered = 8,
  Congestion = 16,
}

impl fmt::Display for Disposition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let text = match self {
      Disposition::Null => "NULL",
      Disposition::Failed => "FAILED",
      Disposition::Busy => "BUSY",
      Disposition::NoAnswer => "NO ANSWER",
      Disposition::Answered => "ANSWERED",
      Disposition::Congestion => "CONGESTION",
    };
    write!(f, "{text}")
  }
}

/// Maps a dial end status string onto a disposition. Unknown statuses
/// classify as failure. When congestion reporting is off, CONGESTION folds
/// into FAILED.
pub(crate) fn disposition_from_dial_status(status: &str, congestion_enabled: bool) -> Disposition {
  match status {
    "ANSWER" => Disposition::Answered,
    "BUSY" => Disposition::Busy,
    "CANCEL" | "NOANSWER" => Disposition::NoAnswer,
    "CONGESTION" => {
      if congestion_enabled {
        Disposition::Congestion
      } else {
        Disposition::Failed
      }
    }
    _ => Disposition::Failed,
  }
}

/// Maps a nonzero hangup cause code onto a disposition at finalization.
pub(crate) fn disposition_from_hangup_cause(cause: u32, congestion_enabled: bool) -> Disposition {
  match HangupCause::from_u32(cause) {
    Some(HangupCause::UserBusy) => Disposition::Busy,
    Some(HangupCause::NormalCircuitCongestion) | Some(HangupCause::SwitchCongestion) => {
      if congestion_enabled {
        Disposition::Congestion
      } else {
        Disposition::Failed
      }
    }
    Some(HangupCause::NoRouteDestination) | Some(HangupCause::SubscriberAbsent) => {
      Disposition::Failed
    }
    Some(HangupCause::NormalClearing) | Some(HangupCause::NoAnswer) => Disposition::NoAnswer,
    _ => Disposition::Failed,
  }
}
