use enumflags2::{bitflags, BitFlags};
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::structure::time::CdrTimestamp;

/// Lifecycle flags carried by a channel snapshot.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelFlag {
  /// The channel was masqueraded away and survives only to be reaped.
  Zombie = 0b001,
  /// The channel is the outbound leg of a call.
  Outgoing = 0b010,
  /// The channel was originated on its own instead of being dialed.
  Originated = 0b100,
}

/// Classic telephony channel states. Only `Up` is significant to record
/// keeping (answer detection); the rest are carried through for tracing.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize_repr, Deserialize_repr, Default,
)]
#[repr(u8)]
pub enum ChannelState {
  #[default]
  Down = 0,
  Reserved = 1,
  OffHook = 2,
  Dialing = 3,
  Ring = 4,
  Ringing = 5,
  Up = 6,
  Busy = 7,
  DialingOffHook = 8,
  PreRing = 9,
}

/// Automated Message Accounting categories for billing records.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize_repr, Deserialize_repr, Default,
)]
#[repr(u8)]
pub enum AmaFlags {
  Omit = 1,
  #[default]
  Billing = 2,
  Documentation = 3,
}

/// Q.931-style hangup cause codes that influence the record disposition.
/// Snapshots carry the raw integer; codes outside this set classify as
/// failure at finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum HangupCause {
  NotDefined = 0,
  NoRouteDestination = 3,
  NormalClearing = 16,
  UserBusy = 17,
  NoUserResponse = 18,
  NoAnswer = 19,
  SubscriberAbsent = 20,
  NormalCircuitCongestion = 34,
  SwitchCongestion = 42,
}

/// Point-in-time state of one channel, as published by the channel producer
/// upstream. Immutable once published; the engine holds shared references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
  /// Channel name, the unique chain key.
  pub name: String,
  /// Identifier of this channel.
  pub uniqueid: String,
  /// Call-wide identifier shared by related channels.
  pub linkedid: String,
  pub caller_name: String,
  pub caller_number: String,
  /// Dialed Number Identification Service value.
  pub caller_dnid: String,
  pub caller_subaddr: String,
  pub dialed_subaddr: String,
  /// Dialplan position.
  pub context: String,
  pub exten: String,
  pub priority: u32,
  /// Currently executing dialplan application and its argument.
  pub appl: String,
  pub data: String,
  pub accountcode: String,
  pub peeraccount: String,
  pub amaflags: AmaFlags,
  /// Raw hangup cause code; zero while the channel is alive.
  pub hangup_cause: u32,
  pub state: ChannelState,
  pub flags: BitFlags<ChannelFlag>,
  pub creation_time: CdrTimestamp,
}

impl ChannelSnapshot {
  pub fn is_up(&self) -> bool {
    self.state == ChannelState::Up
  }

  pub fn is_zombie(&self) -> bool {
    self.flags.contains(ChannelFlag::Zombie)
  }

  /// True when this channel was created as the outbound leg of a dial and
  /// not independently originated.
  pub fn is_dialed(&self) -> bool {
    self.flags.contains(ChannelFlag::Outgoing) && !self.flags.contains(ChannelFlag::Originated)
  }

  /// Dialplan position plus application, the tuple whose change marks a new
  /// billing segment.
  pub fn dialplan_position(&self) -> (&str, &str, u32, &str) {
    (&self.context, &self.exten, self.priority, &self.appl)
  }
}

/// True when `new` executes at a different dialplan position than `old`.
pub(crate) fn dialplan_position_changed(old: &ChannelSnapshot, new: &ChannelSnapshot) -> bool {
  old.dialplan_position() != new.dialplan_position()
}
