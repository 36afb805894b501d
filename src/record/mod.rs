//! Call detail records: the per-channel state machine and its data.

pub mod cdr;
pub mod chain;
pub mod dispositions;
pub mod external;
pub mod party;

use enumflags2::bitflags;
use serde::{Deserialize, Serialize};

/// Option flags applied to records and parties.
///
/// The same flag space serves three purposes: record properties set through
/// the API (`Disable`, `DisableAll`), per-party markers maintained by the
/// engine (`PartyA`), and modifiers accepted by reset/fork (`KeepVars`,
/// `Finalize`, `SetAnswer`, `Reset`).
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CdrOption {
  /// Keep variables on the record instead of clearing them.
  KeepVars = 1 << 0,
  /// Withhold this record from posting.
  Disable = 1 << 1,
  /// Withhold this record and every successor from posting.
  DisableAll = 1 << 2,
  /// The party this flag is set on is preferred as Party A.
  PartyA = 1 << 3,
  /// Finalize every prior record in the chain.
  Finalize = 1 << 4,
  /// Stamp a fresh answer time if the channel is up.
  SetAnswer = 1 << 5,
  /// Restart the record timestamps from now.
  Reset = 1 << 6,
}
