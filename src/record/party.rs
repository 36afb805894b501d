use std::sync::Arc;

use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::{record::CdrOption, structure::channel::ChannelSnapshot};

/// Insertion-ordered variable list attached to one party of a record.
///
/// Variable lists stay small (a handful of entries set from the dialplan),
/// so a vector with linear lookup beats a map here, and it preserves the
/// order in which variables were set, which the serialization surface
/// promises.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarList(Vec<(String, String)>);

impl VarList {
  pub fn new() -> Self {
    VarList(Vec::new())
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Sets `name` to `value`, replacing an existing entry in place.
  pub fn set(&mut self, name: &str, value: &str) {
    match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
      Some((_, v)) => *v = value.to_string(),
      None => self.0.push((name.to_string(), value.to_string())),
    }
  }

  pub fn remove(&mut self, name: &str) {
    self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
  }

  pub fn clear(&mut self) {
    self.0.clear();
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
  }
}

/// One party of a call record: a shared channel snapshot plus the mutable
/// billing state the engine owns for that party.
#[derive(Debug, Clone)]
pub struct PartySnapshot {
  pub snapshot: Arc<ChannelSnapshot>,
  pub userfield: String,
  pub flags: BitFlags<CdrOption>,
  pub variables: VarList,
}

impl PartySnapshot {
  pub(crate) fn new(snapshot: Arc<ChannelSnapshot>) -> Self {
    PartySnapshot {
      snapshot,
      userfield: String::new(),
      flags: BitFlags::empty(),
      variables: VarList::new(),
    }
  }

  pub(crate) fn name(&self) -> &str {
    &self.snapshot.name
  }

  /// Replaces the underlying channel snapshot.
  ///
  /// Values that live only on the snapshot would silently vanish with it, so
  /// any changed DNID or subaddress is persisted into the party's variables
  /// before the swap.
  pub(crate) fn swap_snapshot(&mut self, new: &Arc<ChannelSnapshot>) {
    if new.caller_dnid != self.snapshot.caller_dnid {
      self.variables.set("dnid", &new.caller_dnid);
    }
    if new.caller_subaddr != self.snapshot.caller_subaddr {
      self.variables.set("callingsubaddr", &new.caller_subaddr);
    }
    if new.dialed_subaddr != self.snapshot.dialed_subaddr {
      self.variables.set("calledsubaddr", &new.dialed_subaddr);
    }
    self.snapshot = Arc::clone(new);
  }
}

/// Which of two parties is Party A.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartyPick {
  Left,
  Right,
}

/// Decides which of two parties represents Party A of a call:
/// a dialed channel loses to a non-dialed one, an explicit `PartyA` flag
/// wins, and otherwise the earlier-created channel wins.
///
/// On a seconds tie, `Right` wins only when the left microseconds are
/// strictly greater; every other tie resolves to `Left`. The asymmetry is
/// long-standing upstream behavior that downstream billing may depend on,
/// so it is preserved as is.
pub(crate) fn pick_party_a(left: &PartySnapshot, right: &PartySnapshot) -> PartyPick {
  let left_dialed = left.snapshot.is_dialed();
  let right_dialed = right.snapshot.is_dialed();
  if left_dialed != right_dialed {
    return if left_dialed { PartyPick::Right } else { PartyPick::Left };
  }

  let left_flagged = left.flags.contains(CdrOption::PartyA);
  let right_flagged = right.flags.contains(CdrOption::PartyA);
  if left_flagged != right_flagged {
    return if left_flagged { PartyPick::Left } else { PartyPick::Right };
  }

  let lt = left.snapshot.creation_time;
  let rt = right.snapshot.creation_time;
  if lt.seconds() < rt.seconds() {
    PartyPick::Left
  } else if lt.seconds() == rt.seconds() {
    if lt.microseconds() > rt.microseconds() {
      PartyPick::Right
    } else {
      PartyPick::Left
    }
  } else {
    PartyPick::Right
  }
}
