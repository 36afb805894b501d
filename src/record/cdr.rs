use std::{fmt, sync::Arc};

use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  config::CdrConfig,
  record::{
    chain::CdrChain,
    dispositions::{disposition_from_dial_status, disposition_from_hangup_cause, Disposition},
    party::{pick_party_a, PartyPick, PartySnapshot},
    CdrOption,
  },
  structure::{
    channel::{dialplan_position_changed, ChannelSnapshot},
    time::{CdrTimestamp, Clock},
  },
};

/// Per-dispatch execution context: the engine clock and the configuration
/// options that alter handler behavior.
pub(crate) struct EngineContext<'a> {
  pub clock: &'a dyn Clock,
  pub config: &'a CdrConfig,
  pub debug: bool,
}

impl EngineContext<'_> {
  pub(crate) fn now(&self) -> CdrTimestamp {
    self.clock.now()
  }
}

/// State of one call record.
///
/// Each state owns its event handlers; a handler either mutates the record
/// and reports handled, or reports unhandled, which the event router takes
/// as a cue to fork a new chain element or finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdrState {
  /// Newborn record; one channel, no peer yet.
  Single,
  /// Party A is dialing or being originated toward Party B.
  Dial,
  /// The dial succeeded; awaiting the next event to classify the call.
  DialedPending,
  /// Party A is in a bridge with Party B.
  Bridged,
  /// Party A left a bridge; awaiting classification.
  BridgedPending,
  /// Terminal.
  Finalized,
}

impl fmt::Display for CdrState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let text = match self {
      CdrState::Single => "Single",
      CdrState::Dial => "Dial",
      CdrState::DialedPending => "DialedPending",
      CdrState::Bridged => "Bridged",
      CdrState::BridgedPending => "BridgedPending",
      CdrState::Finalized => "Finalized",
    };
    write!(f, "{text}")
  }
}

/// A party already present in a bridge, collected from the bridge index
/// before a bridge enter is dispatched. Candidates found in a Party-A slot
/// sort ahead of those found in a Party-B slot.
pub(crate) struct BridgeCandidate {
  pub chain: Arc<CdrChain>,
  pub party: PartySnapshot,
  pub from_party_a: bool,
  pub record_sequence: u32,
  pub record_party_b: Option<String>,
}

/// Deferred effect of a bridge enter: the candidate record that handed us
/// its Party A must be finalized in place, as the new pairing supersedes it.
pub(crate) struct CandidateFinalize {
  pub chain: Arc<CdrChain>,
  pub record_sequence: u32,
}

/// Standard record properties readable through the variable interface and
/// protected from writes.
pub(crate) const STANDARD_PROPERTIES: [&str; 21] = [
  "clid",
  "src",
  "dst",
  "dcontext",
  "channel",
  "dstchannel",
  "lastapp",
  "lastdata",
  "start",
  "answer",
  "end",
  "duration",
  "billsec",
  "disposition",
  "amaflags",
  "accountcode",
  "peeraccount",
  "uniqueid",
  "linkedid",
  "userfield",
  "sequence",
];

pub(crate) fn is_standard_property(name: &str) -> bool {
  STANDARD_PROPERTIES.iter().any(|p| p.eq_ignore_ascii_case(name))
}

/// Caller id column: `"name" <number>` when both parts are known.
pub(crate) fn format_caller_id(name: &str, number: &str) -> String {
  match (name.is_empty(), number.is_empty()) {
    (false, false) => format!("\"{name}\" <{number}>"),
    (false, true) => name.to_string(),
    (true, false) => number.to_string(),
    (true, true) => String::new(),
  }
}

fn has_prefix_ignore_case(s: &str, prefix: &str) -> bool {
  s.get(..prefix.len()).is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// One call detail record. Records with the same Party A channel form a
/// chain; the engine appends a new record whenever the channel's activity
/// demands a fresh billing segment.
#[derive(Debug, Clone)]
pub(crate) struct CdrRecord {
  pub sequence: u32,
  pub state: CdrState,
  pub party_a: PartySnapshot,
  pub party_b: Option<PartySnapshot>,
  pub disposition: Disposition,
  pub flags: BitFlags<CdrOption>,
  pub start: Option<CdrTimestamp>,
  pub answer: Option<CdrTimestamp>,
  pub end: Option<CdrTimestamp>,
  // Cached off the snapshots so they survive snapshot swaps.
  pub linkedid: String,
  pub party_a_name: String,
  pub bridge_id: Option<String>,
  pub lastapp: String,
  pub lastdata: String,
}

impl CdrRecord {
  pub(crate) fn new(snapshot: Arc<ChannelSnapshot>, sequence: u32, ctx: &EngineContext) -> Self {
    let mut record = CdrRecord {
      sequence,
      state: CdrState::Single,
      party_a_name: snapshot.name.clone(),
      linkedid: snapshot.linkedid.clone(),
      party_a: PartySnapshot::new(snapshot),
      party_b: None,
      disposition: Disposition::Null,
      flags: BitFlags::empty(),
      start: None,
      answer: None,
      end: None,
      bridge_id: None,
      lastapp: String::new(),
      lastdata: String::new(),
    };
    record.transition(CdrState::Single, ctx);
    record
  }

  /// A fresh record continuing `prev`'s chain. Party A carries over with its
  /// userfield, flags and variables; everything else starts from scratch.
  pub(crate) fn successor(prev: &CdrRecord, sequence: u32, ctx: &EngineContext) -> Self {
    let mut flags = BitFlags::empty();
    if prev.flags.contains(CdrOption::DisableAll) {
      flags |= CdrOption::DisableAll | CdrOption::Disable;
    }
    let mut record = CdrRecord {
      sequence,
      state: CdrState::Single,
      party_a_name: prev.party_a_name.clone(),
      linkedid: prev.linkedid.clone(),
      party_a: prev.party_a.clone(),
      party_b: None,
      disposition: Disposition::Null,
      flags,
      start: None,
      answer: None,
      end: None,
      bridge_id: None,
      lastapp: String::new(),
      lastdata: String::new(),
    };
    record.transition(CdrState::Single, ctx);
    record
  }

  pub(crate) fn is_finalized(&self) -> bool {
    self.state == CdrState::Finalized
  }

  pub(crate) fn matches_party_b(&self, name: &str) -> bool {
    self.party_b.as_ref().is_some_and(|b| b.name().eq_ignore_ascii_case(name))
  }

  /// Moves the record into `state` and runs the state's entry action.
  pub(crate) fn transition(&mut self, state: CdrState, ctx: &EngineContext) {
    if ctx.debug {
      debug!("CDR {} for {}: {} -> {}", self.sequence, self.party_a_name, self.state, state);
    }
    self.state = state;
    match state {
      CdrState::Single => {
        self.start = Some(ctx.now());
        self.check_answer(ctx);
      }
      CdrState::BridgedPending => {
        // Nothing has happened since the bridge ended; unless something
        // does, this record must not be posted.
        self.flags.insert(CdrOption::Disable);
      }
      CdrState::Finalized => {
        if ctx.config.end_before_h_exten {
          self.finalize(ctx);
        }
      }
      CdrState::Dial | CdrState::DialedPending | CdrState::Bridged => {}
    }
  }

  /// Stamps the answer time once Party A is up.
  pub(crate) fn check_answer(&mut self, ctx: &EngineContext) {
    if self.answer.is_none() && self.party_a.snapshot.is_up() {
      let now = ctx.now();
      if ctx.debug {
        debug!("CDR {} for {}: answered at {}", self.sequence, self.party_a_name, now);
      }
      self.answer = Some(now);
    }
  }

  /// Freezes the end time and settles the disposition. Idempotent; a second
  /// call leaves the record unchanged.
  pub(crate) fn finalize(&mut self, ctx: &EngineContext) {
    if self.end.is_some() {
      return;
    }
    self.end = Some(ctx.now());
    if self.disposition == Disposition::Null {
      self.disposition = if self.answer.is_some() {
        Disposition::Answered
      } else if self.party_a.snapshot.hangup_cause != 0 {
        disposition_from_hangup_cause(self.party_a.snapshot.hangup_cause, ctx.config.congestion)
      } else {
        match &self.party_b {
          Some(b) if b.snapshot.hangup_cause != 0 => {
            disposition_from_hangup_cause(b.snapshot.hangup_cause, ctx.config.congestion)
          }
          _ => Disposition::Failed,
        }
      };
    }
    if ctx.debug {
      debug!(
        "CDR {} for {}: finalized as {}",
        self.sequence, self.party_a_name, self.disposition
      );
    }
  }

  /// Whole seconds from start to end, or to now while the record is open.
  pub(crate) fn duration_secs(&self, ctx: &EngineContext) -> i64 {
    match self.start {
      Some(start) => self.end.unwrap_or_else(|| ctx.now()).seconds_since(start),
      None => 0,
    }
  }

  /// Billed seconds from answer to end. Floored, unless sub-second rounding
  /// is configured, in which case a remainder of 500 ms or more rounds up.
  pub(crate) fn billsec_secs(&self, ctx: &EngineContext) -> i64 {
    let answer = match self.answer {
      Some(answer) => answer,
      None => return 0,
    };
    let end = self.end.unwrap_or_else(|| ctx.now());
    let millis = end.micros_since(answer) / 1000;
    let mut secs = millis / 1000;
    if ctx.config.initiated_seconds && millis % 1000 >= 500 {
      secs += 1;
    }
    secs
  }

  /// Whether this record passes the posting filter: not withheld, and either
  /// a billable outcome or explicitly configured to keep unanswered calls.
  /// A record that never found its Party B does not bill if its channel was
  /// merely the dialed-out leg or a lone bridge participant.
  pub(crate) fn should_post(&self, config: &CdrConfig) -> bool {
    if self.flags.intersects(CdrOption::Disable | CdrOption::DisableAll) {
      return false;
    }
    if self.disposition < Disposition::Answered && !config.unanswered {
      return false;
    }
    if self.party_b.is_none() && (self.party_a.snapshot.is_dialed() || self.bridge_id.is_some()) {
      return false;
    }
    true
  }

  // --- event handlers -------------------------------------------------

  /// Party A updates refresh the snapshot and cached fields in every state;
  /// the pending states additionally watch for dialplan movement, and a
  /// finalized record reports unhandled so the router can fork a fresh one
  /// for continued dialplan execution.
  pub(crate) fn process_party_a(&mut self, new: &Arc<ChannelSnapshot>, ctx: &EngineContext) -> bool {
    loop {
      match self.state {
        CdrState::Single | CdrState::Dial | CdrState::Bridged | CdrState::BridgedPending => {
          if self.state == CdrState::BridgedPending
            && !new.is_zombie()
            && dialplan_position_changed(&self.party_a.snapshot, new)
          {
            self.flags.remove(CdrOption::Disable);
            self.transition(CdrState::Single, ctx);
            continue;
          }
          return self.base_party_a(new, ctx);
        }
        CdrState::DialedPending => {
          if dialplan_position_changed(&self.party_a.snapshot, new) {
            if self.party_b.is_some() {
              // The call this record describes is complete; a fresh record
              // must pick up the new dialplan position.
              self.transition(CdrState::Finalized, ctx);
              return false;
            }
            self.transition(CdrState::Single, ctx);
            continue;
          }
          return self.base_party_a(new, ctx);
        }
        CdrState::Finalized => {
          if new.is_zombie() {
            self.finalize(ctx);
          }
          return false;
        }
      }
    }
  }

  fn base_party_a(&mut self, new: &Arc<ChannelSnapshot>, ctx: &EngineContext) -> bool {
    if !self.party_a_name.eq_ignore_ascii_case(&new.name) {
      error!(
        "Party A update for {} dispatched to record owned by {}",
        new.name, self.party_a_name
      );
      debug_assert!(false, "party A channel name mismatch");
      return false;
    }
    self.party_a.swap_snapshot(new);
    // Dial's helper application must not displace the application the
    // channel was actually running, unless nothing was cached yet.
    if !new.appl.is_empty() && (!has_prefix_ignore_case(&new.appl, "appdial") || self.lastapp.is_empty())
    {
      self.lastapp = new.appl.clone();
      self.lastdata = new.data.clone();
    }
    self.linkedid = new.linkedid.clone();
    self.check_answer(ctx);
    if new.is_zombie() {
      self.finalize(ctx);
      self.transition(CdrState::Finalized, ctx);
    }
    true
  }

  /// Party B updates only land on records actively tracking a peer.
  pub(crate) fn process_party_b(&mut self, new: &Arc<ChannelSnapshot>, ctx: &EngineContext) -> bool {
    match self.state {
      CdrState::Dial => {
        if self.matches_party_b(&new.name) {
          if let Some(b) = self.party_b.as_mut() {
            b.swap_snapshot(new);
          }
          if new.is_zombie() {
            self.transition(CdrState::Finalized, ctx);
          }
          true
        } else {
          false
        }
      }
      CdrState::Bridged => {
        if self.matches_party_b(&new.name) {
          if let Some(b) = self.party_b.as_mut() {
            b.swap_snapshot(new);
          }
          if new.is_zombie() {
            self.finalize(ctx);
          }
          true
        } else {
          false
        }
      }
      _ => false,
    }
  }

  pub(crate) fn process_dial_begin(
    &mut self,
    caller: Option<&Arc<ChannelSnapshot>>,
    peer: Option<&Arc<ChannelSnapshot>>,
    ctx: &EngineContext,
  ) -> bool {
    loop {
      match self.state {
        CdrState::Single => {
          if let Some(caller) = caller.filter(|c| c.name.eq_ignore_ascii_case(&self.party_a_name)) {
            self.base_party_a(caller, ctx);
            if let Some(peer) = peer {
              self.party_b = Some(PartySnapshot::new(Arc::clone(peer)));
            }
            self.transition(CdrState::Dial, ctx);
            return true;
          }
          if let Some(peer) = peer.filter(|p| p.name.eq_ignore_ascii_case(&self.party_a_name)) {
            // We are the destination of an origination.
            self.party_a.swap_snapshot(peer);
            self.transition(CdrState::Dial, ctx);
            return true;
          }
          return false;
        }
        CdrState::DialedPending => {
          // The previous dial is history; close this record out and let the
          // router fork a fresh one for the new dial.
          self.finalize(ctx);
          self.transition(CdrState::Finalized, ctx);
          return false;
        }
        CdrState::BridgedPending => {
          self.flags.remove(CdrOption::Disable);
          self.transition(CdrState::Single, ctx);
          continue;
        }
        CdrState::Dial | CdrState::Bridged | CdrState::Finalized => return false,
      }
    }
  }

  pub(crate) fn process_dial_end(
    &mut self,
    caller: Option<&Arc<ChannelSnapshot>>,
    peer: Option<&Arc<ChannelSnapshot>>,
    status: &str,
    ctx: &EngineContext,
  ) -> bool {
    match self.state {
      CdrState::Dial => {
        self.disposition = disposition_from_dial_status(status, ctx.config.congestion);
        if ctx.debug {
          debug!(
            "CDR {} for {}: dial ended {} -> {}",
            self.sequence, self.party_a_name, status, self.disposition
          );
        }
        for side in [caller, peer].into_iter().flatten() {
          if side.name.eq_ignore_ascii_case(&self.party_a_name) {
            self.party_a.swap_snapshot(side);
          }
        }
        if let Some(peer) = peer {
          if let Some(b) = self.party_b.as_mut() {
            if b.name().eq_ignore_ascii_case(&peer.name) {
              b.swap_snapshot(peer);
            }
          }
        }
        if self.disposition == Disposition::Answered {
          self.check_answer(ctx);
          self.transition(CdrState::DialedPending, ctx);
        } else {
          self.transition(CdrState::Finalized, ctx);
        }
        true
      }
      _ => false,
    }
  }

  /// Bridge entry. `candidates` lists the parties already in the bridge,
  /// Party-A slots first. Returns handled plus an optional candidate record
  /// to finalize in place.
  pub(crate) fn process_bridge_enter(
    &mut self,
    bridge_id: &str,
    candidates: &[BridgeCandidate],
    ctx: &EngineContext,
  ) -> (bool, Option<CandidateFinalize>) {
    loop {
      match self.state {
        CdrState::Single => {
          self.bridge_id = Some(bridge_id.to_string());
          let mut effect = None;
          for cand in candidates {
            if cand.party.name().eq_ignore_ascii_case(&self.party_a_name) {
              continue;
            }
            if pick_party_a(&self.party_a, &cand.party) == PartyPick::Left {
              self.party_b = Some(cand.party.clone());
              if cand.from_party_a && cand.record_party_b.is_none() {
                // The candidate was a lone record; this pairing supersedes
                // it.
                effect = Some(CandidateFinalize {
                  chain: Arc::clone(&cand.chain),
                  record_sequence: cand.record_sequence,
                });
              }
              break;
            }
          }
          self.transition(CdrState::Bridged, ctx);
          return (true, effect);
        }
        CdrState::Dial => {
          self.bridge_id = Some(bridge_id.to_string());
          if let Some(b_name) = self.party_b.as_ref().map(|b| b.name().to_string()) {
            let refreshed = candidates
              .iter()
              .find(|c| c.from_party_a && c.party.name().eq_ignore_ascii_case(&b_name));
            if let Some(cand) = refreshed {
              self.party_b = Some(cand.party.clone());
            }
          }
          self.transition(CdrState::Bridged, ctx);
          return (true, None);
        }
        CdrState::DialedPending => {
          self.transition(CdrState::Dial, ctx);
          continue;
        }
        CdrState::BridgedPending => {
          self.flags.remove(CdrOption::Disable);
          self.transition(CdrState::Single, ctx);
          continue;
        }
        CdrState::Bridged | CdrState::Finalized => return (false, None),
      }
    }
  }

  pub(crate) fn process_bridge_leave(
    &mut self,
    bridge_id: &str,
    channel_name: &str,
    ctx: &EngineContext,
  ) -> bool {
    match self.state {
      CdrState::Bridged => {
        let our_bridge = self.bridge_id.as_deref() == Some(bridge_id);
        let involved = channel_name.eq_ignore_ascii_case(&self.party_a_name)
          || self.matches_party_b(channel_name);
        if our_bridge && involved {
          if self.party_b.is_none() {
            // A lone participant from entry to exit never became a call.
            self.flags.insert(CdrOption::Disable);
          }
          self.transition(CdrState::Finalized, ctx);
          true
        } else {
          false
        }
      }
      _ => false,
    }
  }

  // --- property access ------------------------------------------------

  /// Reads one of the standard record properties, live values for open
  /// records.
  pub(crate) fn property(&self, name: &str, ctx: &EngineContext) -> Option<String> {
    let a = &self.party_a.snapshot;
    let value = match name.to_ascii_lowercase().as_str() {
      "clid" => format_caller_id(&a.caller_name, &a.caller_number),
      "src" => a.caller_number.clone(),
      "dst" => a.exten.clone(),
      "dcontext" => a.context.clone(),
      "channel" => a.name.clone(),
      "dstchannel" => self.party_b.as_ref().map(|b| b.name().to_string()).unwrap_or_default(),
      "lastapp" => self.lastapp.clone(),
      "lastdata" => self.lastdata.clone(),
      "start" => self.start.map(|t| t.as_column()).unwrap_or_default(),
      "answer" => self.answer.map(|t| t.as_column()).unwrap_or_default(),
      "end" => self.end.map(|t| t.as_column()).unwrap_or_default(),
      "duration" => self.duration_secs(ctx).to_string(),
      "billsec" => self.billsec_secs(ctx).to_string(),
      "disposition" => self.disposition.to_string(),
      "amaflags" => (a.amaflags as u8).to_string(),
      "accountcode" => a.accountcode.clone(),
      "peeraccount" => a.peeraccount.clone(),
      "uniqueid" => a.uniqueid.clone(),
      "linkedid" => self.linkedid.clone(),
      "userfield" => self.party_a.userfield.clone(),
      "sequence" => self.sequence.to_string(),
      _ => return None,
    };
    Some(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_util::{ctx_with, snapshot, snapshot_up, ManualClock};

  fn arc(s: ChannelSnapshot) -> Arc<ChannelSnapshot> {
    Arc::new(s)
  }

  #[test]
  fn new_record_starts_single_with_start_stamped() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let record = CdrRecord::new(arc(snapshot("PJSIP/alice-00000001")), 1, &ctx);
    assert_eq!(record.state, CdrState::Single);
    assert_eq!(record.start, Some(CdrTimestamp::new(100, 0)));
    assert_eq!(record.answer, None, "a down channel must not answer");
  }

  #[test]
  fn up_channel_answers_on_creation() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let record = CdrRecord::new(arc(snapshot_up("PJSIP/alice-00000001")), 1, &ctx);
    assert_eq!(record.answer, Some(CdrTimestamp::new(100, 0)));
  }

  #[test]
  fn zombie_update_finalizes_and_reports_unhandled_afterwards() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let mut record = CdrRecord::new(arc(snapshot("PJSIP/alice-00000001")), 1, &ctx);

    clock.set(110);
    let mut zombie = snapshot_up("PJSIP/alice-00000001");
    zombie.flags.insert(crate::structure::channel::ChannelFlag::Zombie);
    zombie.hangup_cause = 16;
    assert!(record.process_party_a(&arc(zombie.clone()), &ctx));
    assert_eq!(record.state, CdrState::Finalized);
    assert_eq!(record.end, Some(CdrTimestamp::new(110, 0)));

    // Further updates bounce off the finalized record.
    assert!(!record.process_party_a(&arc(zombie), &ctx));
  }

  #[test]
  fn finalize_is_idempotent() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let mut record = CdrRecord::new(arc(snapshot_up("PJSIP/alice-00000001")), 1, &ctx);
    clock.set(120);
    record.finalize(&ctx);
    let end = record.end;
    let disposition = record.disposition;
    clock.set(500);
    record.finalize(&ctx);
    assert_eq!(record.end, end);
    assert_eq!(record.disposition, disposition);
  }

  #[test]
  fn appdial_does_not_displace_cached_application() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let mut base = snapshot("PJSIP/alice-00000001");
    base.appl = "Dial".to_string();
    base.data = "PJSIP/bob".to_string();
    let mut record = CdrRecord::new(arc(base.clone()), 1, &ctx);

    let mut update = base.clone();
    update.appl = "AppDial".to_string();
    update.data = "(Outgoing Line)".to_string();
    record.process_party_a(&arc(update), &ctx);
    assert_eq!(record.lastapp, "Dial", "appdial must not displace a cached application");

    let mut queue = base.clone();
    queue.appl = "Queue".to_string();
    queue.data = "support".to_string();
    record.process_party_a(&arc(queue), &ctx);
    assert_eq!(record.lastapp, "Queue");
    assert_eq!(record.lastdata, "support");
  }

  #[test]
  fn appdial_is_cached_when_nothing_else_was() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let mut base = snapshot("PJSIP/bob-00000002");
    base.appl = String::new();
    let mut record = CdrRecord::new(arc(base.clone()), 1, &ctx);

    let mut update = base;
    update.appl = "AppDial".to_string();
    record.process_party_a(&arc(update), &ctx);
    assert_eq!(record.lastapp, "AppDial");
  }

  #[test]
  fn dial_begin_adopts_caller_and_peer() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let caller = arc(snapshot("PJSIP/alice-00000001"));
    let peer = arc(snapshot("PJSIP/bob-00000002"));
    let mut record = CdrRecord::new(Arc::clone(&caller), 1, &ctx);

    assert!(record.process_dial_begin(Some(&caller), Some(&peer), &ctx));
    assert_eq!(record.state, CdrState::Dial);
    assert!(record.matches_party_b("PJSIP/bob-00000002"));
  }

  #[test]
  fn dial_begin_as_origination_destination_adopts_peer_side_only() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let caller = arc(snapshot("PJSIP/alice-00000001"));
    let peer = arc(snapshot("Local/1000@default-00000002;1"));
    let mut record = CdrRecord::new(Arc::clone(&peer), 1, &ctx);

    assert!(record.process_dial_begin(Some(&caller), Some(&peer), &ctx));
    assert_eq!(record.state, CdrState::Dial);
    assert!(record.party_b.is_none());
  }

  #[test]
  fn second_dial_begin_is_rejected_in_dial_state() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let caller = arc(snapshot("PJSIP/alice-00000001"));
    let peer = arc(snapshot("PJSIP/bob-00000002"));
    let mut record = CdrRecord::new(Arc::clone(&caller), 1, &ctx);
    record.process_dial_begin(Some(&caller), Some(&peer), &ctx);
    assert!(
      !record.process_dial_begin(Some(&caller), Some(&peer), &ctx),
      "a record already dialing must hand a new dial to the router"
    );
  }

  #[test]
  fn answered_dial_end_moves_to_dialed_pending_and_answers() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let caller = arc(snapshot("PJSIP/alice-00000001"));
    let peer = arc(snapshot("PJSIP/bob-00000002"));
    let mut record = CdrRecord::new(Arc::clone(&caller), 1, &ctx);
    record.process_dial_begin(Some(&caller), Some(&peer), &ctx);

    clock.set(102);
    let caller_up = arc(snapshot_up("PJSIP/alice-00000001"));
    assert!(record.process_dial_end(Some(&caller_up), Some(&peer), "ANSWER", &ctx));
    assert_eq!(record.state, CdrState::DialedPending);
    assert_eq!(record.disposition, Disposition::Answered);
    assert_eq!(record.answer, Some(CdrTimestamp::new(102, 0)));
  }

  #[test]
  fn failed_dial_end_finalizes() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let caller = arc(snapshot("PJSIP/alice-00000001"));
    let peer = arc(snapshot("PJSIP/bob-00000002"));
    let mut record = CdrRecord::new(Arc::clone(&caller), 1, &ctx);
    record.process_dial_begin(Some(&caller), Some(&peer), &ctx);

    assert!(record.process_dial_end(Some(&caller), Some(&peer), "BUSY", &ctx));
    assert_eq!(record.state, CdrState::Finalized);
    assert_eq!(record.disposition, Disposition::Busy);
  }

  #[test]
  fn bridge_leave_needs_matching_bridge_and_participant() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let mut record = CdrRecord::new(arc(snapshot_up("PJSIP/alice-00000001")), 1, &ctx);
    record.process_bridge_enter("bridge-x", &[], &ctx);
    assert_eq!(record.state, CdrState::Bridged);

    assert!(!record.process_bridge_leave("bridge-y", "PJSIP/alice-00000001", &ctx));
    assert!(!record.process_bridge_leave("bridge-x", "PJSIP/carol-00000003", &ctx));
    assert!(record.process_bridge_leave("bridge-x", "PJSIP/alice-00000001", &ctx));
    assert_eq!(record.state, CdrState::Finalized);
  }

  #[test]
  fn billsec_rounds_up_only_with_initiated_seconds() {
    let clock = ManualClock::new(100);
    let mut config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let mut record = CdrRecord::new(arc(snapshot_up("PJSIP/alice-00000001")), 1, &ctx);
    clock.set_with_usec(110, 600_000);
    record.finalize(&ctx);
    assert_eq!(record.billsec_secs(&ctx), 10, "remainder must floor by default");

    config.initiated_seconds = true;
    let ctx = ctx_with(&clock, &config);
    assert_eq!(record.billsec_secs(&ctx), 11, "500ms or more must round up");
  }

  #[test]
  fn unanswered_bridge_stragglers_do_not_post() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);

    // A lone bridge participant that never found a peer.
    let mut lonely = CdrRecord::new(arc(snapshot_up("PJSIP/carol-00000003")), 1, &ctx);
    lonely.process_bridge_enter("bridge-x", &[], &ctx);
    lonely.finalize(&ctx);
    assert_eq!(lonely.disposition, Disposition::Answered);
    assert!(!lonely.should_post(&config));

    // The dialed-out leg of a call, tracked by the caller's record instead.
    let mut dialed_snapshot = snapshot_up("PJSIP/bob-00000002");
    dialed_snapshot.flags.insert(crate::structure::channel::ChannelFlag::Outgoing);
    let mut dialed = CdrRecord::new(arc(dialed_snapshot), 2, &ctx);
    dialed.finalize(&ctx);
    assert!(!dialed.should_post(&config));

    // A plain answered single-party call does bill.
    let mut single = CdrRecord::new(arc(snapshot_up("PJSIP/alice-00000001")), 3, &ctx);
    single.finalize(&ctx);
    assert!(single.should_post(&config));
  }

  #[test]
  fn disabled_records_never_post() {
    let clock = ManualClock::new(100);
    let config = CdrConfig {
      unanswered: true,
      ..Default::default()
    };
    let ctx = ctx_with(&clock, &config);
    let mut record = CdrRecord::new(arc(snapshot_up("PJSIP/alice-00000001")), 1, &ctx);
    record.finalize(&ctx);
    record.flags.insert(CdrOption::Disable);
    assert!(!record.should_post(&config));
  }

  #[test]
  fn property_reads_cover_the_standard_columns() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let mut s = snapshot_up("PJSIP/alice-00000001");
    s.caller_name = "Alice".to_string();
    s.caller_number = "1000".to_string();
    s.exten = "2000".to_string();
    let record = CdrRecord::new(arc(s), 7, &ctx);

    assert_eq!(record.property("clid", &ctx).as_deref(), Some("\"Alice\" <1000>"));
    assert_eq!(record.property("dst", &ctx).as_deref(), Some("2000"));
    assert_eq!(record.property("sequence", &ctx).as_deref(), Some("7"));
    assert_eq!(record.property("dstchannel", &ctx).as_deref(), Some(""));
    assert_eq!(record.property("no_such_property", &ctx), None);
    assert!(is_standard_property("BillSec"));
    assert!(!is_standard_property("route"));
  }
}
