use std::sync::{Mutex, MutexGuard};

use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::{CdrError, CdrResult},
  record::{
    cdr::{CdrRecord, CdrState, EngineContext, STANDARD_PROPERTIES},
    external::ExternalRecord,
    CdrOption,
  },
};

/// All records sharing one Party A channel, newest last.
///
/// The chain mutex is the unit of consistency: every traversal or mutation
/// of the records happens under it, so no other thread ever observes a
/// half-updated chain. Chain locks are never nested; cross-chain work goes
/// through the indices one chain at a time.
pub(crate) struct CdrChain {
  party_a_name: String,
  key: String,
  inner: Mutex<ChainInner>,
}

impl CdrChain {
  pub(crate) fn new(first: CdrRecord) -> Self {
    let party_a_name = first.party_a_name.clone();
    CdrChain {
      key: party_a_name.to_lowercase(),
      party_a_name,
      inner: Mutex::new(ChainInner { records: vec![first] }),
    }
  }

  pub(crate) fn party_a_name(&self) -> &str {
    &self.party_a_name
  }

  /// Index key: the Party A channel name, case-folded.
  pub(crate) fn key(&self) -> &str {
    &self.key
  }

  pub(crate) fn lock(&self) -> MutexGuard<'_, ChainInner> {
    self.inner.lock().unwrap()
  }
}

pub(crate) struct ChainInner {
  pub records: Vec<CdrRecord>,
}

impl ChainInner {
  /// The newest record. A chain is created around its first record and only
  /// ever grows, so this always exists.
  pub(crate) fn last(&self) -> &CdrRecord {
    self.records.last().expect("a chain always holds at least one record")
  }

  pub(crate) fn last_mut(&mut self) -> &mut CdrRecord {
    self.records.last_mut().expect("a chain always holds at least one record")
  }

  /// Appends a fresh record continuing the newest one and returns it.
  pub(crate) fn append_successor(
    &mut self,
    sequence: u32,
    ctx: &EngineContext,
  ) -> &mut CdrRecord {
    let successor = CdrRecord::successor(self.last(), sequence, ctx);
    self.records.push(successor);
    self.last_mut()
  }

  pub(crate) fn find_by_sequence(&self, sequence: u32) -> Option<&CdrRecord> {
    self.records.iter().find(|r| r.sequence == sequence)
  }

  pub(crate) fn find_by_sequence_mut(&mut self, sequence: u32) -> Option<&mut CdrRecord> {
    self.records.iter_mut().find(|r| r.sequence == sequence)
  }

  pub(crate) fn finalize_all(&mut self, ctx: &EngineContext) {
    for record in &mut self.records {
      record.finalize(ctx);
    }
  }

  /// Serializes the chain into the public record form, applying the posting
  /// filter.
  pub(crate) fn externalize(&self, ctx: &EngineContext) -> Vec<ExternalRecord> {
    self
      .records
      .iter()
      .filter(|r| r.should_post(ctx.config))
      .map(|r| ExternalRecord::from_record(r, ctx))
      .collect()
  }

  // --- operations behind the public API -------------------------------

  /// Reads a variable or standard property off the newest record.
  pub(crate) fn get_var(&self, name: &str, ctx: &EngineContext) -> Option<String> {
    let last = self.last();
    last
      .property(name, ctx)
      .or_else(|| last.party_a.variables.get(name).map(str::to_string))
  }

  /// Sets (or with `None`, deletes) a variable on every non-finalized record
  /// where `channel_name` is one of the parties. Returns whether any record
  /// was touched.
  pub(crate) fn set_var(
    &mut self,
    channel_name: &str,
    name: &str,
    value: Option<&str>,
  ) -> bool {
    let mut touched = false;
    for record in &mut self.records {
      if record.is_finalized() {
        continue;
      }
      let variables = if record.party_a_name.eq_ignore_ascii_case(channel_name) {
        Some(&mut record.party_a.variables)
      } else if record.matches_party_b(channel_name) {
        record.party_b.as_mut().map(|b| &mut b.variables)
      } else {
        None
      };
      if let Some(variables) = variables {
        match value {
          Some(value) => variables.set(name, value),
          None => variables.remove(name),
        }
        touched = true;
      }
    }
    touched
  }

  /// Copies `userfield` onto every non-finalized record where `channel_name`
  /// is one of the parties.
  pub(crate) fn set_userfield(&mut self, channel_name: &str, userfield: &str) -> bool {
    let mut touched = false;
    for record in &mut self.records {
      if record.is_finalized() {
        continue;
      }
      if record.party_a_name.eq_ignore_ascii_case(channel_name) {
        record.party_a.userfield = userfield.to_string();
        touched = true;
      } else if record.matches_party_b(channel_name) {
        if let Some(b) = record.party_b.as_mut() {
          b.userfield = userfield.to_string();
          touched = true;
        }
      }
    }
    touched
  }

  pub(crate) fn set_property(&mut self, option: CdrOption) {
    for record in &mut self.records {
      if !record.is_finalized() {
        record.flags.insert(option);
      }
    }
  }

  pub(crate) fn clear_property(&mut self, option: CdrOption) {
    for record in &mut self.records {
      if !record.is_finalized() {
        record.flags.remove(option);
      }
    }
  }

  /// Restarts the chain's records from now, clearing variables unless
  /// `KeepVars` is given.
  pub(crate) fn reset(&mut self, options: BitFlags<CdrOption>, ctx: &EngineContext) {
    for record in &mut self.records {
      if !options.contains(CdrOption::KeepVars) {
        record.party_a.variables.clear();
        if let Some(b) = record.party_b.as_mut() {
          b.variables.clear();
        }
      }
      record.start = Some(ctx.now());
      record.answer = None;
      record.end = None;
      record.check_answer(ctx);
    }
  }

  /// Appends a new record for continued tracking of the channel. Refuses
  /// when the newest record is already finalized.
  pub(crate) fn fork(
    &mut self,
    options: BitFlags<CdrOption>,
    sequence: u32,
    ctx: &EngineContext,
  ) -> CdrResult<()> {
    if self.last().is_finalized() {
      return Err(CdrError::RecordFinalized);
    }
    if options.contains(CdrOption::Finalize) {
      for record in &mut self.records {
        if !record.is_finalized() {
          record.finalize(ctx);
          record.transition(CdrState::Finalized, ctx);
        }
      }
    }
    let record = self.append_successor(sequence, ctx);
    if !options.contains(CdrOption::KeepVars) {
      record.party_a.variables.clear();
    }
    if options.contains(CdrOption::SetAnswer) && record.party_a.snapshot.is_up() {
      record.answer = Some(ctx.now());
    }
    if options.contains(CdrOption::Reset) {
      let now = ctx.now();
      record.start = Some(now);
      record.answer = Some(now);
    }
    Ok(())
  }

  /// Renders every variable and standard property of every record, one line
  /// per value as `level N: name<delim>value<sep>`, records separated by a
  /// newline.
  pub(crate) fn serialize_variables(&self, delim: char, sep: char, ctx: &EngineContext) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    for (index, record) in self.records.iter().enumerate() {
      if index > 0 {
        out.push('\n');
      }
      let level = index + 1;
      for (name, value) in record.party_a.variables.iter() {
        let _ = write!(out, "level {level}: {name}{delim}{value}{sep}");
      }
      for property in STANDARD_PROPERTIES {
        if let Some(value) = record.property(property, ctx) {
          let _ = write!(out, "level {level}: {property}{delim}{value}{sep}");
        }
      }
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::{
    config::CdrConfig,
    record::dispositions::Disposition,
    structure::time::CdrTimestamp,
    test_util::{ctx_with, snapshot, snapshot_up, ManualClock},
  };

  fn chain_for(name: &str, ctx: &EngineContext) -> CdrChain {
    CdrChain::new(CdrRecord::new(Arc::new(snapshot_up(name)), 1, ctx))
  }

  #[test]
  fn chain_key_is_case_folded() {
    let clock = ManualClock::new(0);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let chain = CdrChain::new(CdrRecord::new(Arc::new(snapshot("PJSIP/Alice-00000001")), 1, &ctx));
    assert_eq!(chain.key(), "pjsip/alice-00000001");
    assert_eq!(chain.party_a_name(), "PJSIP/Alice-00000001");
  }

  #[test]
  fn variables_round_trip_through_the_chain() {
    let clock = ManualClock::new(0);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let chain = chain_for("PJSIP/alice-00000001", &ctx);
    let mut inner = chain.lock();

    assert!(inner.set_var("PJSIP/alice-00000001", "route", Some("east")));
    assert_eq!(inner.get_var("route", &ctx).as_deref(), Some("east"));
    assert!(inner.set_var("PJSIP/alice-00000001", "route", None));
    assert_eq!(inner.get_var("route", &ctx), None);
    assert!(!inner.set_var("PJSIP/nobody-00000009", "route", Some("west")));
  }

  #[test]
  fn properties_win_over_variables_on_read() {
    let clock = ManualClock::new(0);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let chain = chain_for("PJSIP/alice-00000001", &ctx);
    let mut inner = chain.lock();
    inner.set_var("PJSIP/alice-00000001", "myvar", Some("7"));
    assert_eq!(inner.get_var("channel", &ctx).as_deref(), Some("PJSIP/alice-00000001"));
    assert_eq!(inner.get_var("myvar", &ctx).as_deref(), Some("7"));
  }

  #[test]
  fn finalized_records_are_skipped_by_writes() {
    let clock = ManualClock::new(0);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let chain = chain_for("PJSIP/alice-00000001", &ctx);
    let mut inner = chain.lock();
    inner.last_mut().finalize(&ctx);
    inner.last_mut().transition(CdrState::Finalized, &ctx);
    assert!(!inner.set_var("PJSIP/alice-00000001", "route", Some("east")));
    assert!(!inner.set_userfield("PJSIP/alice-00000001", "vip"));
  }

  #[test]
  fn fork_refuses_after_finalization() {
    let clock = ManualClock::new(0);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let chain = chain_for("PJSIP/alice-00000001", &ctx);
    let mut inner = chain.lock();
    inner.last_mut().finalize(&ctx);
    inner.last_mut().transition(CdrState::Finalized, &ctx);
    assert!(matches!(
      inner.fork(BitFlags::empty(), 2, &ctx),
      Err(CdrError::RecordFinalized)
    ));
  }

  #[test]
  fn fork_options_shape_the_new_record() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let chain = chain_for("PJSIP/alice-00000001", &ctx);
    let mut inner = chain.lock();
    inner.set_var("PJSIP/alice-00000001", "route", Some("east"));

    clock.set(150);
    inner.fork(CdrOption::KeepVars | CdrOption::Finalize, 2, &ctx).unwrap();
    assert_eq!(inner.records.len(), 2);
    assert!(inner.records[0].is_finalized(), "Finalize must close out prior records");
    let new = inner.last();
    assert_eq!(new.sequence, 2);
    assert_eq!(new.start, Some(CdrTimestamp::new(150, 0)));
    assert_eq!(new.party_a.variables.get("route"), Some("east"));

    clock.set(200);
    inner.fork(CdrOption::Reset.into(), 3, &ctx).unwrap();
    let new = inner.last();
    assert!(new.party_a.variables.get("route").is_none(), "variables drop without KeepVars");
    assert_eq!(new.start, Some(CdrTimestamp::new(200, 0)));
    assert_eq!(new.answer, Some(CdrTimestamp::new(200, 0)));
  }

  #[test]
  fn reset_restarts_timestamps_and_clears_variables() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let chain = chain_for("PJSIP/alice-00000001", &ctx);
    let mut inner = chain.lock();
    inner.set_var("PJSIP/alice-00000001", "route", Some("east"));
    inner.last_mut().finalize(&ctx);

    clock.set(180);
    inner.reset(BitFlags::empty(), &ctx);
    let record = inner.last();
    assert_eq!(record.start, Some(CdrTimestamp::new(180, 0)));
    assert_eq!(record.answer, Some(CdrTimestamp::new(180, 0)), "an up channel re-answers");
    assert_eq!(record.end, None);
    assert!(record.party_a.variables.is_empty());
  }

  #[test]
  fn externalize_applies_the_posting_filter() {
    let clock = ManualClock::new(100);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let chain = chain_for("PJSIP/alice-00000001", &ctx);
    let mut inner = chain.lock();
    clock.set(130);
    inner.finalize_all(&ctx);
    let records = inner.externalize(&ctx);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].disposition, Disposition::Answered);
    assert_eq!(records[0].duration, 30);

    inner.last_mut().flags.insert(CdrOption::Disable);
    assert!(inner.externalize(&ctx).is_empty());
  }

  #[test]
  fn serialize_variables_lists_levels_and_properties() {
    let clock = ManualClock::new(0);
    let config = CdrConfig::default();
    let ctx = ctx_with(&clock, &config);
    let chain = chain_for("PJSIP/alice-00000001", &ctx);
    let mut inner = chain.lock();
    inner.set_var("PJSIP/alice-00000001", "route", Some("east"));
    inner.append_successor(2, &ctx);

    let out = inner.serialize_variables('=', ',', &ctx);
    assert!(out.contains("level 1: route=east,"));
    assert!(out.contains("level 1: channel=PJSIP/alice-00000001,"));
    assert!(out.contains("level 2: channel=PJSIP/alice-00000001,"));
    assert_eq!(out.lines().count(), 2);
  }
}
