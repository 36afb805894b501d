//! Shared fixtures for the test modules: snapshot builders, a manually
//! driven clock, and capture backends.

use std::sync::{Arc, Mutex};

use enumflags2::BitFlags;

use crate::{
  config::CdrConfig,
  engine::backend::Backend,
  record::{cdr::EngineContext, dispositions::Disposition, external::ExternalRecord, party::VarList},
  structure::{
    bridge::BridgeSnapshot,
    channel::{AmaFlags, ChannelSnapshot, ChannelState},
    time::{CdrTimestamp, Clock},
  },
};

pub(crate) fn snapshot(name: &str) -> ChannelSnapshot {
  ChannelSnapshot {
    name: name.to_string(),
    uniqueid: format!("{name}-uid"),
    linkedid: format!("{name}-uid"),
    caller_name: String::new(),
    caller_number: String::new(),
    caller_dnid: String::new(),
    caller_subaddr: String::new(),
    dialed_subaddr: String::new(),
    context: "default".to_string(),
    exten: "1000".to_string(),
    priority: 1,
    appl: String::new(),
    data: String::new(),
    accountcode: String::new(),
    peeraccount: String::new(),
    amaflags: AmaFlags::Billing,
    hangup_cause: 0,
    state: ChannelState::Down,
    flags: BitFlags::empty(),
    creation_time: CdrTimestamp::new(0, 0),
  }
}

pub(crate) fn snapshot_at(name: &str, sec: i64, usec: u32) -> ChannelSnapshot {
  let mut s = snapshot(name);
  s.creation_time = CdrTimestamp::new(sec, usec);
  s
}

pub(crate) fn snapshot_up(name: &str) -> ChannelSnapshot {
  let mut s = snapshot(name);
  s.state = ChannelState::Up;
  s
}

pub(crate) fn bridge(id: &str) -> BridgeSnapshot {
  BridgeSnapshot {
    uniqueid: id.to_string(),
    technology: "simple_bridge".to_string(),
  }
}

/// A clock the test advances by hand.
pub(crate) struct ManualClock(Mutex<CdrTimestamp>);

impl ManualClock {
  pub(crate) fn new(sec: i64) -> Self {
    ManualClock(Mutex::new(CdrTimestamp::new(sec, 0)))
  }

  pub(crate) fn set(&self, sec: i64) {
    *self.0.lock().unwrap() = CdrTimestamp::new(sec, 0);
  }

  pub(crate) fn set_with_usec(&self, sec: i64, usec: u32) {
    *self.0.lock().unwrap() = CdrTimestamp::new(sec, usec);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> CdrTimestamp {
    *self.0.lock().unwrap()
  }
}

pub(crate) fn ctx_with<'a>(clock: &'a dyn Clock, config: &'a CdrConfig) -> EngineContext<'a> {
  EngineContext {
    clock,
    config,
    debug: false,
  }
}

/// Records everything it is handed.
pub(crate) struct CaptureBackend {
  records: Mutex<Vec<ExternalRecord>>,
}

impl CaptureBackend {
  pub(crate) fn new() -> Self {
    CaptureBackend {
      records: Mutex::new(Vec::new()),
    }
  }

  pub(crate) fn records(&self) -> Vec<ExternalRecord> {
    self.records.lock().unwrap().clone()
  }
}

impl Backend for CaptureBackend {
  fn process(
    &self,
    record: &ExternalRecord,
  ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    self.records.lock().unwrap().push(record.clone());
    Ok(())
  }
}

/// Fails every record, for isolation tests.
pub(crate) struct FailingBackend;

impl Backend for FailingBackend {
  fn process(
    &self,
    _record: &ExternalRecord,
  ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    Err("backend is broken".into())
  }
}

pub(crate) fn external_record(channel: &str, sequence: u32) -> ExternalRecord {
  ExternalRecord {
    accountcode: String::new(),
    amaflags: AmaFlags::Billing,
    clid: String::new(),
    src: String::new(),
    dst: "1000".to_string(),
    dcontext: "default".to_string(),
    channel: channel.to_string(),
    dstchannel: String::new(),
    lastapp: String::new(),
    lastdata: String::new(),
    start: CdrTimestamp::new(0, 0),
    answer: CdrTimestamp::new(0, 0),
    end: CdrTimestamp::new(1, 0),
    duration: 1,
    billsec: 1,
    disposition: Disposition::Answered,
    uniqueid: format!("{channel}-uid"),
    linkedid: format!("{channel}-uid"),
    peeraccount: String::new(),
    userfield: String::new(),
    sequence,
    variables: VarList::new(),
  }
}
