use serde::Serialize;

use crate::{
  record::{
    cdr::{format_caller_id, CdrRecord, EngineContext},
    dispositions::Disposition,
    party::VarList,
  },
  structure::{channel::AmaFlags, time::CdrTimestamp},
};

/// The public form of one finalized call record: the classic billing
/// columns.
///
/// Every field is deep-copied at construction, so an external record holds
/// no references into the engine and can outlive the chain it came from.
/// Unset timestamps serialize as the zero instant.
#[derive(Debug, Clone, Serialize)]
pub struct ExternalRecord {
  pub accountcode: String,
  pub amaflags: AmaFlags,
  /// Combined caller id, `"name" <number>`.
  pub clid: String,
  /// Caller number.
  pub src: String,
  /// Dialed extension.
  pub dst: String,
  /// Dialplan context the extension was dialed in.
  pub dcontext: String,
  /// Party A channel name.
  pub channel: String,
  /// Party B channel name, empty for single-party records.
  pub dstchannel: String,
  pub lastapp: String,
  pub lastdata: String,
  pub start: CdrTimestamp,
  pub answer: CdrTimestamp,
  pub end: CdrTimestamp,
  /// Whole seconds from start to end.
  pub duration: i64,
  /// Billed seconds from answer to end.
  pub billsec: i64,
  pub disposition: Disposition,
  pub uniqueid: String,
  pub linkedid: String,
  pub peeraccount: String,
  pub userfield: String,
  pub sequence: u32,
  /// Party A variables, in the order they were set.
  pub variables: VarList,
}

impl ExternalRecord {
  pub(crate) fn from_record(record: &CdrRecord, ctx: &EngineContext) -> Self {
    let a = &record.party_a.snapshot;
    ExternalRecord {
      accountcode: a.accountcode.clone(),
      amaflags: a.amaflags,
      clid: format_caller_id(&a.caller_name, &a.caller_number),
      src: a.caller_number.clone(),
      dst: a.exten.clone(),
      dcontext: a.context.clone(),
      channel: a.name.clone(),
      dstchannel: record.party_b.as_ref().map(|b| b.name().to_string()).unwrap_or_default(),
      lastapp: record.lastapp.clone(),
      lastdata: record.lastdata.clone(),
      start: record.start.unwrap_or_default(),
      answer: record.answer.unwrap_or_default(),
      end: record.end.unwrap_or_default(),
      duration: record.duration_secs(ctx),
      billsec: record.billsec_secs(ctx),
      disposition: record.disposition,
      uniqueid: a.uniqueid.clone(),
      linkedid: record.linkedid.clone(),
      peeraccount: a.peeraccount.clone(),
      userfield: record.party_a.userfield.clone(),
      sequence: record.sequence,
      variables: record.party_a.variables.clone(),
    }
  }
}
