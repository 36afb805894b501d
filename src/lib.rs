//! Call Detail Record (CDR) engine for telephony servers, in native Rust.
//!
//! The engine consumes the asynchronous stream of channel and bridge events
//! a telephony core publishes (snapshots of channel state, dial begin/end,
//! bridge enter/leave), aggregates them into billable call records, and
//! delivers finalized records to pluggable backends, either one by one or
//! in batches.
//!
//! Each channel owns a chain of records; a per-channel state machine
//! decides when a record starts, who its Party A and Party B are, when it
//! is finalized, and when the chain grows a fresh record. When channels
//! meet in a bridge, the pairing algorithm establishes exactly one record
//! per pair of participants.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rustcdr::{Backend, CdrConfig, CdrEngine, ExternalRecord};
//!
//! struct LogBackend;
//!
//! impl Backend for LogBackend {
//!   fn process(
//!     &self,
//!     record: &ExternalRecord,
//!   ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     println!("{} -> {} ({})", record.channel, record.dstchannel, record.disposition);
//!     Ok(())
//!   }
//! }
//!
//! let engine = CdrEngine::new(CdrConfig::default());
//! engine.register_backend("log", "prints records", Arc::new(LogBackend)).unwrap();
//! // The channel/bridge producers feed events in through
//! // `engine.handle_event(...)`; finalized records reach the backends.
//! engine.shutdown();
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod record;
pub mod structure;

pub use crate::{
  config::CdrConfig,
  engine::{
    backend::{Backend, MAX_BACKEND_NAME_LENGTH},
    CdrEngine, EngineStatus,
  },
  error::{CdrError, CdrResult},
  events::CdrEvent,
  record::{
    cdr::CdrState, dispositions::Disposition, external::ExternalRecord, party::VarList, CdrOption,
  },
  structure::{
    bridge::BridgeSnapshot,
    channel::{AmaFlags, ChannelFlag, ChannelSnapshot, ChannelState, HangupCause},
    time::{CdrTimestamp, Clock, SystemClock},
  },
};

#[cfg(test)]
pub(crate) mod test_util;
