//! Inbound event stream.
//!
//! Upstream channel and bridge producers publish four kinds of messages.
//! The contract per channel name: the first message is a channel update with
//! no old snapshot, the last is a channel update with no new snapshot, and
//! messages for one channel arrive in publication order.

use std::sync::Arc;

use crate::structure::{bridge::BridgeSnapshot, channel::ChannelSnapshot};

/// Channel name prefixes of synthetic helper channels (bridge announcement
/// and recording channels). These never produce billing records.
pub(crate) const SYNTHETIC_NAME_PREFIXES: [&str; 2] = ["CBAnn", "CBRec"];

/// One message from the upstream event stream.
#[derive(Debug, Clone)]
pub enum CdrEvent {
  /// Channel state transition. `old == None` announces a new channel,
  /// `new == None` announces its disappearance.
  Channel {
    old: Option<Arc<ChannelSnapshot>>,
    new: Option<Arc<ChannelSnapshot>>,
  },
  /// Dial lifecycle. An absent status is a dial begin; a present status is
  /// the dial end result (ANSWER, BUSY, CANCEL, NOANSWER, CONGESTION,
  /// FAILED). At least one of caller/peer is present.
  Dial {
    caller: Option<Arc<ChannelSnapshot>>,
    peer: Option<Arc<ChannelSnapshot>>,
    status: Option<String>,
  },
  /// A channel joined a bridge.
  BridgeEnter {
    bridge: Arc<BridgeSnapshot>,
    channel: Arc<ChannelSnapshot>,
  },
  /// A channel left a bridge.
  BridgeLeave {
    bridge: Arc<BridgeSnapshot>,
    channel: Arc<ChannelSnapshot>,
  },
}

/// True when the snapshot belongs to a synthetic helper channel and must be
/// dropped before dispatch.
pub(crate) fn filter_channel_snapshot(snapshot: &ChannelSnapshot) -> bool {
  SYNTHETIC_NAME_PREFIXES.iter().any(|prefix| snapshot.name.starts_with(prefix))
}

/// True when events about this bridge must be dropped before dispatch.
pub(crate) fn filter_bridge_snapshot(snapshot: &BridgeSnapshot) -> bool {
  snapshot.is_holding()
}
