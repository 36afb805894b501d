use serde::{Deserialize, Serialize};

/// Bridge technology used for parking-style holding bridges. Events about
/// these are invisible to record keeping.
pub const HOLDING_BRIDGE_TECHNOLOGY: &str = "holding_bridge";

/// Point-in-time state of one bridge. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSnapshot {
  /// Bridge identifier, the bridge index key.
  pub uniqueid: String,
  /// Mixing technology driving the bridge.
  pub technology: String,
}

impl BridgeSnapshot {
  pub fn is_holding(&self) -> bool {
    self.technology == HOLDING_BRIDGE_TECHNOLOGY
  }
}
