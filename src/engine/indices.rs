use std::sync::Arc;

use dashmap::DashMap;

use crate::record::chain::CdrChain;

/// Live chains keyed by Party A channel name, case-folded.
///
/// Reads are lock-free and mutation locks only the touched shard, so a
/// thread may consult the index while holding a chain lock. The reverse
/// never happens: callers clone the chain handle out of the index before
/// locking it.
pub(crate) struct ChannelIndex {
  map: DashMap<String, Arc<CdrChain>>,
}

impl ChannelIndex {
  pub(crate) fn new() -> Self {
    ChannelIndex { map: DashMap::new() }
  }

  pub(crate) fn get(&self, channel_name: &str) -> Option<Arc<CdrChain>> {
    self.map.get(&channel_name.to_lowercase()).map(|entry| Arc::clone(entry.value()))
  }

  /// Inserts the chain unless one already exists for its channel. Returns
  /// whether it was inserted.
  pub(crate) fn insert(&self, chain: Arc<CdrChain>) -> bool {
    let mut inserted = false;
    self.map.entry(chain.key().to_string()).or_insert_with(|| {
      inserted = true;
      chain
    });
    inserted
  }

  pub(crate) fn remove(&self, channel_name: &str) -> Option<Arc<CdrChain>> {
    self.map.remove(&channel_name.to_lowercase()).map(|(_, chain)| chain)
  }

  pub(crate) fn contains(&self, channel_name: &str) -> bool {
    self.map.contains_key(&channel_name.to_lowercase())
  }

  /// A point-in-time copy of every chain handle, safe to lock one by one.
  pub(crate) fn all_chains(&self) -> Vec<Arc<CdrChain>> {
    self.map.iter().map(|entry| Arc::clone(entry.value())).collect()
  }

  pub(crate) fn len(&self) -> usize {
    self.map.len()
  }
}

/// Chains currently in a bridge, keyed by bridge id.
pub(crate) struct BridgeIndex {
  map: DashMap<String, Vec<Arc<CdrChain>>>,
}

impl BridgeIndex {
  pub(crate) fn new() -> Self {
    BridgeIndex { map: DashMap::new() }
  }

  pub(crate) fn add(&self, bridge_id: &str, chain: &Arc<CdrChain>) {
    let mut entry = self.map.entry(bridge_id.to_string()).or_default();
    if !entry.iter().any(|c| c.key() == chain.key()) {
      entry.push(Arc::clone(chain));
    }
  }

  pub(crate) fn remove(&self, bridge_id: &str, chain_key: &str) {
    let emptied = {
      match self.map.get_mut(bridge_id) {
        Some(mut entry) => {
          entry.retain(|c| c.key() != chain_key);
          entry.is_empty()
        }
        None => false,
      }
    };
    if emptied {
      self.map.remove_if(bridge_id, |_, chains| chains.is_empty());
    }
  }

  /// A point-in-time copy of the chains in the bridge, safe to lock one by
  /// one.
  pub(crate) fn chains(&self, bridge_id: &str) -> Vec<Arc<CdrChain>> {
    self
      .map
      .get(bridge_id)
      .map(|entry| entry.value().to_vec())
      .unwrap_or_default()
  }
}
