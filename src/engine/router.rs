//! The event router: single consumer of the merged channel/bridge stream.
//!
//! Dispatch is serialized on the router lock, so handlers see chains and
//! indices in a consistent state. Chain locks are taken one at a time;
//! anything needed across chains (bridge candidates, party snapshots for
//! the dial owner decision) is cloned out first.

use std::{
  collections::HashSet,
  sync::{atomic::Ordering, Arc},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  engine::CdrEngine,
  events::{filter_bridge_snapshot, filter_channel_snapshot, CdrEvent},
  record::{
    cdr::{BridgeCandidate, CdrRecord, CdrState, EngineContext},
    chain::CdrChain,
    party::{pick_party_a, PartyPick},
  },
  structure::{
    bridge::BridgeSnapshot,
    channel::{dialplan_position_changed, ChannelSnapshot},
  },
};

impl CdrEngine {
  /// Feeds one upstream event into the engine.
  ///
  /// May be called from any publishing thread; events are dispatched one at
  /// a time in arrival order. While the engine is disabled only channel
  /// disappearance is honored, so that already-tracked channels do not leak.
  pub fn handle_event(&self, event: CdrEvent) {
    let enabled = self.enabled.load(Ordering::SeqCst);
    let _dispatch = self.router.lock().unwrap();
    let config = self.config.read().unwrap().clone();
    let ctx = EngineContext {
      clock: self.clock.as_ref(),
      config: &config,
      debug: self.debug.load(Ordering::Relaxed),
    };
    match event {
      CdrEvent::Channel { old, new } => match (old, new) {
        (None, None) => warn!("Channel update with no snapshots, dropping"),
        (None, Some(new)) => {
          if enabled && !filter_channel_snapshot(&new) {
            self.create_chain(&new, &ctx);
          }
        }
        (Some(old), Some(new)) => {
          if enabled && !filter_channel_snapshot(&new) {
            self.update_channel(&old, &new, &ctx);
          }
        }
        (Some(old), None) => {
          if !filter_channel_snapshot(&old) {
            self.remove_channel(&old, enabled, &ctx);
          }
        }
      },
      CdrEvent::Dial { caller, peer, status } => {
        if enabled {
          self.handle_dial(caller, peer, status.as_deref(), &ctx);
        }
      }
      CdrEvent::BridgeEnter { bridge, channel } => {
        if enabled {
          self.handle_bridge_enter(&bridge, &channel, &ctx);
        }
      }
      CdrEvent::BridgeLeave { bridge, channel } => {
        if enabled {
          self.handle_bridge_leave(&bridge, &channel, &ctx);
        }
      }
    }
  }

  fn create_chain(&self, snapshot: &Arc<ChannelSnapshot>, ctx: &EngineContext) {
    if self.channels.contains(&snapshot.name) {
      warn!(
        "Channel {} already has a CDR chain, ignoring duplicate announcement",
        snapshot.name
      );
      return;
    }
    let record = CdrRecord::new(Arc::clone(snapshot), self.next_sequence(), ctx);
    let chain = Arc::new(CdrChain::new(record));
    self.channels.insert(chain);
    if ctx.debug {
      debug!("Created CDR chain for {}", snapshot.name);
    }
  }

  fn update_channel(
    &self,
    old: &Arc<ChannelSnapshot>,
    new: &Arc<ChannelSnapshot>,
    ctx: &EngineContext,
  ) {
    let chain = match self.channels.get(&new.name) {
      Some(chain) => chain,
      None => {
        warn!("No CDR chain for channel {}, dropping update", new.name);
        return;
      }
    };
    {
      let mut inner = chain.lock();
      let mut all_unhandled = true;
      for record in &mut inner.records {
        if record.process_party_a(new, ctx) {
          all_unhandled = false;
        }
      }
      // Every record is done with this channel, but the channel is still
      // executing dialplan: it gets a fresh record.
      if all_unhandled
        && !new.is_zombie()
        && !new.appl.is_empty()
        && dialplan_position_changed(old, new)
      {
        let sequence = self.next_sequence();
        let record = inner.append_successor(sequence, ctx);
        record.process_party_a(new, ctx);
      }
    }
    // Records elsewhere tracking this channel as their Party B.
    for other in self.channels.all_chains() {
      if other.key() == chain.key() {
        continue;
      }
      let mut inner = other.lock();
      for record in &mut inner.records {
        if record.matches_party_b(&new.name) {
          record.process_party_b(new, ctx);
        }
      }
    }
  }

  fn remove_channel(&self, old: &Arc<ChannelSnapshot>, enabled: bool, ctx: &EngineContext) {
    let chain = match (self.channels.get(&old.name), enabled) {
      (Some(chain), true) => chain,
      (Some(chain), false) => {
        // Disabled mid-call: reap the chain without producing records.
        self.channels.remove(&old.name);
        debug!("Dropping CDR chain for {} while disabled", chain.party_a_name());
        return;
      }
      (None, _) => {
        warn!("No CDR chain for channel {}, dropping removal", old.name);
        return;
      }
    };
    let externals = {
      let mut inner = chain.lock();
      inner.finalize_all(ctx);
      inner.externalize(ctx)
    };
    if ctx.debug {
      debug!("Dispatching {} records for {}", externals.len(), old.name);
    }
    self.batch.submit(externals);
    self.channels.remove(&old.name);
    // Whoever tracked this channel as Party B has lost their call leg; the
    // records settle in place and their own Party A picks up from here.
    for other in self.channels.all_chains() {
      let mut inner = other.lock();
      for record in &mut inner.records {
        if record.matches_party_b(&old.name) {
          record.finalize(ctx);
        }
      }
    }
  }

  fn handle_dial(
    &self,
    caller: Option<Arc<ChannelSnapshot>>,
    peer: Option<Arc<ChannelSnapshot>>,
    status: Option<&str>,
    ctx: &EngineContext,
  ) {
    let caller = caller.filter(|c| !filter_channel_snapshot(c));
    let peer = peer.filter(|p| !filter_channel_snapshot(p));
    let caller_chain = caller.as_ref().and_then(|c| self.channels.get(&c.name));
    let peer_chain = peer.as_ref().and_then(|p| self.channels.get(&p.name));

    // Exactly one chain processes the dial. With both ends known, the one
    // whose Party A wins the comparison owns it; the loser's side is only
    // ever touched through the Party B passes.
    let owner = match (&caller_chain, &peer_chain) {
      (Some(c), Some(p)) => {
        let caller_party = c.lock().last().party_a.clone();
        let peer_party = p.lock().last().party_a.clone();
        match pick_party_a(&caller_party, &peer_party) {
          PartyPick::Left => Arc::clone(c),
          PartyPick::Right => Arc::clone(p),
        }
      }
      (Some(c), None) => Arc::clone(c),
      (None, Some(p)) => Arc::clone(p),
      (None, None) => {
        warn!("Dial message names no tracked channel, dropping");
        return;
      }
    };

    let status = status.filter(|s| !s.is_empty());
    let mut inner = owner.lock();
    match status {
      None => {
        let mut handled = false;
        for record in &mut inner.records {
          if record.process_dial_begin(caller.as_ref(), peer.as_ref(), ctx) {
            handled = true;
            break;
          }
        }
        if !handled {
          let sequence = self.next_sequence();
          let record = inner.append_successor(sequence, ctx);
          record.process_dial_begin(caller.as_ref(), peer.as_ref(), ctx);
        }
      }
      Some(status) => {
        for record in &mut inner.records {
          record.process_dial_end(caller.as_ref(), peer.as_ref(), status, ctx);
        }
      }
    }
  }

  fn handle_bridge_enter(
    &self,
    bridge: &Arc<BridgeSnapshot>,
    channel: &Arc<ChannelSnapshot>,
    ctx: &EngineContext,
  ) {
    if filter_bridge_snapshot(bridge) || filter_channel_snapshot(channel) {
      return;
    }
    let chain = match self.channels.get(&channel.name) {
      Some(chain) => chain,
      None => {
        warn!("No CDR chain for channel {} entering bridge {}", channel.name, bridge.uniqueid);
        return;
      }
    };
    let candidates = self.collect_bridge_candidates(&bridge.uniqueid, chain.key());

    let (seed_sequence, candidate_finalize) = {
      let mut inner = chain.lock();
      for record in &mut inner.records {
        record.process_party_a(channel, ctx);
      }
      let mut handled = None;
      let mut effect = None;
      for record in &mut inner.records {
        if handled.is_none() {
          let (was_handled, candidate) =
            record.process_bridge_enter(&bridge.uniqueid, &candidates, ctx);
          if was_handled {
            handled = Some(record.sequence);
            effect = candidate;
          }
        }
      }
      match handled {
        Some(sequence) => (sequence, effect),
        None => {
          // The channel is Party A for nobody in this bridge.
          inner.finalize_all(ctx);
          (inner.last().sequence, effect)
        }
      }
    };

    if let Some(candidate) = candidate_finalize {
      let mut inner = candidate.chain.lock();
      if let Some(record) = inner.find_by_sequence_mut(candidate.record_sequence) {
        record.finalize(ctx);
      }
    }

    self.bridge_pairings(&chain, seed_sequence, &bridge.uniqueid, &candidates, ctx);
    self.bridges.add(&bridge.uniqueid, &chain);
  }

  fn handle_bridge_leave(
    &self,
    bridge: &Arc<BridgeSnapshot>,
    channel: &Arc<ChannelSnapshot>,
    ctx: &EngineContext,
  ) {
    if filter_bridge_snapshot(bridge) || filter_channel_snapshot(channel) {
      return;
    }
    let chain = match self.channels.get(&channel.name) {
      Some(chain) => chain,
      None => {
        warn!("No CDR chain for channel {} leaving bridge {}", channel.name, bridge.uniqueid);
        return;
      }
    };
    let handled = {
      let mut inner = chain.lock();
      let mut handled = false;
      for record in &mut inner.records {
        if record.process_bridge_leave(&bridge.uniqueid, &channel.name, ctx) {
          record.bridge_id = None;
          handled = true;
        }
      }
      if handled {
        let sequence = self.next_sequence();
        let record = inner.append_successor(sequence, ctx);
        record.transition(CdrState::BridgedPending, ctx);
      }
      handled
    };
    if handled {
      self.bridges.remove(&bridge.uniqueid, chain.key());
    }
    // Peers still in the bridge who tracked the leaving channel as Party B.
    for other in self.bridges.chains(&bridge.uniqueid) {
      if other.key() == chain.key() {
        continue;
      }
      let mut inner = other.lock();
      for record in &mut inner.records {
        if record.state == CdrState::Bridged && record.matches_party_b(&channel.name) {
          record.finalize(ctx);
        }
      }
    }
  }

  /// Enumerates the parties present in a bridge: every chain's Party A
  /// first, then Party Bs not already collected, deduplicated by channel
  /// name. Only records actually bridged here count.
  fn collect_bridge_candidates(&self, bridge_id: &str, exclude_key: &str) -> Vec<BridgeCandidate> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut candidates = Vec::new();
    let mut party_b_slots = Vec::new();
    for chain in self.bridges.chains(bridge_id) {
      if chain.key() == exclude_key {
        continue;
      }
      let inner = chain.lock();
      for record in &inner.records {
        if record.state != CdrState::Bridged || record.bridge_id.as_deref() != Some(bridge_id) {
          continue;
        }
        if seen.insert(record.party_a_name.to_lowercase()) {
          candidates.push(BridgeCandidate {
            chain: Arc::clone(&chain),
            party: record.party_a.clone(),
            from_party_a: true,
            record_sequence: record.sequence,
            record_party_b: record.party_b.as_ref().map(|b| b.name().to_string()),
          });
        }
        if let Some(b) = &record.party_b {
          party_b_slots.push((
            b.name().to_lowercase(),
            BridgeCandidate {
              chain: Arc::clone(&chain),
              party: b.clone(),
              from_party_a: false,
              record_sequence: record.sequence,
              record_party_b: None,
            },
          ));
        }
      }
    }
    for (name, candidate) in party_b_slots {
      if seen.insert(name) {
        candidates.push(candidate);
      }
    }
    candidates
  }

  /// Establishes a record for every pair of channels meeting in the bridge,
  /// seeded from the record that handled the bridge enter.
  fn bridge_pairings(
    &self,
    our_chain: &Arc<CdrChain>,
    seed_sequence: u32,
    bridge_id: &str,
    candidates: &[BridgeCandidate],
    ctx: &EngineContext,
  ) {
    let (our_party_a, our_party_b) = {
      let inner = our_chain.lock();
      match inner.find_by_sequence(seed_sequence) {
        Some(seed) => (seed.party_a.clone(), seed.party_b.as_ref().map(|b| b.name().to_lowercase())),
        None => return,
      }
    };
    for candidate in candidates {
      let candidate_key = candidate.party.name().to_lowercase();
      if candidate_key == our_party_a.name().to_lowercase() {
        continue;
      }
      if our_party_b.as_deref() == Some(candidate_key.as_str()) {
        continue;
      }
      match pick_party_a(&our_party_a, &candidate.party) {
        PartyPick::Left => {
          // We bill this pair: a fresh record on our chain.
          let mut inner = our_chain.lock();
          let sequence = self.next_sequence();
          let record = inner.append_successor(sequence, ctx);
          record.party_b = Some(candidate.party.clone());
          record.bridge_id = Some(bridge_id.to_string());
          record.transition(CdrState::Bridged, ctx);
        }
        PartyPick::Right if candidate.from_party_a => {
          // The candidate bills this pair on the record we found it in,
          // unless that record already tracks someone else.
          let mut inner = candidate.chain.lock();
          if let Some(record) = inner.find_by_sequence_mut(candidate.record_sequence) {
            let occupied = record
              .party_b
              .as_ref()
              .is_some_and(|b| !b.name().eq_ignore_ascii_case(our_party_a.name()));
            if occupied {
              let sequence = self.next_sequence();
              let new_record = inner.append_successor(sequence, ctx);
              new_record.party_b = Some(our_party_a.clone());
              new_record.bridge_id = Some(bridge_id.to_string());
              new_record.transition(CdrState::Bridged, ctx);
            } else {
              record.party_b = Some(our_party_a.clone());
              // It may have been tentatively finalized while alone.
              record.end = None;
            }
          }
        }
        PartyPick::Right => {
          // The candidate was only known as someone's Party B; the pairing
          // belongs on its own chain.
          match self.channels.get(candidate.party.name()) {
            Some(own_chain) => {
              {
                let mut inner = own_chain.lock();
                let sequence = self.next_sequence();
                let record = inner.append_successor(sequence, ctx);
                record.party_b = Some(our_party_a.clone());
                record.bridge_id = Some(bridge_id.to_string());
                record.transition(CdrState::Bridged, ctx);
              }
              self.bridges.add(bridge_id, &own_chain);
            }
            None => {
              let sequence = self.next_sequence();
              let mut record =
                CdrRecord::new(Arc::clone(&candidate.party.snapshot), sequence, ctx);
              record.party_a = candidate.party.clone();
              record.party_b = Some(our_party_a.clone());
              record.bridge_id = Some(bridge_id.to_string());
              record.transition(CdrState::Bridged, ctx);
              let chain = Arc::new(CdrChain::new(record));
              self.channels.insert(Arc::clone(&chain));
              self.bridges.add(bridge_id, &chain);
            }
          }
        }
      }
    }
  }
}
