//! The engine: public API, configuration handling, and the machinery
//! underneath it (event router, indices, batch dispatcher, backends).

pub mod backend;
pub(crate) mod batch;
pub(crate) mod indices;
mod router;

use std::{
  fmt,
  sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex, RwLock,
  },
  time::Duration,
};

use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use static_assertions::assert_impl_all;

use crate::{
  config::CdrConfig,
  engine::{
    backend::{Backend, BackendRegistry},
    batch::{BatchDispatcher, BatchSettings},
    indices::{BridgeIndex, ChannelIndex},
  },
  error::{CdrError, CdrResult},
  record::{
    cdr::{is_standard_property, EngineContext},
    chain::CdrChain,
    CdrOption,
  },
  structure::time::{Clock, SystemClock},
};

/// The Call Detail Record engine.
///
/// One engine instance observes the channel/bridge event stream of one
/// telephony server and produces billing records. It is a constructed value
/// with its own lifetime: indices and the batch scheduler are created here
/// and torn down on [`shutdown`](CdrEngine::shutdown) (or drop), with no
/// process-wide state.
///
/// All methods take `&self`; the engine is meant to be shared behind an
/// `Arc` between the event producers, API callers, and a control surface.
pub struct CdrEngine {
  pub(crate) config: RwLock<CdrConfig>,
  pub(crate) enabled: AtomicBool,
  pub(crate) debug: AtomicBool,
  sequence: AtomicU32,
  pub(crate) clock: Arc<dyn Clock>,
  pub(crate) channels: ChannelIndex,
  pub(crate) bridges: BridgeIndex,
  backends: Arc<BackendRegistry>,
  pub(crate) batch: BatchDispatcher,
  /// Serializes event dispatch; see the router.
  pub(crate) router: Mutex<()>,
}

assert_impl_all!(CdrEngine: Send, Sync);

impl CdrEngine {
  pub fn new(config: CdrConfig) -> Self {
    Self::with_clock(config, Arc::new(SystemClock))
  }

  /// Creates an engine with an injected clock. Record timestamps come from
  /// the clock, which lets tests drive time explicitly.
  pub fn with_clock(config: CdrConfig, clock: Arc<dyn Clock>) -> Self {
    let config = config.validated();
    let backends = Arc::new(BackendRegistry::new());
    let batch = BatchDispatcher::start(BatchSettings::from(&config), Arc::clone(&backends));
    info!(
      "CDR engine starting, {} mode{}",
      if config.batch { "batch" } else { "simple" },
      if config.enable { "" } else { ", disabled" },
    );
    CdrEngine {
      enabled: AtomicBool::new(config.enable),
      debug: AtomicBool::new(config.debug),
      sequence: AtomicU32::new(1),
      clock,
      channels: ChannelIndex::new(),
      bridges: BridgeIndex::new(),
      backends,
      batch,
      router: Mutex::new(()),
      config: RwLock::new(config),
    }
  }

  /// Next value of the global record sequence counter.
  pub(crate) fn next_sequence(&self) -> u32 {
    self.sequence.fetch_add(1, Ordering::SeqCst)
  }

  fn with_ctx<R>(&self, f: impl FnOnce(&EngineContext) -> R) -> R {
    let config = self.config.read().unwrap().clone();
    let ctx = EngineContext {
      clock: self.clock.as_ref(),
      config: &config,
      debug: self.debug.load(Ordering::Relaxed),
    };
    f(&ctx)
  }

  fn chain_for(&self, channel_name: &str) -> CdrResult<Arc<CdrChain>> {
    self.channels.get(channel_name).ok_or_else(|| CdrError::NotFound {
      channel: channel_name.to_string(),
    })
  }

  // --- variables and record fields ------------------------------------

  /// Reads a variable or standard property off the channel's newest record.
  /// `Ok(None)` means the chain exists but the variable is unset.
  pub fn get_var(&self, channel_name: &str, name: &str) -> CdrResult<Option<String>> {
    let chain = self.chain_for(channel_name)?;
    self.with_ctx(|ctx| Ok(chain.lock().get_var(name, ctx)))
  }

  /// Sets a variable on every non-finalized record that has the channel as
  /// one of its parties, across all chains. `None` deletes the variable.
  /// Standard property names are read-only.
  pub fn set_var(&self, channel_name: &str, name: &str, value: Option<&str>) -> CdrResult<()> {
    if is_standard_property(name) {
      warn!("'{}' is a standard CDR property, refusing to overwrite it", name);
      return Err(CdrError::ReadOnlyVariable { name: name.to_string() });
    }
    let mut touched = false;
    for chain in self.channels.all_chains() {
      if chain.lock().set_var(channel_name, name, value) {
        touched = true;
      }
    }
    if touched {
      Ok(())
    } else {
      Err(CdrError::NotFound { channel: channel_name.to_string() })
    }
  }

  /// Copies the userfield onto every non-finalized record involving the
  /// channel, on either side of the call.
  pub fn set_userfield(&self, channel_name: &str, userfield: &str) -> CdrResult<()> {
    self.chain_for(channel_name)?;
    for chain in self.channels.all_chains() {
      chain.lock().set_userfield(channel_name, userfield);
    }
    Ok(())
  }

  /// Sets an option flag on every non-finalized record of the channel's
  /// chain.
  pub fn set_property(&self, channel_name: &str, option: CdrOption) -> CdrResult<()> {
    let chain = self.chain_for(channel_name)?;
    chain.lock().set_property(option);
    Ok(())
  }

  pub fn clear_property(&self, channel_name: &str, option: CdrOption) -> CdrResult<()> {
    let chain = self.chain_for(channel_name)?;
    chain.lock().clear_property(option);
    Ok(())
  }

  /// Restarts the chain's records from now. `KeepVars` preserves variables.
  pub fn reset(&self, channel_name: &str, options: BitFlags<CdrOption>) -> CdrResult<()> {
    let chain = self.chain_for(channel_name)?;
    self.with_ctx(|ctx| chain.lock().reset(options, ctx));
    Ok(())
  }

  /// Appends a fresh record to the channel's chain. Refuses when the newest
  /// record is already finalized. Options: `SetAnswer`, `Reset`, `KeepVars`,
  /// `Finalize`.
  pub fn fork(&self, channel_name: &str, options: BitFlags<CdrOption>) -> CdrResult<()> {
    let chain = self.chain_for(channel_name)?;
    let sequence = self.next_sequence();
    self.with_ctx(|ctx| chain.lock().fork(options, sequence, ctx))
  }

  /// Renders all variables and properties of the chain's records.
  pub fn serialize_variables(
    &self,
    channel_name: &str,
    delim: char,
    sep: char,
  ) -> CdrResult<String> {
    let chain = self.chain_for(channel_name)?;
    self.with_ctx(|ctx| Ok(chain.lock().serialize_variables(delim, sep, ctx)))
  }

  // --- backends and batching ------------------------------------------

  /// Registers a record sink. Names are unique case-insensitively and at
  /// most [`backend::MAX_BACKEND_NAME_LENGTH`] characters.
  pub fn register_backend(
    &self,
    name: &str,
    description: &str,
    backend: Arc<dyn Backend>,
  ) -> CdrResult<()> {
    self.backends.register(name, description, backend)
  }

  pub fn unregister_backend(&self, name: &str) -> bool {
    self.backends.unregister(name)
  }

  /// Forces an immediate batch drain, the `cdr submit` console command.
  pub fn submit(&self) {
    self.batch.submit_unscheduled();
  }

  // --- control surface -------------------------------------------------

  /// The `cdr set debug on|off` console command.
  pub fn set_debug(&self, on: bool) {
    self.debug.store(on, Ordering::Relaxed);
    info!("CDR debugging {}", if on { "enabled" } else { "disabled" });
  }

  pub fn debug_enabled(&self) -> bool {
    self.debug.load(Ordering::Relaxed)
  }

  pub fn enable(&self) {
    self.enabled.store(true, Ordering::SeqCst);
  }

  /// Stops record keeping. Inbound events are dropped while disabled;
  /// channels that disappear are reaped without producing records.
  pub fn disable(&self) {
    self.enabled.store(false, Ordering::SeqCst);
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled.load(Ordering::SeqCst)
  }

  /// Number of channels with a live record chain.
  pub fn active_channel_count(&self) -> usize {
    self.channels.len()
  }

  /// Applies a fresh configuration. Batch parameters take effect on the
  /// running dispatcher.
  pub fn reload(&self, config: CdrConfig) {
    let config = config.validated();
    self.enabled.store(config.enable, Ordering::SeqCst);
    self.debug.store(config.debug, Ordering::Relaxed);
    self.batch.update_settings(BatchSettings::from(&config));
    *self.config.write().unwrap() = config;
    info!("CDR engine configuration reloaded");
  }

  /// Stops the batch scheduler, draining pending records synchronously when
  /// safe shutdown is configured. Idempotent; also runs on drop.
  pub fn shutdown(&self) {
    self.batch.shutdown();
  }

  /// A snapshot of the engine state, the `cdr show status` console command.
  pub fn status(&self) -> EngineStatus {
    EngineStatus {
      enabled: self.enabled.load(Ordering::SeqCst),
      debug: self.debug.load(Ordering::Relaxed),
      batch_mode: self.config.read().unwrap().batch,
      active_channels: self.channels.len(),
      queued_records: self.batch.queued(),
      next_drain_in: self.batch.next_drain_in(),
      backends: self.backends.descriptions(),
    }
  }
}

impl Drop for CdrEngine {
  fn drop(&mut self) {
    self.shutdown();
  }
}

/// Point-in-time engine state for the status console.
#[derive(Debug, Clone)]
pub struct EngineStatus {
  pub enabled: bool,
  pub debug: bool,
  pub batch_mode: bool,
  pub active_channels: usize,
  pub queued_records: usize,
  pub next_drain_in: Option<Duration>,
  pub backends: Vec<(String, String)>,
}

impl fmt::Display for EngineStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "CDR logging: {}", if self.enabled { "enabled" } else { "disabled" })?;
    writeln!(f, "  Mode: {}", if self.batch_mode { "batch" } else { "simple" })?;
    writeln!(f, "  Debug: {}", if self.debug { "on" } else { "off" })?;
    writeln!(f, "  Active channels: {}", self.active_channels)?;
    if self.batch_mode {
      writeln!(f, "  Queued records: {}", self.queued_records)?;
      if let Some(eta) = self.next_drain_in {
        writeln!(f, "  Next batch drain: {}s", eta.as_secs())?;
      }
    }
    writeln!(f, "  Registered backends: {}", self.backends.len())?;
    for (name, description) in &self.backends {
      writeln!(f, "    {name} : {description}")?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_util::CaptureBackend;

  #[test]
  fn status_reflects_configuration_and_backends() {
    let engine = CdrEngine::new(CdrConfig::default());
    engine
      .register_backend("capture", "test sink", Arc::new(CaptureBackend::new()))
      .unwrap();

    let status = engine.status();
    assert!(status.enabled);
    assert!(!status.batch_mode);
    assert_eq!(status.active_channels, 0);
    assert_eq!(status.backends.len(), 1);

    let rendered = status.to_string();
    assert!(rendered.contains("CDR logging: enabled"));
    assert!(rendered.contains("Mode: simple"));
    assert!(rendered.contains("capture : test sink"));

    engine.shutdown();
  }

  #[test]
  fn reload_switches_modes_and_the_master_switch() {
    let engine = CdrEngine::new(CdrConfig::default());
    assert!(engine.is_enabled());

    engine.reload(CdrConfig {
      enable: false,
      batch: true,
      debug: true,
      ..Default::default()
    });
    assert!(!engine.is_enabled());
    assert!(engine.debug_enabled());
    assert!(engine.status().batch_mode);
    assert!(engine.status().next_drain_in.is_some());

    engine.shutdown();
  }

  #[test]
  fn api_calls_for_unknown_channels_report_not_found() {
    let engine = CdrEngine::new(CdrConfig::default());
    let missing = "PJSIP/nobody-00000001";
    assert!(matches!(
      engine.get_var(missing, "channel"),
      Err(CdrError::NotFound { .. })
    ));
    assert!(matches!(
      engine.set_userfield(missing, "x"),
      Err(CdrError::NotFound { .. })
    ));
    assert!(matches!(
      engine.reset(missing, BitFlags::empty()),
      Err(CdrError::NotFound { .. })
    ));
    engine.shutdown();
  }
}
