use std::{
  sync::{Arc, Condvar, Mutex, RwLock},
  thread,
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{config::CdrConfig, engine::backend::BackendRegistry, record::external::ExternalRecord};

/// The slice of the engine configuration the dispatcher acts on. Updated in
/// place on reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchSettings {
  pub batch: bool,
  pub size: u32,
  pub time: u32,
  pub scheduler_only: bool,
  pub safe_shutdown: bool,
}

impl From<&CdrConfig> for BatchSettings {
  fn from(config: &CdrConfig) -> Self {
    BatchSettings {
      batch: config.batch,
      size: config.size,
      time: config.time,
      scheduler_only: config.scheduler_only,
      safe_shutdown: config.safe_shutdown,
    }
  }
}

struct SchedulerState {
  flush_now: bool,
  shutdown: bool,
  next_drain: Instant,
}

struct BatchShared {
  queue: Mutex<Vec<ExternalRecord>>,
  state: Mutex<SchedulerState>,
  cond: Condvar,
  settings: RwLock<BatchSettings>,
  backends: Arc<BackendRegistry>,
}

/// Buffers finalized records and hands them to the backends on a
/// size-or-time schedule.
///
/// With batching off, submission posts synchronously on the caller thread.
/// With batching on, records queue up; the scheduler thread drains the
/// queue every `time` seconds, immediately once `size` records are waiting,
/// or on an explicit submit. Each drain posts from a detached thread unless
/// `scheduler_only` is set or the engine is shutting down.
pub(crate) struct BatchDispatcher {
  shared: Arc<BatchShared>,
  worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BatchDispatcher {
  pub(crate) fn start(settings: BatchSettings, backends: Arc<BackendRegistry>) -> Self {
    let shared = Arc::new(BatchShared {
      queue: Mutex::new(Vec::new()),
      state: Mutex::new(SchedulerState {
        flush_now: false,
        shutdown: false,
        next_drain: Instant::now() + Duration::from_secs(u64::from(settings.time)),
      }),
      cond: Condvar::new(),
      settings: RwLock::new(settings),
      backends,
    });
    let worker = thread::Builder::new()
      .name("rustcdr batch scheduler".to_string())
      .spawn({
        let shared = Arc::clone(&shared);
        move || scheduler_loop(&shared)
      })
      .expect("Failed to spawn the CDR batch scheduler thread");
    BatchDispatcher {
      shared,
      worker: Mutex::new(Some(worker)),
    }
  }

  /// Accepts a list of finalized records from one dispatched chain.
  pub(crate) fn submit(&self, records: Vec<ExternalRecord>) {
    if records.is_empty() {
      return;
    }
    let settings = *self.shared.settings.read().unwrap();
    if !settings.batch {
      for record in &records {
        self.shared.backends.post(record);
      }
      return;
    }
    let queued = {
      let mut queue = self.shared.queue.lock().unwrap();
      queue.extend(records);
      queue.len()
    };
    if queued >= settings.size as usize {
      trace!("CDR batch reached {} records, scheduling immediate drain", queued);
      self.submit_unscheduled();
    }
  }

  /// Wakes the scheduler for an immediate drain.
  pub(crate) fn submit_unscheduled(&self) {
    let mut state = self.shared.state.lock().unwrap();
    state.flush_now = true;
    self.shared.cond.notify_all();
  }

  pub(crate) fn update_settings(&self, settings: BatchSettings) {
    let reschedule = {
      let mut current = self.shared.settings.write().unwrap();
      let changed = current.time != settings.time || current.batch != settings.batch;
      *current = settings;
      changed
    };
    if reschedule {
      let mut state = self.shared.state.lock().unwrap();
      state.next_drain = Instant::now() + Duration::from_secs(u64::from(settings.time));
      self.shared.cond.notify_all();
    }
  }

  pub(crate) fn queued(&self) -> usize {
    self.shared.queue.lock().unwrap().len()
  }

  /// Time until the next scheduled drain, while batching is active.
  pub(crate) fn next_drain_in(&self) -> Option<Duration> {
    if !self.shared.settings.read().unwrap().batch {
      return None;
    }
    let state = self.shared.state.lock().unwrap();
    if state.shutdown {
      None
    } else {
      Some(state.next_drain.saturating_duration_since(Instant::now()))
    }
  }

  /// Stops the scheduler. With safe shutdown configured, pending records are
  /// drained synchronously so a graceful exit loses nothing. Idempotent.
  pub(crate) fn shutdown(&self) {
    {
      let mut state = self.shared.state.lock().unwrap();
      if state.shutdown {
        return;
      }
      state.shutdown = true;
    }
    self.shared.cond.notify_all();
    if let Some(worker) = self.worker.lock().unwrap().take() {
      let _ = worker.join();
    }
    if self.shared.settings.read().unwrap().safe_shutdown {
      drain(&self.shared, true);
    }
  }
}

fn scheduler_loop(shared: &Arc<BatchShared>) {
  loop {
    let shutting_down = {
      let mut state = shared.state.lock().unwrap();
      loop {
        if state.shutdown || state.flush_now {
          break;
        }
        let now = Instant::now();
        if now >= state.next_drain {
          break;
        }
        let wait = state.next_drain - now;
        let (guard, _timeout) = shared.cond.wait_timeout(state, wait).unwrap();
        state = guard;
      }
      state.flush_now = false;
      let time = shared.settings.read().unwrap().time;
      state.next_drain = Instant::now() + Duration::from_secs(u64::from(time));
      state.shutdown
    };
    if shutting_down {
      if shared.settings.read().unwrap().safe_shutdown {
        drain(shared, true);
      }
      return;
    }
    drain(shared, false);
  }
}

/// Swaps the queue out and posts its records, inline or from a detached
/// posting thread.
fn drain(shared: &Arc<BatchShared>, at_shutdown: bool) {
  let records = {
    let mut queue = shared.queue.lock().unwrap();
    std::mem::take(&mut *queue)
  };
  if records.is_empty() {
    return;
  }
  debug!("Draining {} CDR records to backends", records.len());
  let inline = at_shutdown || shared.settings.read().unwrap().scheduler_only;
  if inline {
    for record in &records {
      shared.backends.post(record);
    }
    return;
  }
  let count = records.len();
  let backends = Arc::clone(&shared.backends);
  let spawned = thread::Builder::new()
    .name("rustcdr batch post".to_string())
    .spawn(move || {
      for record in &records {
        backends.post(record);
      }
    });
  if let Err(e) = spawned {
    error!("Failed to spawn a CDR posting thread, {} records lost: {}", count, e);
  }
}
