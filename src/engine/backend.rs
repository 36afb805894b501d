use std::sync::{Arc, RwLock};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::{CdrError, CdrResult},
  record::external::ExternalRecord,
};

/// Longest allowed backend name.
pub const MAX_BACKEND_NAME_LENGTH: usize = 20;

/// A sink for finalized call records.
///
/// Implementations must not retain the record reference past the call; the
/// record is freed once every backend has seen it. A failure is logged and
/// isolated to the failing backend, with no retry.
pub trait Backend: Send + Sync {
  fn process(
    &self,
    record: &ExternalRecord,
  ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

struct BackendEntry {
  name: String,
  description: String,
  backend: Arc<dyn Backend>,
}

/// The set of registered backends, visited in registration order.
pub(crate) struct BackendRegistry {
  entries: RwLock<Vec<BackendEntry>>,
}

impl BackendRegistry {
  pub(crate) fn new() -> Self {
    BackendRegistry {
      entries: RwLock::new(Vec::new()),
    }
  }

  pub(crate) fn register(
    &self,
    name: &str,
    description: &str,
    backend: Arc<dyn Backend>,
  ) -> CdrResult<()> {
    if name.len() > MAX_BACKEND_NAME_LENGTH {
      return Err(CdrError::BackendNameTooLong { name: name.to_string() });
    }
    let mut entries = self.entries.write().unwrap();
    if entries.iter().any(|e| e.name.eq_ignore_ascii_case(name)) {
      return Err(CdrError::BackendNameTaken { name: name.to_string() });
    }
    info!("Registered '{}' CDR backend", name);
    entries.push(BackendEntry {
      name: name.to_string(),
      description: description.to_string(),
      backend,
    });
    Ok(())
  }

  /// Returns whether a backend by that name was registered.
  pub(crate) fn unregister(&self, name: &str) -> bool {
    let mut entries = self.entries.write().unwrap();
    let before = entries.len();
    entries.retain(|e| !e.name.eq_ignore_ascii_case(name));
    if entries.len() < before {
      info!("Unregistered '{}' CDR backend", name);
      true
    } else {
      false
    }
  }

  /// Hands one record to every backend. A backend failure does not keep the
  /// record from the remaining backends.
  pub(crate) fn post(&self, record: &ExternalRecord) {
    let entries = self.entries.read().unwrap();
    for entry in entries.iter() {
      if let Err(e) = entry.backend.process(record) {
        warn!(
          "CDR backend '{}' failed to process record {} for {}: {}",
          entry.name, record.sequence, record.channel, e
        );
      }
    }
  }

  pub(crate) fn descriptions(&self) -> Vec<(String, String)> {
    self
      .entries
      .read()
      .unwrap()
      .iter()
      .map(|e| (e.name.clone(), e.description.clone()))
      .collect()
  }
}
