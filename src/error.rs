use thiserror::Error;

use crate::engine::backend::MAX_BACKEND_NAME_LENGTH;

/// Errors reported by the public engine API.
///
/// State handlers inside the engine do not produce errors. They report
/// handled/unhandled, and the event router reacts to unhandled by forking a
/// new chain element or finalizing. Errors exist only at the API boundary.
#[derive(Debug, Error)]
pub enum CdrError {
  /// The named channel has no active record chain. Either the channel never
  /// existed, it has already hung up, or the engine is disabled.
  #[error("No call detail records for channel {channel}")]
  NotFound { channel: String },

  /// The named variable is one of the standard record properties, which
  /// cannot be overwritten through the variable interface.
  #[error("'{name}' is a read-only call record property")]
  ReadOnlyVariable { name: String },

  /// The operation requires a non-finalized record, but the newest record in
  /// the chain is already finalized.
  #[error("Call record is already finalized")]
  RecordFinalized,

  /// A backend with the same (case-insensitive) name is already registered.
  #[error("CDR backend '{name}' is already registered")]
  BackendNameTaken { name: String },

  /// Backend names are limited to `MAX_BACKEND_NAME_LENGTH` characters.
  #[error("CDR backend name '{name}' is longer than {max} characters", max = MAX_BACKEND_NAME_LENGTH)]
  BackendNameTooLong { name: String },

  /// The engine master switch is off.
  #[error("CDR engine is disabled")]
  Disabled,
}

pub type CdrResult<T> = std::result::Result<T, CdrError>;
