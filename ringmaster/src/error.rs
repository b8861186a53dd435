//! Errors surfaced by setup-time operations. Runtime protocol failures are absorbed by the
//! protocols themselves and never reach callers.

use thiserror::Error;

/// Result type for ringmaster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ringmaster errors
#[derive(Debug, Error)]
pub enum Error {
  /// Socket-level failure.
  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  /// A hostname did not resolve to any IPv4 address.
  #[error("no IPv4 address for host {host}")]
  Unresolved {
    /// The name that was looked up.
    host: String,
  },

  /// Another receiver is already bound to this endpoint.
  #[error("{host}:{port} is already bound")]
  PortInUse {
    /// Host of the endpoint.
    host: String,
    /// Port of the endpoint.
    port: u16,
  },

  /// The configuration failed validation.
  #[error("invalid configuration: {0}")]
  InvalidConfig(#[from] validator::ValidationErrors),

  /// The configuration file could not be parsed.
  #[error("configuration file: {0}")]
  ConfigFile(#[from] serde_json::Error),
}
