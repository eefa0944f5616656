//! Error taxonomy for the data layer.
//!
//! Nothing here is fatal to the process: every failure is scoped to the
//! key or identifier it occurred on and reported upward for user-facing
//! notification.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the data layer.
#[derive(Debug, Error)]
pub enum DataError {
  /// An owner-scoped operation was requested without a signed-in session.
  /// No network I/O was attempted.
  #[error("login required")]
  LoginRequired,

  /// The hosted backend rejected or failed a request.
  #[error(transparent)]
  Backend(#[from] BackendError),

  /// The operation's task was torn down before it could report a result.
  #[error("operation cancelled")]
  Cancelled,
}

/// Failures talking to the hosted backend.
#[derive(Debug, Error)]
pub enum BackendError {
  #[error("transport error: {0}")]
  Transport(#[from] reqwest::Error),

  #[error("backend returned {status}: {body}")]
  Status { status: u16, body: String },

  #[error("failed to decode backend response: {0}")]
  Decode(#[from] serde_json::Error),

  #[error("invalid backend url: {0}")]
  BadUrl(#[from] url::ParseError),

  #[error("no {0} row for the signed-in user")]
  MissingRow(&'static str),
}

/// Failures loading or reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("config file not found: {0:?}")]
  NotFound(PathBuf),

  #[error("no configuration file found; create one at ~/.config/agora/config.yaml")]
  Missing,

  #[error("failed to read config file {path:?}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },

  #[error("failed to parse config file {path:?}: {source}")]
  Parse {
    path: PathBuf,
    source: serde_yaml::Error,
  },

  #[error("access token not found; set the AGORA_ACCESS_TOKEN environment variable")]
  MissingToken,
}
