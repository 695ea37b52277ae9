//! The error taxonomy: configuration failures, daemon-fatal conditions, and
//! per-request worker errors.

// ----------

use std::io;

use serverino_core::{http::FramingError, websocket::FrameError};

use crate::ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Fatal configuration problems, detected at daemon startup (exit code 2).
#[derive(Debug, ImplError)]
pub enum ConfigError {
	#[error("min_workers ({min}) exceeds max_workers ({max})")]
	MinExceedsMax { min: usize, max: usize },
	#[error("max_workers must be at least 1")]
	ZeroMaxWorkers,
	#[error("unknown user {0:?}")]
	UnknownWorkerUser(String),
	#[error("unknown group {0:?}")]
	UnknownWorkerGroup(String),
}

// --------------------------------------------------
// DaemonError

/// Conditions that are fatal to the daemon process itself.
#[derive(Debug, ImplError)]
pub enum DaemonError {
	#[error("failed to bind listener: {0}")]
	BindFailed(#[source] io::Error),
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("poller setup failed: {0}")]
	PollerSetup(#[source] io::Error),
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error(transparent)]
	Poller(#[from] crate::daemon::poller::PollerError),
	#[error(transparent)]
	Process(#[from] crate::process::ProcessError),
	#[error("failed to install signal handler: {0}")]
	Signal(#[source] nix::errno::Errno),
}

impl DaemonError {
	/// The process exit code this failure maps to.
	pub fn exit_code(&self) -> i32 {
		match self {
			Self::Config(_) => 2,
			Self::BindFailed(_) => 3,
			_ => 1,
		}
	}
}

// --------------------------------------------------
// WorkerError

/// A per-request failure kind, surfaced either as a response with a 4xx/5xx
/// status or as a closed control channel.
#[derive(Debug, ImplError)]
pub enum WorkerError {
	#[error(transparent)]
	Framing(#[from] FramingError),
	#[error("no endpoint matched the request")]
	NotFound,
	#[error(transparent)]
	UpgradeRejected(#[from] FrameError),
	#[error("the WebSocket handshake was rejected")]
	HandshakeRejected,
	#[error("an endpoint panicked: {0}")]
	Internal(String),
	#[error("the request exceeded the configured time limit")]
	Timeout,
	#[error("the client disconnected before the response was fully sent")]
	UpstreamGone,
	#[error("the worker process exited unexpectedly")]
	WorkerCrashed,
}

impl WorkerError {
	/// The status code this error class produces, when one is produced at all
	/// (`UpstreamGone` and `WorkerCrashed` close the connection silently).
	pub fn status_code(&self) -> Option<u16> {
		match self {
			Self::Framing(error) => Some(error.status_code()),
			Self::NotFound => Some(404),
			Self::UpgradeRejected(_) | Self::HandshakeRejected => Some(403),
			Self::Internal(_) => Some(500),
			Self::Timeout => Some(504),
			Self::UpstreamGone | Self::WorkerCrashed => None,
		}
	}
}
