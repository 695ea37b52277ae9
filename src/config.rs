//! Runtime configuration for the daemon and its worker fleet.

// ----------

use std::time::Duration;

use crate::error::ConfigError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const DEFAULT_MAX_WORKERS: usize = 16;
const DEFAULT_MIN_WORKERS: usize = 2;
const DEFAULT_MAX_REQUESTS_PER_WORKER: u64 = 1_000;
const DEFAULT_MAX_WORKER_LIFETIME: Duration = Duration::from_secs(60 * 60);
const DEFAULT_MAX_REQUEST_TIME: Duration = Duration::from_secs(30);
const DEFAULT_MAX_REQUEST_SIZE: usize = 16 * 1024 * 1024;
const DEFAULT_MAX_HEADER_BYTES: usize = 16 * 1024;
const DEFAULT_MAX_WS_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;
const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_IDLE_HANGOVER: Duration = Duration::from_secs(10);
const DEFAULT_WORKER_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

// --------------------------------------------------
// Config

/// Daemon and worker-fleet configuration.
///
/// Built with chainable `with_*` setters.
#[derive(Debug, Clone)]
pub struct Config {
	pub(crate) max_workers: usize,
	pub(crate) min_workers: usize,
	pub(crate) max_requests_per_worker: u64,
	pub(crate) max_worker_lifetime: Duration,
	pub(crate) max_request_time: Duration,
	pub(crate) max_request_size: usize,
	pub(crate) max_header_bytes: usize,
	pub(crate) max_ws_frame_payload: usize,
	pub(crate) keep_alive_timeout: Duration,
	pub(crate) idle_hangover_time: Duration,
	pub(crate) worker_startup_timeout: Duration,
	pub(crate) worker_user: Option<String>,
	pub(crate) worker_group: Option<String>,
	pub(crate) return_code: Option<i32>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			max_workers: DEFAULT_MAX_WORKERS,
			min_workers: DEFAULT_MIN_WORKERS,
			max_requests_per_worker: DEFAULT_MAX_REQUESTS_PER_WORKER,
			max_worker_lifetime: DEFAULT_MAX_WORKER_LIFETIME,
			max_request_time: DEFAULT_MAX_REQUEST_TIME,
			max_request_size: DEFAULT_MAX_REQUEST_SIZE,
			max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
			max_ws_frame_payload: DEFAULT_MAX_WS_FRAME_PAYLOAD,
			keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
			idle_hangover_time: DEFAULT_IDLE_HANGOVER,
			worker_startup_timeout: DEFAULT_WORKER_STARTUP_TIMEOUT,
			worker_user: None,
			worker_group: None,
			return_code: None,
		}
	}
}

impl Config {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_max_workers(mut self, max_workers: usize) -> Self {
		self.max_workers = max_workers;
		self
	}

	pub fn with_min_workers(mut self, min_workers: usize) -> Self {
		self.min_workers = min_workers;
		self
	}

	pub fn with_max_requests_per_worker(mut self, max_requests: u64) -> Self {
		self.max_requests_per_worker = max_requests;
		self
	}

	pub fn with_max_worker_lifetime(mut self, lifetime: Duration) -> Self {
		self.max_worker_lifetime = lifetime;
		self
	}

	pub fn with_max_request_time(mut self, duration: Duration) -> Self {
		self.max_request_time = duration;
		self
	}

	pub fn with_max_request_size(mut self, bytes: usize) -> Self {
		self.max_request_size = bytes;
		self
	}

	pub fn with_max_header_bytes(mut self, bytes: usize) -> Self {
		self.max_header_bytes = bytes;
		self
	}

	pub fn with_max_ws_frame_payload(mut self, bytes: usize) -> Self {
		self.max_ws_frame_payload = bytes;
		self
	}

	pub fn with_keep_alive_timeout(mut self, duration: Duration) -> Self {
		self.keep_alive_timeout = duration;
		self
	}

	pub fn with_idle_hangover_time(mut self, duration: Duration) -> Self {
		self.idle_hangover_time = duration;
		self
	}

	pub fn with_worker_startup_timeout(mut self, duration: Duration) -> Self {
		self.worker_startup_timeout = duration;
		self
	}

	/// Drop privileges to this user after binding listeners (POSIX only).
	pub fn with_worker_user(mut self, user: impl Into<String>) -> Self {
		self.worker_user = Some(user.into());
		self
	}

	pub fn with_worker_group(mut self, group: impl Into<String>) -> Self {
		self.worker_group = Some(group.into());
		self
	}

	/// Overrides the process exit code on a clean, early shutdown.
	pub fn with_return_code(mut self, code: i32) -> Self {
		self.return_code = Some(code);
		self
	}

	/// Validates cross-field invariants. Called by the daemon at startup;
	/// failure maps to exit code 2.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.min_workers > self.max_workers {
			return Err(ConfigError::MinExceedsMax {
				min: self.min_workers,
				max: self.max_workers,
			});
		}

		if self.max_workers == 0 {
			return Err(ConfigError::ZeroMaxWorkers);
		}

		Ok(())
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_min_workers_above_max() {
		let config = Config::new().with_min_workers(4).with_max_workers(2);
		assert!(matches!(config.validate(), Err(ConfigError::MinExceedsMax { min: 4, max: 2 })));
	}

	#[test]
	fn default_config_validates() {
		assert!(Config::new().validate().is_ok());
	}
}
