#![doc = include_str!("../README.md")]
#![deny(unsafe_op_in_unsafe_fn)]

// ----------

pub use serverino_core::{
	http::{HeaderMap, Method, Version},
	websocket as wire_websocket,
	BoxedError,
};

pub(crate) use thiserror::Error as ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub mod config;
pub mod cookie;
pub mod endpoint;
pub mod error;
pub mod output;
pub mod request;
pub mod websocket;

pub(crate) mod control_protocol;
pub(crate) mod process;

pub mod daemon;
pub mod worker;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub use config::Config;
pub use daemon::Daemon;
pub use endpoint::{route, EndpointEntry, EndpointTable, Fallthrough, RoutePredicate};
pub use error::{ConfigError, DaemonError, WorkerError};
pub use output::Output;
pub use request::Request;
pub use websocket::WebSocketSession;

/// Common imports for a serverino endpoint module.
pub mod prelude {
	pub use crate::{
		endpoint::Fallthrough, request::Request, websocket::WebSocketSession, Config, Daemon, Output,
	};
}

// --------------------------------------------------
// Used when expecting a valid value established by an earlier, already-validated step.
pub(crate) const SCOPE_VALIDITY: &str = "scope validity";
