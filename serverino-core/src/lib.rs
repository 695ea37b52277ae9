#![allow(dead_code)]

//! Wire-level framing for `serverino`.
//!
//! Everything in this crate is a pure function over byte buffers: no sockets,
//! no processes, no scheduling. The daemon and the worker runtime both link
//! against it so the exact same parsing and serialization rules apply on
//! both sides of the control channel.

// ----------

pub use std::error::Error as StdError;

pub(crate) use thiserror::Error as ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub mod http;
pub mod websocket;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub type BoxedError = Box<dyn StdError + Send + Sync>;

// --------------------------------------------------
// Used when expecting a valid value established by an earlier, already-validated step.
pub(crate) const SCOPE_VALIDITY: &str = "scope validity";
