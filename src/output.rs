//! The worker-side response builder: the value an endpoint chain mutates
//! as it runs, serialized into wire bytes once the chain finishes.

// ----------

use serverino_core::http::{write_response_head, HeaderMap, Version};

#[cfg(feature = "cookies")]
use crate::cookie::OutgoingCookies;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const DEFAULT_CONTENT_TYPE: &str = "text/html;charset=utf-8";

/// Accumulates the response an endpoint chain is building. Mutations
/// accumulate across the chain until serialization.
pub struct Output {
	status: u16,
	headers: HeaderMap,
	body: Vec<u8>,
	deleted: bool,
	touched: bool,
	mute: bool,
	#[cfg(feature = "cookies")]
	cookies: OutgoingCookies,
}

impl Default for Output {
	fn default() -> Self {
		Self {
			status: 200,
			headers: HeaderMap::new(),
			body: Vec::new(),
			deleted: false,
			touched: false,
			mute: false,
			#[cfg(feature = "cookies")]
			cookies: OutgoingCookies::new(),
		}
	}
}

impl Output {
	pub fn new() -> Self {
		Self::default()
	}

	/// Whether any mutation has been applied since construction — the
	/// condition the endpoint chain checks to decide whether to stop
	/// iterating.
	pub fn touched(&self) -> bool {
		self.touched
	}

	pub fn status(&self) -> u16 {
		self.status
	}

	pub fn set_status(&mut self, status: u16) -> &mut Self {
		self.status = status;
		self.touched = true;
		self
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	pub fn insert_header(&mut self, name: impl Into<Box<str>>, value: impl Into<Box<str>>) -> &mut Self {
		self.headers.insert(name, value);
		self.touched = true;
		self
	}

	pub fn body(&self) -> &[u8] {
		&self.body
	}

	/// Replaces the body outright.
	pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
		self.body = body.into();
		self.deleted = false;
		self.touched = true;
		self
	}

	/// Appends to the body. If the body was [`cleared`](Self::clear) since the
	/// last write, the append starts from empty, so the result is exactly the
	/// appended bytes.
	pub fn append_body(&mut self, bytes: &[u8]) -> &mut Self {
		if self.deleted {
			self.body.clear();
			self.deleted = false;
		}

		self.body.extend_from_slice(bytes);
		self.touched = true;
		self
	}

	/// The "output = null" operation: clears the body buffer. A subsequent
	/// append starts clean.
	pub fn clear(&mut self) -> &mut Self {
		self.body.clear();
		self.deleted = true;
		self.touched = true;
		self
	}

	pub fn mute(&mut self) {
		self.mute = true;
	}

	#[cfg(feature = "cookies")]
	pub fn cookies_mut(&mut self) -> &mut OutgoingCookies {
		self.touched = true;
		&mut self.cookies
	}

	/// Serializes status line, headers, `Set-Cookie` lines, and body into
	/// wire bytes. `is_head` mutes the body per HTTP semantics even if the
	/// caller didn't call [`mute`](Self::mute).
	pub fn serialize(&self, version: Version, keep_alive: bool, is_head: bool) -> Vec<u8> {
		let muted = self.mute || is_head;
		let body_len = if muted { 0 } else { self.body.len() };

		// System headers come first; any explicit header of the same name the
		// endpoint set is re-applied afterwards, which moves it to its final
		// position and lets it override the system default.
		let mut headers = HeaderMap::new();
		headers.insert("connection", if keep_alive { "keep-alive" } else { "close" });
		headers.insert("content-length", body_len.to_string());

		if !self.headers.contains("content-type") && !self.body.is_empty() {
			headers.insert("content-type", DEFAULT_CONTENT_TYPE);
		}

		for (name, value) in self.headers.iter() {
			headers.insert(name, value);
		}

		#[cfg(feature = "cookies")]
		for cookie in self.cookies.iter() {
			headers.append("Set-Cookie", cookie.to_string());
		}

		let mut out = Vec::with_capacity(body_len + 256);
		write_response_head(&mut out, version, self.status, &headers);

		if !muted {
			out.extend_from_slice(&self.body);
		}

		out
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn untouched_output_stays_untouched() {
		let output = Output::new();
		assert!(!output.touched());
	}

	#[test]
	fn mutating_status_marks_touched() {
		let mut output = Output::new();
		output.set_status(404);
		assert!(output.touched());
	}

	#[test]
	fn clear_then_append_is_idempotent() {
		let mut output = Output::new();
		output.append_body(b"first");
		output.clear();
		output.append_body(b"second");

		assert_eq!(output.body(), b"second");
	}

	#[test]
	fn serializes_the_literal_simple_scenario() {
		let mut output = Output::new();
		output.append_body(b"simple");
		output.insert_header("content-type", "text/plain");

		let bytes = output.serialize(Version::Http10, false, false);
		let text = String::from_utf8(bytes).unwrap();

		assert_eq!(
			text,
			"HTTP/1.0 200 OK\r\nconnection: close\r\ncontent-length: 6\r\ncontent-type: text/plain\r\n\r\nsimple"
		);
	}

	#[test]
	fn head_response_has_no_body_but_correct_content_length() {
		let mut output = Output::new();
		output.append_body(b"hidden");

		let bytes = output.serialize(Version::Http11, true, true);
		let text = String::from_utf8(bytes).unwrap();

		assert!(text.contains("content-length: 6"));
		assert!(text.ends_with("\r\n\r\n"));
	}
}
