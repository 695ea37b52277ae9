//! Byte-level HTTP/1.0 and HTTP/1.1 request parsing and response serialization.
//!
//! Nothing in this module touches a socket. [`try_parse_request`] is fed
//! whatever bytes the caller has buffered so far and reports back whether a
//! full request is framed, is still incomplete, or is malformed.

// ----------

use crate::ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// Method

/// An HTTP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
	Get,
	Head,
	Post,
	Put,
	Delete,
	Connect,
	Options,
	Trace,
	Patch,
	Extension(Box<str>),
}

impl Method {
	pub fn as_str(&self) -> &str {
		match self {
			Self::Get => "GET",
			Self::Head => "HEAD",
			Self::Post => "POST",
			Self::Put => "PUT",
			Self::Delete => "DELETE",
			Self::Connect => "CONNECT",
			Self::Options => "OPTIONS",
			Self::Trace => "TRACE",
			Self::Patch => "PATCH",
			Self::Extension(token) => token,
		}
	}

	pub fn is_head(&self) -> bool {
		matches!(self, Self::Head)
	}

	fn parse(token: &[u8]) -> Result<Self, FramingError> {
		if token.is_empty() || !token.iter().all(|b| is_token_byte(*b)) {
			return Err(FramingError::BadRequestLine);
		}

		let method = match token {
			b"GET" => Self::Get,
			b"HEAD" => Self::Head,
			b"POST" => Self::Post,
			b"PUT" => Self::Put,
			b"DELETE" => Self::Delete,
			b"CONNECT" => Self::Connect,
			b"OPTIONS" => Self::Options,
			b"TRACE" => Self::Trace,
			b"PATCH" => Self::Patch,
			other => Self::Extension(
				std::str::from_utf8(other)
					.map_err(|_| FramingError::BadRequestLine)?
					.into(),
			),
		};

		Ok(method)
	}
}

// --------------------------------------------------
// Version

/// The negotiated HTTP version of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
	Http10,
	Http11,
}

impl Version {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Http10 => "HTTP/1.0",
			Self::Http11 => "HTTP/1.1",
		}
	}

	/// The `Connection` behavior a request of this version has when the
	/// request doesn't carry an explicit `Connection` header.
	pub fn default_keep_alive(&self) -> bool {
		matches!(self, Self::Http11)
	}

	fn parse(token: &[u8]) -> Result<Self, FramingError> {
		match token {
			b"HTTP/1.0" => Ok(Self::Http10),
			b"HTTP/1.1" => Ok(Self::Http11),
			_ => Err(FramingError::UnknownVersion),
		}
	}
}

// --------------------------------------------------
// HeaderMap

/// A case-insensitive, insertion-order-preserving header map.
///
/// Lookups are case-insensitive; the original case of a header name is kept
/// for re-emission. [`HeaderMap::append`] implements the request-parsing
/// duplicate rule (values joined with `, `, except for `Set-Cookie` which
/// keeps separate entries); [`HeaderMap::insert`] implements ordinary
/// last-write-wins assignment for output headers.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
	entries: Vec<(Box<str>, Box<str>)>,
}

impl HeaderMap {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Case-insensitive last-write-wins insert.
	pub fn insert(&mut self, name: impl Into<Box<str>>, value: impl Into<Box<str>>) {
		let name = name.into();
		self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
		self.entries.push((name, value.into()));
	}

	/// The request-parsing duplicate-header rule: join with `, ` unless `name`
	/// is `Set-Cookie`, in which case a new entry is kept.
	pub fn append(&mut self, name: impl Into<Box<str>>, value: impl Into<Box<str>>) {
		let name = name.into();
		let value = value.into();

		if name.eq_ignore_ascii_case("set-cookie") {
			self.entries.push((name, value));
			return;
		}

		if let Some((_, existing)) = self
			.entries
			.iter_mut()
			.find(|(n, _)| n.eq_ignore_ascii_case(&name))
		{
			let joined = format!("{existing}, {value}");
			*existing = joined.into();
			return;
		}

		self.entries.push((name, value));
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self
			.entries
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_ref())
	}

	pub fn get_all<'m>(&'m self, name: &'m str) -> impl Iterator<Item = &'m str> {
		self
			.entries
			.iter()
			.filter(move |(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_ref())
	}

	pub fn contains(&self, name: &str) -> bool {
		self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
	}

	pub fn remove(&mut self, name: &str) {
		self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
	}

	/// Iterates headers in insertion order, original case preserved.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.entries.iter().map(|(n, v)| (n.as_ref(), v.as_ref()))
	}
}

// --------------------------------------------------
// RequestHead

/// Everything the wire framer knows about a request before the body.
#[derive(Debug, Clone)]
pub struct RequestHead {
	pub method: Method,
	/// Raw request-target bytes, percent-decoding deferred to the caller.
	pub target: Box<[u8]>,
	pub version: Version,
	pub headers: HeaderMap,
}

impl RequestHead {
	/// Whether the connection should be kept alive after this request,
	/// accounting for the version default and an explicit `Connection` header.
	pub fn keep_alive(&self) -> bool {
		match self.headers.get("connection") {
			Some(value) => !header_value_has_token(value, "close"),
			None => self.version.default_keep_alive(),
		}
	}
}

// --------------------------------------------------
// Parse outcome

/// The result of feeding a buffer to [`try_parse_request`].
pub enum ParseOutcome {
	/// Not enough bytes yet to determine anything.
	Incomplete,
	/// A full request was framed; `consumed` bytes should be drained from the
	/// front of the ingress buffer.
	Complete {
		consumed: usize,
		head: RequestHead,
		body: Vec<u8>,
	},
	/// The bytes seen so far can never become a valid request.
	Invalid(FramingError),
}

/// Attempts to parse one HTTP request out of `buf`.
///
/// `max_header_bytes` bounds the size of the request-line-plus-headers block;
/// `max_body_bytes` bounds the decoded body (the daemon's `maxRequestSize`).
pub fn try_parse_request(buf: &[u8], max_header_bytes: usize, max_body_bytes: usize) -> ParseOutcome {
	let Some(header_end) = find_subslice(buf, b"\r\n\r\n") else {
		return if buf.len() > max_header_bytes {
			ParseOutcome::Invalid(FramingError::HeaderBlockTooLarge)
		} else {
			ParseOutcome::Incomplete
		};
	};

	let header_block_len = header_end + 4;

	if header_block_len > max_header_bytes {
		return ParseOutcome::Invalid(FramingError::HeaderBlockTooLarge);
	}

	let head = match parse_head(&buf[..header_end]) {
		Ok(head) => head,
		Err(error) => return ParseOutcome::Invalid(error),
	};

	let content_length = head.headers.get("content-length");
	let transfer_encoding = head.headers.get("transfer-encoding");

	if content_length.is_some() && transfer_encoding.is_some() {
		return ParseOutcome::Invalid(FramingError::ConflictingBodyFraming);
	}

	if let Some(encoding) = transfer_encoding {
		if !header_value_has_token(encoding, "chunked") {
			return ParseOutcome::Invalid(FramingError::BadChunkEncoding);
		}

		return match decode_chunked(&buf[header_block_len..], max_body_bytes) {
			ChunkOutcome::Incomplete => ParseOutcome::Incomplete,
			ChunkOutcome::Invalid(error) => ParseOutcome::Invalid(error),
			ChunkOutcome::Complete { consumed, body } => ParseOutcome::Complete {
				consumed: header_block_len + consumed,
				head,
				body,
			},
		};
	}

	let body_len = match content_length {
		Some(raw) => match raw.trim().parse::<usize>() {
			Ok(len) => len,
			Err(_) => return ParseOutcome::Invalid(FramingError::BadHeaderSyntax),
		},
		None => 0,
	};

	if body_len > max_body_bytes {
		return ParseOutcome::Invalid(FramingError::BodyTooLarge);
	}

	let available = buf.len().saturating_sub(header_block_len);

	if available < body_len {
		return ParseOutcome::Incomplete;
	}

	let body = buf[header_block_len..header_block_len + body_len].to_vec();

	ParseOutcome::Complete {
		consumed: header_block_len + body_len,
		head,
		body,
	}
}

fn parse_head(block: &[u8]) -> Result<RequestHead, FramingError> {
	let mut lines = block.split(|b| *b == b'\n').map(strip_trailing_cr);

	let request_line = lines.next().ok_or(FramingError::BadRequestLine)?;
	let mut parts = request_line.splitn(3, |b| *b == b' ');

	let method = Method::parse(parts.next().ok_or(FramingError::BadRequestLine)?)?;
	let target = parts.next().ok_or(FramingError::BadRequestLine)?;

	if target.is_empty() {
		return Err(FramingError::BadRequestLine);
	}

	let version = Version::parse(parts.next().ok_or(FramingError::BadRequestLine)?)?;

	if parts.next().is_some() {
		return Err(FramingError::BadRequestLine);
	}

	let mut headers = HeaderMap::new();

	for line in lines {
		if line.is_empty() {
			continue;
		}

		if line[0] == b' ' || line[0] == b'\t' {
			// Obsolete line folding: not supported.
			return Err(FramingError::BadHeaderSyntax);
		}

		let colon = line
			.iter()
			.position(|b| *b == b':')
			.ok_or(FramingError::BadHeaderSyntax)?;

		let (name, rest) = line.split_at(colon);
		let value = &rest[1..];

		if name.is_empty() || !name.iter().all(|b| is_token_byte(*b)) {
			return Err(FramingError::BadHeaderSyntax);
		}

		let value = trim_wsp(value);
		let name = std::str::from_utf8(name).map_err(|_| FramingError::BadHeaderSyntax)?;
		let value = std::str::from_utf8(value).map_err(|_| FramingError::BadHeaderSyntax)?;

		headers.append(name, value);
	}

	Ok(RequestHead {
		method,
		target: target.into(),
		version,
		headers,
	})
}

enum ChunkOutcome {
	Incomplete,
	Complete { consumed: usize, body: Vec<u8> },
	Invalid(FramingError),
}

fn decode_chunked(buf: &[u8], max_body_bytes: usize) -> ChunkOutcome {
	let mut cursor = 0;
	let mut body = Vec::new();

	loop {
		let Some(line_end) = find_subslice(&buf[cursor..], b"\r\n") else {
			return ChunkOutcome::Incomplete;
		};
		let size_line = &buf[cursor..cursor + line_end];
		// Chunk extensions (after `;`) are accepted but ignored.
		let size_token = size_line.split(|b| *b == b';').next().unwrap_or(size_line);
		let size_str = match std::str::from_utf8(size_token) {
			Ok(s) => s.trim(),
			Err(_) => return ChunkOutcome::Invalid(FramingError::BadChunkEncoding),
		};

		let Ok(chunk_size) = usize::from_str_radix(size_str, 16) else {
			return ChunkOutcome::Invalid(FramingError::BadChunkEncoding);
		};

		cursor += line_end + 2;

		if chunk_size == 0 {
			// No trailer support: require the terminating CRLF immediately.
			if buf.len() < cursor + 2 {
				return ChunkOutcome::Incomplete;
			}

			if &buf[cursor..cursor + 2] != b"\r\n" {
				return ChunkOutcome::Invalid(FramingError::BadChunkEncoding);
			}

			return ChunkOutcome::Complete {
				consumed: cursor + 2,
				body,
			};
		}

		if body.len() + chunk_size > max_body_bytes {
			return ChunkOutcome::Invalid(FramingError::BodyTooLarge);
		}

		if buf.len() < cursor + chunk_size + 2 {
			return ChunkOutcome::Incomplete;
		}

		body.extend_from_slice(&buf[cursor..cursor + chunk_size]);
		cursor += chunk_size;

		if &buf[cursor..cursor + 2] != b"\r\n" {
			return ChunkOutcome::Invalid(FramingError::BadChunkEncoding);
		}

		cursor += 2;
	}
}

// --------------------------------------------------
// Response serialization

/// Writes a status line, headers, and the blank line terminating a response
/// head into `out`. The body (if any) is appended separately by the caller.
pub fn write_response_head(out: &mut Vec<u8>, version: Version, status: u16, headers: &HeaderMap) {
	out.extend_from_slice(version.as_str().as_bytes());
	out.push(b' ');
	out.extend_from_slice(status.to_string().as_bytes());
	out.push(b' ');
	out.extend_from_slice(reason_phrase(status).as_bytes());
	out.extend_from_slice(b"\r\n");

	for (name, value) in headers.iter() {
		out.extend_from_slice(name.as_bytes());
		out.extend_from_slice(b": ");
		out.extend_from_slice(value.as_bytes());
		out.extend_from_slice(b"\r\n");
	}

	out.extend_from_slice(b"\r\n");
}

pub fn reason_phrase(status: u16) -> &'static str {
	match status {
		101 => "Switching Protocols",
		200 => "OK",
		204 => "No Content",
		301 => "Moved Permanently",
		302 => "Found",
		304 => "Not Modified",
		400 => "Bad Request",
		401 => "Unauthorized",
		403 => "Forbidden",
		404 => "Not Found",
		405 => "Method Not Allowed",
		413 => "Payload Too Large",
		500 => "Internal Server Error",
		502 => "Bad Gateway",
		504 => "Gateway Timeout",
		505 => "HTTP Version Not Supported",
		_ => "Unknown",
	}
}

// --------------------------------------------------
// FramingError

/// Everything that can go wrong while framing a request off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ImplError)]
pub enum FramingError {
	#[error("malformed request line")]
	BadRequestLine,
	#[error("malformed header syntax")]
	BadHeaderSyntax,
	#[error("header block exceeds the configured limit")]
	HeaderBlockTooLarge,
	#[error("unsupported HTTP version")]
	UnknownVersion,
	#[error("both Content-Length and Transfer-Encoding present")]
	ConflictingBodyFraming,
	#[error("malformed chunked transfer encoding")]
	BadChunkEncoding,
	#[error("body exceeds the configured maximum request size")]
	BodyTooLarge,
}

impl FramingError {
	/// The status code this error class maps to.
	pub fn status_code(&self) -> u16 {
		match self {
			Self::BodyTooLarge => 413,
			Self::UnknownVersion => 505,
			_ => 400,
		}
	}
}

// --------------------------------------------------------------------------------
// helpers

fn is_token_byte(b: u8) -> bool {
	matches!(b,
		b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
	) || b.is_ascii_alphanumeric()
}

fn strip_trailing_cr(line: &[u8]) -> &[u8] {
	match line.split_last() {
		Some((b'\r', rest)) => rest,
		_ => line,
	}
}

fn trim_wsp(value: &[u8]) -> &[u8] {
	let start = value.iter().position(|b| *b != b' ' && *b != b'\t').unwrap_or(value.len());
	let end = value
		.iter()
		.rposition(|b| *b != b' ' && *b != b'\t')
		.map(|i| i + 1)
		.unwrap_or(start);

	&value[start..end]
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	haystack.windows(needle.len()).position(|window| window == needle)
}

fn header_value_has_token(value: &str, token: &str) -> bool {
	value.split(',').map(str::trim).any(|part| part.eq_ignore_ascii_case(token))
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_simple_get() {
		let raw = b"GET /simple HTTP/1.0\r\n\r\n";
		match try_parse_request(raw, 8192, 1024) {
			ParseOutcome::Complete { consumed, head, body } => {
				assert_eq!(consumed, raw.len());
				assert_eq!(head.method, Method::Get);
				assert_eq!(&*head.target, b"/simple");
				assert_eq!(head.version, Version::Http10);
				assert!(body.is_empty());
			}
			_ => panic!("expected a complete parse"),
		}
	}

	#[test]
	fn reports_incomplete_without_terminator() {
		let raw = b"GET /simple HTTP/1.1\r\nHost: x";
		assert!(matches!(
			try_parse_request(raw, 8192, 1024),
			ParseOutcome::Incomplete
		));
	}

	#[test]
	fn waits_for_full_content_length_body() {
		let raw = b"POST / HTTP/1.1\r\ncontent-length: 5\r\n\r\nhel";
		assert!(matches!(
			try_parse_request(raw, 8192, 1024),
			ParseOutcome::Incomplete
		));

		let raw = b"POST / HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello";
		match try_parse_request(raw, 8192, 1024) {
			ParseOutcome::Complete { body, .. } => assert_eq!(body, b"hello"),
			_ => panic!("expected a complete parse"),
		}
	}

	#[test]
	fn rejects_conflicting_body_framing() {
		let raw = b"POST / HTTP/1.1\r\ncontent-length: 5\r\ntransfer-encoding: chunked\r\n\r\nhello";
		match try_parse_request(raw, 8192, 1024) {
			ParseOutcome::Invalid(FramingError::ConflictingBodyFraming) => {}
			_ => panic!("expected ConflictingBodyFraming"),
		}
	}

	#[test]
	fn decodes_chunked_body() {
		let raw = b"POST / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
		match try_parse_request(raw, 8192, 1024) {
			ParseOutcome::Complete { body, consumed, .. } => {
				assert_eq!(body, b"hello");
				assert_eq!(consumed, raw.len());
			}
			_ => panic!("expected a complete parse"),
		}
	}

	#[test]
	fn rejects_oversized_body() {
		let body = "hello".repeat(5000);
		let raw = format!(
			"POST / HTTP/1.1\r\ncontent-length: {}\r\n\r\n{}",
			body.len(),
			body
		);

		match try_parse_request(raw.as_bytes(), 8192, 2000) {
			ParseOutcome::Invalid(error) => assert_eq!(error.status_code(), 413),
			_ => panic!("expected BodyTooLarge"),
		}

		let body = "hello".repeat(100);
		let raw = format!(
			"POST / HTTP/1.1\r\ncontent-length: {}\r\n\r\n{}",
			body.len(),
			body
		);

		assert!(matches!(
			try_parse_request(raw.as_bytes(), 8192, 2000),
			ParseOutcome::Complete { .. }
		));
	}

	#[test]
	fn duplicate_headers_are_joined_except_set_cookie() {
		let mut headers = HeaderMap::new();
		headers.append("X-Tag", "a");
		headers.append("X-Tag", "b");
		headers.append("Set-Cookie", "a=1");
		headers.append("Set-Cookie", "b=2");

		assert_eq!(headers.get("x-tag"), Some("a, b"));
		assert_eq!(headers.get_all("set-cookie").collect::<Vec<_>>(), vec!["a=1", "b=2"]);
	}

	#[test]
	fn header_insert_preserves_case_and_is_case_insensitive_on_lookup() {
		let mut headers = HeaderMap::new();
		headers.insert("Content-Type", "text/plain");

		assert_eq!(headers.get("content-type"), Some("text/plain"));
		assert_eq!(headers.iter().next(), Some(("Content-Type", "text/plain")));
	}

	#[test]
	fn keep_alive_defaults_by_version() {
		let mut head = RequestHead {
			method: Method::Get,
			target: b"/".as_slice().into(),
			version: Version::Http11,
			headers: HeaderMap::new(),
		};
		assert!(head.keep_alive());

		head.version = Version::Http10;
		assert!(!head.keep_alive());

		head.headers.insert("Connection", "close");
		head.version = Version::Http11;
		assert!(!head.keep_alive());
	}

	#[test]
	fn unknown_version_is_505() {
		let raw = b"GET / HTTP/2.0\r\n\r\n";
		match try_parse_request(raw, 8192, 1024) {
			ParseOutcome::Invalid(error) => assert_eq!(error.status_code(), 505),
			_ => panic!("expected UnknownVersion"),
		}
	}
}
