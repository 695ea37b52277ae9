//! Detects and validates a WebSocket upgrade attempt on an inbound request.

// ----------

use serverino_core::{http::HeaderMap, websocket::accept_value};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// A validated upgrade request, carrying what's needed to answer `101`.
#[derive(Debug, PartialEq, Eq)]
pub struct UpgradeRequest {
	pub sec_websocket_accept: String,
}

/// Examines the request's headers and reports whether it is a WebSocket
/// upgrade attempt, and if so whether the required headers are present and
/// well-formed.
///
/// Returns `Ok(None)` for an ordinary request, `Ok(Some(..))` for a valid
/// attempt, `Err(())` for a malformed one (→ 400).
pub fn detect(headers: &HeaderMap) -> Result<Option<UpgradeRequest>, ()> {
	let Some(upgrade) = headers.get("upgrade") else {
		return Ok(None);
	};

	if !upgrade.eq_ignore_ascii_case("websocket") {
		return Ok(None);
	}

	let connection_upgrades = headers
		.get("connection")
		.map(|value| value.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
		.unwrap_or(false);

	if !connection_upgrades {
		return Err(());
	}

	if headers.get("sec-websocket-version") != Some("13") {
		return Err(());
	}

	let Some(key) = headers.get("sec-websocket-key") else {
		return Err(());
	};

	if key.trim().is_empty() {
		return Err(());
	}

	Ok(Some(UpgradeRequest {
		sec_websocket_accept: accept_value(key),
	}))
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
		let mut headers = HeaderMap::new();
		for (name, value) in pairs.iter().copied() {
			headers.insert(name, value);
		}
		headers
	}

	#[test]
	fn plain_request_is_not_attempted() {
		let headers = HeaderMap::new();
		assert_eq!(detect(&headers), Ok(None));
	}

	#[test]
	fn valid_handshake_computes_the_literal_accept_value() {
		let headers = headers_with(&[
			("Upgrade", "websocket"),
			("Connection", "Upgrade"),
			("Sec-WebSocket-Version", "13"),
			("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
		]);

		let upgrade = detect(&headers).unwrap().expect("valid upgrade");
		assert_eq!(upgrade.sec_websocket_accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
	}

	#[test]
	fn missing_key_is_malformed() {
		let headers = headers_with(&[
			("Upgrade", "websocket"),
			("Connection", "Upgrade"),
			("Sec-WebSocket-Version", "13"),
		]);

		assert!(detect(&headers).is_err());
	}

	#[test]
	fn wrong_version_is_malformed() {
		let headers = headers_with(&[
			("Upgrade", "websocket"),
			("Connection", "Upgrade"),
			("Sec-WebSocket-Version", "8"),
			("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
		]);

		assert!(detect(&headers).is_err());
	}

	#[test]
	fn connection_header_match_is_case_insensitive_and_token_based() {
		let headers = headers_with(&[
			("Upgrade", "WebSocket"),
			("Connection", "keep-alive, Upgrade"),
			("Sec-WebSocket-Version", "13"),
			("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
		]);

		assert!(detect(&headers).unwrap().is_some());
	}
}
