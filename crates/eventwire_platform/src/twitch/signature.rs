#![forbid(unsafe_code)]

//! EventSub message signatures: `sha256=` + hex(HMAC-SHA256(secret, id || timestamp || body)).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

const DIGEST_HEX_LEN: usize = 64;

fn mac(secret: &[u8], message_id: &str, timestamp: &str, body: &[u8]) -> Option<HmacSha256> {
	let mut mac = HmacSha256::new_from_slice(secret).ok()?;
	mac.update(message_id.as_bytes());
	mac.update(timestamp.as_bytes());
	mac.update(body);
	Some(mac)
}

/// Compute the signature header value for a message.
pub fn sign(secret: &[u8], message_id: &str, timestamp: &str, body: &[u8]) -> String {
	match mac(secret, message_id, timestamp, body) {
		Some(mac) => format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())),
		None => String::new(),
	}
}

/// Check a signature header. Never errors; any malformed input is `false`.
pub fn verify(secret: &[u8], message_id: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
	let Some(digest_hex) = signature.strip_prefix(SIGNATURE_PREFIX) else {
		return false;
	};
	if digest_hex.len() != DIGEST_HEX_LEN {
		return false;
	}
	let Ok(provided) = hex::decode(digest_hex) else {
		return false;
	};

	// verify_slice compares in constant time.
	mac(secret, message_id, timestamp, body).is_some_and(|mac| mac.verify_slice(&provided).is_ok())
}
