// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Signing primitives for job completion webhooks.
//!
//! Senders and receivers agree on two things: the body is canonical JSON
//! (object keys sorted at every depth, no insignificant whitespace), and the
//! `X-Signature` header carries `sha256=<hex hmac>` over exactly those bytes.

use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

pub mod headers {
	pub const EVENT: &str = "X-Event";
	pub const SIGNATURE: &str = "X-Signature";
	pub const DELIVERY_TIMESTAMP: &str = "X-Delivery-Timestamp";
	pub const DELIVERY_ID: &str = "X-Delivery-Id";
}

/// Compute an HMAC-SHA256 signature for a payload.
///
/// Returns the hex-encoded signature without any prefix.
pub fn compute_hmac_sha256(secret: &[u8], payload: &[u8]) -> String {
	let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
	mac.update(payload);
	hex::encode(mac.finalize().into_bytes())
}

/// Verify a raw hex HMAC-SHA256 signature in constant time.
pub fn verify_hmac_sha256(secret: &[u8], payload: &[u8], signature: &str) -> bool {
	let Ok(expected) = hex::decode(signature) else {
		return false;
	};
	let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
		return false;
	};
	mac.update(payload);
	mac.verify_slice(&expected).is_ok()
}

/// Produce the `X-Signature` header value for a body.
pub fn sign_payload(secret: &[u8], body: &[u8]) -> String {
	format!("{SIGNATURE_PREFIX}{}", compute_hmac_sha256(secret, body))
}

/// Check an `X-Signature` header value against a received body.
pub fn verify_signature_header(secret: &[u8], body: &[u8], header: &str) -> bool {
	match header.strip_prefix(SIGNATURE_PREFIX) {
		Some(hex_sig) => verify_hmac_sha256(secret, body, hex_sig),
		None => false,
	}
}

/// Serialize a value as canonical JSON.
///
/// Keys are re-inserted in sorted order so the output does not depend on
/// whether `serde_json` was built with `preserve_order`.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
	let value = serde_json::to_value(value)?;
	serde_json::to_vec(&canonicalize(value))
}

fn canonicalize(value: Value) -> Value {
	match value {
		Value::Object(map) => {
			let mut entries: Vec<(String, Value)> = map.into_iter().collect();
			entries.sort_by(|a, b| a.0.cmp(&b.0));
			let mut sorted = Map::new();
			for (key, value) in entries {
				sorted.insert(key, canonicalize(value));
			}
			Value::Object(sorted)
		}
		Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
		other => other,
	}
}


#[cfg(test)]
mod proptests {
	use super::*;
	use proptest::prelude::*;

	proptest! {
		#[test]
		fn prop_header_roundtrip(
			secret in proptest::collection::vec(proptest::num::u8::ANY, 1..64),
			payload in proptest::collection::vec(proptest::num::u8::ANY, 0..512)
		) {
			let header = sign_payload(&secret, &payload);
			prop_assert!(verify_signature_header(&secret, &payload, &header));
		}

		#[test]
		fn prop_wrong_secret_fails(
			secret1 in proptest::collection::vec(proptest::num::u8::ANY, 1..64),
			secret2 in proptest::collection::vec(proptest::num::u8::ANY, 1..64),
			payload in proptest::collection::vec(proptest::num::u8::ANY, 1..256)
		) {
			prop_assume!(secret1 != secret2);
			let header = sign_payload(&secret1, &payload);
			prop_assert!(!verify_signature_header(&secret2, &payload, &header));
		}

		#[test]
		fn prop_canonical_json_is_order_independent(
			keys in proptest::collection::btree_set("[a-z]{1,8}", 1..8)
		) {
			let forward: Map<String, Value> = keys.iter().map(|k| (k.clone(), Value::from(k.len()))).collect();
			let reverse: Map<String, Value> = keys.iter().rev().map(|k| (k.clone(), Value::from(k.len()))).collect();
			prop_assert_eq!(
				canonical_json(&Value::Object(forward)).unwrap(),
				canonical_json(&Value::Object(reverse)).unwrap()
			);
		}
	}
}
