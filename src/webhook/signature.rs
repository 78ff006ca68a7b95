//! Provider signature verification.
//!
//! Each provider signs a different byte layout; the canonical payload is
//! rebuilt exactly and compared to the received signature in constant time.
//! An empty secret never verifies.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Query parameter carrying the BitLabs signature.
pub const BITLABS_HASH_MARKER: &str = "&hash=";

fn constant_time_eq_hex(expected: &str, received: &str) -> bool {
    let received = received.trim().to_ascii_lowercase();
    expected.as_bytes().ct_eq(received.as_bytes()).into()
}

fn hmac_sha1_hex(secret: &str, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Sorted `key=value` pairs joined by `&`, skipping `exclude`.
pub fn sorted_query(params: &BTreeMap<String, String>, exclude: &str) -> String {
    params
        .iter()
        .filter(|(k, _)| k.as_str() != exclude)
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// The part of a BitLabs callback URL that is signed: everything before
/// `&hash=`. `None` when the URL carries no hash parameter.
pub fn bitlabs_payload(raw_url: &str) -> Option<&str> {
    raw_url
        .split_once(BITLABS_HASH_MARKER)
        .map(|(payload, _)| payload)
}

/// The hash value of a BitLabs callback URL, or `None` when the URL carries
/// no hash or has parameters after it that the signature does not cover.
pub fn bitlabs_hash(raw_url: &str) -> Option<&str> {
    raw_url
        .split_once(BITLABS_HASH_MARKER)
        .map(|(_, hash)| hash)
        .filter(|hash| !hash.contains(['&', '#']))
}

/// BitLabs: hex HMAC-SHA1 of the URL before `&hash=`, keyed by the app secret.
pub fn verify_bitlabs(raw_url: &str, received: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(payload) = bitlabs_payload(raw_url) else {
        return false;
    };
    hmac_sha1_hex(secret, payload.as_bytes())
        .is_some_and(|expected| constant_time_eq_hex(&expected, received))
}

/// CPX Research: hex MD5 of the sorted parameters (without `hash`) with the
/// secret appended.
pub fn verify_cpx(params: &BTreeMap<String, String>, received: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let payload = format!("{}{}", sorted_query(params, "hash"), secret);
    let expected = format!("{:x}", md5::compute(payload.as_bytes()));
    constant_time_eq_hex(&expected, received)
}

/// AdGem postback: hex HMAC-SHA256 of the sorted parameters (without
/// `verifier`), keyed by the postback key.
pub fn verify_adgem(params: &BTreeMap<String, String>, received: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    hmac_sha256_hex(secret, sorted_query(params, "verifier").as_bytes())
        .is_some_and(|expected| constant_time_eq_hex(&expected, received))
}

/// AdGem ban notifications: hex HMAC-SHA256 of the raw body.
pub fn verify_adgem_ban(body: &[u8], received: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    hmac_sha256_hex(secret, body).is_some_and(|expected| constant_time_eq_hex(&expected, received))
}

/// Signing helpers for tests and local tooling that simulate providers.
pub mod sign {
    use super::*;

    pub fn bitlabs(payload: &str, secret: &str) -> String {
        hmac_sha1_hex(secret, payload.as_bytes()).unwrap_or_default()
    }

    pub fn cpx(params: &BTreeMap<String, String>, secret: &str) -> String {
        let payload = format!("{}{}", sorted_query(params, "hash"), secret);
        format!("{:x}", md5::compute(payload.as_bytes()))
    }

    pub fn adgem(params: &BTreeMap<String, String>, secret: &str) -> String {
        hmac_sha256_hex(secret, sorted_query(params, "verifier").as_bytes()).unwrap_or_default()
    }

    pub fn adgem_ban(body: &[u8], secret: &str) -> String {
        hmac_sha256_hex(secret, body).unwrap_or_default()
    }
}
