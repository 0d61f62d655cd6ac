//! HMAC-SHA256 signing utilities for channel authorization and recovery ids.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Sign a message, returning the lowercase hex digest.
pub fn sign(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    encode_hex(&mac.finalize().into_bytes())
}

/// Verify a lowercase hex signature in constant time.
pub fn verify(secret: &str, message: &str, signature: &str) -> bool {
    let Some(signature_bytes) = decode_hex(signature) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    mac.verify_slice(&signature_bytes).is_ok()
}

pub fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

pub fn decode_hex(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(input.get(index..index + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{decode_hex, encode_hex, sign, verify};

    const SECRET: &str = "test_signing_secret";

    #[test]
    fn sign_produces_64_hex_chars() {
        let signature = sign(SECRET, "conn-1:private-orders");
        assert_eq!(signature.len(), 64);
        assert!(signature.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));
    }

    #[test]
    fn verify_accepts_own_signature() {
        let signature = sign(SECRET, "conn-1:private-orders");
        assert!(verify(SECRET, "conn-1:private-orders", &signature));
    }

    #[test]
    fn verify_rejects_wrong_message_or_secret() {
        let signature = sign(SECRET, "conn-1:private-orders");
        assert!(!verify(SECRET, "conn-2:private-orders", &signature));
        assert!(!verify("other_secret", "conn-1:private-orders", &signature));
    }

    #[test]
    fn verify_rejects_malformed_hex() {
        assert!(!verify(SECRET, "conn-1:private-orders", "zz"));
        assert!(!verify(SECRET, "conn-1:private-orders", "abc"));
        assert!(!verify(SECRET, "conn-1:private-orders", ""));
    }

    #[test]
    fn hex_round_trip() {
        let bytes = [0x00, 0x0f, 0xf0, 0xff];
        assert_eq!(decode_hex(&encode_hex(&bytes)).as_deref(), Some(&bytes[..]));
    }
}
