//! HMAC signing and verification of kernel wire messages.
//!
//! Every outgoing multipart frame is signed per the Jupyter wire format: the
//! signature is `HMAC(key, header || parent_header || metadata || content)`
//! encoded in hex. Inbound frames whose signature does not verify are
//! dropped and logged, never forwarded to a client.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Sign the four required parts of a message (header, parent_header,
/// metadata, content) plus any trailing buffers, returning the hex-encoded
/// HMAC-SHA256 digest.
pub fn sign(key: &[u8], parts: &[Bytes]) -> String {
    // An empty key means signing is disabled and always produces an empty
    // signature.
    if key.is_empty() {
        return String::new();
    }
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a signature against the same parts used in [`sign`]. Uses the
/// constant-time comparison built into `hmac`'s `verify_slice`.
pub fn verify(key: &[u8], parts: &[Bytes], signature: &str) -> bool {
    if key.is_empty() {
        return signature.is_empty();
    }
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let key = b"super-secret-kernel-key";
        let parts = vec![
            Bytes::from_static(b"{\"msg_id\":\"1\"}"),
            Bytes::from_static(b"{}"),
            Bytes::from_static(b"{}"),
            Bytes::from_static(b"{\"code\":\"1+1\"}"),
        ];
        let sig = sign(key, &parts);
        assert!(!sig.is_empty());
        assert!(verify(key, &parts, &sig));
    }

    #[test]
    fn tampered_content_fails_verification() {
        let key = b"super-secret-kernel-key";
        let original = vec![Bytes::from_static(b"{}"), Bytes::from_static(b"{}")];
        let sig = sign(key, &original);
        let tampered = vec![Bytes::from_static(b"{}"), Bytes::from_static(b"{\"x\":1}")];
        assert!(!verify(key, &tampered, &sig));
    }

    #[test]
    fn empty_key_disables_signing() {
        let parts = vec![Bytes::from_static(b"{}")];
        assert_eq!(sign(b"", &parts), "");
        assert!(verify(b"", &parts, ""));
        assert!(!verify(b"", &parts, "deadbeef"));
    }
}
