//! Webhook requests and signature verification
//!
//! The webhook trigger is transport-neutral: whatever HTTP layer the
//! embedding application runs hands the raw request in as a
//! [`WebhookRequest`]. Signatures are HMAC-SHA256 over the raw body,
//! verified in constant time.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the request signature
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// An HTTP-shaped trigger request
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    /// Request headers, lowercase keys
    pub headers: HashMap<String, String>,

    /// Raw request body
    pub body: Vec<u8>,
}

impl WebhookRequest {
    /// Create a request from a body
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Add a header (key lowercased)
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into().to_lowercase(), value.into());
        self
    }

    /// The signature header, if present
    pub fn signature(&self) -> Option<&str> {
        self.headers.get(SIGNATURE_HEADER).map(String::as_str)
    }

    /// Parse the body as JSON
    pub fn body_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Compute the hex HMAC-SHA256 signature of a body
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature against a body, in constant time
///
/// Accepts an optional `sha256=` prefix on the provided signature.
pub fn verify_signature(secret: &str, body: &[u8], provided: &str) -> bool {
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    let Ok(expected) = hex::decode(provided) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    // verify_slice is a constant-time comparison.
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let body = br#"{"order": 7}"#;
        let signature = sign("topsecret", body);

        assert!(verify_signature("topsecret", body, &signature));
        assert!(verify_signature(
            "topsecret",
            body,
            &format!("sha256={signature}")
        ));
    }

    #[test]
    fn test_verify_rejects_wrong_secret_or_body() {
        let body = b"payload";
        let signature = sign("secret-a", body);

        assert!(!verify_signature("secret-b", body, &signature));
        assert!(!verify_signature("secret-a", b"tampered", &signature));
    }

    #[test]
    fn test_verify_rejects_malformed_signature() {
        assert!(!verify_signature("secret", b"payload", "not-hex"));
        assert!(!verify_signature("secret", b"payload", ""));
    }

    #[test]
    fn test_request_headers_lowercased() {
        let request = WebhookRequest::new(b"{}".to_vec())
            .with_header("X-Webhook-Signature", "sha256=abc");
        assert_eq!(request.signature(), Some("sha256=abc"));
    }

    #[test]
    fn test_body_json() {
        let request = WebhookRequest::new(br#"{"x": 1}"#.to_vec());
        assert_eq!(request.body_json().unwrap()["x"], 1);

        let bad = WebhookRequest::new(b"not json".to_vec());
        assert!(bad.body_json().is_none());
    }
}
