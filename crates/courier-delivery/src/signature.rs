//! Keyed payload signatures for receiver-side authenticity checks.
//!
//! The signed message is `"<unix-ms timestamp>.<canonical JSON payload>"`.
//! Canonical JSON sorts object keys recursively and carries no insignificant
//! whitespace, so sender and receiver agree on the bytes regardless of how
//! either side orders fields. The request body is the same canonical string,
//! which lets receivers verify against the raw body without re-encoding.
//!
//! Header format: `X-Signature: <algorithm>=<digest>` where the digest is hex
//! or base64 per the destination's [`SignatureConfig`].

use std::fmt::Write as _;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use courier_core::{SignatureAlgorithm, SignatureConfig, SignatureEncoding, WebhookPayload};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Sha256, Sha512};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Signature generation and verification errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// Secret is empty or unusable as an HMAC key.
    #[error("invalid secret key")]
    InvalidSecret,

    /// Header is not `<algorithm>=<digest>`.
    #[error("invalid signature format: {0}")]
    InvalidFormat(String),

    /// Header names a different algorithm than configured.
    #[error("signature algorithm mismatch: expected {expected}, got {actual}")]
    AlgorithmMismatch {
        /// Configured algorithm
        expected: String,
        /// Algorithm found in the header
        actual: String,
    },

    /// Digest does not match.
    #[error("signature verification failed")]
    VerificationFailed,

    /// Payload could not be serialized or parsed.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Renders a JSON value with recursively sorted object keys and no
/// whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

            out.push('{');
            for (index, (key, value)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        },
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        },
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut String) {
    // Display for scalar values is the compact JSON encoding.
    let _ = write!(out, "{value}");
}

/// Canonical JSON encoding of a webhook payload, used as request body.
///
/// # Errors
///
/// Returns [`SignatureError::InvalidPayload`] if the payload cannot be
/// converted to JSON.
pub fn canonical_payload(payload: &WebhookPayload) -> Result<String, SignatureError> {
    let value =
        serde_json::to_value(payload).map_err(|e| SignatureError::InvalidPayload(e.to_string()))?;
    Ok(canonical_json(&value))
}

/// Message that gets signed: `"<timestamp>.<canonical body>"`.
pub fn signing_input(timestamp_ms: u64, canonical_body: &str) -> String {
    format!("{timestamp_ms}.{canonical_body}")
}

/// Raw HMAC digest of `message`.
///
/// # Errors
///
/// Returns [`SignatureError::InvalidSecret`] for an empty secret.
pub fn compute_digest(
    algorithm: SignatureAlgorithm,
    secret: &str,
    message: &[u8],
) -> Result<Vec<u8>, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::InvalidSecret);
    }

    let digest = match algorithm {
        SignatureAlgorithm::Sha256 => {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|_| SignatureError::InvalidSecret)?;
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        },
        SignatureAlgorithm::Sha512 => {
            let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
                .map_err(|_| SignatureError::InvalidSecret)?;
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        },
    };

    Ok(digest)
}

/// Computes the `X-Signature` header value for a canonical body.
///
/// # Example
///
/// ```
/// use courier_core::SignatureConfig;
/// use courier_delivery::signature::sign;
///
/// let header = sign("secret", 1_700_000_000_000, r#"{"a":1}"#, SignatureConfig::default()).unwrap();
/// assert!(header.starts_with("sha256="));
/// ```
///
/// # Errors
///
/// Returns [`SignatureError::InvalidSecret`] for an empty secret.
pub fn sign(
    secret: &str,
    timestamp_ms: u64,
    canonical_body: &str,
    config: SignatureConfig,
) -> Result<String, SignatureError> {
    let message = signing_input(timestamp_ms, canonical_body);
    let digest = compute_digest(config.algorithm, secret, message.as_bytes())?;

    let encoded = match config.encoding {
        SignatureEncoding::Hex => hex::encode(digest),
        SignatureEncoding::Base64 => BASE64.encode(digest),
    };

    Ok(format!("{}={encoded}", config.algorithm))
}

/// Verifies an `X-Signature` header against a received body.
///
/// The body is re-canonicalized before verification, so receivers may pass
/// either the exact request body or an equivalent JSON document. Digest
/// comparison is constant time.
///
/// # Errors
///
/// Returns [`SignatureError::VerificationFailed`] on mismatch and the other
/// variants for malformed input.
pub fn verify(
    secret: &str,
    timestamp_ms: u64,
    body: &[u8],
    header: &str,
    config: SignatureConfig,
) -> Result<(), SignatureError> {
    let (algorithm, encoded) = header
        .split_once('=')
        .ok_or_else(|| SignatureError::InvalidFormat("missing '=' separator".to_string()))?;

    let expected_algorithm = config.algorithm.to_string();
    if algorithm != expected_algorithm {
        return Err(SignatureError::AlgorithmMismatch {
            expected: expected_algorithm,
            actual: algorithm.to_string(),
        });
    }

    let provided = match config.encoding {
        SignatureEncoding::Hex => hex::decode(encoded)
            .map_err(|e| SignatureError::InvalidFormat(format!("invalid hex digest: {e}")))?,
        SignatureEncoding::Base64 => BASE64
            .decode(encoded)
            .map_err(|e| SignatureError::InvalidFormat(format!("invalid base64 digest: {e}")))?,
    };

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| SignatureError::InvalidPayload(e.to_string()))?;
    let message = signing_input(timestamp_ms, &canonical_json(&value));

    if secret.is_empty() {
        return Err(SignatureError::InvalidSecret);
    }

    let verified = match config.algorithm {
        SignatureAlgorithm::Sha256 => {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|_| SignatureError::InvalidSecret)?;
            mac.update(message.as_bytes());
            mac.verify_slice(&provided).is_ok()
        },
        SignatureAlgorithm::Sha512 => {
            let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
                .map_err(|_| SignatureError::InvalidSecret)?;
            mac.update(message.as_bytes());
            mac.verify_slice(&provided).is_ok()
        },
    };

    if verified {
        Ok(())
    } else {
        Err(SignatureError::VerificationFailed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({
            "zeta": 1,
            "alpha": {"b": [3, {"y": true, "x": null}], "a": "text"},
        });

        assert_eq!(
            canonical_json(&value),
            r#"{"alpha":{"a":"text","b":[3,{"x":null,"y":true}]},"zeta":1}"#
        );
    }

    #[test]
    fn canonical_json_escapes_strings() {
        let value = json!({"quote\"key": "line\nbreak"});
        assert_eq!(canonical_json(&value), r#"{"quote\"key":"line\nbreak"}"#);
    }

    #[test]
    fn known_sha256_hex_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let digest = compute_digest(
            SignatureAlgorithm::Sha256,
            "key",
            b"The quick brown fox jumps over the lazy dog",
        )
        .unwrap();

        assert_eq!(
            hex::encode(digest),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn header_uses_algorithm_prefix_and_encoding() {
        let body = r#"{"data":{},"event":"ping","id":"x"}"#;

        let hex_header = sign(SECRET, 1, body, SignatureConfig::default()).unwrap();
        let (prefix, digest) = hex_header.split_once('=').unwrap();
        assert_eq!(prefix, "sha256");
        assert_eq!(digest.len(), 64);

        let b64_config = SignatureConfig {
            algorithm: SignatureAlgorithm::Sha512,
            encoding: SignatureEncoding::Base64,
        };
        let b64_header = sign(SECRET, 1, body, b64_config).unwrap();
        assert!(b64_header.starts_with("sha512="));
        assert_eq!(BASE64.decode(&b64_header["sha512=".len()..]).unwrap().len(), 64);
    }

    #[test]
    fn signature_binds_timestamp() {
        let body = r#"{"a":1}"#;
        let config = SignatureConfig::default();

        assert_ne!(sign(SECRET, 1, body, config).unwrap(), sign(SECRET, 2, body, config).unwrap());
    }

    #[test]
    fn verify_accepts_reordered_equivalent_body() {
        let config = SignatureConfig::default();
        let header = sign(SECRET, 42, r#"{"a":1,"b":2}"#, config).unwrap();

        assert!(verify(SECRET, 42, br#"{ "b": 2, "a": 1 }"#, &header, config).is_ok());
    }

    #[test]
    fn verify_rejects_tampering() {
        let config = SignatureConfig::default();
        let header = sign(SECRET, 42, r#"{"a":1}"#, config).unwrap();

        assert_eq!(
            verify(SECRET, 42, br#"{"a":2}"#, &header, config),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify(SECRET, 43, br#"{"a":1}"#, &header, config),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify("other", 42, br#"{"a":1}"#, &header, config),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn verify_rejects_malformed_headers() {
        let config = SignatureConfig::default();

        assert!(matches!(
            verify(SECRET, 1, b"{}", "deadbeef", config),
            Err(SignatureError::InvalidFormat(_))
        ));
        assert!(matches!(
            verify(SECRET, 1, b"{}", "sha512=00", config),
            Err(SignatureError::AlgorithmMismatch { .. })
        ));
        assert!(matches!(
            verify(SECRET, 1, b"{}", "sha256=zz", config),
            Err(SignatureError::InvalidFormat(_))
        ));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert_eq!(
            sign("", 1, "{}", SignatureConfig::default()),
            Err(SignatureError::InvalidSecret)
        );
    }

    #[test]
    fn canonical_payload_contains_all_fields() {
        let payload = WebhookPayload::new("invoice.paid", json!({"amount": 10}));
        let body = canonical_payload(&payload).unwrap();

        assert!(body.starts_with(r#"{"data":{"amount":10},"event":"invoice.paid","id":""#));
    }
}
