//! HMAC signing for webhook payloads and the correlation ID carried
//! through every request.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Opaque request-scoped identifier propagated from the inbound HTTP
/// request through provider calls and webhook deliveries, and echoed
/// back in every error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Compute the hex-encoded HMAC-SHA256 signature of a payload under a
/// secret. Used for `X-Webhook-Signature: sha256=<hex>`.
pub fn sign_hmac(payload: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex-encoded HMAC-SHA256 signature against a payload and
/// secret, in constant time with respect to the signature bytes.
pub fn verify_hmac(payload: &str, signature_hex: &str, secret: &str) -> bool {
    let computed = sign_hmac(payload, secret);

    computed.as_bytes().len() == signature_hex.as_bytes().len()
        && computed
            .as_bytes()
            .iter()
            .zip(signature_hex.as_bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_signing_round_trips() {
        let payload = r#"{"instanceId":"abc","status":"ready"}"#;
        let secret = "webhook_secret_key";

        let signature = sign_hmac(payload, secret);
        assert_eq!(signature.len(), 64);
        assert!(verify_hmac(payload, &signature, secret));
        assert!(!verify_hmac(payload, "0".repeat(64).as_str(), secret));
        assert!(!verify_hmac("different payload", &signature, secret));
    }

    #[test]
    fn hmac_is_deterministic() {
        let sig1 = sign_hmac("payload", "secret");
        let sig2 = sign_hmac("payload", "secret");
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn correlation_id_round_trips_through_string() {
        let id = CorrelationId::new();
        let parsed: CorrelationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
