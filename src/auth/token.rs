//! Bearer token verification
//!
//! Validates compact HMAC-signed JWTs minted by the account service and
//! extracts the subject as the connecting user's identity. Verification is a
//! pure function of the token, the shared secret, the pinned algorithm and the
//! clock; nothing here performs I/O.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha384, Sha512};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;
type HmacSha384 = Hmac<Sha384>;
type HmacSha512 = Hmac<Sha512>;

/// Reasons a credential is refused
///
/// Every verification failure maps to one of these; none of them are fatal to
/// the caller, they only decide whether the upgrade is refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Algorithm mismatch: expected {expected}, token declares {found}")]
    AlgorithmMismatch { expected: Algorithm, found: String },

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Token has no subject")]
    MissingSubject,

    #[error("Token has no expiry claim")]
    MissingExpiry,

    #[error("Token expired at {0}")]
    Expired(i64),

    #[error("Token not valid before {0}")]
    NotYetValid(i64),

    #[error("Token names an audience the relay does not accept")]
    UnexpectedAudience,

    #[error("Invalid verification key")]
    InvalidKey,
}

/// Error returned when parsing an unsupported algorithm name
#[derive(Debug, Error)]
#[error("Unsupported signing algorithm: {0} (expected HS256, HS384 or HS512)")]
pub struct UnknownAlgorithm(String);

/// HMAC signing algorithms accepted by the verifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[default]
    #[serde(rename = "HS256")]
    Hs256,
    #[serde(rename = "HS384")]
    Hs384,
    #[serde(rename = "HS512")]
    Hs512,
}

impl Algorithm {
    /// The JOSE `alg` header value for this algorithm
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Hs256 => "HS256",
            Algorithm::Hs384 => "HS384",
            Algorithm::Hs512 => "HS512",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HS256" => Ok(Algorithm::Hs256),
            "HS384" => Ok(Algorithm::Hs384),
            "HS512" => Ok(Algorithm::Hs512),
            _ => Err(UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Authenticated user name extracted from a verified token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[allow(dead_code)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Expiry handling for verified tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// Reject tokens whose `exp` lies in the past
    pub validate_exp: bool,
    /// Reject tokens that carry no `exp` at all
    pub require_exp: bool,
    /// Clock skew tolerated on `exp` and `nbf`, in seconds
    pub leeway_secs: u64,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            validate_exp: true,
            require_exp: false,
            leeway_secs: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    exp: Option<f64>,
    #[serde(default)]
    nbf: Option<f64>,
    #[serde(default)]
    iat: Option<f64>,
    #[serde(default)]
    aud: Option<serde_json::Value>,
}

/// Verifies bearer tokens against a shared secret and a pinned algorithm
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Vec<u8>,
    algorithm: Algorithm,
    policy: ExpiryPolicy,
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("secret", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("policy", &self.policy)
            .finish()
    }
}

impl TokenVerifier {
    /// Create a verifier with the default expiry policy
    pub fn new(secret: impl Into<Vec<u8>>, algorithm: Algorithm) -> Self {
        Self {
            secret: secret.into(),
            algorithm,
            policy: ExpiryPolicy::default(),
        }
    }

    /// Replace the expiry policy
    pub fn with_policy(mut self, policy: ExpiryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Verify a token against the current system time
    pub fn verify(&self, token: &str) -> Result<Identity, Rejection> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.verify_at(token, now)
    }

    /// Verify a token as of `now` (seconds since the Unix epoch)
    pub fn verify_at(&self, token: &str, now: i64) -> Result<Identity, Rejection> {
        let mut segments = token.split('.');
        let (header_b64, payload_b64, signature_b64) =
            match (segments.next(), segments.next(), segments.next(), segments.next()) {
                (Some(h), Some(p), Some(s), None) => (h, p, s),
                _ => {
                    return Err(Rejection::Malformed(
                        "expected three dot-separated segments".to_string(),
                    ))
                }
            };

        let header: Header = decode_json(header_b64, "header")?;

        // The declared algorithm is only compared, never trusted
        if header.alg != self.algorithm.as_str() {
            return Err(Rejection::AlgorithmMismatch {
                expected: self.algorithm,
                found: header.alg,
            });
        }

        let signature = decode_segment(signature_b64, "signature")?;
        let signing_input = &token[..header_b64.len() + 1 + payload_b64.len()];
        if !self.signature_matches(signing_input.as_bytes(), &signature)? {
            return Err(Rejection::BadSignature);
        }

        let claims: Claims = decode_json(payload_b64, "payload")?;
        self.check_time_claims(&claims, now)?;

        // No audience is configured, so any audience claim is foreign
        if claims.aud.is_some() {
            return Err(Rejection::UnexpectedAudience);
        }

        match claims.sub {
            Some(sub) if !sub.is_empty() => Ok(Identity::new(sub)),
            _ => Err(Rejection::MissingSubject),
        }
    }

    fn signature_matches(&self, input: &[u8], signature: &[u8]) -> Result<bool, Rejection> {
        let matches = match self.algorithm {
            Algorithm::Hs256 => {
                let mut mac =
                    HmacSha256::new_from_slice(&self.secret).map_err(|_| Rejection::InvalidKey)?;
                mac.update(input);
                mac.verify_slice(signature).is_ok()
            }
            Algorithm::Hs384 => {
                let mut mac =
                    HmacSha384::new_from_slice(&self.secret).map_err(|_| Rejection::InvalidKey)?;
                mac.update(input);
                mac.verify_slice(signature).is_ok()
            }
            Algorithm::Hs512 => {
                let mut mac =
                    HmacSha512::new_from_slice(&self.secret).map_err(|_| Rejection::InvalidKey)?;
                mac.update(input);
                mac.verify_slice(signature).is_ok()
            }
        };
        Ok(matches)
    }

    fn check_time_claims(&self, claims: &Claims, now: i64) -> Result<(), Rejection> {
        let leeway = self.policy.leeway_secs as f64;
        let now = now as f64;

        match claims.exp {
            Some(exp) if self.policy.validate_exp && now > exp + leeway => {
                return Err(Rejection::Expired(exp as i64));
            }
            None if self.policy.require_exp => return Err(Rejection::MissingExpiry),
            _ => {}
        }

        if let Some(iat) = claims.iat {
            if iat.fract() != 0.0 {
                return Err(Rejection::Malformed(format!("iat is not an integer: {}", iat)));
            }
        }

        if let Some(nbf) = claims.nbf {
            if now + leeway < nbf {
                return Err(Rejection::NotYetValid(nbf as i64));
            }
        }

        Ok(())
    }
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>, Rejection> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| Rejection::Malformed(format!("invalid base64 in {}: {}", what, e)))
}

fn decode_json<T: serde::de::DeserializeOwned>(segment: &str, what: &str) -> Result<T, Rejection> {
    let bytes = decode_segment(segment, what)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Rejection::Malformed(format!("invalid JSON in {}: {}", what, e)))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;

    const SECRET: &[u8] = b"very_secret_key";
    const NOW: i64 = 1_700_000_000;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(SECRET, Algorithm::Hs256)
    }

    #[test]
    fn test_valid_token_yields_subject() {
        let token = mint_for("alice", SECRET);
        let identity = verifier().verify_at(&token, NOW).unwrap();
        assert_eq!(identity.as_str(), "alice");
    }

    #[test]
    fn test_every_algorithm_roundtrips_subject() {
        for alg in [Algorithm::Hs256, Algorithm::Hs384, Algorithm::Hs512] {
            let token = mint(&json!({ "sub": "bob" }), SECRET, alg);
            let identity = TokenVerifier::new(SECRET, alg).verify_at(&token, NOW).unwrap();
            assert_eq!(identity.to_string(), "bob");
        }
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = mint_for("alice", b"another_secret");
        assert_eq!(
            verifier().verify_at(&token, NOW),
            Err(Rejection::BadSignature)
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let token = mint_for("alice", SECRET);
        let parts: Vec<&str> = token.split('.').collect();
        let forged_payload = URL_SAFE_NO_PAD.encode(json!({ "sub": "mallory" }).to_string());
        let forged = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);
        assert_eq!(
            verifier().verify_at(&forged, NOW),
            Err(Rejection::BadSignature)
        );
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let token = mint_for("alice", SECRET);
        let mut bytes = token.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        assert!(verifier().verify_at(&tampered, NOW).is_err());
    }

    #[test]
    fn test_algorithm_substitution_rejected() {
        // Signed with HS512 but the verifier is pinned to HS256
        let token = mint(&json!({ "sub": "alice" }), SECRET, Algorithm::Hs512);
        let result = verifier().verify_at(&token, NOW);
        assert!(matches!(
            result,
            Err(Rejection::AlgorithmMismatch { expected: Algorithm::Hs256, .. })
        ));
    }

    #[test]
    fn test_alg_none_rejected() {
        let header = URL_SAFE_NO_PAD.encode(json!({ "alg": "none" }).to_string());
        let payload = URL_SAFE_NO_PAD.encode(json!({ "sub": "alice" }).to_string());
        let token = format!("{}.{}.", header, payload);
        assert!(matches!(
            verifier().verify_at(&token, NOW),
            Err(Rejection::AlgorithmMismatch { .. })
        ));
    }

    #[test]
    fn test_header_lies_about_algorithm() {
        // Header claims HS256 but the signature was produced with HS384
        let header = json!({ "alg": "HS256" });
        let token = mint_with_header(&header, &json!({ "sub": "alice" }), SECRET, Algorithm::Hs384);
        assert_eq!(
            verifier().verify_at(&token, NOW),
            Err(Rejection::BadSignature)
        );
    }

    #[test]
    fn test_missing_subject_rejected() {
        let token = mint(&json!({ "name": "alice" }), SECRET, Algorithm::Hs256);
        assert_eq!(
            verifier().verify_at(&token, NOW),
            Err(Rejection::MissingSubject)
        );
    }

    #[test]
    fn test_empty_subject_rejected() {
        let token = mint(&json!({ "sub": "" }), SECRET, Algorithm::Hs256);
        assert_eq!(
            verifier().verify_at(&token, NOW),
            Err(Rejection::MissingSubject)
        );
    }

    #[test]
    fn test_non_string_subject_is_malformed() {
        let token = mint(&json!({ "sub": 42 }), SECRET, Algorithm::Hs256);
        assert!(matches!(
            verifier().verify_at(&token, NOW),
            Err(Rejection::Malformed(_))
        ));
    }

    #[test]
    fn test_issued_at_must_be_integer() {
        let token = mint(&json!({ "sub": "alice", "iat": NOW }), SECRET, Algorithm::Hs256);
        assert!(verifier().verify_at(&token, NOW).is_ok());

        for iat in [json!("yesterday"), json!(1.5)] {
            let token = mint(&json!({ "sub": "alice", "iat": iat }), SECRET, Algorithm::Hs256);
            assert!(
                matches!(verifier().verify_at(&token, NOW), Err(Rejection::Malformed(_))),
                "iat {} accepted",
                iat
            );
        }
    }

    #[test]
    fn test_audience_claim_rejected() {
        for aud in [json!("chat"), json!(["chat", "admin"])] {
            let token = mint(&json!({ "sub": "alice", "aud": aud }), SECRET, Algorithm::Hs256);
            assert_eq!(
                verifier().verify_at(&token, NOW),
                Err(Rejection::UnexpectedAudience)
            );
        }
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        for token in ["", "abc", "a.b", "a.b.c.d", "!!!.???.***"] {
            assert!(
                matches!(verifier().verify_at(token, NOW), Err(Rejection::Malformed(_))),
                "token {:?} should be malformed",
                token
            );
        }
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = mint(&json!({ "sub": "alice", "exp": NOW - 10 }), SECRET, Algorithm::Hs256);
        assert_eq!(
            verifier().verify_at(&token, NOW),
            Err(Rejection::Expired(NOW - 10))
        );
    }

    #[test]
    fn test_expired_token_within_leeway_accepted() {
        let token = mint(&json!({ "sub": "alice", "exp": NOW - 10 }), SECRET, Algorithm::Hs256);
        let verifier = verifier().with_policy(ExpiryPolicy {
            leeway_secs: 30,
            ..ExpiryPolicy::default()
        });
        assert!(verifier.verify_at(&token, NOW).is_ok());
    }

    #[test]
    fn test_expiry_check_can_be_disabled() {
        let token = mint(&json!({ "sub": "alice", "exp": NOW - 10 }), SECRET, Algorithm::Hs256);
        let verifier = verifier().with_policy(ExpiryPolicy {
            validate_exp: false,
            ..ExpiryPolicy::default()
        });
        assert!(verifier.verify_at(&token, NOW).is_ok());
    }

    #[test]
    fn test_require_exp() {
        let verifier = verifier().with_policy(ExpiryPolicy {
            require_exp: true,
            ..ExpiryPolicy::default()
        });

        let without = mint_for("alice", SECRET);
        assert_eq!(
            verifier.verify_at(&without, NOW),
            Err(Rejection::MissingExpiry)
        );

        let with = mint(&json!({ "sub": "alice", "exp": NOW + 60 }), SECRET, Algorithm::Hs256);
        assert!(verifier.verify_at(&with, NOW).is_ok());
    }

    #[test]
    fn test_not_yet_valid_rejected() {
        let token = mint(&json!({ "sub": "alice", "nbf": NOW + 60 }), SECRET, Algorithm::Hs256);
        assert_eq!(
            verifier().verify_at(&token, NOW),
            Err(Rejection::NotYetValid(NOW + 60))
        );
    }

    #[test]
    fn test_padded_signature_tolerated() {
        let token = mint_for("alice", SECRET);
        let split = token.rfind('.').unwrap();
        let signature = &token[split + 1..];
        let pad = (4 - signature.len() % 4) % 4;
        let padded = format!("{}{}", token, "=".repeat(pad));
        assert_eq!(verifier().verify_at(&padded, NOW).unwrap().as_str(), "alice");
    }

    #[test]
    fn test_verification_is_deterministic() {
        let token = mint_for("alice", SECRET);
        let v = verifier();
        assert_eq!(v.verify_at(&token, NOW), v.verify_at(&token, NOW));
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("HS256".parse::<Algorithm>().unwrap(), Algorithm::Hs256);
        assert_eq!("hs384".parse::<Algorithm>().unwrap(), Algorithm::Hs384);
        assert_eq!("HS512".parse::<Algorithm>().unwrap(), Algorithm::Hs512);
        assert!("RS256".parse::<Algorithm>().is_err());
        assert!("none".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug = format!("{:?}", verifier());
        assert!(!debug.contains("very_secret_key"));
        assert!(debug.contains("redacted"));
    }
}
