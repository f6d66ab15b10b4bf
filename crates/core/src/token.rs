//! Capability token mint and verification.
//!
//! Tokens are RS256-signed, single-audience, and carry a fresh `jti` per
//! issue. The private key lives only in the controller process; the gateway
//! verifies against the published JWKS document.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The only audience tokens are minted for.
pub const AUDIENCE: &str = "ws";

const KEY_BITS: usize = 2048;

/// Claims carried by a capability token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Owner identity (opaque external subject)
    pub sub: String,
    /// Session the token is bound to
    pub sid: String,
    /// Audience, always [`AUDIENCE`]
    pub aud: String,
    /// Single-use token id, mirrored in the durable `jti` table
    pub jti: String,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// A freshly minted token plus the durable record the controller writes.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub token_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("audience mismatch")]
    Audience,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("key error: {0}")]
    Key(String),
}

/// A single RSA public key in JWKS form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

/// The published verification key set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

/// Holds the signing key and mints tokens.
#[derive(Clone)]
pub struct Signer {
    encoding_key: EncodingKey,
    jwk: Jwk,
}

impl Signer {
    /// Build a signer from an RSA private key PEM (PKCS#8 or PKCS#1).
    pub fn from_pem(pem: &str) -> Result<Self, TokenError> {
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| TokenError::Key(format!("unusable signing key: {e}")))?;

        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| TokenError::Key(format!("unparsable signing key: {e}")))?;
        let public = private.to_public_key();

        let n_bytes = public.n().to_bytes_be();
        let e_bytes = public.e().to_bytes_be();

        // kid: truncated SHA-256 fingerprint of the modulus. Stable for the
        // key's lifetime, changes with the key.
        let digest = Sha256::digest(&n_bytes);
        let kid: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();

        let jwk = Jwk {
            kty: "RSA".to_string(),
            use_: "sig".to_string(),
            alg: "RS256".to_string(),
            kid,
            n: URL_SAFE_NO_PAD.encode(&n_bytes),
            e: URL_SAFE_NO_PAD.encode(&e_bytes),
        };

        Ok(Self { encoding_key, jwk })
    }

    /// Generate a fresh 2048-bit key pair. Returns the signer and the
    /// private key PEM for persistence.
    pub fn generate() -> Result<(Self, String), TokenError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| TokenError::Key(format!("key generation failed: {e}")))?;
        let pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| TokenError::Key(format!("key encoding failed: {e}")))?
            .to_string();
        let signer = Self::from_pem(&pem)?;
        Ok((signer, pem))
    }

    pub fn kid(&self) -> &str {
        &self.jwk.kid
    }

    /// Mint a token bound to one session, with a fresh `jti` each call.
    pub fn issue(
        &self,
        session_id: Uuid,
        owner_id: &str,
        ttl: std::time::Duration,
    ) -> Result<IssuedToken, TokenError> {
        let now = Utc::now();
        let token_id = Uuid::new_v4();
        let exp = now.timestamp() as u64 + ttl.as_secs();

        let claims = Claims {
            sub: owner_id.to_string(),
            sid: session_id.to_string(),
            aud: AUDIENCE.to_string(),
            jti: token_id.to_string(),
            iat: now.timestamp() as u64,
            exp,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.jwk.kid.clone());

        let token = jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|e| TokenError::Key(format!("signing failed: {e}")))?;

        let expires_at = DateTime::<Utc>::from_timestamp(exp as i64, 0)
            .ok_or_else(|| TokenError::Invalid("expiry out of range".to_string()))?;

        Ok(IssuedToken {
            token,
            token_id,
            expires_at,
        })
    }

    /// The verification key set to publish.
    pub fn jwks(&self) -> JwksDocument {
        JwksDocument {
            keys: vec![self.jwk.clone()],
        }
    }
}

/// Verifies tokens against a published key set.
#[derive(Clone)]
pub struct Verifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl Verifier {
    /// Build a verifier from a JWKS document. Takes the first RS256
    /// signature key; key rotation is not supported.
    pub fn from_jwks(doc: &JwksDocument) -> Result<Self, TokenError> {
        let jwk = doc
            .keys
            .iter()
            .find(|k| k.kty == "RSA" && k.alg == "RS256")
            .ok_or_else(|| TokenError::Key("no RS256 key in JWKS".to_string()))?;

        let decoding_key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
            .map_err(|e| TokenError::Key(format!("unusable JWKS key: {e}")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.set_audience(&[AUDIENCE]);

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    /// Build a verifier directly from a signer (tests, controller-local use).
    pub fn from_signer(signer: &Signer) -> Result<Self, TokenError> {
        Self::from_jwks(&signer.jwks())
    }

    /// Check signature, expiry, and audience; return the claim set.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        match jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(TokenError::Expired),
                jsonwebtoken::errors::ErrorKind::InvalidAudience => Err(TokenError::Audience),
                _ => Err(TokenError::Invalid(e.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;
    use std::time::Duration;

    use super::*;

    // Key generation is slow; share one pair across the module.
    static TEST_SIGNER: OnceLock<Signer> = OnceLock::new();

    fn test_signer() -> &'static Signer {
        TEST_SIGNER.get_or_init(|| Signer::generate().unwrap().0)
    }

    fn encode_claims(signer: &Signer, claims: &Claims) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(signer.jwk.kid.clone());
        jsonwebtoken::encode(&header, claims, &signer.encoding_key).unwrap()
    }

    #[test]
    fn issue_verify_round_trip() {
        let signer = test_signer();
        let verifier = Verifier::from_jwks(&signer.jwks()).unwrap();

        let session_id = Uuid::new_v4();
        let issued = signer
            .issue(session_id, "owner-7", Duration::from_secs(300))
            .unwrap();

        let claims = verifier.verify(&issued.token).unwrap();
        assert_eq!(claims.sub, "owner-7");
        assert_eq!(claims.sid, session_id.to_string());
        assert_eq!(claims.aud, AUDIENCE);
        assert_eq!(claims.jti, issued.token_id.to_string());
        assert_eq!(claims.exp - claims.iat, 300);
    }

    #[test]
    fn token_is_three_base64url_segments() {
        let issued = test_signer()
            .issue(Uuid::new_v4(), "o", Duration::from_secs(60))
            .unwrap();
        let segments: Vec<&str> = issued.token.split('.').collect();
        assert_eq!(segments.len(), 3);
        for segment in segments {
            assert!(!segment.is_empty());
            assert!(
                segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            );
        }
    }

    #[test]
    fn fresh_jti_per_issue() {
        let signer = test_signer();
        let a = signer
            .issue(Uuid::new_v4(), "o", Duration::from_secs(60))
            .unwrap();
        let b = signer
            .issue(Uuid::new_v4(), "o", Duration::from_secs(60))
            .unwrap();
        assert_ne!(a.token_id, b.token_id);
    }

    #[test]
    fn rejects_token_from_other_key() {
        let (other, _) = Signer::generate().unwrap();
        let issued = other
            .issue(Uuid::new_v4(), "o", Duration::from_secs(60))
            .unwrap();

        let verifier = Verifier::from_jwks(&test_signer().jwks()).unwrap();
        assert!(matches!(
            verifier.verify(&issued.token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_garbage() {
        let verifier = Verifier::from_jwks(&test_signer().jwks()).unwrap();
        assert!(verifier.verify("not.a.token").is_err());
    }

    #[test]
    fn expiry_boundary() {
        let signer = test_signer();
        let verifier = Verifier::from_jwks(&signer.jwks()).unwrap();
        let now = Utc::now().timestamp() as u64;

        let mut claims = Claims {
            sub: "o".to_string(),
            sid: Uuid::new_v4().to_string(),
            aud: AUDIENCE.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + 2,
        };
        // Still inside the window
        assert!(verifier.verify(&encode_claims(signer, &claims)).is_ok());

        // Past expiry, zero leeway
        claims.exp = now - 1;
        assert!(matches!(
            verifier.verify(&encode_claims(signer, &claims)),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn rejects_wrong_audience() {
        let signer = test_signer();
        let verifier = Verifier::from_jwks(&signer.jwks()).unwrap();
        let now = Utc::now().timestamp() as u64;

        let claims = Claims {
            sub: "o".to_string(),
            sid: Uuid::new_v4().to_string(),
            aud: "api".to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + 60,
        };
        assert!(matches!(
            verifier.verify(&encode_claims(signer, &claims)),
            Err(TokenError::Audience)
        ));
    }

    #[test]
    fn kid_is_stable_for_a_key() {
        let (signer, pem) = Signer::generate().unwrap();
        let reloaded = Signer::from_pem(&pem).unwrap();
        assert_eq!(signer.kid(), reloaded.kid());
        assert_eq!(signer.jwks().keys[0].kid, signer.kid());
    }

    #[test]
    fn jwks_document_shape() {
        let doc = serde_json::to_value(test_signer().jwks()).unwrap();
        let key = &doc["keys"][0];
        assert_eq!(key["kty"], "RSA");
        assert_eq!(key["use"], "sig");
        assert_eq!(key["alg"], "RS256");
        assert!(key["kid"].is_string());
        // base64url without padding
        let n = key["n"].as_str().unwrap();
        assert!(!n.is_empty());
        assert!(!n.contains('='));
        assert!(!n.contains('+'));
        assert!(!n.contains('/'));
    }
}
