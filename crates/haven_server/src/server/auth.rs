#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use haven_domain::{ChatError, Identity, UserId};
use haven_util::secret::SecretString;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Claims carried by a `v1.<payload>.<sig>` access token.
///
/// `sub` is the stable user id; `name` is the display name shown to other
/// members and falls back to `sub` when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	pub exp: u64,
}

/// Turns an opaque bearer token into an authenticated identity.
///
/// Resolution happens once per connection, before the socket joins the
/// registry. A failure here is fatal for the connection.
#[async_trait]
pub trait AuthResolver: Send + Sync {
	async fn resolve(&self, token: &str) -> Result<Identity, ChatError>;
}

/// Resolver for stateless HMAC-signed tokens.
pub struct HmacAuthResolver {
	secret: SecretString,
}

impl HmacAuthResolver {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}
}

#[async_trait]
impl AuthResolver for HmacAuthResolver {
	async fn resolve(&self, token: &str) -> Result<Identity, ChatError> {
		let claims = verify_hmac_token(token, self.secret.expose())?;
		identity_from_claims(claims)
	}
}

/// Dev-only resolver that accepts any `sub` or `sub:name` token verbatim.
///
/// Construction is gated behind a debug build plus an explicit env flag;
/// never reachable in release builds.
pub struct DevAuthResolver;

#[async_trait]
impl AuthResolver for DevAuthResolver {
	async fn resolve(&self, token: &str) -> Result<Identity, ChatError> {
		let token = token.trim();
		if token.is_empty() {
			return Err(ChatError::Auth("empty token".to_string()));
		}
		let (sub, name) = match token.split_once(':') {
			Some((sub, name)) => (sub, Some(name.to_string())),
			None => (token, None),
		};
		identity_from_claims(AuthClaims { sub: sub.to_string(), name, exp: u64::MAX })
	}
}

fn identity_from_claims(claims: AuthClaims) -> Result<Identity, ChatError> {
	let AuthClaims { sub, name, .. } = claims;
	let display_name = name.filter(|s| !s.trim().is_empty()).unwrap_or_else(|| sub.clone());
	let user_id = UserId::new(sub).map_err(|e| ChatError::Auth(format!("invalid subject: {e}")))?;
	Ok(Identity::new(user_id, display_name))
}

pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, ChatError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(ChatError::Auth("invalid token format".to_string()));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD
		.decode(payload_b64)
		.map_err(|_| ChatError::Auth("malformed token payload".to_string()))?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD
		.decode(sig_b64)
		.map_err(|_| ChatError::Auth("malformed token signature".to_string()))?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(ChatError::Auth("invalid token signature".to_string()));
	}

	let claims: AuthClaims =
		serde_json::from_slice(&payload).map_err(|_| ChatError::Auth("malformed token claims".to_string()))?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(ChatError::Auth("token expired".to_string()));
	}

	Ok(claims)
}

/// Signs claims into the `v1.<payload>.<sig>` wire form.
///
/// Used by operator tooling and tests; the server itself only verifies.
pub fn sign_token(claims: &AuthClaims, secret: &str) -> String {
	let payload = serde_json::to_vec(claims).expect("serialize claims");
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn future_exp() -> u64 {
		SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600
	}

	#[test]
	fn signed_token_verifies_and_resolves_name() {
		let claims =
			AuthClaims { sub: "u1".to_string(), name: Some("Ada".to_string()), exp: future_exp() };
		let token = sign_token(&claims, "secret");

		let verified = verify_hmac_token(&token, "secret").unwrap();
		assert_eq!(verified.sub, "u1");
		assert_eq!(verified.name.as_deref(), Some("Ada"));

		let identity = identity_from_claims(verified).unwrap();
		assert_eq!(identity.user_id.as_str(), "u1");
		assert_eq!(identity.display_name, "Ada");
	}

	#[test]
	fn display_name_falls_back_to_sub() {
		let identity = identity_from_claims(AuthClaims {
			sub: "u1".to_string(),
			name: None,
			exp: future_exp(),
		})
		.unwrap();
		assert_eq!(identity.display_name, "u1");

		let identity = identity_from_claims(AuthClaims {
			sub: "u1".to_string(),
			name: Some("   ".to_string()),
			exp: future_exp(),
		})
		.unwrap();
		assert_eq!(identity.display_name, "u1");
	}

	#[test]
	fn tampered_signature_is_rejected() {
		let claims = AuthClaims { sub: "u1".to_string(), name: None, exp: future_exp() };
		let token = sign_token(&claims, "secret");
		let forged = sign_token(&claims, "other-secret");

		assert!(verify_hmac_token(&token, "secret").is_ok());
		let err = verify_hmac_token(&forged, "secret").unwrap_err();
		match err {
			ChatError::Auth(msg) => assert!(msg.contains("signature")),
			other => panic!("expected auth error, got {other:?}"),
		}
	}

	#[test]
	fn expired_token_is_rejected() {
		let claims = AuthClaims { sub: "u1".to_string(), name: None, exp: 1 };
		let token = sign_token(&claims, "secret");
		let err = verify_hmac_token(&token, "secret").unwrap_err();
		match err {
			ChatError::Auth(msg) => assert!(msg.contains("expired")),
			other => panic!("expected auth error, got {other:?}"),
		}
	}

	#[test]
	fn garbage_tokens_are_rejected() {
		for bad in ["", "v1", "v2.a.b", "v1.!!!.sig", "v1.cGF5bG9hZA"] {
			assert!(verify_hmac_token(bad, "secret").is_err(), "token {bad:?} should fail");
		}
	}

	#[tokio::test]
	async fn dev_resolver_splits_sub_and_name() {
		let identity = DevAuthResolver.resolve("u9:Grace").await.unwrap();
		assert_eq!(identity.user_id.as_str(), "u9");
		assert_eq!(identity.display_name, "Grace");

		let identity = DevAuthResolver.resolve("u9").await.unwrap();
		assert_eq!(identity.display_name, "u9");

		assert!(DevAuthResolver.resolve("  ").await.is_err());
	}
}
