use anyhow::{anyhow, bail, Context};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ErrorCode, RelayError};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Identity attached to authenticated requests and connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

/// Verifies HS256 access tokens issued by the identity provider.
///
/// The relay only needs `verify`; issuing is kept as a seam for tests and
/// local tooling.
#[derive(Clone)]
pub struct AccessTokenVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AccessTokenVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Validate a token and return the user id it was issued for.
    pub fn verify(&self, token: &str) -> anyhow::Result<String> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        if claims.sub.trim().is_empty() {
            return Err(anyhow!("access token subject is empty"));
        }

        Ok(claims.sub)
    }

    pub fn issue_token(&self, user_id: &str) -> anyhow::Result<String> {
        self.issue_token_at(user_id, current_unix_timestamp()?)
    }

    fn issue_token_at(&self, user_id: &str, issued_at: i64) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }
}

pub async fn require_bearer_auth(
    State(verifier): State<Arc<AccessTokenVerifier>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        Some(token) => token,
        None => return unauthorized_response("missing bearer token"),
    };

    let user_id = match verifier.verify(token) {
        Ok(user_id) => user_id,
        Err(_) => return unauthorized_response("invalid bearer token"),
    };

    request.extensions_mut().insert(AuthenticatedUser { user_id });

    next.run(request).await
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    RelayError::new(ErrorCode::AuthInvalidToken, message).into_response()
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{
        current_unix_timestamp, require_bearer_auth, AccessTokenVerifier, AuthenticatedUser,
        ACCESS_TOKEN_TTL_SECONDS,
    };
    use axum::{
        body::Body,
        extract::Extension,
        http::{header::AUTHORIZATION, Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    const TEST_SECRET: &str = "fanline_test_secret_that_is_definitely_long_enough";

    #[test]
    fn issues_and_verifies_tokens() {
        let verifier = AccessTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let token = verifier.issue_token("user-7").expect("token should be issued");
        let user_id = verifier.verify(&token).expect("token should verify");
        assert_eq!(user_id, "user-7");
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(AccessTokenVerifier::new("too-short").is_err());
    }

    #[test]
    fn rejects_tampered_tokens() {
        let verifier = AccessTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let token = verifier.issue_token("user-7").expect("token should be issued");
        let tampered = format!("{token}x");
        assert!(verifier.verify(&tampered).is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let verifier = AccessTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - ACCESS_TOKEN_TTL_SECONDS
            - 1;
        let token = verifier.issue_token_at("user-7", issued_at).expect("token should be issued");
        assert!(verifier.verify(&token).is_err());
    }

    fn protected_app(verifier: Arc<AccessTokenVerifier>) -> Router {
        Router::new()
            .route(
                "/protected",
                get(|Extension(user): Extension<AuthenticatedUser>| async move { user.user_id }),
            )
            .layer(middleware::from_fn_with_state(verifier, require_bearer_auth))
    }

    #[tokio::test]
    async fn rejects_requests_without_bearer_token() {
        let verifier =
            Arc::new(AccessTokenVerifier::new(TEST_SECRET).expect("verifier should initialize"));
        let response = protected_app(verifier)
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn passes_identity_to_handlers() {
        let verifier =
            Arc::new(AccessTokenVerifier::new(TEST_SECRET).expect("verifier should initialize"));
        let token = verifier.issue_token("user-9").expect("token should be issued");

        let response = protected_app(verifier)
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        assert_eq!(body.as_ref(), b"user-9");
    }
}
