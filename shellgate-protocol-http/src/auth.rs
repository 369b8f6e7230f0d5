use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use poem::{FromRequest, Request, RequestBody};
use serde::{Deserialize, Serialize};
use shellgate_common::{JwtConfig, SessionId, ShellgateError};
use shellgate_core::Services;
use uuid::Uuid;

pub const TUNNEL_PURPOSE: &str = "tunnel";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub iss: String,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

pub fn issue_access_token(config: &JwtConfig, user_id: Uuid) -> Result<String, ShellgateError> {
    let claims = Claims {
        sub: user_id,
        iss: config.issuer.clone(),
        exp: (Utc::now() + chrono::Duration::from_std(config.access_ttl).unwrap_or_default())
            .timestamp(),
        purpose: None,
        session_id: None,
    };
    sign(config, &claims)
}

/// Short-lived token returned by the launch endpoint; only valid for
/// opening the session's tunnel.
pub fn issue_tunnel_token(
    config: &JwtConfig,
    user_id: Uuid,
    session_id: SessionId,
) -> Result<String, ShellgateError> {
    let claims = Claims {
        sub: user_id,
        iss: config.issuer.clone(),
        exp: (Utc::now() + chrono::Duration::minutes(5)).timestamp(),
        purpose: Some(TUNNEL_PURPOSE.to_owned()),
        session_id: Some(session_id),
    };
    sign(config, &claims)
}

fn sign(config: &JwtConfig, claims: &Claims) -> Result<String, ShellgateError> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(config.secret.expose_secret().as_bytes()),
    )
    .map_err(|_| ShellgateError::Unauthorized)
}

pub fn validate_token(config: &JwtConfig, token: &str) -> Result<Claims, ShellgateError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[&config.issuer]);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.secret.expose_secret().as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| ShellgateError::Unauthorized)
}

/// Extracts the bearer token from `Authorization` or the `token` /
/// `access_token` query parameters.
pub fn token_from_request(req: &Request) -> Option<String> {
    if let Some(header) = req.headers().get(http::header::AUTHORIZATION) {
        if let Ok(value) = header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_owned());
            }
        }
    }
    let query: Vec<(String, String)> = req
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    for key in ["token", "access_token"] {
        if let Some((_, value)) = query.iter().find(|(k, _)| k == key) {
            return Some(value.clone());
        }
    }
    None
}

/// The authenticated caller. Handlers that take this extractor reject
/// unauthenticated requests with 401.
pub struct CurrentUser {
    pub user_id: Uuid,
    pub claims: Claims,
}

impl<'a> FromRequest<'a> for CurrentUser {
    async fn from_request(req: &'a Request, _body: &mut RequestBody) -> poem::Result<Self> {
        let services = req
            .extensions()
            .get::<Services>()
            .ok_or(ShellgateError::LifecycleUnavailable)?;
        let token = token_from_request(req).ok_or(ShellgateError::Unauthorized)?;
        let config = services.config.lock().await;
        let claims = validate_token(&config.jwt, &token)?;
        Ok(CurrentUser {
            user_id: claims.sub,
            claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use shellgate_common::Secret;

    use super::*;

    fn config() -> JwtConfig {
        JwtConfig {
            secret: Secret::new("test-secret".to_owned()),
            issuer: "shellgate".to_owned(),
            access_ttl: std::time::Duration::from_secs(3600),
        }
    }

    #[test]
    fn access_token_round_trips() {
        let config = config();
        let user = Uuid::new_v4();
        let token = issue_access_token(&config, user).unwrap();
        let claims = validate_token(&config, &token).unwrap();
        assert_eq!(claims.sub, user);
        assert!(claims.purpose.is_none());
    }

    #[test]
    fn tunnel_token_carries_session() {
        let config = config();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();
        let token = issue_tunnel_token(&config, user, session).unwrap();
        let claims = validate_token(&config, &token).unwrap();
        assert_eq!(claims.purpose.as_deref(), Some(TUNNEL_PURPOSE));
        assert_eq!(claims.session_id, Some(session));
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let config = config();
        let token = issue_access_token(&config, Uuid::new_v4()).unwrap();
        let mut other = config;
        other.issuer = "someone-else".to_owned();
        assert!(validate_token(&other, &token).is_err());
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(validate_token(&config(), "not-a-jwt").is_err());
    }
}
