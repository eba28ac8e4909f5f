//! Authentication helpers
//!
//! Decodes the bearer credential on each HTTP request into an [`Identity`].
//! Signature verification is enforced upstream by the deployment; this
//! module only parses the claims payload. Also parses the RBAC
//! remote-terminal groups header and defines the allow-check capability
//! used by the management endpoint.

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use thiserror::Error;

/// Header carrying the RBAC remote-terminal group allow-list.
pub const RBAC_GROUPS_HEADER: &str = "X-Men-Rbac-Remote-Terminal-Groups";

/// Who is making the request. Lifetime of one HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Token subject: a user id or a device id.
    pub subject: String,
    pub tenant: String,
    /// True for user tokens, false for device tokens.
    pub is_user: bool,
    pub plan: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Authorization not present in header")]
    Missing,
    #[error("malformed Authorization header")]
    Malformed,
}

/// Claims payload of the bearer token. Only the fields the bridge needs.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    tenant: String,
    #[serde(default)]
    user: bool,
    #[serde(default)]
    plan: Option<String>,
}

impl Identity {
    /// Extract the identity from the `Authorization` header, falling back
    /// to the `JWT` cookie.
    pub fn from_headers(headers: &HeaderMap) -> Result<Identity, AuthError> {
        let token = bearer_token(headers)?;
        decode_claims(token)
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn bearer_token<'a>(headers: &'a HeaderMap) -> Result<&'a str, AuthError> {
    if let Some(auth) = header_value(headers, "authorization") {
        return auth
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Malformed);
    }
    if let Some(cookie) = header_value(headers, "cookie") {
        for part in cookie.split(';') {
            if let Some(token) = part.trim().strip_prefix("JWT=") {
                if !token.is_empty() {
                    return Ok(token);
                }
            }
        }
    }
    Err(AuthError::Missing)
}

/// Decode the claims segment of a compact JWS. No signature check.
fn decode_claims(token: &str) -> Result<Identity, AuthError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_sig), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::Malformed);
    };
    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::Malformed)?;
    let claims: Claims = serde_json::from_slice(&raw).map_err(|_| AuthError::Malformed)?;
    if claims.sub.is_empty() {
        return Err(AuthError::Malformed);
    }
    Ok(Identity {
        subject: claims.sub,
        tenant: claims.tenant,
        is_user: claims.user,
        plan: claims.plan,
    })
}

/// Parse the RBAC groups header into its comma-separated list. `None`
/// when the header is absent or empty.
pub fn rbac_groups(headers: &HeaderMap) -> Option<Vec<String>> {
    let raw = header_value(headers, RBAC_GROUPS_HEADER)?;
    let groups: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect();
    if groups.is_empty() {
        None
    } else {
        Some(groups)
    }
}

#[derive(Debug, Error)]
#[error("remote terminal access check failed: {0}")]
pub struct AccessError(pub String);

/// External allow-check for remote-terminal access, consulted when the
/// RBAC groups header is present.
#[async_trait::async_trait]
pub trait RemoteTerminalAccess: Send + Sync {
    async fn allowed(
        &self,
        tenant: &str,
        device_id: &str,
        groups: &[String],
    ) -> Result<bool, AccessError>;
}

/// Allow-everything policy used when no RBAC collaborator is configured.
pub struct AllowAll;

#[async_trait::async_trait]
impl RemoteTerminalAccess for AllowAll {
    async fn allowed(
        &self,
        _tenant: &str,
        _device_id: &str,
        _groups: &[String],
    ) -> Result<bool, AccessError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::{HeaderName, HeaderValue};

    fn make_headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    /// Unsigned token with the given claims payload, signature faked.
    fn make_token(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(b"not-a-signature");
        format!("{header}.{payload}.{sig}")
    }

    #[test]
    fn extracts_user_identity_from_bearer() {
        let token = make_token(&serde_json::json!({
            "sub": "user-1",
            "tenant": "t1",
            "user": true,
            "plan": "professional",
        }));
        let headers = make_headers(&[("authorization", &format!("Bearer {token}"))]);
        let identity = Identity::from_headers(&headers).unwrap();
        assert_eq!(identity.subject, "user-1");
        assert_eq!(identity.tenant, "t1");
        assert!(identity.is_user);
        assert_eq!(identity.plan.as_deref(), Some("professional"));
    }

    #[test]
    fn device_identity_defaults() {
        let token = make_token(&serde_json::json!({
            "sub": "device-1",
            "tenant": "t1",
        }));
        let headers = make_headers(&[("authorization", &format!("Bearer {token}"))]);
        let identity = Identity::from_headers(&headers).unwrap();
        assert!(!identity.is_user);
        assert_eq!(identity.plan, None);
    }

    #[test]
    fn falls_back_to_jwt_cookie() {
        let token = make_token(&serde_json::json!({"sub": "user-1", "user": true}));
        let headers = make_headers(&[("cookie", &format!("theme=dark; JWT={token}"))]);
        let identity = Identity::from_headers(&headers).unwrap();
        assert_eq!(identity.subject, "user-1");
    }

    #[test]
    fn missing_credential() {
        let headers = make_headers(&[]);
        assert_eq!(Identity::from_headers(&headers), Err(AuthError::Missing));
    }

    #[test]
    fn malformed_credential() {
        for value in [
            "malformed",
            "Bearer ",
            "Bearer one.two",
            "Bearer one.two.three.four",
            "Bearer a.!!!.c",
        ] {
            let headers = make_headers(&[("authorization", value)]);
            assert_eq!(
                Identity::from_headers(&headers),
                Err(AuthError::Malformed),
                "value {value:?}"
            );
        }
    }

    #[test]
    fn claims_payload_must_be_json_with_subject() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(b"not json");
        let token = format!("{header}.{payload}.sig");
        let headers = make_headers(&[("authorization", &format!("Bearer {token}"))]);
        assert_eq!(Identity::from_headers(&headers), Err(AuthError::Malformed));

        let token = make_token(&serde_json::json!({"sub": ""}));
        let headers = make_headers(&[("authorization", &format!("Bearer {token}"))]);
        assert_eq!(Identity::from_headers(&headers), Err(AuthError::Malformed));
    }

    #[test]
    fn rbac_groups_parsing() {
        let headers = make_headers(&[(RBAC_GROUPS_HEADER, "foo, bar ,baz")]);
        assert_eq!(
            rbac_groups(&headers),
            Some(vec![
                "foo".to_string(),
                "bar".to_string(),
                "baz".to_string()
            ])
        );

        assert_eq!(rbac_groups(&make_headers(&[])), None);
        assert_eq!(
            rbac_groups(&make_headers(&[(RBAC_GROUPS_HEADER, " , ")])),
            None
        );
    }
}
