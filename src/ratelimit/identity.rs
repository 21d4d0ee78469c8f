//! Request identity resolution.
//!
//! Derives the key a request is counted under from its headers alone. The
//! bearer token is only *parsed* for its subject claim; no signature is
//! verified, so the result must never be used for authorization. Any failure
//! along the way degrades to an anonymous identity instead of failing the
//! request.

use axum::http::HeaderMap;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::buckets::IdentityPreference;

/// Fallback used whenever no usable identity component can be found.
pub const UNKNOWN: &str = "unknown";

/// JWT segments are unpadded base64url, but some issuers pad them anyway.
const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Headers consulted, in order, after `Forwarded` and before `X-Forwarded-For`.
const PROXY_ADDRESS_HEADERS: [&str; 2] = ["cf-connecting-ip", "x-real-ip"];

/// Reasons a bearer token did not yield a subject.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("authorization header is not valid UTF-8")]
    NotUtf8,

    #[error("authorization header is not of the form `Bearer <token>`")]
    NotBearer,

    #[error("token has fewer than two segments")]
    MissingPayload,

    #[error("payload is not base64url: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("payload is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload carries no sub, user_id or uid claim")]
    MissingSubject,
}

/// Who a request appears to come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Subject claimed by the bearer token, if any.
    pub subject: Option<String>,
    /// Best-effort client address from proxy headers.
    pub client_address: Option<String>,
    /// `user:<subject>`, else `ip:<address>`, else `ip:unknown`.
    pub composite_key: String,
}

impl Identity {
    /// Resolve the identity of a request from its headers.
    ///
    /// Both components are resolved so that buckets which force address-based
    /// keys still see the address of an authenticated caller.
    pub fn resolve(headers: &HeaderMap) -> Self {
        let subject = headers
            .get("authorization")
            .map(|value| value.to_str().map_err(|_| TokenError::NotUtf8))
            .map(|value| value.and_then(subject_from_authorization))
            .and_then(Result::ok);
        let client_address = client_address(headers);

        Self::from_parts(subject, client_address)
    }

    /// Build an identity from already-resolved components.
    pub fn from_parts(subject: Option<String>, client_address: Option<String>) -> Self {
        let composite_key = match (&subject, &client_address) {
            (Some(subject), _) => format!("user:{}", subject),
            (None, Some(address)) => format!("ip:{}", address),
            (None, None) => format!("ip:{}", UNKNOWN),
        };

        Self {
            subject,
            client_address,
            composite_key,
        }
    }

    /// The identity component a bucket with the given preference counts under.
    ///
    /// `User` never falls back to the address: anonymous callers all share the
    /// literal `unknown` key.
    pub fn key_for(&self, preference: IdentityPreference) -> &str {
        match preference {
            IdentityPreference::Auto => &self.composite_key,
            IdentityPreference::User => self.subject.as_deref().unwrap_or(UNKNOWN),
            IdentityPreference::Ip => self.client_address.as_deref().unwrap_or(UNKNOWN),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubjectClaims {
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    uid: Option<Value>,
}

/// Extract the subject claim from an `Authorization: Bearer <jwt>` value.
pub fn subject_from_authorization(header: &str) -> Result<String, TokenError> {
    let mut parts = header.split_whitespace();
    let (scheme, token) = match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) => (scheme, token),
        _ => return Err(TokenError::NotBearer),
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(TokenError::NotBearer);
    }

    let payload = token.split('.').nth(1).ok_or(TokenError::MissingPayload)?;
    let decoded = String::from_utf8(TOKEN_ENGINE.decode(payload)?)?;
    let claims: SubjectClaims = serde_json::from_str(&decoded)?;

    [claims.sub, claims.user_id, claims.uid]
        .into_iter()
        .flatten()
        .find_map(claim_as_string)
        .ok_or(TokenError::MissingSubject)
}

fn claim_as_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Find the client address in the usual reverse-proxy headers.
///
/// Order: `Forwarded: for=`, `CF-Connecting-IP`, `X-Real-IP`, first entry of
/// `X-Forwarded-For`, `X-Client-IP`. First non-empty match wins.
pub fn client_address(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(address) = header("forwarded").and_then(forwarded_for) {
        return Some(address);
    }

    for name in PROXY_ADDRESS_HEADERS {
        if let Some(address) = header(name) {
            return Some(address.to_string());
        }
    }

    if let Some(address) = header("x-forwarded-for")
        .and_then(|list| list.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(address.to_string());
    }

    header("x-client-ip").map(str::to_string)
}

/// Read the `for=` parameter of the first element of an RFC 7239 header.
fn forwarded_for(value: &str) -> Option<String> {
    let first = value.split(',').next()?;
    let raw = first.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        name.trim().eq_ignore_ascii_case("for").then_some(value.trim())
    })?;

    let unquoted = raw.trim_matches('"');
    let address = match unquoted.strip_prefix('[') {
        // "[2001:db8::1]:4711" -> 2001:db8::1
        Some(rest) => rest.split(']').next().unwrap_or(rest),
        None => unquoted,
    };

    (!address.is_empty()).then(|| address.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn token_with_payload(payload: &str) -> String {
        let header = TOKEN_ENGINE.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = TOKEN_ENGINE.encode(payload);
        format!("Bearer {}.{}.not-a-real-signature", header, payload)
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_no_headers_is_unknown_ip() {
        let identity = Identity::resolve(&HeaderMap::new());
        assert_eq!(identity.subject, None);
        assert_eq!(identity.client_address, None);
        assert_eq!(identity.composite_key, "ip:unknown");
    }

    #[test]
    fn test_bearer_subject_without_signature_check() {
        let token = token_with_payload(r#"{"sub":"abc","role":"authenticated"}"#);
        let identity = Identity::resolve(&headers(&[("authorization", &token)]));
        assert_eq!(identity.subject.as_deref(), Some("abc"));
        assert_eq!(identity.composite_key, "user:abc");
    }

    #[test]
    fn test_subject_claim_fallbacks() {
        let token = token_with_payload(r#"{"user_id":"u-1"}"#);
        assert_eq!(subject_from_authorization(&token).unwrap(), "u-1");

        let token = token_with_payload(r#"{"uid":42}"#);
        assert_eq!(subject_from_authorization(&token).unwrap(), "42");

        let token = token_with_payload(r#"{"sub":"first","user_id":"second"}"#);
        assert_eq!(subject_from_authorization(&token).unwrap(), "first");
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let token = token_with_payload(r#"{"sub":"abc"}"#).replacen("Bearer", "bEaReR", 1);
        assert_eq!(subject_from_authorization(&token).unwrap(), "abc");
    }

    #[test]
    fn test_padded_payload_is_accepted() {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(r#"{"sub":"abc"}"#);
        assert!(payload.ends_with('='));
        let header = format!("Bearer x.{}.y", payload);
        assert_eq!(subject_from_authorization(&header).unwrap(), "abc");
    }

    #[test]
    fn test_two_segment_token_is_enough() {
        let payload = TOKEN_ENGINE.encode(r#"{"sub":"abc"}"#);
        let header = format!("Bearer head.{}", payload);
        assert_eq!(subject_from_authorization(&header).unwrap(), "abc");
    }

    #[test]
    fn test_malformed_tokens_are_anonymous() {
        assert!(matches!(
            subject_from_authorization("Basic dXNlcjpwYXNz"),
            Err(TokenError::NotBearer)
        ));
        assert!(matches!(
            subject_from_authorization("Bearer a.b c"),
            Err(TokenError::NotBearer)
        ));
        assert!(matches!(
            subject_from_authorization("Bearer onlyonesegment"),
            Err(TokenError::MissingPayload)
        ));
        assert!(matches!(
            subject_from_authorization("Bearer a.!!!.c"),
            Err(TokenError::Base64(_))
        ));

        let not_json = format!("Bearer a.{}.c", TOKEN_ENGINE.encode("hello"));
        assert!(matches!(
            subject_from_authorization(&not_json),
            Err(TokenError::Json(_))
        ));

        let no_subject = token_with_payload(r#"{"role":"anon"}"#);
        assert!(matches!(
            subject_from_authorization(&no_subject),
            Err(TokenError::MissingSubject)
        ));

        let identity = Identity::resolve(&headers(&[
            ("authorization", "Bearer garbage"),
            ("x-real-ip", "198.51.100.4"),
        ]));
        assert_eq!(identity.composite_key, "ip:198.51.100.4");
    }

    #[test]
    fn test_forwarded_header_wins_and_strips_brackets() {
        let identity = Identity::resolve(&headers(&[
            ("forwarded", r#"for="[2001:db8:cafe::17]:4711";proto=https, for=10.0.0.1"#),
            ("x-forwarded-for", "203.0.113.9"),
        ]));
        assert_eq!(identity.client_address.as_deref(), Some("2001:db8:cafe::17"));
        assert_eq!(identity.composite_key, "ip:2001:db8:cafe::17");

        let map = headers(&[("forwarded", "proto=http;For=192.0.2.60;by=203.0.113.43")]);
        assert_eq!(client_address(&map).as_deref(), Some("192.0.2.60"));
    }

    #[test]
    fn test_proxy_header_precedence() {
        let map = headers(&[
            ("cf-connecting-ip", "192.0.2.1"),
            ("x-real-ip", "192.0.2.2"),
            ("x-forwarded-for", "192.0.2.3"),
            ("x-client-ip", "192.0.2.4"),
        ]);
        assert_eq!(client_address(&map).as_deref(), Some("192.0.2.1"));

        let map = headers(&[("x-real-ip", "192.0.2.2"), ("x-client-ip", "192.0.2.4")]);
        assert_eq!(client_address(&map).as_deref(), Some("192.0.2.2"));

        let map = headers(&[("x-forwarded-for", " 192.0.2.3 , 10.0.0.1"), ("x-client-ip", "192.0.2.4")]);
        assert_eq!(client_address(&map).as_deref(), Some("192.0.2.3"));

        let map = headers(&[("x-forwarded-for", ""), ("x-client-ip", "192.0.2.4")]);
        assert_eq!(client_address(&map).as_deref(), Some("192.0.2.4"));
    }

    #[test]
    fn test_key_for_preference() {
        let both = Identity::from_parts(Some("abc".into()), Some("192.0.2.1".into()));
        assert_eq!(both.key_for(IdentityPreference::Auto), "user:abc");
        assert_eq!(both.key_for(IdentityPreference::User), "abc");
        assert_eq!(both.key_for(IdentityPreference::Ip), "192.0.2.1");

        let anonymous = Identity::from_parts(None, Some("192.0.2.1".into()));
        assert_eq!(anonymous.key_for(IdentityPreference::Auto), "ip:192.0.2.1");
        assert_eq!(anonymous.key_for(IdentityPreference::User), "unknown");

        let nothing = Identity::from_parts(None, None);
        assert_eq!(nothing.key_for(IdentityPreference::Ip), "unknown");
    }
}
