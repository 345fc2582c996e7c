//! `Authorization: Bearer` header parsing.

use axum::http::{HeaderMap, header};

use super::errors::AuthErrorKind;

/// Extract the access token from the Authorization header.
///
/// A missing header is `NoToken`; anything other than `Bearer <token>` is
/// `InvalidTokenFormat`. No verification happens here.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthErrorKind> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthErrorKind::NoToken)?
        .to_str()
        .map_err(|_| AuthErrorKind::InvalidTokenFormat)?;

    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or(AuthErrorKind::InvalidTokenFormat)?;

    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() || token.contains(' ') {
        return Err(AuthErrorKind::InvalidTokenFormat);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_bearer_token_simple() {
        assert_eq!(bearer_token(&headers("Bearer abc.def.ghi")).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn test_bearer_scheme_is_case_insensitive() {
        assert_eq!(bearer_token(&headers("bearer abc")).unwrap(), "abc");
    }

    #[test]
    fn test_missing_header() {
        assert!(matches!(
            bearer_token(&HeaderMap::new()),
            Err(AuthErrorKind::NoToken)
        ));
    }

    #[test]
    fn test_wrong_scheme() {
        assert!(matches!(
            bearer_token(&headers("Basic dXNlcjpwYXNz")),
            Err(AuthErrorKind::InvalidTokenFormat)
        ));
    }

    #[test]
    fn test_missing_token() {
        assert!(matches!(
            bearer_token(&headers("Bearer")),
            Err(AuthErrorKind::InvalidTokenFormat)
        ));
        assert!(matches!(
            bearer_token(&headers("Bearer    ")),
            Err(AuthErrorKind::InvalidTokenFormat)
        ));
    }

    #[test]
    fn test_extra_parts() {
        assert!(matches!(
            bearer_token(&headers("Bearer a b")),
            Err(AuthErrorKind::InvalidTokenFormat)
        ));
    }
}
