//! Client IP resolution for IP-keyed rate limits.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request},
    http::{Extensions, HeaderMap, request::Parts},
};

use crate::cli::IpExtractor;

/// State types that know how the client IP is determined.
pub trait HasIpExtractor {
    fn ip_extractor(&self) -> Option<&IpExtractor>;
}

fn resolve(
    headers: &HeaderMap,
    extensions: &Extensions,
    ip_extractor: Option<&IpExtractor>,
) -> Result<String, &'static str> {
    match ip_extractor {
        Some(extractor) => {
            let header_value = headers
                .get(extractor.header_name)
                .ok_or("IP header not present")?
                .to_str()
                .map_err(|_| "IP header contains invalid characters")?;
            extractor.extract(header_value)
        }
        None => extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .ok_or("No client IP available"),
    }
}

/// Resolve the client IP of `request`.
///
/// With an extractor configured, the proxy header is mandatory: a missing or
/// unparsable header is an error and the socket address is NOT used instead.
/// Without one, the peer address from `ConnectInfo` is used.
pub fn extract_client_ip<B>(
    request: &Request<B>,
    ip_extractor: Option<&IpExtractor>,
) -> Result<String, &'static str> {
    resolve(request.headers(), request.extensions(), ip_extractor)
}

/// Client IP for handlers, `None` when it cannot be determined.
pub struct ClientIp(pub Option<String>);

impl<S> FromRequestParts<S> for ClientIp
where
    S: HasIpExtractor + Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientIp(
            resolve(&parts.headers, &parts.extensions, state.ip_extractor()).ok(),
        ))
    }
}
