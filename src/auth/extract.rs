//! axum extractors for verified callers and request metadata

use super::middleware::{extract_bearer_token, AccessGate};
use super::types::Claims;
use crate::error::MedgateError;
use crate::RequestContext;
use axum::{
    extract::{ConnectInfo, FromRef, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Claims of an authenticated caller
///
/// Use this in route handlers to require a valid session token:
/// ```ignore
/// async fn list_patients(CurrentUser(claims): CurrentUser) -> impl IntoResponse {
///     // Only runs with a verified, non-revoked token
/// }
/// ```
/// Role checks stay with the handler via [`AccessGate::require`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Claims);

impl<S> FromRequestParts<S> for CurrentUser
where
    Arc<AccessGate>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = MedgateError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let gate = Arc::<AccessGate>::from_ref(state);

        let header = match parts.headers.get(header::AUTHORIZATION) {
            Some(value) => Some(value.to_str().map_err(|_| MedgateError::TokenInvalid)?),
            None => None,
        };
        let token = extract_bearer_token(header)?;

        Ok(CurrentUser(gate.verify(token)?))
    }
}

/// Proxies whose `X-Forwarded-For` and `X-Real-IP` headers are believed.
///
/// Cheap to clone; expose it from router state through `FromRef`.
#[derive(Debug, Clone)]
pub struct TrustedProxies(Arc<[IpAddr]>);

impl TrustedProxies {
    pub fn new(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        let addrs: Vec<IpAddr> = addrs.into_iter().map(|ip| ip.to_canonical()).collect();
        Self(Arc::from(addrs))
    }

    /// Trust no proxy; only the socket peer counts
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.0.contains(&ip.to_canonical())
    }
}

impl Default for TrustedProxies {
    fn default() -> Self {
        Self::none()
    }
}

/// Request metadata for audit rows.
///
/// The client address is the TCP peer, so the server must be started with
/// `into_make_service_with_connect_info::<SocketAddr>()`. Without connection
/// info the address is left unset.
impl<S> FromRequestParts<S> for RequestContext
where
    TrustedProxies: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let proxies = TrustedProxies::from_ref(state);
        let mut ctx = RequestContext::new();

        if let Some(ip) = client_ip(parts, &proxies) {
            ctx = ctx.with_ip(ip);
        }
        if let Some(agent) = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
        {
            ctx = ctx.with_user_agent(agent);
        }

        Ok(ctx)
    }
}

/// Socket peer, or the address a trusted proxy reports for it
fn client_ip(parts: &Parts, proxies: &TrustedProxies) -> Option<IpAddr> {
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_canonical())?;

    if !proxies.contains(peer) {
        return Some(peer);
    }

    forwarded_client(&parts.headers, proxies)
        .or_else(|| {
            parts
                .headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        })
        .or(Some(peer))
}

/// Nearest untrusted hop of `X-Forwarded-For`. Hops left of it were supplied
/// by the client and are ignored.
fn forwarded_client(headers: &HeaderMap, proxies: &TrustedProxies) -> Option<IpAddr> {
    let chain = headers.get("x-forwarded-for")?.to_str().ok()?;

    for hop in chain.rsplit(',') {
        match hop.trim().parse::<IpAddr>() {
            Ok(ip) if proxies.contains(ip) => continue,
            Ok(ip) => return Some(ip.to_canonical()),
            Err(_) => return None,
        }
    }

    None
}
