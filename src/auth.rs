//! Layered request authentication for the protocol server.
//!
//! Ordered checks: CIDR bypass ranges (exempt from identity auth), the
//! network allow-list, then bearer-token identity. Client IPs come from the
//! connection peer unless the peer is a trusted proxy, in which case the
//! first value of the first `X-Forwarded-For` header is used.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::config::{AuthConfig, AuthMode};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Parsed auth state
// ---------------------------------------------------------------------------

pub struct AuthState {
    cfg: AuthConfig,
    allow: Vec<IpNet>,
    bypass: Vec<IpNet>,
    trusted_proxies: Vec<IpAddr>,
}

/// Parse an entry that may be a bare IP or a CIDR.
fn parse_net(entry: &str) -> Result<IpNet> {
    let s = entry.trim();
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    let ip: IpAddr = s
        .parse()
        .map_err(|_| Error::Validation(format!("bad IP/CIDR '{s}'")))?;
    Ok(IpNet::from(ip))
}

impl AuthState {
    pub fn new(cfg: AuthConfig) -> Result<Arc<Self>> {
        let allow = cfg.allowed_ips.iter().map(|s| parse_net(s)).collect::<Result<_>>()?;
        let bypass = cfg.bypass_ranges.iter().map(|s| parse_net(s)).collect::<Result<_>>()?;
        let trusted_proxies = cfg
            .trusted_proxies
            .iter()
            .map(|s| {
                s.trim()
                    .parse::<IpAddr>()
                    .map_err(|_| Error::Validation(format!("bad trusted proxy '{s}'")))
            })
            .collect::<Result<_>>()?;
        Ok(Arc::new(Self { cfg, allow, bypass, trusted_proxies }))
    }

    /// Resolve the effective client IP. X-Forwarded-For is honored only when
    /// the immediate peer is a trusted proxy; duplicate headers use the first
    /// value of the first header only.
    pub fn resolve_client_ip(&self, peer: IpAddr, headers: &HeaderMap) -> Result<IpAddr> {
        if !self.trusted_proxies.contains(&peer) {
            return Ok(peer);
        }
        let Some(xff) = headers.get_all("x-forwarded-for").iter().next() else {
            return Ok(peer);
        };
        let raw = xff
            .to_str()
            .map_err(|_| Error::Authentication("invalid forwarded header".into()))?;
        // CR/LF stripped before parsing; any other control character is refused.
        let raw = raw.replace(['\r', '\n'], "");
        let first = raw.split(',').next().unwrap_or("").trim();
        if first.is_empty() {
            return Ok(peer);
        }
        if first.chars().any(|c| c.is_ascii_control()) {
            return Err(Error::Authentication("control characters in forwarded header".into()));
        }
        parse_forwarded_ip(first)
    }

    fn in_bypass(&self, ip: IpAddr) -> bool {
        self.bypass.iter().any(|n| n.contains(&ip))
    }

    fn in_allow_list(&self, ip: IpAddr) -> bool {
        self.allow.iter().any(|n| n.contains(&ip))
    }

    fn token_ok(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.cfg.token.as_deref() else {
            return false;
        };
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|t| t == expected)
    }

    /// Run the ordered checks for one request.
    pub fn authorize(&self, peer: IpAddr, headers: &HeaderMap) -> Decision {
        if !self.cfg.enabled {
            return Decision::Allow { bypassed: false };
        }

        let ip = match self.resolve_client_ip(peer, headers) {
            Ok(ip) => ip,
            Err(e) => return Decision::Deny { reason: e.to_string() },
        };

        // 1. Bypass ranges skip every subsequent check.
        if self.in_bypass(ip) {
            if self.cfg.audit_log {
                tracing::info!(ip = %ip, "auth bypass range matched");
            }
            return Decision::Allow { bypassed: true };
        }

        let network_ok = self.allow.is_empty() || self.in_allow_list(ip);
        let token_ok = self.token_ok(headers);

        // 2. Network allow-list, 3. identity.
        let allowed = match self.cfg.mode {
            AuthMode::None => network_ok,
            AuthMode::Token => network_ok && token_ok,
            AuthMode::Both => self.in_allow_list(ip) && token_ok,
            AuthMode::Either => self.in_allow_list(ip) || token_ok,
        };

        if allowed {
            if self.cfg.verbose_log {
                tracing::debug!(ip = %ip, "request authorized");
            }
            Decision::Allow { bypassed: false }
        } else if !network_ok {
            Decision::Deny { reason: format!("address {ip} not in allow list") }
        } else {
            Decision::Deny { reason: "identity verification failed".into() }
        }
    }
}

/// Strip an optional port from a forwarded address ("1.2.3.4:5678",
/// "[::1]:80") and parse the IP.
fn parse_forwarded_ip(s: &str) -> Result<IpAddr> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(ip);
    }
    if let Ok(sock) = s.parse::<SocketAddr>() {
        return Ok(sock.ip());
    }
    Err(Error::Authentication(format!("unparseable forwarded address '{s}'")))
}

#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    Allow { bypassed: bool },
    Deny { reason: String },
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Reject unauthorized requests with 403 and a JSON-RPC error envelope so
/// protocol clients get a parseable body.
pub async fn require_auth(
    State(auth): State<Arc<AuthState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> std::result::Result<Response, Response> {
    match auth.authorize(peer.ip(), &headers) {
        Decision::Allow { .. } => Ok(next.run(request).await),
        Decision::Deny { reason } => {
            tracing::warn!(peer = %peer, reason = reason.as_str(), "request rejected");
            let body = serde_json::json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": -32603, "message": "forbidden" }
            });
            Err(Response::builder()
                .status(StatusCode::FORBIDDEN)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(cfg: AuthConfig) -> Arc<AuthState> {
        AuthState::new(cfg).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn allow_list_scenario() {
        let auth = state(AuthConfig {
            enabled: true,
            allowed_ips: vec!["127.0.0.1".into(), "192.168.1.0/24".into()],
            ..Default::default()
        });
        assert_eq!(
            auth.authorize(ip("127.0.0.1"), &HeaderMap::new()),
            Decision::Allow { bypassed: false }
        );
        assert_eq!(
            auth.authorize(ip("192.168.1.77"), &HeaderMap::new()),
            Decision::Allow { bypassed: false }
        );
        assert!(matches!(
            auth.authorize(ip("8.8.8.8"), &HeaderMap::new()),
            Decision::Deny { .. }
        ));
    }

    #[test]
    fn bypass_skips_token_requirement() {
        let auth = state(AuthConfig {
            enabled: true,
            mode: AuthMode::Token,
            bypass_ranges: vec!["10.0.0.0/8".into()],
            token: Some("secret".into()),
            ..Default::default()
        });
        assert_eq!(
            auth.authorize(ip("10.1.2.3"), &HeaderMap::new()),
            Decision::Allow { bypassed: true }
        );
        assert!(matches!(
            auth.authorize(ip("203.0.113.9"), &HeaderMap::new()),
            Decision::Deny { .. }
        ));
    }

    #[test]
    fn token_modes() {
        let base = AuthConfig {
            enabled: true,
            allowed_ips: vec!["192.0.2.0/24".into()],
            token: Some("secret".into()),
            ..Default::default()
        };
        let mut with_token = HeaderMap::new();
        with_token.insert("authorization", "Bearer secret".parse().unwrap());
        let mut wrong_token = HeaderMap::new();
        wrong_token.insert("authorization", "Bearer nope".parse().unwrap());

        let both = state(AuthConfig { mode: AuthMode::Both, ..base.clone() });
        assert!(matches!(both.authorize(ip("192.0.2.5"), &with_token), Decision::Allow { .. }));
        assert!(matches!(both.authorize(ip("192.0.2.5"), &wrong_token), Decision::Deny { .. }));
        assert!(matches!(both.authorize(ip("8.8.8.8"), &with_token), Decision::Deny { .. }));

        let either = state(AuthConfig { mode: AuthMode::Either, ..base });
        assert!(matches!(either.authorize(ip("8.8.8.8"), &with_token), Decision::Allow { .. }));
        assert!(matches!(
            either.authorize(ip("192.0.2.5"), &HeaderMap::new()),
            Decision::Allow { .. }
        ));
        assert!(matches!(either.authorize(ip("8.8.8.8"), &HeaderMap::new()), Decision::Deny { .. }));
    }

    #[test]
    fn forwarded_header_only_from_trusted_proxy() {
        let auth = state(AuthConfig {
            enabled: true,
            trusted_proxies: vec!["10.0.0.1".into()],
            ..Default::default()
        });
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());

        // Untrusted peer: header ignored.
        assert_eq!(auth.resolve_client_ip(ip("9.9.9.9"), &headers).unwrap(), ip("9.9.9.9"));
        // Trusted peer: first token wins.
        assert_eq!(auth.resolve_client_ip(ip("10.0.0.1"), &headers).unwrap(), ip("203.0.113.7"));
    }

    #[test]
    fn forwarded_header_port_and_whitespace() {
        let auth = state(AuthConfig {
            enabled: true,
            trusted_proxies: vec!["10.0.0.1".into()],
            ..Default::default()
        });
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "  198.51.100.4:8443 ".parse().unwrap());
        assert_eq!(auth.resolve_client_ip(ip("10.0.0.1"), &headers).unwrap(), ip("198.51.100.4"));

        let mut v6 = HeaderMap::new();
        v6.insert("x-forwarded-for", "[2001:db8::1]:443".parse().unwrap());
        assert_eq!(auth.resolve_client_ip(ip("10.0.0.1"), &v6).unwrap(), ip("2001:db8::1"));
    }

    #[test]
    fn disabled_auth_allows_everything() {
        let auth = state(AuthConfig::default());
        assert_eq!(
            auth.authorize(ip("8.8.8.8"), &HeaderMap::new()),
            Decision::Allow { bypassed: false }
        );
    }

    #[test]
    fn bad_cidr_rejected_at_construction() {
        assert!(AuthState::new(AuthConfig {
            allowed_ips: vec!["not-an-ip".into()],
            ..Default::default()
        })
        .is_err());
    }
}
