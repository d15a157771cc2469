//! Shared auth gate and config-reload poll run in front of every route
//! except the exempt PWA manifest (design notes §4.A, §4.B).

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::auth::manifest_exempt;
use crate::config::NetworkAccessConfig;
use crate::error::RelayError;
use crate::AppState;

pub const SESSION_COOKIE_NAME: &str = "relay_session";

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn header_str<'a>(req: &'a Request<Body>, name: axum::http::HeaderName) -> Option<&'a str> {
    req.headers().get(name)?.to_str().ok()
}

fn find_cookie<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    cookie_header.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
    })
}

fn host_of(url: &str) -> Option<String> {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let host = without_scheme.split('/').next()?;
    Some(host.split(':').next().unwrap_or(host).to_string())
}

/// First hop in `X-Forwarded-For`, the address the proxy in front of this
/// relay claims the client connected from.
fn forwarded_for(req: &Request<Body>) -> Option<std::net::IpAddr> {
    header_str(req, axum::http::header::HeaderName::from_static("x-forwarded-for"))?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Socket-level admission control, run before lockout/auth (design notes
/// §4.F): an IP outside every configured allow-subnet is rejected outright,
/// and, only when this deployment trusts its front proxy, a forwarded
/// address on the deny-list is rejected too.
fn check_network_access(net: &NetworkAccessConfig, addr: &SocketAddr, req: &Request<Body>) -> Option<RelayError> {
    if !net.allowed_subnets.is_empty() {
        let allowed = net
            .allowed_subnets
            .iter()
            .filter_map(|s| s.parse::<ipnet::IpNet>().ok())
            .any(|subnet| subnet.contains(&addr.ip()));
        if !allowed {
            return Some(RelayError::Forbidden("source address not in an allowed subnet".into()));
        }
    }

    if net.trust_proxy_headers && !net.denied_forwarded_for.is_empty() {
        if let Some(forwarded) = forwarded_for(req) {
            let denied = net
                .denied_forwarded_for
                .iter()
                .filter_map(|s| s.parse::<ipnet::IpNet>().ok())
                .any(|subnet| subnet.contains(&forwarded));
            if denied {
                return Some(RelayError::Forbidden("forwarded address is denied".into()));
            }
        }
    }

    None
}

pub async fn auth_gate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    state.config.poll();

    let cfg = state.config.current();
    if let Some(err) = check_network_access(&cfg.network_access, &addr, &req) {
        return err.into_response();
    }

    let path = req.uri().path().to_string();
    let request_host = header_str(&req, axum::http::header::HOST)
        .map(String::from)
        .unwrap_or_default();
    let referer_host = header_str(&req, axum::http::header::REFERER).and_then(host_of);

    if manifest_exempt(&path, referer_host.as_deref(), &request_host) {
        return next.run(req).await;
    }

    let basic_header = header_str(&req, axum::http::header::AUTHORIZATION).map(String::from);
    let cookie_value = header_str(&req, axum::http::header::COOKIE)
        .and_then(|h| find_cookie(h, SESSION_COOKIE_NAME))
        .map(String::from);

    let source_key = addr.ip().to_string();
    match state
        .auth
        .resolve(
            &source_key,
            basic_header.as_deref(),
            cookie_value.as_deref(),
            now_secs(),
        )
        .await
    {
        Ok(authenticated) => {
            let upgrade_cookie = authenticated.upgrade_cookie.clone();
            req.extensions_mut().insert(authenticated);
            let mut response = next.run(req).await;
            if let Some(cookie) = upgrade_cookie {
                if let Ok(value) = format!(
                    "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
                    SESSION_COOKIE_NAME,
                    cookie,
                    crate::auth::SESSION_LIFETIME_SECS
                )
                .parse()
                {
                    response.headers_mut().insert(axum::http::header::SET_COOKIE, value);
                }
            }
            response
        }
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(forwarded_for: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/");
        if let Some(v) = forwarded_for {
            builder = builder.header("x-forwarded-for", v);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn outside_allowed_subnet_is_rejected() {
        let net = NetworkAccessConfig {
            allowed_subnets: vec!["10.0.0.0/8".to_string()],
            denied_forwarded_for: Vec::new(),
            trust_proxy_headers: false,
        };
        let addr: SocketAddr = "203.0.113.5:1234".parse().unwrap();
        assert!(matches!(
            check_network_access(&net, &addr, &req(None)),
            Some(RelayError::Forbidden(_))
        ));
    }

    #[test]
    fn inside_allowed_subnet_passes() {
        let net = NetworkAccessConfig {
            allowed_subnets: vec!["10.0.0.0/8".to_string()],
            denied_forwarded_for: Vec::new(),
            trust_proxy_headers: false,
        };
        let addr: SocketAddr = "10.1.2.3:1234".parse().unwrap();
        assert!(check_network_access(&net, &addr, &req(None)).is_none());
    }

    #[test]
    fn denied_forwarded_for_only_checked_when_trusted() {
        let net = NetworkAccessConfig {
            allowed_subnets: Vec::new(),
            denied_forwarded_for: vec!["198.51.100.0/24".to_string()],
            trust_proxy_headers: false,
        };
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert!(check_network_access(&net, &addr, &req(Some("198.51.100.7"))).is_none());

        let trusting = NetworkAccessConfig {
            trust_proxy_headers: true,
            ..net
        };
        assert!(matches!(
            check_network_access(&trusting, &addr, &req(Some("198.51.100.7"))),
            Some(RelayError::Forbidden(_))
        ));
    }
}
