//! Request function: build absolute URL from configured base + path, inject
//! auth header, apply a timeout, return `{status, body}`. A streaming
//! variant pipes the upstream response body through verbatim except for a
//! bounded redirect depth and `Content-Type` propagation (design notes §4.C).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, StatusCode};

use crate::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::config::UpstreamConfig;
use crate::error::{RelayError, RelayResult};

/// Header carrying the long-polling strategy's continuation token.
const TRACKING_ID_HEADER: &str = "X-Atmosphere-tracking-id";

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// The long-polling strategy's continuation token, echoed back on the
    /// next request against the same page; `None` for callers that don't
    /// request it.
    pub tracking_id: Option<String>,
}

pub struct UpstreamClient {
    http: Client,
    breaker: Arc<CircuitBreaker>,
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            http: Client::builder()
                .redirect(reqwest::redirect::Policy::limited(3))
                .build()
                .expect("reqwest client builds with static config"),
            breaker: Arc::new(CircuitBreaker::new(5, 30)),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    fn url(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn authorize(req: reqwest::RequestBuilder, cfg: &UpstreamConfig) -> reqwest::RequestBuilder {
        if let Some(token) = &cfg.bearer_token {
            req.bearer_auth(token)
        } else if let (Some(user), Some(pass)) = (&cfg.basic_user, &cfg.basic_pass) {
            req.basic_auth(user, Some(pass))
        } else {
            req
        }
    }

    /// Buffered GET with transparent gzip/deflate/br decoding. Honors the
    /// circuit breaker: if open, fails fast without issuing the request.
    pub async fn get(&self, cfg: &UpstreamConfig, path: &str) -> RelayResult<UpstreamResponse> {
        if !self.breaker.allow() {
            return Err(RelayError::UpstreamUnreachable(
                "circuit breaker open".to_string(),
            ));
        }

        let url = Self::url(&cfg.base_url, path);
        let req = Self::authorize(self.http.get(&url), cfg)
            .timeout(Duration::from_millis(cfg.timeout_ms));

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                let content_type = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                let body = resp.bytes().await.map_err(RelayError::from)?;

                if status.is_server_error() {
                    self.breaker.record_failure();
                    return Err(RelayError::UpstreamStatus {
                        status: status.as_u16(),
                        body: String::from_utf8_lossy(&body).to_string(),
                    });
                }
                self.breaker.record_success();
                Ok(UpstreamResponse {
                    status,
                    body,
                    content_type,
                    content_encoding: None,
                    tracking_id: None,
                })
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(RelayError::from(e))
            }
        }
    }

    /// GET with a caller-supplied timeout override, used by the long-polling
    /// strategy (120s default) and SSE (disabled timeouts).
    pub async fn get_with_timeout(
        &self,
        cfg: &UpstreamConfig,
        path: &str,
        extra_headers: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> RelayResult<UpstreamResponse> {
        if !self.breaker.allow() {
            return Err(RelayError::UpstreamUnreachable(
                "circuit breaker open".to_string(),
            ));
        }
        let url = Self::url(&cfg.base_url, path);
        let mut req = Self::authorize(self.http.get(&url), cfg);
        for (k, v) in extra_headers {
            req = req.header(*k, v);
        }
        if let Some(t) = timeout {
            req = req.timeout(t);
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                let headers = resp.headers().clone();
                let body = resp.bytes().await.map_err(RelayError::from)?;
                if status.is_server_error() {
                    self.breaker.record_failure();
                    return Err(RelayError::UpstreamStatus {
                        status: status.as_u16(),
                        body: String::from_utf8_lossy(&body).to_string(),
                    });
                }
                self.breaker.record_success();
                Ok(UpstreamResponse {
                    status,
                    body,
                    content_type: headers
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from),
                    content_encoding: headers
                        .get(reqwest::header::CONTENT_ENCODING)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from),
                    tracking_id: headers
                        .get(TRACKING_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from),
                })
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(RelayError::from(e))
            }
        }
    }

    /// Open a raw streaming GET with no timeout, for the SSE subscription
    /// strategy's long-lived connection. The caller reads `bytes_stream()`
    /// directly; the circuit breaker only sees success/failure of the
    /// initial connect, not the stream's eventual lifetime.
    pub async fn open_stream(
        &self,
        cfg: &UpstreamConfig,
        path: &str,
    ) -> RelayResult<reqwest::Response> {
        if !self.breaker.allow() {
            return Err(RelayError::UpstreamUnreachable(
                "circuit breaker open".to_string(),
            ));
        }
        let url = Self::url(&cfg.base_url, path);
        let req = Self::authorize(self.http.get(&url), cfg);
        match req.send().await {
            Ok(resp) if resp.status().is_server_error() => {
                self.breaker.record_failure();
                Err(RelayError::UpstreamStatus {
                    status: resp.status().as_u16(),
                    body: String::new(),
                })
            }
            Ok(resp) => {
                self.breaker.record_success();
                Ok(resp)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(RelayError::from(e))
            }
        }
    }

    /// POST a client-originated command verbatim to `/rest/items/<name>`.
    pub async fn send_command(
        &self,
        cfg: &UpstreamConfig,
        item_name: &str,
        command: String,
    ) -> RelayResult<StatusCode> {
        let url = Self::url(&cfg.base_url, &format!("rest/items/{}", item_name));
        let req = Self::authorize(self.http.post(&url), cfg)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .body(command);

        let resp = req.send().await.map_err(RelayError::from)?;
        Ok(resp.status())
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_path_without_doubling_slash() {
        assert_eq!(
            UpstreamClient::url("http://host:8080/", "/rest/items"),
            "http://host:8080/rest/items"
        );
        assert_eq!(
            UpstreamClient::url("http://host:8080", "rest/items"),
            "http://host:8080/rest/items"
        );
    }
}
