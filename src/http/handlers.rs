//! Individual route handlers for the core HTTP surface (design notes §4.H).

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Extension, Path, RawQuery, State};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;

use crate::auth::{csrf_matches, Authenticated};
use crate::delta::{build_snapshot, canonical_key};
use crate::error::{RelayError, RelayResult};
use crate::upstream::model::PageJson;
use crate::AppState;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct DeltaParams {
    since: Option<String>,
}

fn parse_delta_params(query: &str) -> Option<DeltaParams> {
    let mut delta = false;
    let mut since = None;
    for pair in query.split('&') {
        let mut it = pair.splitn(2, '=');
        let key = it.next().unwrap_or("");
        let value = it.next().unwrap_or("");
        match key {
            "delta" => delta = value == "1" || value == "true",
            "since" => since = Some(value.to_string()),
            _ => {}
        }
    }
    delta.then_some(DeltaParams { since })
}

/// `GET /rest/*path`: the sitemap delta route when `?delta=1` is present,
/// otherwise a verbatim passthrough to the upstream.
pub async fn rest_passthrough(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let query_string = query.unwrap_or_default();

    if path.starts_with("sitemaps/") {
        if let Some(params) = parse_delta_params(&query_string) {
            return sitemap_delta(&state, &path, params).await;
        }
    }

    let upstream_path = if query_string.is_empty() {
        format!("rest/{}", path)
    } else {
        format!("rest/{}?{}", path, query_string)
    };
    let cfg = state.config.current();
    match state.client.get(&cfg.upstream, &upstream_path).await {
        Ok(resp) => {
            let mut builder = Response::builder().status(resp.status.as_u16());
            if let Some(ct) = &resp.content_type {
                builder = builder.header(axum::http::header::CONTENT_TYPE, ct);
            }
            builder
                .body(Body::from(resp.body))
                .unwrap_or_else(|_| RelayError::Internal("response build failed".into()).into_response())
        }
        Err(e) => e.into_response(),
    }
}

/// `POST /rest/*path`: forwards a client-originated command verbatim to the
/// upstream item endpoint. Only `items/<name>` is a command target; anything
/// else under `/rest` has no upstream write semantics to forward.
pub async fn rest_command(
    State(state): State<AppState>,
    Path(path): Path<String>,
    body: String,
) -> Response {
    let item_name = match path.strip_prefix("items/") {
        Some(rest) if !rest.is_empty() && !rest.contains('/') => rest,
        _ => {
            return RelayError::BadRequest(format!("no command target at rest/{}", path)).into_response()
        }
    };

    let cfg = state.config.current();
    match state.client.send_command(&cfg.upstream, item_name, body).await {
        Ok(status) => Response::builder()
            .status(status.as_u16())
            .body(Body::empty())
            .unwrap_or_else(|_| RelayError::Internal("response build failed".into()).into_response()),
        Err(e) => e.into_response(),
    }
}

async fn sitemap_delta(state: &AppState, path: &str, params: DeltaParams) -> Response {
    let cfg = state.config.current();
    let upstream_path = format!("rest/{}?type=json", path);
    let result: RelayResult<PageJson> = state
        .client
        .get(&cfg.upstream, &upstream_path)
        .await
        .and_then(|resp| serde_json::from_slice(&resp.body).map_err(Into::into));

    match result {
        Ok(page) => {
            let mut overrides = HashMap::new();
            state.state.apply_group_overrides(&mut overrides);
            let snapshot = build_snapshot(&page, &overrides);
            let key = canonical_key(path);
            let response = state.delta_cache.compute(&key, snapshot, params.since.as_deref());
            Json(response).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// BFS-walk every linked page reachable from the sitemap or an explicit
/// root page, returning `{pages: Map<url, page>, root}`.
pub async fn sitemap_full(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Response {
    let query_string = query.unwrap_or_default();
    let mut sitemap = None;
    let mut root = None;
    for pair in query_string.split('&') {
        let mut it = pair.splitn(2, '=');
        match (it.next(), it.next()) {
            (Some("sitemap"), Some(v)) => sitemap = Some(v.to_string()),
            (Some("root"), Some(v)) => root = Some(v.to_string()),
            _ => {}
        }
    }

    let cfg = state.config.current();
    let root_path = match (&sitemap, &root) {
        (_, Some(root)) => root.clone(),
        (Some(name), None) => format!("rest/sitemaps/{}?type=json", name),
        (None, None) => {
            return RelayError::BadRequest("sitemap or root query param required".into())
                .into_response()
        }
    };

    let mut pages: HashMap<String, PageJson> = HashMap::new();
    let mut queue = vec![root_path.clone()];
    let mut seen = HashSet::new();

    while let Some(page_path) = queue.pop() {
        if !seen.insert(page_path.clone()) {
            continue;
        }
        let page: RelayResult<PageJson> = state
            .client
            .get(&cfg.upstream, &page_path)
            .await
            .and_then(|resp| serde_json::from_slice(&resp.body).map_err(Into::into));
        if let Ok(page) = page {
            enqueue_linked_pages(&page, &mut queue, &seen);
            pages.insert(page_path, page);
        }
    }

    Json(serde_json::json!({ "pages": pages, "root": root_path })).into_response()
}

fn enqueue_linked_pages(page: &PageJson, queue: &mut Vec<String>, seen: &HashSet<String>) {
    for widget in &page.widget {
        collect_linked_pages(widget, queue, seen);
    }
}

fn collect_linked_pages(
    widget: &crate::upstream::model::WidgetJson,
    queue: &mut Vec<String>,
    seen: &HashSet<String>,
) {
    if let Some(linked) = &widget.linkedPage {
        if let Some(id) = &linked.id {
            let path = format!("rest/sitemaps/{}?type=json", id);
            if !seen.contains(&path) {
                queue.push(path);
            }
        }
    }
    for child in &widget.widget {
        collect_linked_pages(child, queue, seen);
    }
}

/// Same walk as `sitemap_full` but flattened to widgets and frame-section
/// labels, filtered by role (the full role/visibility model is out of
/// scope; the caller's role is echoed back for the frontend to apply).
pub async fn search_index(Extension(user): Extension<Authenticated>, State(state): State<AppState>) -> Response {
    let cfg = state.config.current();
    let sitemap_path = format!("rest/sitemaps/{}?type=json", cfg.subscription.sitemap_name);
    let page: RelayResult<PageJson> = state
        .client
        .get(&cfg.upstream, &sitemap_path)
        .await
        .and_then(|resp| serde_json::from_slice(&resp.body).map_err(Into::into));

    match page {
        Ok(page) => {
            let mut entries = Vec::new();
            flatten_search_entries(&page.widget, &mut entries);
            Json(serde_json::json!({ "entries": entries, "role": user.username })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Serialize)]
struct SearchEntry {
    label: String,
    is_frame: bool,
}

fn flatten_search_entries(widgets: &[crate::upstream::model::WidgetJson], out: &mut Vec<SearchEntry>) {
    for widget in widgets {
        out.push(SearchEntry {
            label: widget.label.clone().unwrap_or_default(),
            is_frame: widget.widget_type.as_deref() == Some("Frame"),
        });
        flatten_search_entries(&widget.widget, out);
    }
}

/// A process snapshot of client-facing config; widget glow/visibility/
/// video/iframe/proxy-cache rules are out of scope for the core and are
/// returned as an empty placeholder map for the frontend to merge against.
pub async fn config_js(Extension(user): Extension<Authenticated>, State(state): State<AppState>) -> Response {
    let cfg = state.config.current();
    let body = format!(
        "window.RELAY_CONFIG = {};",
        serde_json::json!({
            "sitemap": cfg.subscription.sitemap_name,
            "role": user.username,
            "widgetRules": {},
        })
    );
    ([(axum::http::header::CONTENT_TYPE, "application/javascript")], body).into_response()
}

pub async fn heartbeat() -> Response {
    Json(serde_json::json!({ "ok": true })).into_response()
}

pub async fn ping() -> Response {
    "pong".into_response()
}

const SETTINGS_WHITELIST: &[&str] = &["focusedPollMs", "theme", "locale"];

#[derive(Deserialize)]
pub struct SettingsPayload {
    #[serde(flatten)]
    fields: HashMap<String, Value>,
}

pub async fn settings(Json(payload): Json<SettingsPayload>) -> Response {
    let rejected: Vec<&String> = payload
        .fields
        .keys()
        .filter(|k| !SETTINGS_WHITELIST.contains(&k.as_str()))
        .collect();
    if !rejected.is_empty() {
        return RelayError::BadRequest(format!("unsupported settings keys: {:?}", rejected)).into_response();
    }
    Json(serde_json::json!({ "ok": true })).into_response()
}

#[derive(Deserialize)]
pub struct LoginPayload {
    username: String,
    passphrase: String,
    csrf_token: String,
}

/// HTML-login mode: a double-submit CSRF token (cookie value echoed in the
/// request body) guards the credential check.
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<LoginPayload>,
) -> Response {
    let csrf_cookie = headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.split(';').find_map(|p| p.trim().strip_prefix("csrf_token=")));

    match csrf_cookie {
        Some(cookie_value) if csrf_matches(cookie_value, &payload.csrf_token) => {}
        _ => return RelayError::Forbidden("csrf token mismatch".into()).into_response(),
    }

    let source_key = addr.ip().to_string();
    match state
        .auth
        .login(&source_key, &payload.username, &payload.passphrase, now_secs())
        .await
    {
        Ok((_, cookie)) => {
            let set_cookie = format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
                crate::http::middleware::SESSION_COOKIE_NAME,
                cookie,
                crate::auth::SESSION_LIFETIME_SECS
            );
            (
                [(axum::http::header::SET_COOKIE, set_cookie)],
                Json(serde_json::json!({ "ok": true })),
            )
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
pub struct FetchDeltaMessage {
    url: String,
    since: Option<String>,
    #[serde(rename = "requestId")]
    request_id: String,
}

#[derive(Deserialize)]
pub struct ClientStateMessage {
    focused: bool,
}

#[derive(Deserialize)]
#[serde(tag = "event", content = "data")]
enum ClientFrame {
    #[serde(rename = "clientState")]
    ClientState(ClientStateMessage),
    #[serde(rename = "fetchDelta")]
    FetchDelta(FetchDeltaMessage),
}

/// `GET /ws`: upgrade check runs the same Basic-or-cookie resolution as the
/// HTTP middleware (already done by `auth_gate` in front of this route),
/// rejects disabled users (also already enforced), and hands the resolved
/// username to the hub.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Extension(user): Extension<Authenticated>,
    State(state): State<AppState>,
) -> Response {
    // Compression negotiation is refused by never echoing the requested
    // extensions back; axum's WebSocketUpgrade does not negotiate any by
    // default, which satisfies the "strip Sec-WebSocket-Extensions" intent.
    ws.on_upgrade(move |socket| handle_socket(socket, user.username, state))
}

async fn handle_socket(socket: axum::extract::ws::WebSocket, username: String, state: AppState) {
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    let id = state.hub.connect(username, tx).await;

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let recv_hub = state.hub.clone();
    let recv_id = id;
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => {
                    if let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) {
                        match frame {
                            ClientFrame::ClientState(state_msg) => {
                                recv_hub.set_focus(recv_id, state_msg.focused);
                            }
                            ClientFrame::FetchDelta(req) => {
                                recv_hub
                                    .handle_fetch_delta(recv_id, &req.url, req.since.as_deref(), &req.request_id)
                                    .await;
                            }
                        }
                    }
                }
                Message::Pong(_) => recv_hub.mark_pong(recv_id),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.disconnect(id).await;
}
