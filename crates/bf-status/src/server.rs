use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bf_build::{BuildRegistry, TrySetManager};
use bf_buildlet::Buildlet;
use bf_core::builders::BuilderCatalog;
use bf_pools::reverse::ReversePool;
use bf_pools::PoolSet;
use bf_sched::{SchedItem, Scheduler};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::auth::GomoteAuth;
use crate::health::HealthRegistry;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Shared state behind every status handler.
pub struct StatusState {
    pub registry: Arc<BuildRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub pools: Arc<PoolSet>,
    pub reverse: Arc<ReversePool>,
    pub tries: Arc<TrySetManager>,
    pub health: HealthRegistry,
    pub catalog: Arc<BuilderCatalog>,
    pub gomote: Option<GomoteState>,
    pub environment: String,
    pub started: DateTime<Utc>,
    pub version: String,
}

/// Gomote control plane: auth plus the live session table.
pub struct GomoteState {
    pub auth: GomoteAuth,
    sessions: Mutex<Vec<GomoteSession>>,
}

struct GomoteSession {
    name: String,
    host_type: String,
    user: String,
    created: DateTime<Utc>,
    /// Holds the reservation; canceling releases the buildlet.
    _token: CancellationToken,
    buildlet: Arc<dyn Buildlet>,
}

impl GomoteState {
    pub fn new(auth: GomoteAuth) -> Self {
        Self {
            auth,
            sessions: Mutex::new(Vec::new()),
        }
    }
}

/// Build the full status router.
pub fn status_router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/", get(get_index))
        .route("/builders", get(get_builders))
        .route("/temporarylogs", get(get_temporary_logs))
        .route("/try", get(get_try))
        .route(
            "/try.json",
            get(get_try_json).layer(CorsLayer::permissive()),
        )
        .route("/status/reverse.json", get(get_reverse_json))
        .route(
            "/status/post-submit-active.json",
            get(get_post_submit_active),
        )
        .route("/status/{id}", get(get_health_checker))
        .route("/buildlet/create", post(post_buildlet_create))
        .route("/buildlet/list", get(get_buildlet_list))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Status pages
// ---------------------------------------------------------------------------

async fn get_index(State(state): State<Arc<StatusState>>) -> Html<String> {
    let uptime = Utc::now().signed_duration_since(state.started);
    let mut page = format!(
        "<html><head><title>farm coordinator</title></head><body>\
         <h1>farm coordinator</h1>\
         <p>environment: {} &middot; version: {} &middot; up {}m</p>",
        html_escape(&state.environment),
        html_escape(&state.version),
        uptime.num_minutes(),
    );

    page.push_str("<h2>health</h2><ul>");
    for checker in state.health.all() {
        let res = checker.check();
        page.push_str(&format!(
            "<li><a href=\"/status/{}\">{}</a>: {}</li>",
            checker.id(),
            html_escape(checker.title()),
            if res.ok { "ok" } else { "<b>FAILING</b>" }
        ));
    }
    page.push_str("</ul>");

    page.push_str("<h2>scheduler</h2><ul>");
    for host in state.scheduler.snapshot().host_types {
        page.push_str(&format!(
            "<li>{}: {} waiting, {} creating, oldest {}s</li>",
            html_escape(&host.host_type),
            host.waiting,
            host.creating,
            host.oldest_wait_secs
        ));
    }
    page.push_str("</ul>");

    page.push_str("<h2>pools</h2><ul>");
    for pool in state.pools.statuses() {
        page.push_str(&format!(
            "<li>{}: {}</li>",
            html_escape(&pool.name),
            html_escape(&pool.detail.join("; "))
        ));
    }
    page.push_str("</ul>");

    page.push_str("<h2>try sets</h2><ul>");
    for ts in state.tries.active() {
        let snap = ts.snapshot();
        page.push_str(&format!(
            "<li><a href=\"/try?commit={}\">{}</a>: {}/{} remaining, {} failed</li>",
            &snap.commit[..snap.commit.len().min(8)],
            html_escape(&snap.change_id),
            snap.remaining,
            snap.total,
            snap.failed.len()
        ));
    }
    page.push_str("</ul>");

    page.push_str("<h2>active builds</h2><ul>");
    for bs in state.registry.active() {
        let snap = bs.snapshot();
        page.push_str(&format!(
            "<li><a href=\"{}\">{}@{}</a> {}</li>",
            log_link(&snap.builder, &snap.rev, snap.sub_name.as_deref(), snap.sub_rev.as_deref()),
            html_escape(&snap.builder),
            &snap.rev[..snap.rev.len().min(8)],
            html_escape(snap.last_event.as_deref().unwrap_or("pending"))
        ));
    }
    page.push_str("</ul>");

    page.push_str("<h2>recent builds</h2><ul>");
    for bs in state.registry.recent() {
        let snap = bs.snapshot();
        let verdict = match snap.succeeded {
            Some(true) => "ok",
            Some(false) => "FAIL",
            None => "?",
        };
        page.push_str(&format!(
            "<li>{}@{}: {}</li>",
            html_escape(&snap.builder),
            &snap.rev[..snap.rev.len().min(8)],
            verdict
        ));
    }
    page.push_str("</ul></body></html>");
    Html(page)
}

async fn get_builders(State(state): State<Arc<StatusState>>) -> Html<String> {
    let mut page = String::from(
        "<html><head><title>builders</title></head><body><h1>builders</h1>\
         <table border=1 cellpadding=4>\
         <tr><th>name</th><th>host type</th><th>goos/goarch</th>\
         <th>split make/run</th><th>helpers</th><th>try bot</th></tr>",
    );
    for b in state.catalog.all() {
        page.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}/{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            html_escape(&b.name),
            html_escape(&b.host_type),
            html_escape(&b.goos),
            html_escape(&b.goarch),
            b.split_make_run,
            b.num_test_helpers,
            b.default_try_bot
        ));
    }
    page.push_str("</table></body></html>");
    Html(page)
}

// ---------------------------------------------------------------------------
// Live logs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LogQuery {
    name: String,
    rev: String,
    #[serde(rename = "subName")]
    sub_name: Option<String>,
    #[serde(rename = "subRev")]
    sub_rev: Option<String>,
    nostream: Option<String>,
}

async fn get_temporary_logs(
    State(state): State<Arc<StatusState>>,
    Query(q): Query<LogQuery>,
) -> Response {
    let Some(bs) = state.registry.find(
        &q.name,
        &q.rev,
        q.sub_name.as_deref(),
        q.sub_rev.as_deref(),
    ) else {
        return (StatusCode::NOT_FOUND, "no such build\n").into_response();
    };

    if q.nostream.as_deref() == Some("1") {
        return (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            bs.log.snapshot(),
        )
            .into_response();
    }

    // Stream the live log until the build's "done" event closes it.
    let reader = bs.log.reader();
    let stream = futures::stream::unfold(reader, |mut reader| async move {
        reader
            .next_chunk()
            .await
            .map(|chunk| (Ok::<_, std::convert::Infallible>(chunk), reader))
    });
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response()
}

fn log_link(name: &str, rev: &str, sub_name: Option<&str>, sub_rev: Option<&str>) -> String {
    match (sub_name, sub_rev) {
        (Some(sn), Some(sr)) => format!(
            "/temporarylogs?name={name}&rev={rev}&subName={sn}&subRev={sr}"
        ),
        _ => format!("/temporarylogs?name={name}&rev={rev}"),
    }
}

// ---------------------------------------------------------------------------
// Try status
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TryQuery {
    commit: Option<String>,
}

#[derive(Serialize)]
struct TryStatusPayload {
    change_id: String,
    commit: String,
    remaining: usize,
    total: usize,
    failed: Vec<String>,
    canceled: bool,
    builds: Vec<TryBuildPayload>,
}

#[derive(Serialize)]
struct TryBuildPayload {
    builder: String,
    done: bool,
    succeeded: Option<bool>,
}

fn try_payload(state: &StatusState, commit_prefix: &str) -> Option<TryStatusPayload> {
    let ts = state.tries.find_by_commit_prefix(commit_prefix)?;
    let snap = ts.snapshot();
    Some(TryStatusPayload {
        change_id: snap.change_id,
        commit: snap.commit,
        remaining: snap.remaining,
        total: snap.total,
        failed: snap.failed,
        canceled: snap.canceled,
        builds: ts
            .builds()
            .iter()
            .map(|b| TryBuildPayload {
                builder: b.rev.name.clone(),
                done: b.is_done(),
                succeeded: b.succeeded(),
            })
            .collect(),
    })
}

async fn get_try(
    State(state): State<Arc<StatusState>>,
    Query(q): Query<TryQuery>,
) -> Response {
    let Some(commit) = q.commit else {
        return (StatusCode::BAD_REQUEST, "missing commit parameter\n").into_response();
    };
    match try_payload(&state, &commit) {
        Some(p) => {
            let mut page = format!(
                "<html><body><h1>try set {}</h1><p>{} of {} remaining</p><ul>",
                html_escape(&p.change_id),
                p.remaining,
                p.total
            );
            for b in &p.builds {
                let verdict = match (b.done, b.succeeded) {
                    (false, _) => "running",
                    (true, Some(true)) => "ok",
                    _ => "FAIL",
                };
                page.push_str(&format!("<li>{}: {}</li>", html_escape(&b.builder), verdict));
            }
            page.push_str("</ul></body></html>");
            Html(page).into_response()
        }
        None => (StatusCode::NOT_FOUND, "no try set for that commit\n").into_response(),
    }
}

async fn get_try_json(
    State(state): State<Arc<StatusState>>,
    Query(q): Query<TryQuery>,
) -> Response {
    let Some(commit) = q.commit else {
        return (StatusCode::BAD_REQUEST, "missing commit parameter\n").into_response();
    };
    match try_payload(&state, &commit) {
        Some(p) => Json(p).into_response(),
        None => (StatusCode::NOT_FOUND, "no try set for that commit\n").into_response(),
    }
}

// ---------------------------------------------------------------------------
// Operational JSON and health
// ---------------------------------------------------------------------------

async fn get_reverse_json(State(state): State<Arc<StatusState>>) -> Response {
    Json(state.reverse.report()).into_response()
}

async fn get_post_submit_active(State(state): State<Arc<StatusState>>) -> Response {
    let active: Vec<_> = state
        .registry
        .active()
        .iter()
        .filter(|b| !b.is_try)
        .map(|b| b.snapshot())
        .collect();
    Json(active).into_response()
}

async fn get_health_checker(
    State(state): State<Arc<StatusState>>,
    Path(id): Path<String>,
) -> Response {
    match state.health.find(&id) {
        Some(checker) => {
            let res = checker.check();
            let code = if res.ok {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (code, res.render()).into_response()
        }
        None => (StatusCode::NOT_FOUND, "unknown health check\n").into_response(),
    }
}

// ---------------------------------------------------------------------------
// Gomote control plane
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateBuildletQuery {
    #[serde(rename = "type")]
    host_type: String,
}

#[derive(Serialize)]
struct GomoteSessionPayload {
    name: String,
    host_type: String,
    user: String,
    created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_port: Option<String>,
}

fn authenticate(state: &StatusState, headers: &HeaderMap) -> Result<String, Response> {
    let Some(gomote) = &state.gomote else {
        return Err((StatusCode::NOT_FOUND, "gomote disabled\n").into_response());
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| gomote.auth.check_basic(v))
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"gomote\"")],
                "bad credentials\n",
            )
                .into_response()
        })
}

async fn post_buildlet_create(
    State(state): State<Arc<StatusState>>,
    headers: HeaderMap,
    Query(q): Query<CreateBuildletQuery>,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let token = CancellationToken::new();
    let item = SchedItem::gomote(q.host_type.clone(), user.clone());
    let buildlet = match state.scheduler.get_buildlet(&token, item).await {
        Ok(b) => b,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("buildlet unavailable: {e}\n"),
            )
                .into_response()
        }
    };
    info!(user = %user, host_type = %q.host_type, buildlet = %buildlet.name(),
          "gomote session created");

    let payload = GomoteSessionPayload {
        name: buildlet.name().to_string(),
        host_type: q.host_type.clone(),
        user: user.clone(),
        created: Utc::now(),
        ip_port: Some(buildlet.ip_port()),
    };
    let gomote = state.gomote.as_ref().expect("checked in authenticate");
    gomote.sessions.lock().expect("gomote lock poisoned").push(GomoteSession {
        name: payload.name.clone(),
        host_type: payload.host_type.clone(),
        user,
        created: payload.created,
        _token: token,
        buildlet,
    });
    Json(payload).into_response()
}

async fn get_buildlet_list(
    State(state): State<Arc<StatusState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authenticate(&state, &headers) {
        return resp;
    }
    let gomote = state.gomote.as_ref().expect("checked in authenticate");
    let sessions: Vec<GomoteSessionPayload> = gomote
        .sessions
        .lock()
        .expect("gomote lock poisoned")
        .iter()
        .map(|s| GomoteSessionPayload {
            name: s.name.clone(),
            host_type: s.host_type.clone(),
            user: s.user.clone(),
            created: s.created,
            ip_port: Some(s.buildlet.ip_port()),
        })
        .collect();
    Json(sessions).into_response()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
