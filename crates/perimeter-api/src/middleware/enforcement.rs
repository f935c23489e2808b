use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, MatchedPath, State},
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use perimeter_shared::{AlertContext, AlertKind, BanSubjectKind, ErrorCode, Finding, Severity};
use uuid::Uuid;

use crate::middleware::auth::bearer_token;
use crate::services::ban_service::BanService;
use crate::services::classifier::{self, ClassifyInput};
use crate::services::identity_service::IdentityService;
use crate::services::rate_limit::RateDecision;
use crate::services::web_request_service::WebRequestService;
use crate::state::AppState;
use crate::telemetry;

/// Request bodies larger than this are not buffered for classification.
const MAX_BUFFERED_BODY: usize = 1024 * 1024;

/// The in-path gate: ban/suspension pre-check, rate-limit tick, request
/// capture, and post-handler classification feeding the alert pipeline.
pub async fn enforce(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let remote_address = client_address(&req);
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let route_bucket = req
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| route_bucket_for(&path));

    // Session principal from the bearer token, if any. An unverifiable token
    // is itself a signal, picked up after the handler runs.
    let (session_principal, invalid_token) = match bearer_token(req.headers()) {
        Some(token) => match state.auth_service().verify_token(token) {
            Ok(claims) => (Uuid::parse_str(&claims.sub).ok(), false),
            Err(_) => (None, true),
        },
        None => (None, false),
    };

    // Pre-check: standing bans and suspensions reject before any handler
    // runs. Store errors fail open; a glitch must not lock everyone out.
    let ban_service = BanService::new(state.db.pool().clone());
    if let Some(principal_id) = session_principal {
        match ban_service
            .active_ban(BanSubjectKind::Principal, &principal_id.to_string())
            .await
        {
            Ok(Some(_)) => {
                let response = rejection(
                    StatusCode::FORBIDDEN,
                    ErrorCode::BannedPrincipal,
                    "Principal is banned",
                );
                log_request(&state, &method, &path, 403, started, &remote_address, session_principal);
                return response;
            }
            Ok(None) => match state.user_service().find_by_id(principal_id).await {
                Ok(Some(principal)) if !principal.is_active => {
                    let response = rejection(
                        StatusCode::FORBIDDEN,
                        ErrorCode::Suspended,
                        "Account is suspended",
                    );
                    log_request(&state, &method, &path, 403, started, &remote_address, session_principal);
                    return response;
                }
                Ok(_) => {}
                Err(e) => fail_open(&state, &remote_address, &path, &method, "principal lookup", &e).await,
            },
            Err(e) => fail_open(&state, &remote_address, &path, &method, "principal ban lookup", &e).await,
        }
    }
    if let Some(addr) = remote_address.as_deref() {
        match ban_service.active_ban(BanSubjectKind::Address, addr).await {
            Ok(Some(_)) => {
                let response = rejection(
                    StatusCode::FORBIDDEN,
                    ErrorCode::BannedAddress,
                    "Address is banned",
                );
                log_request(&state, &method, &path, 403, started, &remote_address, session_principal);
                return response;
            }
            Ok(None) => {}
            Err(e) => fail_open(&state, &remote_address, &path, &method, "address ban lookup", &e).await,
        }
    }

    // Rate-limit tick per (address, route template).
    if let Some(addr) = remote_address.as_deref() {
        if let RateDecision::Limited { retry_after_secs } =
            state.rate_limiter.tick(addr, &route_bucket).await
        {
            telemetry::metrics::handle().rate_limited.add(1, &[]);
            let finding = classifier::finding_for(
                AlertKind::RateLimitExceeded,
                Severity::Medium,
                &format!("rate limit exceeded on {route_bucket}"),
            );
            let ctx = AlertContext {
                principal_id: session_principal,
                remote_address: remote_address.clone(),
                route: route_bucket.clone(),
                method: method.clone(),
                user_agent: header_str(req.headers(), "user-agent"),
                payload: String::new(),
                metadata: serde_json::json!({}),
            };
            state.pipeline().process_findings(&[finding], &ctx).await;

            let mut response = rejection(
                StatusCode::TOO_MANY_REQUESTS,
                ErrorCode::RateLimited,
                "Too many requests",
            );
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
            log_request(&state, &method, &path, 429, started, &remote_address, session_principal);
            return response;
        }
    }

    // Buffer the body so the classifier sees what the handler sees.
    let user_agent = header_str(req.headers(), "user-agent");
    let referer = header_str(req.headers(), "referer");
    let query = req.uri().query().unwrap_or_default().to_string();
    let (parts, body) = req.into_parts();
    let body_bytes = match to_bytes(body, MAX_BUFFERED_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => {
            // Oversized or broken body: the classifier flags it, the
            // handler gets an empty body.
            axum::body::Bytes::new()
        }
    };
    let req = Request::from_parts(parts, Body::from(body_bytes.clone()));

    let input = ClassifyInput {
        method: &method,
        route: &route_bucket,
        query: &query,
        body: &body_bytes,
        user_agent: user_agent.as_deref(),
        referer: referer.as_deref(),
        remote_address: remote_address.as_deref(),
    };
    // Findings are recorded after the handler returns. There is no
    // pre-handler rejection: a classified login attempt must still fail
    // authentication normally, and repeat offenders are stopped by the
    // ban pre-check on their next request.
    let findings = state.classifier.classify(&input);

    let response = next.run(req).await;
    let status = response.status();

    let mut post_findings: Vec<Finding> = findings;
    if invalid_token && matches!(status.as_u16(), 401 | 403) {
        post_findings.push(classifier::finding_for(
            AlertKind::UnauthorizedAccess,
            Severity::High,
            &format!("invalid session token on {route_bucket}"),
        ));
    }

    if !post_findings.is_empty() {
        let ctx = alert_context(
            &state,
            session_principal,
            &body_bytes,
            &remote_address,
            &route_bucket,
            &method,
            user_agent,
            &query,
        )
        .await;
        state.pipeline().process_findings(&post_findings, &ctx).await;
    }

    log_request(
        &state,
        &method,
        &path,
        i32::from(status.as_u16()),
        started,
        &remote_address,
        session_principal,
    );

    response
}

/// Attribute the request: session principal first, then credential fields in
/// the body, so pre-auth attacks count against the targeted account.
#[allow(clippy::too_many_arguments)]
async fn alert_context(
    state: &AppState,
    session_principal: Option<Uuid>,
    body: &[u8],
    remote_address: &Option<String>,
    route: &str,
    method: &str,
    user_agent: Option<String>,
    query: &str,
) -> AlertContext {
    let identity = IdentityService::new(state.db.pool().clone());
    let principal_id = identity
        .resolve(session_principal, body, remote_address.as_deref())
        .await;

    let mut payload = String::new();
    if !query.is_empty() {
        payload.push_str(query);
    }
    if let Ok(text) = std::str::from_utf8(body) {
        if !text.is_empty() {
            if !payload.is_empty() {
                payload.push('\n');
            }
            payload.push_str(text);
        }
    }

    AlertContext {
        principal_id,
        remote_address: remote_address.clone(),
        route: route.to_string(),
        method: method.to_string(),
        user_agent,
        payload,
        metadata: serde_json::json!({}),
    }
}

/// Pre-check read failures fail open but leave a high-severity trace.
async fn fail_open(
    state: &AppState,
    remote_address: &Option<String>,
    path: &str,
    method: &str,
    what: &str,
    error: &perimeter_shared::PerimeterError,
) {
    tracing::error!(error = %error, what, "enforcement pre-check failed open");
    let ctx = AlertContext {
        principal_id: None,
        remote_address: remote_address.clone(),
        route: path.to_string(),
        method: method.to_string(),
        user_agent: None,
        payload: String::new(),
        metadata: serde_json::json!({ "component": what }),
    };
    state
        .pipeline()
        .emit_internal(
            AlertKind::Internal,
            Severity::High,
            &format!("{what} failed: {error}"),
            &ctx,
        )
        .await;
}

fn rejection(status: StatusCode, code: ErrorCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error_code": code.as_str(),
            "message": message,
        })),
    )
        .into_response()
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Collapse id-like path segments so `/admin/alerts/<uuid>` and
/// `/admin/alerts/<other-uuid>` share one rate-limit bucket. This runs
/// before routing, so the matched template is not yet known.
fn route_bucket_for(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            let id_like = !segment.is_empty()
                && (segment.parse::<uuid::Uuid>().is_ok() || segment.parse::<u64>().is_ok());
            if id_like {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Proxy headers first, then the socket peer.
pub fn client_address<B>(req: &Request<B>) -> Option<String> {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    if let Some(real_ip) = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return Some(real_ip.trim().to_string());
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Fire-and-forget introspection row; never delays the response.
fn log_request(
    state: &AppState,
    method: &str,
    path: &str,
    status: i32,
    started: Instant,
    remote_address: &Option<String>,
    principal_id: Option<Uuid>,
) {
    let service = WebRequestService::new(state.db.pool().clone());
    let method = method.to_string();
    let path = path.to_string();
    let remote_address = remote_address.clone().unwrap_or_else(|| "unknown".to_string());
    let latency_ms = started.elapsed().as_millis() as i64;
    tokio::spawn(async move {
        if let Err(e) = service
            .record(&method, &path, status, latency_ms, &remote_address, principal_id)
            .await
        {
            tracing::debug!(error = %e, "failed to record web request");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_header_wins_over_peer() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(client_address(&req).as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn real_ip_is_second_choice() {
        let req = Request::builder()
            .header("x-real-ip", "198.51.100.7")
            .body(())
            .unwrap();
        assert_eq!(client_address(&req).as_deref(), Some("198.51.100.7"));
    }

    #[test]
    fn no_source_yields_none() {
        let req = Request::builder().body(()).unwrap();
        assert_eq!(client_address(&req), None);
    }

    #[test]
    fn id_segments_collapse_into_one_bucket() {
        assert_eq!(
            route_bucket_for("/admin/alerts/6f9619ff-8b86-d011-b42d-00c04fc964ff"),
            "/admin/alerts/:id"
        );
        assert_eq!(route_bucket_for("/tickets/12345"), "/tickets/:id");
        assert_eq!(route_bucket_for("/auth/login"), "/auth/login");
    }
}
