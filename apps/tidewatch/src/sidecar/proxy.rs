use std::time::Instant;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Response},
    response::IntoResponse,
};
use serde_json::json;
use tidewatch_capture::{CorrelationId, HeaderPair, RequestHead, ResponseHead};
use tracing::{debug, warn};

use super::{ApiError, ServiceTarget, SidecarState, INSPECTOR_PREFIX};

/// Headers that describe one connection hop and must not be forwarded.
/// `host` is kept so the worker sees the address the client used.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const UPGRADE_REFUSED: &str = "protocol upgrade is not supported by the proxy";

pub(super) async fn proxy(State(state): State<SidecarState>, request: Request) -> Response<Body> {
    let path = request.uri().path().to_owned();
    if is_inspector_path(&path) {
        return ApiError::NotFound {
            message: format!("unknown inspector endpoint {path}"),
            hint: Some("GET /__tidewatch/ lists the available endpoints"),
        }
        .into_response();
    }

    let Some(target) = state.target.clone() else {
        if state.first_missing_target() {
            state.logs.warn(
                "proxy",
                format!(
                    "{} {path} was not proxied: no worker is bound in {} mode",
                    request.method(),
                    state.mode.as_str()
                ),
            );
        }
        return ApiError::NoTarget.into_response();
    };

    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let query = parts.uri.query().map(str::to_owned);
    let id = state.traffic.start_exchange(RequestHead {
        method: parts.method.to_string(),
        path: path.clone(),
        query: query.clone(),
        headers: header_pairs(&parts.headers),
    });

    if is_upgrade(&parts.headers) {
        warn!(%id, path, "refusing protocol upgrade");
        state.logs.warn(
            "proxy",
            format!("{} {path} asked for a protocol upgrade, which is not proxied", parts.method),
        );
        if let Err(err) = state.traffic.fail_exchange(id, UPGRADE_REFUSED, started) {
            debug!(%id, error = %err, "exchange failure not recorded");
        }
        return ApiError::UpgradeUnsupported.into_response();
    }

    let outcome = forward(&state, &target, &parts.method, &path, query.as_deref(), &parts.headers, body).await;
    match outcome {
        Ok(upstream) => {
            let status = upstream.status();
            let headers = strip_hop_by_hop(upstream.headers());
            // The exchange completes at the response head; the body streams through afterwards.
            let recorded = state.traffic.complete_exchange(
                id,
                ResponseHead {
                    status: status.as_u16(),
                    headers: header_pairs(&headers),
                },
                started,
            );
            if let Err(err) = recorded {
                debug!(%id, error = %err, "exchange not recorded");
            }
            let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(reason) => {
            report_failure(&state, id, &parts.method, &path, &reason, started);
            ApiError::Upstream.into_response()
        }
    }
}

async fn forward(
    state: &SidecarState,
    target: &ServiceTarget,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Body,
) -> Result<reqwest::Response, String> {
    let mut url = target.base_url.clone();
    url.set_path(path);
    url.set_query(query);

    let mut request = state
        .client
        .request(method.clone(), url)
        .headers(forwarded_headers(headers));
    if !is_bodiless(method) {
        request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    request.send().await.map_err(|err| err.to_string())
}

fn report_failure(
    state: &SidecarState,
    id: CorrelationId,
    method: &Method,
    path: &str,
    reason: &str,
    started: Instant,
) {
    warn!(%id, %method, path, reason, "proxy forward failed");
    state.logs.error(
        "proxy",
        format!("{method} {path} failed: {reason}"),
        Some(json!({ "correlationId": id, "method": method.as_str(), "path": path })),
    );
    if let Err(err) = state.traffic.fail_exchange(id, reason, started) {
        debug!(%id, error = %err, "exchange failure not recorded");
    }
}

fn is_inspector_path(path: &str) -> bool {
    path == INSPECTOR_PREFIX
        || path
            .strip_prefix(INSPECTOR_PREFIX)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn is_bodiless(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

/// A WebSocket handshake or any other `Upgrade` request.
fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        || headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = strip_hop_by_hop(headers);
    if let Some(host) = headers.get(header::HOST) {
        if !out.contains_key(&X_FORWARDED_HOST) {
            out.insert(X_FORWARDED_HOST, host.clone());
        }
    }
    if !out.contains_key(&X_FORWARDED_PROTO) {
        out.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
    out
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(HeaderName::from_static(name));
    }
    out
}

fn header_pairs(headers: &HeaderMap) -> Vec<HeaderPair> {
    headers
        .iter()
        .map(|(name, value)| {
            HeaderPair::new(name.as_str(), String::from_utf8_lossy(value.as_bytes()).into_owned())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn inspector_prefix_matches_whole_segments_only() {
        assert!(is_inspector_path("/__tidewatch"));
        assert!(is_inspector_path("/__tidewatch/unknown"));
        assert!(!is_inspector_path("/__tidewatchers"));
        assert!(!is_inspector_path("/orders"));
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("host", HeaderValue::from_static("localhost:8787"));
        headers.insert("content-length", HeaderValue::from_static("12"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let stripped = strip_hop_by_hop(&headers);
        assert!(stripped.get("connection").is_none());
        assert_eq!(stripped.get("host").unwrap(), "localhost:8787");
        assert!(stripped.get("content-length").is_none());
        assert_eq!(stripped.get("x-request-id").unwrap(), "abc");
        assert_eq!(stripped.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn forwarded_headers_name_the_original_host() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("localhost:8787"));
        let forwarded = forwarded_headers(&headers);
        assert_eq!(forwarded.get("host").unwrap(), "localhost:8787");
        assert_eq!(forwarded.get("x-forwarded-host").unwrap(), "localhost:8787");
        assert_eq!(forwarded.get("x-forwarded-proto").unwrap(), "http");

        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(forwarded_headers(&headers).get("x-forwarded-proto").unwrap(), "https");
    }

    #[test]
    fn upgrade_requests_are_recognised() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade(&headers));
        headers.insert("connection", HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_upgrade(&headers));

        let mut headers = HeaderMap::new();
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        assert!(is_upgrade(&headers));
    }

    #[test]
    fn only_get_and_head_drop_the_body() {
        assert!(is_bodiless(&Method::GET));
        assert!(is_bodiless(&Method::HEAD));
        assert!(!is_bodiless(&Method::POST));
        assert!(!is_bodiless(&Method::DELETE));
    }

    #[test]
    fn captured_headers_keep_repeated_values() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        let pairs = header_pairs(&headers);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1], HeaderPair::new("accept", "application/json"));
    }
}
