use std::collections::{BTreeMap, HashMap};

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tidewatch_capture::{CorrelationId, LogFilter};

use super::{InspectorRequest, ResourceSegment, SidecarState, INSPECTOR_PREFIX};
use crate::manifest::{BindingDeclaration, BindingKind};

#[derive(Debug)]
pub enum ApiError {
    NotFound {
        message: String,
        hint: Option<&'static str>,
    },
    BadRequest(String),
    NotImplemented {
        message: String,
        hint: &'static str,
    },
    NoTarget,
    Upstream,
    UpgradeUnsupported,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ApiErrorBody {
    fn new(error: &str, message: impl Into<String>, hint: Option<&str>) -> Self {
        Self {
            error: error.to_owned(),
            message: Some(message.into()),
            hint: hint.map(str::to_owned),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound { message, hint } => (
                StatusCode::NOT_FOUND,
                ApiErrorBody::new("not_found", message, hint),
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ApiErrorBody::new("bad_request", message, None),
            ),
            ApiError::NotImplemented { message, hint } => (
                StatusCode::NOT_IMPLEMENTED,
                ApiErrorBody::new("not_implemented", message, Some(hint)),
            ),
            ApiError::NoTarget => (
                StatusCode::NOT_FOUND,
                ApiErrorBody::new(
                    "no_target",
                    "no worker is bound to this inspector, so there is nothing to proxy to",
                    Some("tidewatch is running in attach mode; open your worker on its own port"),
                ),
            ),
            ApiError::Upstream => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiErrorBody::new(
                    "proxy_error",
                    "the request to the worker failed",
                    Some("see /__tidewatch/logs?category=proxy for details"),
                ),
            ),
            ApiError::UpgradeUnsupported => (
                StatusCode::NOT_IMPLEMENTED,
                ApiErrorBody::new(
                    "upgrade_unsupported",
                    "protocol upgrades such as WebSockets are not proxied",
                    Some("connect to the worker's own port for upgraded connections"),
                ),
            ),
        };
        (status, Json(body)).into_response()
    }
}

pub(super) async fn index(State(state): State<SidecarState>) -> Json<Value> {
    Json(json!({
        "name": "tidewatch",
        "worker": state.manifest.name(),
        "mode": state.mode.as_str(),
        "endpoints": [
            format!("{INSPECTOR_PREFIX}/health"),
            format!("{INSPECTOR_PREFIX}/bindings"),
            format!("{INSPECTOR_PREFIX}/requests"),
            format!("{INSPECTOR_PREFIX}/requests/{{id}}"),
            format!("{INSPECTOR_PREFIX}/logs"),
        ],
        "resources": ResourceSegment::ALL
            .iter()
            .map(|segment| format!("{INSPECTOR_PREFIX}/{segment}"))
            .collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse<'a> {
    status: &'static str,
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credentials_source: Option<&'static str>,
}

pub(super) async fn health(State(state): State<SidecarState>) -> Response {
    Json(HealthResponse {
        status: "ok",
        mode: state.mode.as_str(),
        target: state.target.as_deref().map(|target| target.service.as_str()),
        credentials_source: state.credentials_source,
    })
    .into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BindingView<'a> {
    binding_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_identifier: Option<&'a str>,
}

impl<'a> From<&'a BindingDeclaration> for BindingView<'a> {
    fn from(decl: &'a BindingDeclaration) -> Self {
        // Variable identifiers are just their names; values are never held.
        let resource_identifier =
            (decl.kind() != BindingKind::Variable).then(|| decl.resource_identifier());
        BindingView {
            binding_name: decl.binding_name(),
            resource_identifier,
        }
    }
}

pub(super) async fn bindings(State(state): State<SidecarState>) -> Response {
    let grouped: BTreeMap<&'static str, Vec<BindingView<'_>>> = state
        .manifest
        .grouped()
        .into_iter()
        .map(|(kind, decls)| (kind.as_str(), decls.into_iter().map(BindingView::from).collect()))
        .collect();
    Json(json!({
        "worker": state.manifest.name(),
        "bindings": grouped,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub(super) struct RequestsQuery {
    limit: Option<usize>,
}

pub(super) async fn list_requests(
    State(state): State<SidecarState>,
    Query(query): Query<RequestsQuery>,
) -> Json<Value> {
    let requests = match query.limit {
        Some(limit) => state.traffic.recent(limit),
        None => state.traffic.exchanges(),
    };
    Json(json!({
        "capacity": state.traffic.capacity(),
        "requests": requests,
    }))
}

pub(super) async fn get_request(
    State(state): State<SidecarState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id: CorrelationId = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("'{id}' is not a request id")))?;
    let exchange = state.traffic.exchange(id).ok_or_else(|| ApiError::NotFound {
        message: format!("request {id} is unknown or has been evicted"),
        hint: None,
    })?;
    Ok(Json(exchange).into_response())
}

pub(super) async fn list_logs(
    State(state): State<SidecarState>,
    Query(filter): Query<LogFilter>,
) -> Json<Value> {
    Json(json!({ "logs": state.logs.entries(&filter) }))
}

pub(super) async fn resource(
    State(state): State<SidecarState>,
    Path(params): Path<HashMap<String, String>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ApiError> {
    let resource = params.get("resource").map(String::as_str).unwrap_or_default();
    let segment = ResourceSegment::parse(resource).ok_or_else(|| ApiError::NotFound {
        message: format!("unknown inspector endpoint {INSPECTOR_PREFIX}/{resource}"),
        hint: Some("GET /__tidewatch/ lists the available endpoints"),
    })?;

    let kinds = segment.kinds();
    let declared: Vec<BindingDeclaration> = state
        .manifest
        .bindings()
        .iter()
        .filter(|decl| kinds.contains(&decl.kind()))
        .cloned()
        .collect();
    if !kinds.is_empty() && declared.is_empty() {
        return Err(ApiError::NotFound {
            message: format!(
                "{} declares no binding served by {INSPECTOR_PREFIX}/{segment}",
                state.manifest.name()
            ),
            hint: Some("add the binding to your manifest and restart tidewatch"),
        });
    }

    let inspector = state.inspectors.get(segment).ok_or_else(|| ApiError::NotImplemented {
        message: format!("no inspector is available for {segment} resources"),
        hint: "inspect the resource with the runtime's own tooling for now",
    })?;

    let request = InspectorRequest {
        method,
        rest: params.get("rest").cloned().unwrap_or_default(),
        query: uri.query().map(str::to_owned),
        body,
        bindings: declared,
    };
    Ok(inspector.handle(request).await)
}
