//! HTTP surface served on the externally visible port: inspector endpoints
//! under [`INSPECTOR_PREFIX`], everything else proxied to the runtime.

mod inspector;
mod proxy;
mod routes;

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;
use tidewatch_capture::{LogStore, TrafficStore};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use url::Url;

use crate::config::LaunchMode;
use crate::manifest::ResourceManifest;
use crate::synth::CompanionManifest;

pub use inspector::{InspectorRegistry, InspectorRequest, ResourceInspector, ResourceSegment};
pub use routes::{ApiError, ApiErrorBody};

pub const INSPECTOR_PREFIX: &str = "/__tidewatch";
pub const CREDENTIALS_ENV: &str = "CLOUDFLARE_API_TOKEN";

/// Where proxied traffic is sent.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    /// Service binding name inside the companion.
    pub binding: String,
    /// Process the binding points at.
    pub service: String,
    pub base_url: Url,
}

impl ServiceTarget {
    /// Target for a companion that carries a service reference; `None` in
    /// attach mode.
    pub fn from_companion(companion: &CompanionManifest, base_url: Url) -> Option<Self> {
        companion.service_target().map(|decl| ServiceTarget {
            binding: decl.binding_name().to_owned(),
            service: decl.resource_identifier().to_owned(),
            base_url,
        })
    }
}

#[derive(Clone)]
pub struct SidecarState {
    pub manifest: Arc<ResourceManifest>,
    pub mode: LaunchMode,
    pub target: Option<Arc<ServiceTarget>>,
    pub traffic: Arc<TrafficStore>,
    pub logs: Arc<LogStore>,
    pub inspectors: Arc<InspectorRegistry>,
    pub credentials_source: Option<&'static str>,
    client: reqwest::Client,
    missing_target_warned: Arc<AtomicBool>,
}

impl SidecarState {
    pub fn new(
        manifest: Arc<ResourceManifest>,
        mode: LaunchMode,
        target: Option<ServiceTarget>,
        traffic: Arc<TrafficStore>,
        logs: Arc<LogStore>,
    ) -> Result<Self, reqwest::Error> {
        // Redirects belong to the caller, not the proxy. The runtime is always
        // on loopback, so system proxy settings never apply.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self {
            manifest,
            mode,
            target: target.map(Arc::new),
            traffic,
            logs,
            inspectors: Arc::new(InspectorRegistry::default()),
            credentials_source: credentials_from_env(),
            client,
            missing_target_warned: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Mounts resource inspectors. Without this, declared resource routes answer 501.
    pub fn with_inspectors(mut self, inspectors: InspectorRegistry) -> Self {
        self.inspectors = Arc::new(inspectors);
        self
    }

    pub fn with_credentials_source(mut self, source: Option<&'static str>) -> Self {
        self.credentials_source = source;
        self
    }

    /// True exactly once per state, for the first request that finds no target.
    pub(crate) fn first_missing_target(&self) -> bool {
        !self.missing_target_warned.swap(true, Ordering::SeqCst)
    }
}

pub fn credentials_from_env() -> Option<&'static str> {
    std::env::var(CREDENTIALS_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|_| "environment")
}

pub fn build_router(state: SidecarState) -> Router {
    Router::new()
        .route("/__tidewatch", get(routes::index))
        .route("/__tidewatch/", get(routes::index))
        .route("/__tidewatch/health", get(routes::health))
        .route("/__tidewatch/bindings", get(routes::bindings))
        .route("/__tidewatch/requests", get(routes::list_requests))
        .route("/__tidewatch/requests/:id", get(routes::get_request))
        .route("/__tidewatch/logs", get(routes::list_logs))
        .route("/__tidewatch/:resource", any(routes::resource))
        .route("/__tidewatch/:resource/*rest", any(routes::resource))
        .fallback(proxy::proxy)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: SidecarState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, mode = state.mode.as_str(), "sidecar listening");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
