//! Request Dispatcher (§4.8): the public HTTP surface — the proxy route,
//! admin log access, and the human-readable health summary.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use bytesize::ByteSize;
use futures_util::Stream;
use scopeguard::guard;
use tower_http::cors::{Any as CorsAny, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{AuthResolver, BearerToken};
use crate::error::OrchestratorError;
use crate::lifecycle::LifecycleController;
use crate::memory::MemoryProbe;
use crate::registry::Registry;
use crate::runtime::ContainerRuntime;
use crate::service::Service;

/// Wraps the upstream response body so `connections` is decremented exactly
/// once the stream is fully drained *or* dropped early (client disconnect),
/// never merely once the upstream headers arrive (§5, §4.8).
struct ConnectionDrainingStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    _guard: scopeguard::ScopeGuard<Arc<Service>, fn(Arc<Service>)>,
}

impl Stream for ConnectionDrainingStream {
    type Item = reqwest::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

fn release_connection_slot(service: Arc<Service>) {
    service.end_request();
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub lifecycle: Arc<LifecycleController>,
    pub memory: Arc<MemoryProbe>,
    pub auth: Arc<AuthResolver>,
    pub http: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/c/:name/*path", any(proxy))
        .route("/log/:name", axum::routing::get(logs))
        .route("/health", axum::routing::get(health))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(CorsAny)
                .allow_methods(CorsAny)
                .allow_headers(CorsAny),
        )
        .with_state(state)
}

async fn proxy(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Path((name, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    body: Body,
) -> Response {
    let service = match state.registry.get(&name) {
        Some(service) => service,
        None => return OrchestratorError::NotFound(name).into_response(),
    };

    if let Some(group) = &service.config.permission_group {
        let principal = state.auth.resolve(token.as_deref());
        if !principal.is_in_group(group, state.auth.admin_group()) {
            return OrchestratorError::PermissionDenied.into_response();
        }
    }

    service.begin_request();
    let cleanup: scopeguard::ScopeGuard<Arc<Service>, fn(Arc<Service>)> =
        guard(service.clone(), release_connection_slot);

    if let Err(e) = state.lifecycle.ensure_running(&name).await {
        return e.into_response();
    }

    let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
    let upstream_url = format!(
        "http://127.0.0.1:{}/{}{}",
        service.host_port(),
        path,
        query
    );

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return OrchestratorError::UpstreamUnreachable(name).into_response(),
    };

    let mut request = state.http.request(method, &upstream_url).body(body_bytes);
    for (key, value) in headers.iter() {
        if key == axum::http::header::HOST {
            continue;
        }
        request = request.header(key, value);
    }

    let upstream = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("failed to reach upstream for service {}: {}", name, e);
            return OrchestratorError::UpstreamUnreachable(name).into_response();
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (key, value) in upstream.headers().iter() {
        response_headers.insert(key.clone(), value.clone());
    }

    let body = ConnectionDrainingStream {
        inner: Box::pin(upstream.bytes_stream()),
        _guard: cleanup,
    };

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

async fn logs(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(service) = state.registry.get(&name) else {
        return OrchestratorError::NotFound(name).into_response();
    };
    let Some(container_id) = service.container_id.read().clone() else {
        return OrchestratorError::NotFound(name).into_response();
    };

    match state.runtime.logs(&container_id).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned().into_response(),
        Err(e) => OrchestratorError::from(e).into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let mut out = String::new();

    let ram = state.memory.system_ram();
    out.push_str(&format!(
        "system ram: {} used / {} total\n",
        ByteSize::b(ram.used),
        ByteSize::b(ram.total)
    ));

    for (gpu, info) in state.memory.system_vram() {
        out.push_str(&format!(
            "gpu {}: {} used / {} total\n",
            gpu,
            ByteSize::b(info.used),
            ByteSize::b(info.total)
        ));
    }

    out.push_str("\nservices:\n");
    for service in state.registry.iter() {
        out.push_str(&format!(
            "  {:<24} {:<10} ram={} vram={} connections={}\n",
            service.name(),
            service.status.get(),
            ByteSize::b(service.ram.load(std::sync::atomic::Ordering::SeqCst)),
            ByteSize::b(service.vram.load(std::sync::atomic::Ordering::SeqCst)),
            service.connections.get(),
        ));
    }

    out.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{HealthCheckType, ServiceConfig};
    use futures_util::{stream, StreamExt};

    #[test]
    fn byte_size_formats_are_human_readable() {
        assert!(ByteSize::b(1024).to_string().contains('K'));
    }

    fn config() -> ServiceConfig {
        ServiceConfig {
            name: "svc_a".into(),
            image: "example/image".into(),
            max_ram: None,
            max_vram: None,
            use_cpu: true,
            use_gpu: false,
            max_boot_time: 60,
            idle_timeout: 60,
            health_check_type: HealthCheckType::None,
            health_check_url: String::new(),
            health_check_regex: None,
            port: 8000,
            mounts: vec![],
            environment: vec![],
            cpuset_cpus: None,
            permission_group: None,
        }
    }

    fn draining_stream(
        service: Arc<Service>,
        chunks: Vec<&'static str>,
    ) -> ConnectionDrainingStream {
        let inner = stream::iter(
            chunks
                .into_iter()
                .map(|c| -> reqwest::Result<Bytes> { Ok(Bytes::from(c)) }),
        );
        ConnectionDrainingStream {
            inner: Box::pin(inner),
            _guard: guard(service, release_connection_slot),
        }
    }

    #[tokio::test]
    async fn connection_is_released_once_the_stream_is_fully_drained() {
        let service = Arc::new(Service::new(config()));
        service.begin_request();
        assert_eq!(service.connections.get(), 1);

        let body = draining_stream(service.clone(), vec!["a", "b"]);
        let collected: Vec<_> = body.collect().await;

        assert_eq!(collected.len(), 2);
        assert_eq!(service.connections.get(), 0);
    }

    #[tokio::test]
    async fn connection_is_released_on_early_drop_without_draining_the_stream() {
        let service = Arc::new(Service::new(config()));
        service.begin_request();

        let body = draining_stream(service.clone(), vec!["a", "b", "c"]);
        // Dropped without polling at all, as happens on an early client
        // disconnect: the guard must still fire.
        drop(body);

        assert_eq!(service.connections.get(), 0);
    }

    #[tokio::test]
    async fn connection_stays_held_while_the_stream_is_still_pending() {
        let service = Arc::new(Service::new(config()));
        service.begin_request();

        let body = draining_stream(service.clone(), vec!["a"]);
        // The guard lives inside `body`, which is still in scope here.
        assert_eq!(service.connections.get(), 1);
        drop(body);
        assert_eq!(service.connections.get(), 0);
    }
}
