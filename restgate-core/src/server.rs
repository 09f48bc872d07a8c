//! HTTP surface assembly: reserved swagger routes plus the dynamic fallback.
//!
//! The listener itself (port binding, TLS handshake) is owned by the binary;
//! this module only builds the router and decides the TLS mode.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::{header, StatusCode};
use tracing::{error, info, warn};

use crate::dispatch::Dispatcher;
use crate::routes::RoutePublisher;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub publisher: Arc<RoutePublisher>,
    /// Directory holding the swagger UI assets, if any.
    pub ui_root: Option<PathBuf>,
}

/// Build the gateway router.
///
/// Reserved routes live under `swagger_prefix`; everything else falls
/// through to the dispatcher. The UI subtree is only mounted for a
/// non-empty prefix, since mounting it at the root would shadow the whole
/// dynamic surface.
pub fn router(state: AppState, swagger_prefix: &str) -> Router {
    let prefix = normalize_prefix(swagger_prefix);

    let mut router = Router::new().route(
        &format!("{prefix}/v1/swagger.json"),
        get(swagger_json),
    );

    if state.ui_root.is_some() {
        if prefix.is_empty() {
            warn!("swagger UI disabled: an empty mount prefix would shadow dynamic routes");
        } else {
            info!(prefix = %prefix, "publishing swagger docs");
            router = router
                .route(&prefix, get(ui_index))
                .route(&format!("{prefix}/"), get(ui_index))
                .route(&format!("{prefix}/{{*path}}"), get(ui_asset));
        }
    }

    router.fallback(dispatch_request).with_state(state)
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

async fn dispatch_request(State(state): State<AppState>, req: Request) -> Response {
    state.dispatcher.dispatch(req).await
}

async fn swagger_json(State(state): State<AppState>) -> Response {
    Json(state.publisher.snapshot().swagger.clone()).into_response()
}

async fn ui_index(State(state): State<AppState>) -> Response {
    match &state.ui_root {
        Some(root) => serve_file(&root.join("index.html")).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ui_asset(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let root = match &state.ui_root {
        Some(root) => root,
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    // Keep lookups inside the asset root.
    if path.split('/').any(|part| part == "..") || path.starts_with('/') {
        return StatusCode::NOT_FOUND.into_response();
    }
    serve_file(&root.join(path)).await
}

async fn serve_file(path: &FsPath) -> Response {
    match tokio::fs::read(path).await {
        Ok(contents) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type_for(path))],
            contents,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn content_type_for(path: &FsPath) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

// -- TLS mode -----------------------------------------------------------------

/// How the listener should come up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// Serve TLS with the given key and certificate.
    Enabled { key: PathBuf, cert: PathBuf },
    /// Serve cleartext HTTP.
    Cleartext,
}

/// Decide the listener mode from configuration.
///
/// TLS is requested with the string "True"; when requested but either PKI
/// file is missing, the gateway downgrades to cleartext rather than failing
/// to start.
pub fn resolve_tls(enable_tls: &str, key: &str, cert: &str) -> TlsMode {
    if enable_tls != "True" {
        info!("tls disabled through configuration");
        return TlsMode::Cleartext;
    }

    let key_path = PathBuf::from(key);
    let cert_path = PathBuf::from(cert);
    let key_ok = key_path.exists();
    let cert_ok = cert_path.exists();

    if key_ok && cert_ok {
        info!("tls enabled");
        return TlsMode::Enabled {
            key: key_path,
            cert: cert_path,
        };
    }

    if !key_ok {
        error!(path = %key_path.display(), "tls key not found");
    }
    if !cert_ok {
        error!(path = %cert_path.display(), "tls certificate not found");
    }
    info!("disabling tls due to missing pki files");
    TlsMode::Cleartext
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::routes::{Published, RoutePublisher};
    use crate::session::UnaryInvoker;
    use async_trait::async_trait;
    use axum::body::Body;
    use std::time::Duration;
    use tonic::metadata::MetadataMap;
    use tower::ServiceExt;

    struct EchoBackend;

    #[async_trait]
    impl UnaryInvoker for EchoBackend {
        async fn invoke(
            &self,
            _service: &str,
            _method: &str,
            request: Vec<u8>,
            _deadline: Duration,
            _metadata: MetadataMap,
        ) -> Result<Vec<u8>> {
            Ok(request)
        }
    }

    fn make_state(ui_root: Option<PathBuf>) -> AppState {
        let published = Published::from_blob(&crate::routes::tests::demo_blob()).unwrap();
        let publisher = Arc::new(RoutePublisher::new(published));
        let dispatcher = Arc::new(Dispatcher::new(publisher.clone(), Arc::new(EchoBackend)));
        AppState {
            dispatcher,
            publisher,
            ui_root,
        }
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn serves_swagger_document() {
        let app = router(make_state(None), "");
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/v1/swagger.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let doc: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(doc["swagger"], "2.0");
        assert!(doc["paths"]["/v1/say"]["post"].is_object());
    }

    #[tokio::test]
    async fn swagger_document_honors_prefix() {
        let app = router(make_state(None), "/apidocs");
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/apidocs/v1/swagger.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn dynamic_routes_fall_through_to_dispatcher() {
        let app = router(make_state(None), "");
        let response = app
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/v1/say")
                    .body(Body::from(r#"{"text":"hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&body_string(response).await).unwrap(),
            serde_json::json!({"text": "hi"})
        );
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = router(make_state(None), "");
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_ui_assets_under_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>ui</html>").unwrap();
        std::fs::write(dir.path().join("app.css"), "body{}").unwrap();

        let app = router(make_state(Some(dir.path().to_path_buf())), "/apidocs");

        let index = app
            .clone()
            .oneshot(
                http::Request::builder()
                    .uri("/apidocs/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(index.status(), StatusCode::OK);
        assert_eq!(body_string(index).await, "<html>ui</html>");

        let css = app
            .clone()
            .oneshot(
                http::Request::builder()
                    .uri("/apidocs/app.css")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(css.status(), StatusCode::OK);
        assert_eq!(
            css.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/css"
        );

        let escape = app
            .oneshot(
                http::Request::builder()
                    .uri("/apidocs/../Cargo.toml")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_ne!(escape.status(), StatusCode::OK);
    }

    #[test]
    fn tls_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("server.key");
        let cert = dir.path().join("server.crt");
        std::fs::write(&key, "key").unwrap();
        std::fs::write(&cert, "cert").unwrap();

        assert_eq!(
            resolve_tls("True", key.to_str().unwrap(), cert.to_str().unwrap()),
            TlsMode::Enabled {
                key: key.clone(),
                cert: cert.clone()
            }
        );
        assert_eq!(
            resolve_tls("False", key.to_str().unwrap(), cert.to_str().unwrap()),
            TlsMode::Cleartext
        );
        // Requested but missing cert: downgrade instead of failing.
        assert_eq!(
            resolve_tls("True", key.to_str().unwrap(), "/nonexistent/server.crt"),
            TlsMode::Cleartext
        );
    }

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("apidocs"), "/apidocs");
        assert_eq!(normalize_prefix("/apidocs/"), "/apidocs");
    }
}
