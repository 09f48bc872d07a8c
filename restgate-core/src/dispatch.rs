//! Per-request dispatch: match a route, bind inputs, call the backend,
//! and translate the reply (or error status) back to HTTP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use prost::Message as _;
use prost_reflect::DynamicMessage;
use serde_json::json;
use tonic::metadata::{MetadataMap, MetadataValue};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::routes::RoutePublisher;
use crate::session::{UnaryInvoker, DEFAULT_DEADLINE};
use crate::translate;

/// Per-request deadline override header, in milliseconds.
pub const TIMEOUT_HEADER: &str = "x-request-timeout-ms";

/// Largest request body the dispatcher will buffer.
const BODY_LIMIT: usize = 4 * 1024 * 1024;

/// Translates matched HTTP requests into backend calls.
pub struct Dispatcher {
    publisher: Arc<RoutePublisher>,
    backend: Arc<dyn UnaryInvoker>,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(publisher: Arc<RoutePublisher>, backend: Arc<dyn UnaryInvoker>) -> Dispatcher {
        Dispatcher {
            publisher,
            backend,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Refuse new requests with 503 from now on.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Handle one dynamic request end to end.
    ///
    /// The route table snapshot is taken once; a concurrent rebuild does not
    /// affect this request. Dropping the future (client disconnect) cancels
    /// the in-flight backend call.
    pub async fn dispatch(&self, req: Request) -> Response {
        if self.shutting_down.load(Ordering::Acquire) {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down".into());
        }

        let snapshot = self.publisher.snapshot();

        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();

        let (route, raw_vars) = match snapshot.routes.match_request(&parts.method, &path) {
            Some(found) => found,
            None => {
                debug!(method = %parts.method, path = %path, "no route matched");
                return text_response(StatusCode::NOT_FOUND, "Not Found".into());
            }
        };

        let path_vars: Vec<(String, String)> = raw_vars
            .into_iter()
            .map(|(name, value)| (name, percent_decode(&value)))
            .collect();
        let query = parse_query(parts.uri.query().unwrap_or(""));

        let body = match axum::body::to_bytes(body, BODY_LIMIT).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return text_response(
                    StatusCode::BAD_REQUEST,
                    format!("failed to read request body: {e}"),
                )
            }
        };

        let input = translate::RequestInput {
            path_vars: &path_vars,
            query: &query,
            body: &body[..],
        };
        let request_msg = match translate::decode_request(&route.input, &route.body, &input) {
            Ok(msg) => msg,
            Err(GatewayError::Binding(msg)) => {
                return text_response(StatusCode::BAD_REQUEST, msg);
            }
            Err(e) => return internal_response(&e.to_string()),
        };

        let deadline = request_deadline(&parts.headers);
        let metadata = forward_metadata(&parts.headers);

        let reply_bytes = match self
            .backend
            .invoke(
                &route.service,
                &route.rpc,
                request_msg.encode_to_vec(),
                deadline,
                metadata,
            )
            .await
        {
            Ok(bytes) => bytes,
            Err(GatewayError::GrpcStatus(status)) => return status_response(&status),
            Err(GatewayError::Resolution(msg)) => {
                warn!(service = %route.service, rpc = %route.rpc, error = %msg, "backend unreachable");
                return text_response(StatusCode::SERVICE_UNAVAILABLE, msg);
            }
            Err(e) => return internal_response(&e.to_string()),
        };

        let reply = match DynamicMessage::decode(route.output.clone(), reply_bytes.as_slice()) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(service = %route.service, rpc = %route.rpc, error = %e, "undecodable backend reply");
                return internal_response("backend reply did not match the response schema");
            }
        };

        match translate::encode_response(&reply) {
            Ok(value) => (StatusCode::OK, Json(value)).into_response(),
            Err(e) => internal_response(&e.to_string()),
        }
    }
}

/// Map a gRPC status code to its HTTP equivalent.
pub fn http_status_for(code: tonic::Code) -> StatusCode {
    match code {
        tonic::Code::Ok => StatusCode::OK,
        tonic::Code::InvalidArgument => StatusCode::BAD_REQUEST,
        tonic::Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        tonic::Code::PermissionDenied => StatusCode::FORBIDDEN,
        tonic::Code::NotFound => StatusCode::NOT_FOUND,
        tonic::Code::AlreadyExists => StatusCode::CONFLICT,
        tonic::Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        tonic::Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Known codes carry the backend's details string verbatim; everything else
/// collapses into the opaque 500 envelope.
fn status_response(status: &tonic::Status) -> Response {
    let code = http_status_for(status.code());
    if code == StatusCode::INTERNAL_SERVER_ERROR {
        internal_response(status.message())
    } else {
        text_response(code, status.message().to_string())
    }
}

fn internal_response(details: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "Internal Server Error",
            "specific_error": details,
        })),
    )
        .into_response()
}

fn text_response(status: StatusCode, body: String) -> Response {
    (status, body).into_response()
}

fn request_deadline(headers: &http::HeaderMap) -> Duration {
    headers
        .get(TIMEOUT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_DEADLINE)
}

/// Credentials are forwarded transparently; nothing else crosses over.
fn forward_metadata(headers: &http::HeaderMap) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    if let Some(auth) = headers.get(http::header::AUTHORIZATION) {
        if let Ok(value) = auth.to_str() {
            if let Ok(value) = MetadataValue::try_from(value) {
                metadata.insert("authorization", value);
            }
        }
    }
    metadata
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => match (hex_val(bytes.get(i + 1)), hex_val(bytes.get(i + 2))) {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(byte: Option<&u8>) -> Option<u8> {
    match byte? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{Published, RoutePublisher};
    use async_trait::async_trait;
    use axum::body::Body;
    use std::sync::Mutex;

    enum FakeReply {
        /// Return the request bytes unchanged.
        Echo,
        Status(tonic::Code, &'static str),
    }

    struct FakeBackend {
        reply: FakeReply,
        calls: Mutex<Vec<(String, String, Vec<u8>, Duration)>>,
    }

    impl FakeBackend {
        fn new(reply: FakeReply) -> Arc<FakeBackend> {
            Arc::new(FakeBackend {
                reply,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn last_call(&self) -> (String, String, Vec<u8>, Duration) {
            self.calls.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl UnaryInvoker for FakeBackend {
        async fn invoke(
            &self,
            service: &str,
            method: &str,
            request: Vec<u8>,
            deadline: Duration,
            _metadata: MetadataMap,
        ) -> crate::error::Result<Vec<u8>> {
            self.calls.lock().unwrap().push((
                service.to_string(),
                method.to_string(),
                request.clone(),
                deadline,
            ));
            match &self.reply {
                FakeReply::Echo => Ok(request),
                FakeReply::Status(code, msg) => Err(GatewayError::GrpcStatus(
                    tonic::Status::new(*code, *msg),
                )),
            }
        }
    }

    fn make_dispatcher(reply: FakeReply) -> (Dispatcher, Arc<FakeBackend>) {
        let published = Published::from_blob(&crate::routes::tests::demo_blob()).unwrap();
        let publisher = Arc::new(RoutePublisher::new(published));
        let backend = FakeBackend::new(reply);
        (
            Dispatcher::new(publisher, backend.clone() as Arc<dyn UnaryInvoker>),
            backend,
        )
    }

    fn request(method: &str, uri: &str, body: &str) -> Request {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let (dispatcher, backend) = make_dispatcher(FakeReply::Echo);
        let response = dispatcher
            .dispatch(request("POST", "/v1/say", r#"{"text":"hi"}"#))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&body).unwrap(),
            serde_json::json!({"text": "hi"})
        );
        let (service, rpc, _, _) = backend.last_call();
        assert_eq!(service, "demo.v1.Echo");
        assert_eq!(rpc, "Say");
    }

    #[tokio::test]
    async fn path_variable_binds_into_request_message() {
        let (dispatcher, backend) = make_dispatcher(FakeReply::Status(tonic::Code::NotFound, "gone"));
        let response = dispatcher.dispatch(request("GET", "/v1/items/42", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "gone");

        let (_, _, request_bytes, _) = backend.last_call();
        let published = Published::from_blob(&crate::routes::tests::demo_blob()).unwrap();
        let (route, _) = published
            .routes
            .match_request(&http::Method::GET, "/v1/items/42")
            .unwrap();
        let msg = DynamicMessage::decode(route.input.clone(), request_bytes.as_slice()).unwrap();
        let id = msg.get_field(&route.input.get_field_by_name("id").unwrap());
        assert_eq!(id.as_i64(), Some(42));
    }

    #[tokio::test]
    async fn query_parameters_bind_repeated_and_scalar_fields() {
        let (dispatcher, backend) = make_dispatcher(FakeReply::Echo);
        let response = dispatcher
            .dispatch(request("GET", "/v1/search?q=a&q=b&limit=5", ""))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let (_, _, request_bytes, _) = backend.last_call();
        let published = Published::from_blob(&crate::routes::tests::demo_blob()).unwrap();
        let (route, _) = published
            .routes
            .match_request(&http::Method::GET, "/v1/search")
            .unwrap();
        let msg = DynamicMessage::decode(route.input.clone(), request_bytes.as_slice()).unwrap();
        let q = msg.get_field(&route.input.get_field_by_name("q").unwrap());
        let values: Vec<String> = q
            .as_list()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(values, vec!["a", "b"]);
        let limit = msg.get_field(&route.input.get_field_by_name("limit").unwrap());
        assert_eq!(limit.as_i32(), Some(5));
    }

    #[tokio::test]
    async fn invalid_argument_maps_to_400_with_details() {
        let (dispatcher, _) = make_dispatcher(FakeReply::Status(tonic::Code::InvalidArgument, "bad"));
        let response = dispatcher
            .dispatch(request("POST", "/v1/say", r#"{"text":"x"}"#))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "bad");
    }

    #[tokio::test]
    async fn unknown_status_maps_to_500_envelope() {
        let (dispatcher, _) = make_dispatcher(FakeReply::Status(tonic::Code::Internal, "boom"));
        let response = dispatcher
            .dispatch(request("POST", "/v1/say", r#"{"text":"x"}"#))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"], "Internal Server Error");
        assert_eq!(body["specific_error"], "boom");
    }

    #[tokio::test]
    async fn unmatched_path_is_404() {
        let (dispatcher, _) = make_dispatcher(FakeReply::Echo);
        let response = dispatcher.dispatch(request("GET", "/nope", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_body_is_400() {
        let (dispatcher, _) = make_dispatcher(FakeReply::Echo);
        let response = dispatcher
            .dispatch(request("POST", "/v1/say", "not json"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_requests() {
        let (dispatcher, _) = make_dispatcher(FakeReply::Echo);
        dispatcher.begin_shutdown();
        let response = dispatcher
            .dispatch(request("POST", "/v1/say", r#"{"text":"x"}"#))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn timeout_header_overrides_deadline() {
        let (dispatcher, backend) = make_dispatcher(FakeReply::Echo);
        let req = http::Request::builder()
            .method("POST")
            .uri("/v1/say")
            .header(TIMEOUT_HEADER, "1500")
            .body(Body::from(r#"{"text":"x"}"#))
            .unwrap();
        dispatcher.dispatch(req).await;
        let (_, _, _, deadline) = backend.last_call();
        assert_eq!(deadline, Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn default_deadline_applies_without_header() {
        let (dispatcher, backend) = make_dispatcher(FakeReply::Echo);
        dispatcher
            .dispatch(request("POST", "/v1/say", r#"{"text":"x"}"#))
            .await;
        let (_, _, _, deadline) = backend.last_call();
        assert_eq!(deadline, DEFAULT_DEADLINE);
    }

    #[test]
    fn status_mapping_table() {
        assert_eq!(http_status_for(tonic::Code::Ok), StatusCode::OK);
        assert_eq!(
            http_status_for(tonic::Code::InvalidArgument),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            http_status_for(tonic::Code::Unauthenticated),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            http_status_for(tonic::Code::PermissionDenied),
            StatusCode::FORBIDDEN
        );
        assert_eq!(http_status_for(tonic::Code::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            http_status_for(tonic::Code::AlreadyExists),
            StatusCode::CONFLICT
        );
        assert_eq!(
            http_status_for(tonic::Code::DeadlineExceeded),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            http_status_for(tonic::Code::Unavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            http_status_for(tonic::Code::Unknown),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn query_parsing_decodes_percent_and_plus() {
        let pairs = parse_query("q=hello+world&name=a%20b&flag");
        assert_eq!(
            pairs,
            vec![
                ("q".to_string(), "hello world".to_string()),
                ("name".to_string(), "a b".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }
}
