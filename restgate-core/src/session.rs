//! The long-lived backend session: endpoint resolution, channel management,
//! schema refresh over server reflection, and the unary call primitive.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut};
use http::uri::PathAndQuery;
use prost::Message;
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codec::{BufferSettings, Codec, CompressionEncoding, Decoder, Encoder};
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};
use tonic_reflection::pb::v1;
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient as V1Client;
use tonic_reflection::pb::v1alpha;
use tracing::{debug, info, warn};

use crate::discovery::Discovery;
use crate::error::{GatewayError, Result};

/// Default per-request deadline when the client does not supply one.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Default connection timeout for one dial attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reflection API version: 0=unknown, 1=v1, 2=v1alpha
const VERSION_UNKNOWN: u8 = 0;
const VERSION_V1: u8 = 1;
const VERSION_V1ALPHA: u8 = 2;

/// A backend endpoint as configured: direct, or a discovery alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSpec {
    /// `host:port`, used directly.
    Direct(String),
    /// `@service-name`, resolved through a [`Discovery`] collaborator.
    Discovered(String),
}

impl EndpointSpec {
    pub fn parse(endpoint: &str) -> Result<EndpointSpec> {
        if let Some(name) = endpoint.strip_prefix('@') {
            if name.is_empty() {
                return Err(GatewayError::Resolution(
                    "endpoint '@' is missing a service name".into(),
                ));
            }
            return Ok(EndpointSpec::Discovered(name.to_string()));
        }
        if endpoint.is_empty() {
            return Err(GatewayError::Resolution("endpoint must not be empty".into()));
        }
        Ok(EndpointSpec::Direct(endpoint.to_string()))
    }
}

/// Exponential reconnect backoff: 500 ms doubling to a 30 s cap, with
/// ±20 % jitter applied per delay.
pub(crate) struct Backoff {
    current: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_secs(30);
    const JITTER: f64 = 0.2;

    pub(crate) fn new() -> Backoff {
        Backoff {
            current: Backoff::INITIAL,
        }
    }

    pub(crate) fn next(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(Backoff::MAX);
        let factor = 1.0 + rand::thread_rng().gen_range(-Backoff::JITTER..=Backoff::JITTER);
        base.mul_f64(factor)
    }
}

/// Single-flight gate for rebuilds: at most one runs, at most one queues.
pub(crate) struct RebuildGate {
    running: AtomicBool,
    queued: AtomicBool,
}

impl RebuildGate {
    pub(crate) fn new() -> RebuildGate {
        RebuildGate {
            running: AtomicBool::new(false),
            queued: AtomicBool::new(false),
        }
    }

    /// Returns true if the caller should run the rebuild now. Otherwise the
    /// request is folded into the single queued follow-up.
    pub(crate) fn try_begin(&self) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            self.queued.store(true, Ordering::Release);
            false
        } else {
            true
        }
    }

    /// Returns true if a follow-up was queued; the caller keeps the running
    /// slot and loops. Returns false once the gate is fully released.
    pub(crate) fn finish(&self) -> bool {
        if self.queued.swap(false, Ordering::AcqRel) {
            true
        } else {
            self.running.store(false, Ordering::Release);
            false
        }
    }
}

/// SHA-256 fingerprint of a descriptor blob.
pub fn fingerprint(blob: &[u8]) -> [u8; 32] {
    Sha256::digest(blob).into()
}

/// Callback invoked with the new descriptor blob when the schema changes.
pub type RebuildCallback = dyn Fn(&[u8]) -> Result<()> + Send + Sync;

/// Unary call seam between the dispatcher and the backend.
#[async_trait]
pub trait UnaryInvoker: Send + Sync {
    async fn invoke(
        &self,
        service: &str,
        method: &str,
        request: Vec<u8>,
        deadline: Duration,
        metadata: MetadataMap,
    ) -> Result<Vec<u8>>;
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `host:port` or `@service-name`.
    pub endpoint: String,
    /// Connection timeout for one dial attempt.
    pub connect_timeout: Duration,
}

impl SessionConfig {
    pub fn new(endpoint: &str) -> SessionConfig {
        SessionConfig {
            endpoint: endpoint.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// The process-scoped backend session.
pub struct Session {
    channel: Channel,
    schema_fingerprint: Mutex<Option<[u8; 32]>>,
    callback: Mutex<Option<Arc<RebuildCallback>>>,
    gate: RebuildGate,
    pending_blob: Mutex<Option<Vec<u8>>>,
    reflection_version: AtomicU8,
}

impl Session {
    /// Resolve the endpoint and dial until a channel is established.
    ///
    /// Retries are unbounded with exponential backoff; for discovered
    /// endpoints the candidate list is re-queried each round and tried
    /// round-robin.
    pub async fn connect(
        config: SessionConfig,
        discovery: Option<Arc<dyn Discovery>>,
    ) -> Result<Session> {
        let spec = EndpointSpec::parse(&config.endpoint)?;
        if matches!(spec, EndpointSpec::Discovered(_)) && discovery.is_none() {
            return Err(GatewayError::Resolution(format!(
                "endpoint '{}' needs a discovery agent",
                config.endpoint
            )));
        }

        let mut backoff = Backoff::new();
        let mut round = 0usize;
        loop {
            let candidates: Vec<String> = match &spec {
                EndpointSpec::Direct(addr) => vec![addr.clone()],
                EndpointSpec::Discovered(name) => {
                    let discovery = discovery.as_ref().expect("checked above");
                    match discovery.lookup(name).await {
                        Ok(endpoints) => endpoints.iter().map(|e| e.to_string()).collect(),
                        Err(e) => {
                            warn!(service = %name, error = %e, "discovery lookup failed");
                            Vec::new()
                        }
                    }
                }
            };

            if !candidates.is_empty() {
                let address = &candidates[round % candidates.len()];
                match dial(address, config.connect_timeout).await {
                    Ok(channel) => {
                        info!(address = %address, "connected to backend");
                        return Ok(Session {
                            channel,
                            schema_fingerprint: Mutex::new(None),
                            callback: Mutex::new(None),
                            gate: RebuildGate::new(),
                            pending_blob: Mutex::new(None),
                            reflection_version: AtomicU8::new(VERSION_UNKNOWN),
                        });
                    }
                    Err(e) => warn!(address = %address, error = %e, "backend dial failed"),
                }
            }

            round += 1;
            let delay = backoff.next();
            debug!(delay_ms = delay.as_millis() as u64, "retrying backend connection");
            tokio::time::sleep(delay).await;
        }
    }

    /// Register the rebuild callback invoked on schema change.
    pub fn set_rebuild_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&[u8]) -> Result<()> + Send + Sync + 'static,
    {
        let mut guard = self
            .callback
            .lock()
            .map_err(|_| GatewayError::Other("internal lock poisoned".into()))?;
        *guard = Some(Arc::new(callback));
        Ok(())
    }

    /// Spawn the background refresh loop polling the backend schema.
    pub fn spawn_refresh_task(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The interval fires immediately; the startup fetch already ran.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match session.refresh_schema().await {
                    Ok(true) => info!("backend schema changed, route table rebuilt"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "schema refresh failed, keeping current routes"),
                }
            }
        })
    }

    /// Fetch the schema, compare fingerprints, and run the rebuild callback
    /// on change. Returns whether a rebuild happened. Rebuild failures leave
    /// the stored fingerprint untouched so the next signal retries.
    pub async fn refresh_schema(&self) -> Result<bool> {
        let blob = self.fetch_descriptor_blob().await?;
        let new_fingerprint = fingerprint(&blob);
        {
            let guard = self
                .schema_fingerprint
                .lock()
                .map_err(|_| GatewayError::Other("internal lock poisoned".into()))?;
            if *guard == Some(new_fingerprint) {
                return Ok(false);
            }
        }

        self.run_rebuild(blob)?;

        let mut guard = self
            .schema_fingerprint
            .lock()
            .map_err(|_| GatewayError::Other("internal lock poisoned".into()))?;
        *guard = Some(new_fingerprint);
        Ok(true)
    }

    fn run_rebuild(&self, blob: Vec<u8>) -> Result<()> {
        let callback = {
            let guard = self
                .callback
                .lock()
                .map_err(|_| GatewayError::Other("internal lock poisoned".into()))?;
            guard.clone()
        };
        let Some(callback) = callback else {
            return Ok(());
        };

        {
            let mut pending = self
                .pending_blob
                .lock()
                .map_err(|_| GatewayError::Other("internal lock poisoned".into()))?;
            *pending = Some(blob);
        }

        if !self.gate.try_begin() {
            debug!("rebuild already in flight, change queued");
            return Ok(());
        }

        let mut result = Ok(());
        loop {
            let next = {
                let mut pending = self
                    .pending_blob
                    .lock()
                    .map_err(|_| GatewayError::Other("internal lock poisoned".into()))?;
                pending.take()
            };
            if let Some(blob) = next {
                if let Err(e) = callback(&blob) {
                    result = Err(GatewayError::Rebuild(e.to_string()));
                }
            }
            if !self.gate.finish() {
                break;
            }
        }
        result
    }

    // -- Descriptor fetch over server reflection ------------------------------

    /// Assemble a `FileDescriptorSet` blob covering every service the backend
    /// exposes, including transitive file dependencies. Files are ordered by
    /// name so the blob (and its fingerprint) is deterministic.
    pub async fn fetch_descriptor_blob(&self) -> Result<Vec<u8>> {
        let services = self.list_services().await?;
        let mut files: BTreeMap<String, FileDescriptorProto> = BTreeMap::new();

        for service in services {
            if service.starts_with("grpc.reflection.") || service.starts_with("grpc.health.") {
                continue;
            }
            let request =
                v1::server_reflection_request::MessageRequest::FileContainingSymbol(service.clone());
            match self.reflect(request).await? {
                v1::server_reflection_response::MessageResponse::FileDescriptorResponse(fdr) => {
                    self.absorb_files(&mut files, fdr.file_descriptor_proto)
                        .await?;
                }
                _ => {
                    return Err(GatewayError::Other(
                        format!("unexpected reflection response for symbol '{service}'").into(),
                    ))
                }
            }
        }

        let set = FileDescriptorSet {
            file: files.into_values().collect(),
        };
        Ok(set.encode_to_vec())
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        let request = v1::server_reflection_request::MessageRequest::ListServices(String::new());
        match self.reflect(request).await? {
            v1::server_reflection_response::MessageResponse::ListServicesResponse(list) => {
                Ok(list.service.into_iter().map(|s| s.name).collect())
            }
            _ => Err(GatewayError::Other(
                "unexpected reflection response for list_services".into(),
            )),
        }
    }

    /// Decode serialized file descriptors into the collection, pulling any
    /// missing dependencies from the server by filename.
    async fn absorb_files(
        &self,
        files: &mut BTreeMap<String, FileDescriptorProto>,
        serialized: Vec<Vec<u8>>,
    ) -> Result<()> {
        let mut pending: Vec<FileDescriptorProto> = Vec::new();
        for bytes in serialized {
            let fdp = FileDescriptorProto::decode(bytes.as_slice()).map_err(|e| {
                GatewayError::Descriptor(format!("failed to decode file descriptor: {e}"))
            })?;
            pending.push(fdp);
        }

        while let Some(fdp) = pending.pop() {
            let name = fdp.name().to_string();
            if files.contains_key(&name) {
                continue;
            }
            let deps = fdp.dependency.clone();
            files.insert(name, fdp);

            for dep in deps {
                if files.contains_key(&dep) {
                    continue;
                }
                let request =
                    v1::server_reflection_request::MessageRequest::FileByFilename(dep.clone());
                match self.reflect(request).await {
                    Ok(v1::server_reflection_response::MessageResponse::FileDescriptorResponse(
                        fdr,
                    )) => {
                        for bytes in fdr.file_descriptor_proto {
                            match FileDescriptorProto::decode(bytes.as_slice()) {
                                Ok(fdp) => pending.push(fdp),
                                Err(e) => warn!(file = %dep, error = %e, "undecodable dependency"),
                            }
                        }
                    }
                    Ok(_) => warn!(file = %dep, "unexpected reflection response for dependency"),
                    Err(e) => warn!(file = %dep, error = %e, "dependency fetch failed"),
                }
            }
        }
        Ok(())
    }

    /// Send a reflection request with v1/v1alpha auto-negotiation, caching
    /// the discovered version.
    async fn reflect(
        &self,
        message_request: v1::server_reflection_request::MessageRequest,
    ) -> Result<v1::server_reflection_response::MessageResponse> {
        let cached = self.reflection_version.load(Ordering::Relaxed);
        match cached {
            VERSION_V1 => return self.reflect_v1(message_request).await,
            VERSION_V1ALPHA => return self.reflect_v1alpha(message_request).await,
            _ => {}
        }

        match self.reflect_v1(message_request.clone()).await {
            Ok(resp) => {
                self.reflection_version.store(VERSION_V1, Ordering::Relaxed);
                Ok(resp)
            }
            Err(GatewayError::GrpcStatus(status))
                if status.code() == tonic::Code::Unimplemented =>
            {
                let resp = self.reflect_v1alpha(message_request).await?;
                self.reflection_version
                    .store(VERSION_V1ALPHA, Ordering::Relaxed);
                Ok(resp)
            }
            Err(e) => Err(e),
        }
    }

    async fn reflect_v1(
        &self,
        message_request: v1::server_reflection_request::MessageRequest,
    ) -> Result<v1::server_reflection_response::MessageResponse> {
        let request = v1::ServerReflectionRequest {
            host: String::new(),
            message_request: Some(message_request),
        };

        let (tx, rx) = mpsc::channel(1);
        tx.send(request)
            .await
            .map_err(|_| GatewayError::Other("failed to send reflection request".into()))?;
        drop(tx);

        let mut client = V1Client::new(self.channel.clone());
        let response = client
            .server_reflection_info(tonic::Request::new(ReceiverStream::new(rx)))
            .await
            .map_err(GatewayError::GrpcStatus)?;

        let mut stream = response.into_inner();
        let resp = stream
            .message()
            .await
            .map_err(GatewayError::GrpcStatus)?
            .ok_or_else(|| GatewayError::Other("empty reflection response stream".into()))?;

        extract_response(resp.message_response)
    }

    async fn reflect_v1alpha(
        &self,
        message_request: v1::server_reflection_request::MessageRequest,
    ) -> Result<v1::server_reflection_response::MessageResponse> {
        let alpha_request = convert_request_to_v1alpha(message_request);

        let (tx, rx) = mpsc::channel(1);
        tx.send(alpha_request)
            .await
            .map_err(|_| GatewayError::Other("failed to send reflection request".into()))?;
        drop(tx);

        let mut client =
            v1alpha::server_reflection_client::ServerReflectionClient::new(self.channel.clone());
        let response = client
            .server_reflection_info(tonic::Request::new(ReceiverStream::new(rx)))
            .await
            .map_err(GatewayError::GrpcStatus)?;

        let mut stream = response.into_inner();
        let resp = stream
            .message()
            .await
            .map_err(GatewayError::GrpcStatus)?
            .ok_or_else(|| GatewayError::Other("empty reflection response stream".into()))?;

        convert_response_from_v1alpha(resp)
    }
}

#[async_trait]
impl UnaryInvoker for Session {
    /// Invoke a unary method, returning the raw response bytes.
    ///
    /// The deadline is propagated to the backend via the grpc-timeout header
    /// and enforced locally. Dropping the returned future (HTTP client went
    /// away) cancels the outbound call.
    async fn invoke(
        &self,
        service: &str,
        method: &str,
        request: Vec<u8>,
        deadline: Duration,
        metadata: MetadataMap,
    ) -> Result<Vec<u8>> {
        let path: PathAndQuery = format!("/{service}/{method}")
            .parse()
            .map_err(|e| GatewayError::Other(format!("invalid method path: {e}").into()))?;

        let mut client =
            Grpc::new(self.channel.clone()).accept_compressed(CompressionEncoding::Gzip);
        client
            .ready()
            .await
            .map_err(|e| GatewayError::Resolution(format!("backend not ready: {e}")))?;

        let mut req = tonic::Request::new(request);
        *req.metadata_mut() = metadata;
        req.set_timeout(deadline);

        let call = client.unary(req, path, RawCodec);
        let response = match tokio::time::timeout(deadline, call).await {
            Ok(result) => result.map_err(GatewayError::GrpcStatus)?,
            Err(_) => {
                return Err(GatewayError::GrpcStatus(tonic::Status::deadline_exceeded(
                    "request deadline exceeded",
                )))
            }
        };

        Ok(response.into_inner())
    }
}

async fn dial(address: &str, connect_timeout: Duration) -> Result<Channel> {
    let endpoint: Endpoint = Channel::from_shared(format!("http://{address}"))
        .map_err(|e| GatewayError::Resolution(format!("invalid address '{address}': {e}")))?;
    endpoint
        .connect_timeout(connect_timeout)
        .connect()
        .await
        .map_err(|e| GatewayError::Resolution(format!("failed to connect to {address}: {e}")))
}

// -- Raw bytes codec ----------------------------------------------------------

/// A gRPC codec that passes message bytes through untouched.
///
/// The dispatcher already holds the request in wire form (encoded from a
/// dynamic message), and decodes the reply itself against the route's output
/// descriptor, so the channel moves opaque frames.
#[derive(Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Vec<u8>;
    type Decode = Vec<u8>;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

pub struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = Vec<u8>;
    type Error = tonic::Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut tonic::codec::EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = Vec<u8>;
    type Error = tonic::Status;

    fn decode(
        &mut self,
        src: &mut tonic::codec::DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        let len = src.remaining();
        let mut buf = vec![0u8; len];
        src.copy_to_slice(&mut buf);
        Ok(Some(buf))
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

// -- Reflection helpers -------------------------------------------------------

/// Extract the message from a v1 reflection response, surfacing embedded errors.
fn extract_response(
    msg: Option<v1::server_reflection_response::MessageResponse>,
) -> Result<v1::server_reflection_response::MessageResponse> {
    let msg =
        msg.ok_or_else(|| GatewayError::Other("reflection response has no message".into()))?;

    if let v1::server_reflection_response::MessageResponse::ErrorResponse(ref err) = msg {
        return Err(GatewayError::Other(
            format!(
                "reflection error (code {}): {}",
                err.error_code, err.error_message
            )
            .into(),
        ));
    }

    Ok(msg)
}

fn convert_request_to_v1alpha(
    msg: v1::server_reflection_request::MessageRequest,
) -> v1alpha::ServerReflectionRequest {
    use v1::server_reflection_request::MessageRequest;
    let alpha_msg = match msg {
        MessageRequest::FileByFilename(s) => {
            v1alpha::server_reflection_request::MessageRequest::FileByFilename(s)
        }
        MessageRequest::FileContainingSymbol(s) => {
            v1alpha::server_reflection_request::MessageRequest::FileContainingSymbol(s)
        }
        MessageRequest::FileContainingExtension(ext) => {
            v1alpha::server_reflection_request::MessageRequest::FileContainingExtension(
                v1alpha::ExtensionRequest {
                    containing_type: ext.containing_type,
                    extension_number: ext.extension_number,
                },
            )
        }
        MessageRequest::AllExtensionNumbersOfType(s) => {
            v1alpha::server_reflection_request::MessageRequest::AllExtensionNumbersOfType(s)
        }
        MessageRequest::ListServices(s) => {
            v1alpha::server_reflection_request::MessageRequest::ListServices(s)
        }
    };
    v1alpha::ServerReflectionRequest {
        host: String::new(),
        message_request: Some(alpha_msg),
    }
}

fn convert_response_from_v1alpha(
    resp: v1alpha::ServerReflectionResponse,
) -> Result<v1::server_reflection_response::MessageResponse> {
    use v1alpha::server_reflection_response::MessageResponse;
    let msg = resp
        .message_response
        .ok_or_else(|| GatewayError::Other("reflection response has no message".into()))?;

    match msg {
        MessageResponse::FileDescriptorResponse(fdr) => Ok(
            v1::server_reflection_response::MessageResponse::FileDescriptorResponse(
                v1::FileDescriptorResponse {
                    file_descriptor_proto: fdr.file_descriptor_proto,
                },
            ),
        ),
        MessageResponse::ListServicesResponse(list) => Ok(
            v1::server_reflection_response::MessageResponse::ListServicesResponse(
                v1::ListServiceResponse {
                    service: list
                        .service
                        .into_iter()
                        .map(|s| v1::ServiceResponse { name: s.name })
                        .collect(),
                },
            ),
        ),
        MessageResponse::ErrorResponse(err) => Err(GatewayError::Other(
            format!(
                "reflection error (code {}): {}",
                err.error_code, err.error_message
            )
            .into(),
        )),
        _ => Err(GatewayError::Other(
            "unexpected v1alpha reflection response".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_spec_forms() {
        assert_eq!(
            EndpointSpec::parse("localhost:50055").unwrap(),
            EndpointSpec::Direct("localhost:50055".into())
        );
        assert_eq!(
            EndpointSpec::parse("@voltha-grpc").unwrap(),
            EndpointSpec::Discovered("voltha-grpc".into())
        );
        assert!(EndpointSpec::parse("").is_err());
        assert!(EndpointSpec::parse("@").is_err());
    }

    #[test]
    fn backoff_grows_and_caps_with_jitter() {
        let mut backoff = Backoff::new();
        let mut base = Duration::from_millis(500);
        for _ in 0..10 {
            let delay = backoff.next();
            let low = base.mul_f64(1.0 - Backoff::JITTER);
            let high = base.mul_f64(1.0 + Backoff::JITTER);
            assert!(delay >= low && delay <= high, "delay {delay:?} outside [{low:?}, {high:?}]");
            base = (base * 2).min(Duration::from_secs(30));
        }
        // Past the cap, the base stops growing.
        for _ in 0..5 {
            let delay = backoff.next();
            assert!(delay <= Duration::from_secs(36));
        }
    }

    #[test]
    fn rebuild_gate_runs_then_releases() {
        let gate = RebuildGate::new();
        assert!(gate.try_begin());
        assert!(!gate.finish());
        // Fully released: a new change runs again.
        assert!(gate.try_begin());
        assert!(!gate.finish());
    }

    #[test]
    fn rebuild_gate_queues_exactly_one_follow_up() {
        let gate = RebuildGate::new();
        assert!(gate.try_begin());
        // Two changes arrive while running; they collapse into one follow-up.
        assert!(!gate.try_begin());
        assert!(!gate.try_begin());
        assert!(gate.finish());
        assert!(!gate.finish());
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = fingerprint(b"schema-one");
        let b = fingerprint(b"schema-one");
        let c = fingerprint(b"schema-two");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
