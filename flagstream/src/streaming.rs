//! Streaming update pipeline: a long-lived WebSocket channel with an
//! authenticated handshake, versioned incremental sync, heartbeats and
//! exponential-backoff reconnection.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, client_async_tls_with_config,
    connect_async_tls_with_config,
};
use tracing::{debug, info, warn};

use crate::backoff::BackoffStrategy;
use crate::config::{Config, WebSocketConfig};
use crate::evaluator::flag_references_segment;
use crate::notices::{FlagChangedNotice, NoticeBroadcaster};
use crate::protocol::{
    SyncEventType, SyncPayload, build_token, data_sync_request, parse_sync_message, ping_message,
};
use crate::status::{
    DATA_INVALID_ERROR, NETWORK_ERROR, REQUEST_INVALID_ERROR, RUNTIME_ERROR, SYSTEM_QUIT,
    UNKNOWN_CLOSE_CODE, UNKNOWN_ERROR, UpdateState, UpdateStatusProvider, WEBSOCKET_ERROR,
};
use crate::store::Category;
use crate::task::Ready;

const PING_INTERVAL: Duration = Duration::from_secs(10);
const WS_INVALID_REQUEST_CLOSE: u16 = 4003;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// A component that feeds flag data into the update-status provider.
#[async_trait]
pub trait UpdateProcessor: Send + Sync {
    /// Start background work; returns immediately.
    fn start(&self);

    /// Close the channel and stop background work.
    async fn stop(&self);

    /// Whether the processor has received data and initialized its storage.
    fn initialized(&self) -> bool;
}

/// The default processor: a WebSocket client with reconnection.
pub struct StreamingProcessor {
    config: Arc<Config>,
    provider: Arc<UpdateStatusProvider>,
    broadcaster: Arc<NoticeBroadcaster>,
    ready: Ready,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingProcessor {
    pub fn new(
        config: Arc<Config>,
        provider: Arc<UpdateStatusProvider>,
        broadcaster: Arc<NoticeBroadcaster>,
        ready: Ready,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            provider,
            broadcaster,
            ready,
            shutdown,
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl UpdateProcessor for StreamingProcessor {
    fn start(&self) {
        let worker = StreamWorker {
            config: self.config.clone(),
            provider: self.provider.clone(),
            broadcaster: self.broadcaster.clone(),
            ready: self.ready.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        let provider = self.provider.clone();
        let ready = self.ready.clone();
        let handle = tokio::spawn(async move {
            // A worker that dies outside the normal shutdown path is an
            // unexpected error in the streaming loop itself.
            if let Err(error) = tokio::spawn(worker.run()).await {
                warn!(error = %error, "streaming worker aborted unexpectedly");
                provider.update_state(UpdateState::error_off(UNKNOWN_ERROR, error.to_string()));
                ready.set();
            }
        });
        *self.handle.lock().expect("streaming lock poisoned") = Some(handle);
    }

    async fn stop(&self) {
        info!("streaming is stopping");
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().expect("streaming lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn initialized(&self) -> bool {
        self.ready.is_set() && self.provider.initialized()
    }
}

/// Processor used in offline mode: reports ready immediately.
pub struct NullUpdateProcessor {
    provider: Arc<UpdateStatusProvider>,
    ready: Ready,
}

impl NullUpdateProcessor {
    pub fn new(provider: Arc<UpdateStatusProvider>, ready: Ready) -> Self {
        Self { provider, ready }
    }
}

#[async_trait]
impl UpdateProcessor for NullUpdateProcessor {
    fn start(&self) {
        self.ready.set();
        self.provider.update_state(UpdateState::ok());
    }

    async fn stop(&self) {}

    fn initialized(&self) -> bool {
        self.ready.is_set()
    }
}

enum Outcome {
    Reconnect,
    Stop,
}

enum MessageOutcome {
    Continue,
    CloseAndReconnect,
    Fatal,
}

#[derive(Debug)]
struct ConnectFailure {
    error_type: &'static str,
    message: String,
}

struct StreamWorker {
    config: Arc<Config>,
    provider: Arc<UpdateStatusProvider>,
    broadcaster: Arc<NoticeBroadcaster>,
    ready: Ready,
    shutdown: watch::Receiver<bool>,
}

impl StreamWorker {
    async fn run(self) {
        let mut backoff = BackoffStrategy::new(self.config.streaming_first_retry_delay());
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            backoff.set_good_run();
            debug!("streaming websocket is connecting");
            match self.connect().await {
                Ok(socket) => {
                    debug!("streaming websocket connected");
                    match self.drive(socket, &mut shutdown).await {
                        Outcome::Stop => break,
                        Outcome::Reconnect => {}
                    }
                }
                Err(failure) => {
                    warn!(
                        error = %failure.message,
                        kind = failure.error_type,
                        "streaming websocket connection failed"
                    );
                    self.provider
                        .update_state(UpdateState::interrupted(failure.error_type, failure.message));
                }
            }
            if *shutdown.borrow() {
                break;
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        // Unblock anyone waiting on startup even when the stream never came up.
        self.ready.set();
        debug!("streaming websocket loop exited");
    }

    async fn connect(&self) -> Result<WsStream, ConnectFailure> {
        let websocket = self.config.websocket();
        let endpoint = self.config.streaming_url();
        let url = format!(
            "{endpoint}?token={}&type=server",
            build_token(self.config.env_secret())
        );
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|error| ConnectFailure {
                error_type: WEBSOCKET_ERROR,
                message: error.to_string(),
            })?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(self.config.env_secret()).map_err(|error| ConnectFailure {
                error_type: WEBSOCKET_ERROR,
                message: error.to_string(),
            })?,
        );
        headers.insert(
            "User-Agent",
            HeaderValue::from_static(crate::protocol::USER_AGENT),
        );
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));

        let connector = tls_connector(websocket)?;
        let timeout = Duration::from_secs_f64(websocket.timeout);
        let attempt = async {
            if let Some((proxy_host, proxy_port)) = http_proxy(websocket) {
                let (target_host, target_port) = endpoint_address(&endpoint)?;
                let tunnel = connect_via_proxy(
                    &proxy_host,
                    proxy_port,
                    &target_host,
                    target_port,
                    websocket.proxy_auth.as_ref(),
                )
                .await
                .map_err(|error| ConnectFailure {
                    error_type: NETWORK_ERROR,
                    message: error.to_string(),
                })?;
                client_async_tls_with_config(request, tunnel, None, connector)
                    .await
                    .map_err(classify_handshake_error)
            } else {
                connect_async_tls_with_config(request, None, false, connector)
                    .await
                    .map_err(classify_handshake_error)
            }
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(failure)) => Err(failure),
            Err(_) => Err(ConnectFailure {
                error_type: NETWORK_ERROR,
                message: "websocket connection timed out".to_string(),
            }),
        }
    }

    async fn drive(&self, socket: WsStream, shutdown: &mut watch::Receiver<bool>) -> Outcome {
        let (mut sink, mut stream) = socket.split();
        debug!("asking data update on websocket");
        let version = self.provider.latest_version().max(0);
        if sink
            .send(Message::Text(data_sync_request(version)))
            .await
            .is_err()
        {
            self.provider.update_state(UpdateState::interrupted(
                NETWORK_ERROR,
                "failed to send data-sync request",
            ));
            return Outcome::Reconnect;
        }
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );
        loop {
            tokio::select! {
                _ = ping.tick() => {
                    debug!("ping");
                    if sink.send(Message::Text(ping_message())).await.is_err() {
                        self.provider.update_state(UpdateState::interrupted(
                            NETWORK_ERROR,
                            "failed to send ping",
                        ));
                        return Outcome::Reconnect;
                    }
                }
                changed = shutdown.changed() => {
                    let _ = close(&mut sink, CloseCode::Normal).await;
                    match changed {
                        Ok(()) => self.provider.update_state(UpdateState::normal_off()),
                        // The owning processor went away without an orderly stop.
                        Err(_) => self.provider.update_state(UpdateState::error_off(
                            SYSTEM_QUIT,
                            "update processor dropped",
                        )),
                    }
                    return Outcome::Stop;
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => match self.handle_text(&text) {
                        MessageOutcome::Continue => {}
                        MessageOutcome::CloseAndReconnect => {
                            let _ = close(&mut sink, CloseCode::Away).await;
                            return Outcome::Reconnect;
                        }
                        MessageOutcome::Fatal => {
                            let _ = close(&mut sink, CloseCode::Away).await;
                            return Outcome::Stop;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => return self.on_server_close(frame),
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        let error_type = classify_ws_error(&error);
                        warn!(error = %error, "streaming websocket failure");
                        self.provider
                            .update_state(UpdateState::interrupted(error_type, error.to_string()));
                        return Outcome::Reconnect;
                    }
                    None => {
                        self.provider.update_state(UpdateState::interrupted(
                            NETWORK_ERROR,
                            "websocket stream ended",
                        ));
                        return Outcome::Reconnect;
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) -> MessageOutcome {
        match parse_sync_message(text) {
            Err(error) => {
                self.provider
                    .update_state(UpdateState::error_off(DATA_INVALID_ERROR, error.to_string()));
                MessageOutcome::Fatal
            }
            Ok(None) => MessageOutcome::Continue,
            Ok(Some(payload)) => {
                debug!("streaming websocket is processing data");
                if self.apply_payload(payload) {
                    MessageOutcome::Continue
                } else {
                    // State was already set by the provider; drop the
                    // connection and resync from the current version.
                    MessageOutcome::CloseAndReconnect
                }
            }
        }
    }

    /// Apply a payload to the store. Returns false only on storage failure.
    fn apply_payload(&self, mut payload: SyncPayload) -> bool {
        let mut changed_flags: Vec<String> = Vec::new();
        let ok = match payload.event_type {
            SyncEventType::Full => {
                let flag_keys: Vec<String> = payload
                    .data
                    .get(&Category::FeatureFlags)
                    .map(|flags| flags.keys().cloned().collect())
                    .unwrap_or_default();
                match self.provider.init(payload.data, payload.version) {
                    Err(_) => false,
                    Ok(applied) => {
                        if applied {
                            changed_flags = flag_keys;
                        }
                        true
                    }
                }
            }
            SyncEventType::Patch => {
                let mut ok = true;
                'categories: for category in [Category::FeatureFlags, Category::Segments] {
                    let Some(items) = payload.data.remove(&category) else {
                        continue;
                    };
                    let mut entities: Vec<_> = items.into_values().collect();
                    entities.sort_by_key(|entity| entity.timestamp);
                    for entity in entities {
                        let key = entity.id.clone();
                        let version = entity.timestamp;
                        match self.provider.upsert(category, &key, entity, version) {
                            Err(_) => {
                                ok = false;
                                break 'categories;
                            }
                            Ok(true) => match category {
                                Category::FeatureFlags => changed_flags.push(key),
                                Category::Segments => {
                                    changed_flags.extend(self.flags_referencing(&key));
                                }
                                Category::DataTest => {}
                            },
                            Ok(false) => {}
                        }
                    }
                }
                ok
            }
        };
        if ok {
            self.ready.set();
            self.provider.update_state(UpdateState::ok());
            for flag_key in changed_flags {
                self.broadcaster
                    .broadcast(Box::new(FlagChangedNotice::new(flag_key)));
            }
            debug!("processing data is done");
        }
        ok
    }

    /// Keys of stored flags whose rules reference a segment.
    fn flags_referencing(&self, segment_id: &str) -> Vec<String> {
        self.provider
            .get_all(Category::FeatureFlags)
            .into_values()
            .filter_map(|entity| entity.as_flag())
            .filter(|flag| flag_references_segment(flag, segment_id))
            .map(|flag| flag.key.clone())
            .collect()
    }

    fn on_server_close(&self, frame: Option<CloseFrame<'_>>) -> Outcome {
        let (code, reason) = frame
            .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
            .unwrap_or((1005, String::new()));
        if code == WS_INVALID_REQUEST_CLOSE {
            debug!(code, "streaming websocket closed by server, request invalid");
            self.provider.update_state(UpdateState::error_off(
                REQUEST_INVALID_ERROR,
                REQUEST_INVALID_ERROR,
            ));
            Outcome::Stop
        } else {
            debug!(code, "streaming websocket closed by server");
            let message = if reason.is_empty() {
                UNKNOWN_CLOSE_CODE.to_string()
            } else {
                reason
            };
            self.provider
                .update_state(UpdateState::interrupted(UNKNOWN_CLOSE_CODE, message));
            Outcome::Reconnect
        }
    }
}

async fn close(sink: &mut WsSink, code: CloseCode) -> Result<(), WsError> {
    sink.send(Message::Close(Some(CloseFrame {
        code,
        reason: "".into(),
    })))
    .await
}

fn classify_handshake_error(error: WsError) -> ConnectFailure {
    ConnectFailure {
        error_type: classify_ws_error(&error),
        message: error.to_string(),
    }
}

fn classify_ws_error(error: &WsError) -> &'static str {
    match error {
        WsError::Io(_) | WsError::Tls(_) | WsError::ConnectionClosed | WsError::AlreadyClosed => {
            NETWORK_ERROR
        }
        WsError::Protocol(_)
        | WsError::Capacity(_)
        | WsError::WriteBufferFull(_)
        | WsError::Utf8
        | WsError::AttackAttempt
        | WsError::Http(_)
        | WsError::HttpFormat(_) => WEBSOCKET_ERROR,
        // Anything else is an unexpected failure in the client itself, not
        // on the wire.
        _ => RUNTIME_ERROR,
    }
}

fn tls_connector(websocket: &WebSocketConfig) -> Result<Option<Connector>, ConnectFailure> {
    if !websocket.disable_ssl_verification {
        return Ok(None);
    }
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|error| ConnectFailure {
            error_type: WEBSOCKET_ERROR,
            message: error.to_string(),
        })?;
    Ok(Some(Connector::NativeTls(tls)))
}

/// Proxy address, when an HTTP CONNECT proxy is configured. Other proxy
/// types are reported and ignored.
fn http_proxy(websocket: &WebSocketConfig) -> Option<(String, u16)> {
    let host = websocket.proxy_host.as_ref()?;
    match websocket.proxy_type.as_deref() {
        None | Some("http") => Some((host.clone(), websocket.proxy_port.unwrap_or(80))),
        Some(other) => {
            warn!(proxy_type = other, "unsupported websocket proxy type, connecting directly");
            None
        }
    }
}

fn endpoint_address(endpoint: &str) -> Result<(String, u16), ConnectFailure> {
    let url = url::Url::parse(endpoint).map_err(|error| ConnectFailure {
        error_type: WEBSOCKET_ERROR,
        message: error.to_string(),
    })?;
    let host = url.host_str().ok_or_else(|| ConnectFailure {
        error_type: WEBSOCKET_ERROR,
        message: format!("no host in streaming url {endpoint}"),
    })?;
    let port = url.port_or_known_default().unwrap_or(80);
    Ok((host.to_string(), port))
}

/// Open an HTTP CONNECT tunnel through a proxy.
async fn connect_via_proxy(
    proxy_host: &str,
    proxy_port: u16,
    target_host: &str,
    target_port: u16,
    proxy_auth: Option<&(String, String)>,
) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;
    let mut connect = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n"
    );
    if let Some((user, password)) = proxy_auth {
        let credentials = BASE64.encode(format!("{user}:{password}"));
        connect.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    connect.push_str("\r\n");
    stream.write_all(connect.as_bytes()).await?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 8192 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized proxy CONNECT response",
            ));
        }
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed the connection during CONNECT",
            ));
        }
        response.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or_default();
    let connected = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|status| status == "200");
    if !connected {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy CONNECT failed: {status_line}"),
        ));
    }
    Ok(stream)
}
