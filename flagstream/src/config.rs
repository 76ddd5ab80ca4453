//! Client configuration: connection endpoints, clamped tuning knobs,
//! HTTP/WebSocket sub-configuration and component injection points.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use url::Url;

use crate::errors::Error;
use crate::event_processor::EventProcessor;
use crate::notices::NoticeBroadcaster;
use crate::sender::Sender;
use crate::status::UpdateStatusProvider;
use crate::store::DataStore;
use crate::streaming::UpdateProcessor;
use crate::task::Ready;
use crate::types::FlagValue;

const STREAMING_PATH: &str = "/streaming";
const EVENTS_PATH: &str = "/api/public/insight/track";

const DEFAULT_FIRST_RETRY_DELAY: f64 = 1.0;
const MAX_FIRST_RETRY_DELAY: f64 = 60.0;
const MIN_EVENTS_IN_QUEUE: usize = 10_000;
const DEFAULT_FLUSH_INTERVAL: f64 = 1.0;
const MAX_FLUSH_INTERVAL: f64 = 3.0;
const DEFAULT_RETRY_INTERVAL: f64 = 0.1;
const MAX_RETRY_INTERVAL: f64 = 1.0;
const DEFAULT_MAX_RETRIES: u32 = 1;
const MAX_MAX_RETRIES: u32 = 3;

/// HTTP transport options for the event sender.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Connection timeout in seconds.
    pub connect_timeout: f64,
    /// Read timeout in seconds.
    pub read_timeout: f64,
    /// Proxy URL, e.g. `http://proxy:3128`.
    pub proxy_url: Option<String>,
    /// Basic-auth credentials for the proxy.
    pub proxy_auth: Option<(String, String)>,
    /// Extra PEM CA bundle to trust.
    pub ca_certs: Option<PathBuf>,
    /// Client certificate (PEM) for mutual TLS.
    pub cert_file: Option<PathBuf>,
    /// Private key (PKCS#8 PEM) matching `cert_file`.
    pub cert_key_file: Option<PathBuf>,
    /// Skip server certificate verification.
    pub disable_ssl_verification: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 5.0,
            read_timeout: 10.0,
            proxy_url: None,
            proxy_auth: None,
            ca_certs: None,
            cert_file: None,
            cert_key_file: None,
            disable_ssl_verification: false,
        }
    }
}

impl HttpConfig {
    fn normalized(mut self) -> Self {
        if !self.connect_timeout.is_finite() || self.connect_timeout <= 0.0 {
            self.connect_timeout = 5.0;
        }
        if !self.read_timeout.is_finite() || self.read_timeout <= 0.0 {
            self.read_timeout = 10.0;
        }
        self
    }
}

/// WebSocket transport options for the streaming pipeline.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Connection timeout in seconds, capped at 10.
    pub timeout: f64,
    /// Skip server certificate verification.
    pub disable_ssl_verification: bool,
    /// Proxy type; only `"http"` (CONNECT tunneling) is supported.
    pub proxy_type: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    /// Basic-auth credentials for the proxy.
    pub proxy_auth: Option<(String, String)>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            timeout: 5.0,
            disable_ssl_verification: false,
            proxy_type: None,
            proxy_host: None,
            proxy_port: None,
            proxy_auth: None,
        }
    }
}

impl WebSocketConfig {
    fn normalized(mut self) -> Self {
        if !self.timeout.is_finite() || self.timeout <= 0.0 {
            self.timeout = 5.0;
        } else {
            self.timeout = self.timeout.min(10.0);
        }
        self
    }
}

/// Factory for a custom update processor.
pub type UpdateProcessorFactory = Arc<
    dyn Fn(
            Arc<Config>,
            Arc<UpdateStatusProvider>,
            Arc<NoticeBroadcaster>,
            Ready,
        ) -> Arc<dyn UpdateProcessor>
        + Send
        + Sync,
>;

/// Factory for a custom event processor.
pub type EventProcessorFactory =
    Arc<dyn Fn(Arc<Config>, Arc<dyn Sender>) -> Arc<dyn EventProcessor> + Send + Sync>;

/// SDK configuration. Build with [`Config::builder`]; numeric knobs are
/// clamped silently, while the secret and URLs are validated when the client
/// starts (offline clients skip validation).
#[derive(Clone)]
pub struct Config {
    env_secret: String,
    event_url: String,
    streaming_url: String,
    streaming_first_retry_delay: f64,
    events_max_in_queue: usize,
    events_flush_interval: f64,
    events_retry_interval: f64,
    events_max_retries: u32,
    offline: bool,
    http: HttpConfig,
    websocket: WebSocketConfig,
    defaults: HashMap<String, FlagValue>,
    data_store: Option<Arc<dyn DataStore>>,
    update_processor_factory: Option<UpdateProcessorFactory>,
    event_processor_factory: Option<EventProcessorFactory>,
}

impl Config {
    pub fn builder(
        env_secret: impl Into<String>,
        event_url: impl Into<String>,
        streaming_url: impl Into<String>,
    ) -> ConfigBuilder {
        ConfigBuilder {
            env_secret: env_secret.into(),
            event_url: event_url.into(),
            streaming_url: streaming_url.into(),
            streaming_first_retry_delay: DEFAULT_FIRST_RETRY_DELAY,
            events_max_in_queue: MIN_EVENTS_IN_QUEUE,
            events_flush_interval: DEFAULT_FLUSH_INTERVAL,
            events_retry_interval: DEFAULT_RETRY_INTERVAL,
            events_max_retries: DEFAULT_MAX_RETRIES,
            offline: false,
            http: HttpConfig::default(),
            websocket: WebSocketConfig::default(),
            defaults: HashMap::new(),
            data_store: None,
            update_processor_factory: None,
            event_processor_factory: None,
        }
    }

    pub fn env_secret(&self) -> &str {
        &self.env_secret
    }

    /// Full endpoint for event shipping.
    pub fn events_url(&self) -> String {
        format!("{}{}", self.event_url, EVENTS_PATH)
    }

    /// Full endpoint for the streaming channel, with `http(s)` schemes
    /// rewritten to `ws(s)`.
    pub fn streaming_url(&self) -> String {
        let base = if let Some(rest) = self.streaming_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.streaming_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.streaming_url.clone()
        };
        format!("{base}{STREAMING_PATH}")
    }

    pub fn streaming_first_retry_delay(&self) -> f64 {
        self.streaming_first_retry_delay
    }

    pub fn events_max_in_queue(&self) -> usize {
        self.events_max_in_queue
    }

    pub fn events_flush_interval(&self) -> f64 {
        self.events_flush_interval
    }

    pub fn events_retry_interval(&self) -> f64 {
        self.events_retry_interval
    }

    pub fn events_max_retries(&self) -> u32 {
        self.events_max_retries
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn http(&self) -> &HttpConfig {
        &self.http
    }

    pub fn websocket(&self) -> &WebSocketConfig {
        &self.websocket
    }

    /// Configured fallback value for a flag key, if any.
    pub fn default_value(&self, key: &str) -> Option<FlagValue> {
        self.defaults.get(key).cloned()
    }

    pub(crate) fn data_store(&self) -> Option<Arc<dyn DataStore>> {
        self.data_store.clone()
    }

    pub(crate) fn update_processor_factory(&self) -> Option<UpdateProcessorFactory> {
        self.update_processor_factory.clone()
    }

    pub(crate) fn event_processor_factory(&self) -> Option<EventProcessorFactory> {
        self.event_processor_factory.clone()
    }

    /// Check the secret and both URLs; called at client construction for
    /// online clients.
    pub fn validate(&self) -> Result<(), Error> {
        if self.env_secret.is_empty() || !self.env_secret.is_ascii() {
            return Err(Error::InvalidEnvSecret);
        }
        if !is_absolute_url(&self.streaming_url) || !is_absolute_url(&self.event_url) {
            return Err(Error::InvalidUrl);
        }
        Ok(())
    }
}

fn is_absolute_url(value: &str) -> bool {
    Url::parse(value).map(|url| url.has_host()).unwrap_or(false)
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    env_secret: String,
    event_url: String,
    streaming_url: String,
    streaming_first_retry_delay: f64,
    events_max_in_queue: usize,
    events_flush_interval: f64,
    events_retry_interval: f64,
    events_max_retries: u32,
    offline: bool,
    http: HttpConfig,
    websocket: WebSocketConfig,
    defaults: HashMap<String, FlagValue>,
    data_store: Option<Arc<dyn DataStore>>,
    update_processor_factory: Option<UpdateProcessorFactory>,
    event_processor_factory: Option<EventProcessorFactory>,
}

impl ConfigBuilder {
    /// First reconnect delay in seconds, clamped to `(0, 60]`.
    pub fn streaming_first_retry_delay(mut self, seconds: f64) -> Self {
        self.streaming_first_retry_delay = seconds;
        self
    }

    /// Inbox capacity, floored at 10 000.
    pub fn events_max_in_queue(mut self, capacity: usize) -> Self {
        self.events_max_in_queue = capacity;
        self
    }

    /// Automatic flush period in seconds, clamped to `(0, 3]`.
    pub fn events_flush_interval(mut self, seconds: f64) -> Self {
        self.events_flush_interval = seconds;
        self
    }

    /// Sleep between send retries in seconds, clamped to `(0, 1]`.
    pub fn events_retry_interval(mut self, seconds: f64) -> Self {
        self.events_retry_interval = seconds;
        self
    }

    /// Retry attempts after a failed send, clamped to `[1, 3]`.
    pub fn events_max_retries(mut self, retries: u32) -> Self {
        self.events_max_retries = retries;
        self
    }

    /// Offline mode: no network, evaluation over externally loaded data.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn http(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }

    pub fn websocket(mut self, websocket: WebSocketConfig) -> Self {
        self.websocket = websocket;
        self
    }

    /// Register a fallback value for a flag key.
    pub fn default_value(mut self, key: impl Into<String>, value: impl Into<FlagValue>) -> Self {
        self.defaults.insert(key.into(), value.into());
        self
    }

    /// Inject a custom data store.
    pub fn data_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.data_store = Some(store);
        self
    }

    /// Inject a custom update processor.
    pub fn update_processor(mut self, factory: UpdateProcessorFactory) -> Self {
        self.update_processor_factory = Some(factory);
        self
    }

    /// Inject a custom event processor.
    pub fn event_processor(mut self, factory: EventProcessorFactory) -> Self {
        self.event_processor_factory = Some(factory);
        self
    }

    pub fn build(self) -> Config {
        let clamp = |value: f64, default: f64, max: f64| {
            if !value.is_finite() || value <= 0.0 {
                default
            } else {
                value.min(max)
            }
        };
        Config {
            env_secret: self.env_secret,
            event_url: self.event_url.trim_end_matches('/').to_string(),
            streaming_url: self.streaming_url.trim_end_matches('/').to_string(),
            streaming_first_retry_delay: clamp(
                self.streaming_first_retry_delay,
                DEFAULT_FIRST_RETRY_DELAY,
                MAX_FIRST_RETRY_DELAY,
            ),
            events_max_in_queue: self.events_max_in_queue.max(MIN_EVENTS_IN_QUEUE),
            events_flush_interval: clamp(
                self.events_flush_interval,
                DEFAULT_FLUSH_INTERVAL,
                MAX_FLUSH_INTERVAL,
            ),
            events_retry_interval: clamp(
                self.events_retry_interval,
                DEFAULT_RETRY_INTERVAL,
                MAX_RETRY_INTERVAL,
            ),
            events_max_retries: if self.events_max_retries == 0 {
                DEFAULT_MAX_RETRIES
            } else {
                self.events_max_retries.min(MAX_MAX_RETRIES)
            },
            offline: self.offline,
            http: self.http.normalized(),
            websocket: self.websocket.normalized(),
            defaults: self.defaults,
            data_store: self.data_store,
            update_processor_factory: self.update_processor_factory,
            event_processor_factory: self.event_processor_factory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ConfigBuilder {
        Config::builder("secret", "http://events.local", "ws://stream.local")
    }

    #[test]
    fn test_defaults() {
        let config = builder().build();
        assert_eq!(config.streaming_first_retry_delay(), 1.0);
        assert_eq!(config.events_max_in_queue(), 10_000);
        assert_eq!(config.events_flush_interval(), 1.0);
        assert_eq!(config.events_retry_interval(), 0.1);
        assert_eq!(config.events_max_retries(), 1);
        assert!(!config.is_offline());
    }

    #[test]
    fn test_clamps() {
        let config = builder()
            .streaming_first_retry_delay(120.0)
            .events_max_in_queue(10)
            .events_flush_interval(30.0)
            .events_retry_interval(5.0)
            .events_max_retries(99)
            .build();
        assert_eq!(config.streaming_first_retry_delay(), 60.0);
        assert_eq!(config.events_max_in_queue(), 10_000);
        assert_eq!(config.events_flush_interval(), 3.0);
        assert_eq!(config.events_retry_interval(), 1.0);
        assert_eq!(config.events_max_retries(), 3);

        let config = builder()
            .streaming_first_retry_delay(-1.0)
            .events_flush_interval(0.0)
            .events_retry_interval(-0.5)
            .events_max_retries(0)
            .build();
        assert_eq!(config.streaming_first_retry_delay(), 1.0);
        assert_eq!(config.events_flush_interval(), 1.0);
        assert_eq!(config.events_retry_interval(), 0.1);
        assert_eq!(config.events_max_retries(), 1);
    }

    #[test]
    fn test_url_joining_strips_trailing_slash() {
        let config =
            Config::builder("secret", "http://events.local/", "https://stream.local/").build();
        assert_eq!(
            config.events_url(),
            "http://events.local/api/public/insight/track"
        );
        assert_eq!(config.streaming_url(), "wss://stream.local/streaming");
    }

    #[test]
    fn test_validation() {
        assert!(builder().build().validate().is_ok());
        assert!(matches!(
            Config::builder("", "http://e", "http://s").build().validate(),
            Err(Error::InvalidEnvSecret)
        ));
        assert!(matches!(
            Config::builder("sécrèt", "http://e", "http://s")
                .build()
                .validate(),
            Err(Error::InvalidEnvSecret)
        ));
        assert!(matches!(
            Config::builder("secret", "", "").build().validate(),
            Err(Error::InvalidUrl)
        ));
        // Absolute URLs without a host are rejected.
        assert!(matches!(
            Config::builder("secret", "mailto:a@b.c", "urn:isbn:0-294-56559-3")
                .build()
                .validate(),
            Err(Error::InvalidUrl)
        ));
    }

    #[test]
    fn test_websocket_timeout_cap() {
        let websocket = WebSocketConfig {
            timeout: 30.0,
            ..WebSocketConfig::default()
        };
        let config = builder().websocket(websocket).build();
        assert_eq!(config.websocket().timeout, 10.0);

        let websocket = WebSocketConfig {
            timeout: 0.0,
            ..WebSocketConfig::default()
        };
        let config = builder().websocket(websocket).build();
        assert_eq!(config.websocket().timeout, 5.0);
    }

    #[test]
    fn test_http_timeout_defaults_on_invalid() {
        let http = HttpConfig {
            connect_timeout: -1.0,
            read_timeout: 0.0,
            ..HttpConfig::default()
        };
        let config = builder().http(http).build();
        assert_eq!(config.http().connect_timeout, 5.0);
        assert_eq!(config.http().read_timeout, 10.0);
    }

    #[test]
    fn test_default_values() {
        let config = builder().default_value("ff-a", true).default_value("ff-b", 3.5).build();
        assert_eq!(config.default_value("ff-a"), Some(FlagValue::Bool(true)));
        assert_eq!(config.default_value("ff-b"), Some(FlagValue::Number(3.5)));
        assert_eq!(config.default_value("ff-c"), None);
    }
}
