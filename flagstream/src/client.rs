//! The SDK client: wires the store, the update pipeline, the evaluator and
//! the event processor together and owns their lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::errors::Error;
use crate::evaluator::{
    EvalResult, Evaluator, REASON_CLIENT_NOT_READY, REASON_FLAG_NOT_FOUND,
};
use crate::event_processor::{DefaultEventProcessor, EventProcessor, NullEventProcessor};
use crate::events::{Event, FlagEventVariation};
use crate::notices::NoticeBroadcaster;
use crate::protocol::parse_sync_message;
use crate::sender::{HttpEventSender, Sender};
use crate::status::UpdateStatusProvider;
use crate::store::{Category, DataStore, MemoryDataStore};
use crate::streaming::{NullUpdateProcessor, StreamingProcessor, UpdateProcessor};
use crate::task::Ready;
use crate::types::{EvalDetail, FlagState, FlagType, FlagValue};
use crate::user::User;

/// Default number of seconds the constructor waits for the first sync.
pub const DEFAULT_START_WAIT: f64 = 15.0;

/// Everything needed to run one evaluation and ship its telemetry.
#[derive(Clone)]
struct EvalContext {
    config: Arc<Config>,
    store: Arc<dyn DataStore>,
    evaluator: Arc<Evaluator>,
    update_processor: Arc<dyn UpdateProcessor>,
    event_processor: Arc<dyn EventProcessor>,
}

impl EvalContext {
    fn evaluate_internal(&self, key: &str, user: &User, default: FlagValue) -> EvalResult {
        // A default registered in the configuration wins over the caller's.
        let default = self.config.default_value(key).unwrap_or(default);
        let default_string = default.to_stored_string();
        let flag_type = default.flag_type().unwrap_or(FlagType::String);

        if !self.update_processor.initialized() {
            warn!(
                flag = key,
                "evaluation called before the client is initialized, returning default value"
            );
            return EvalResult::error(default_string, REASON_CLIENT_NOT_READY, key, flag_type);
        }
        if key.is_empty() {
            warn!("empty feature flag key, returning default value");
            return EvalResult::error(default_string, REASON_FLAG_NOT_FOUND, key, flag_type);
        }
        let Some(flag) = self.evaluator.get_flag(key) else {
            warn!(flag = key, "unknown feature flag, returning default value");
            return EvalResult::error(default_string, REASON_FLAG_NOT_FOUND, key, flag_type);
        };
        let result = self.evaluator.evaluate(&flag, user);
        let mut event = Event::flag(user.clone());
        event.add_variation(FlagEventVariation::new(result.clone()));
        self.event_processor.send_event(event);
        result
    }

    fn variation_value(&self, key: &str, user: &User, default: FlagValue) -> FlagValue {
        self.evaluate_internal(key, user, default)
            .eval_detail()
            .variation
    }
}

/// State of all feature flags for one user. Events for a flag are shipped
/// the first time [`AllFlagStates::get`] is called for its key.
pub struct AllFlagStates {
    success: bool,
    message: String,
    states: Mutex<HashMap<String, (EvalDetail, Option<Event>)>>,
    event_processor: Arc<dyn EventProcessor>,
}

impl AllFlagStates {
    pub fn success(&self) -> bool {
        self.success
    }

    /// `"OK"` on success, otherwise the failure reason.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn key_names(&self) -> Vec<String> {
        self.states
            .lock()
            .expect("states lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Evaluation detail for one flag; ships its pending event once.
    pub fn get(&self, key: &str) -> Option<EvalDetail> {
        let mut states = self.states.lock().expect("states lock poisoned");
        let (detail, event) = states.get_mut(key)?;
        if let Some(event) = event.take() {
            self.event_processor.send_event(event);
        }
        Some(detail.clone())
    }
}

/// A server-side feature-flag client.
///
/// One instance should be created per environment and retained for the
/// lifetime of the application; instances are safe to share across tasks.
pub struct FlagClient {
    context: EvalContext,
    provider: Arc<UpdateStatusProvider>,
    broadcaster: Arc<NoticeBroadcaster>,
    ready: Ready,
}

impl FlagClient {
    /// Create a client and wait up to [`DEFAULT_START_WAIT`] seconds for the
    /// first successful sync.
    pub async fn new(config: Config) -> Result<Self, Error> {
        Self::with_start_wait(config, DEFAULT_START_WAIT).await
    }

    /// Create a client, waiting at most `start_wait` seconds for the first
    /// sync; zero or less returns immediately. An uninitialized client keeps
    /// connecting in the background and serves default values meanwhile.
    pub async fn with_start_wait(config: Config, start_wait: f64) -> Result<Self, Error> {
        if config.is_offline() {
            info!("SDK is in offline mode");
        } else {
            config.validate()?;
        }
        let config = Arc::new(config);
        let broadcaster = Arc::new(NoticeBroadcaster::new());

        let store: Arc<dyn DataStore> = config
            .data_store()
            .unwrap_or_else(|| Arc::new(MemoryDataStore::new()));
        let provider = Arc::new(UpdateStatusProvider::new(store.clone()));

        let flag_source = store.clone();
        let segment_source = store.clone();
        let evaluator = Arc::new(Evaluator::new(
            Arc::new(move |key: &str| {
                flag_source
                    .get(Category::FeatureFlags, key)
                    .and_then(|entity| entity.as_flag())
            }),
            Arc::new(move |key: &str| {
                segment_source
                    .get(Category::Segments, key)
                    .and_then(|entity| entity.as_segment())
            }),
        ));

        let sender: Arc<dyn Sender> = Arc::new(HttpEventSender::new("insight", &config)?);
        let event_processor: Arc<dyn EventProcessor> =
            if let Some(factory) = config.event_processor_factory() {
                factory(config.clone(), sender)
            } else if config.is_offline() {
                Arc::new(NullEventProcessor)
            } else {
                Arc::new(DefaultEventProcessor::new(&config, sender))
            };

        let ready = Ready::new();
        let update_processor: Arc<dyn UpdateProcessor> =
            if let Some(factory) = config.update_processor_factory() {
                factory(
                    config.clone(),
                    provider.clone(),
                    broadcaster.clone(),
                    ready.clone(),
                )
            } else if config.is_offline() {
                Arc::new(NullUpdateProcessor::new(provider.clone(), ready.clone()))
            } else {
                Arc::new(StreamingProcessor::new(
                    config.clone(),
                    provider.clone(),
                    broadcaster.clone(),
                    ready.clone(),
                ))
            };
        update_processor.start();

        let context = EvalContext {
            config: config.clone(),
            store,
            evaluator,
            update_processor,
            event_processor,
        };
        let client = Self {
            context,
            provider,
            broadcaster,
            ready,
        };

        if start_wait > 0.0 {
            if !client.context.config.is_offline() {
                info!(seconds = start_wait, "waiting for client initialization");
            }
            client
                .ready
                .wait(Duration::from_secs_f64(start_wait))
                .await;
            if !client.context.store.initialized() && !client.context.config.is_offline() {
                warn!("no flag data in the environment yet, evaluations return default values");
            }
            if !client.initialized() {
                warn!("client was not successfully initialized");
            }
        } else {
            info!("client starts in asynchronous mode");
        }
        Ok(client)
    }

    /// Whether the client has received data and is ready to evaluate.
    pub fn initialized(&self) -> bool {
        self.context.update_processor.initialized()
    }

    pub fn is_offline(&self) -> bool {
        self.context.config.is_offline()
    }

    /// Lifecycle state of the update pipeline, for waiting and inspection.
    pub fn update_status_provider(&self) -> Arc<UpdateStatusProvider> {
        self.provider.clone()
    }

    /// The pub/sub channel carrying [`crate::notices::FlagChangedNotice`]
    /// signals emitted by the streaming pipeline.
    pub fn notice_broadcaster(&self) -> Arc<NoticeBroadcaster> {
        self.broadcaster.clone()
    }

    /// Evaluate a flag for a user, converted to the flag's declared type.
    /// Ships a flag event unless evaluation failed. `default` is returned
    /// when the flag is unknown or the client is not ready.
    pub fn variation(
        &self,
        key: &str,
        user: &User,
        default: impl Into<FlagValue>,
    ) -> FlagValue {
        self.context.variation_value(key, user, default.into())
    }

    /// Like [`FlagClient::variation`], with the reason and success marker.
    pub fn variation_detail(
        &self,
        key: &str,
        user: &User,
        default: impl Into<FlagValue>,
    ) -> FlagState {
        self.context
            .evaluate_internal(key, user, default.into())
            .flag_state()
    }

    /// Evaluate every stored flag for `user`. Events are deferred until
    /// [`AllFlagStates::get`].
    pub fn all_flag_states(&self, user: &User) -> AllFlagStates {
        if !self.initialized() {
            warn!("all_flag_states called before the client is initialized");
            return AllFlagStates {
                success: false,
                message: REASON_CLIENT_NOT_READY.to_string(),
                states: Mutex::new(HashMap::new()),
                event_processor: self.context.event_processor.clone(),
            };
        }
        let mut states = HashMap::new();
        for entity in self
            .context
            .store
            .get_all(Category::FeatureFlags)
            .into_values()
        {
            let Some(flag) = entity.as_flag() else {
                continue;
            };
            let result = self.context.evaluator.evaluate(&flag, user);
            let mut event = Event::flag(user.clone());
            event.add_variation(FlagEventVariation::new(result.clone()));
            states.insert(result.key_name.clone(), (result.eval_detail(), Some(event)));
        }
        AllFlagStates {
            success: true,
            message: "OK".to_string(),
            states: Mutex::new(states),
            event_processor: self.context.event_processor.clone(),
        }
    }

    /// Deliver buffered events as soon as possible (asynchronously).
    pub fn flush(&self) {
        self.context.event_processor.flush();
    }

    /// Load a dataset from an external data-sync envelope. Only available in
    /// offline mode; mainly used for tests and bootstrapping.
    pub fn initialize_from_external_json(&self, json: &str) -> bool {
        if !self.context.config.is_offline() {
            return false;
        }
        match parse_sync_message(json) {
            Ok(Some(payload)) => self
                .provider
                .init(payload.data, payload.version)
                .is_ok(),
            _ => false,
        }
    }

    /// Release every task and connection owned by the client. Idempotent;
    /// the client must not be used afterwards.
    pub async fn stop(&self) {
        info!("flagstream client is closing");
        self.context.store.stop();
        self.context.update_processor.stop().await;
        self.context.event_processor.stop().await;
        self.broadcaster.stop().await;
    }
}
