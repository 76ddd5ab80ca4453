//! Update-status state machine and its provider.
//!
//! The provider wraps the data store: it forwards writes, converts storage
//! failures into INTERRUPTED transitions, and lets callers wait for the OK
//! state through a watch channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::warn;

use crate::errors::StoreError;
use crate::store::{AllData, Category, DataStore};
use crate::types::Entity;

pub const DATA_STORAGE_INIT_ERROR: &str = "Data Storage init error";
pub const DATA_STORAGE_UPDATE_ERROR: &str = "Data Storage update error";
pub const REQUEST_INVALID_ERROR: &str = "Request invalid";
pub const DATA_INVALID_ERROR: &str = "Received Data invalid";
pub const NETWORK_ERROR: &str = "Network error";
pub const RUNTIME_ERROR: &str = "Runtime error";
pub const WEBSOCKET_ERROR: &str = "WebSocket error";
pub const UNKNOWN_ERROR: &str = "Unknown error";
pub const UNKNOWN_CLOSE_CODE: &str = "Unknown close code";
pub const SYSTEM_QUIT: &str = "System quit";

/// Lifecycle phase of the update pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateType {
    /// Starting up; remains here until the first successful sync or a
    /// permanent failure.
    Initializing,
    /// Operational: an open stream with at least one processed message.
    Ok,
    /// A recoverable error occurred; a reconnect is pending.
    Interrupted,
    /// Permanently shut down, either deliberately or after a fatal error.
    Off,
}

/// The error that caused the latest non-OK transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorTrack {
    pub error_type: String,
    pub message: String,
}

/// Current state of the update pipeline plus when it was entered.
#[derive(Debug, Clone)]
pub struct UpdateState {
    pub state_type: StateType,
    /// Instant the current `state_type` was entered.
    pub state_since: DateTime<Utc>,
    pub error_track: Option<ErrorTrack>,
}

impl UpdateState {
    pub fn initializing() -> Self {
        Self {
            state_type: StateType::Initializing,
            state_since: Utc::now(),
            error_track: None,
        }
    }

    pub fn ok() -> Self {
        Self {
            state_type: StateType::Ok,
            state_since: Utc::now(),
            error_track: None,
        }
    }

    pub fn interrupted(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            state_type: StateType::Interrupted,
            state_since: Utc::now(),
            error_track: Some(ErrorTrack {
                error_type: error_type.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn normal_off() -> Self {
        Self {
            state_type: StateType::Off,
            state_since: Utc::now(),
            error_track: None,
        }
    }

    pub fn error_off(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            state_type: StateType::Off,
            state_since: Utc::now(),
            error_track: Some(ErrorTrack {
                error_type: error_type.to_string(),
                message: message.into(),
            }),
        }
    }
}

/// Owns the state machine and writes through to the data store.
pub struct UpdateStatusProvider {
    store: Arc<dyn DataStore>,
    state: watch::Sender<UpdateState>,
}

impl UpdateStatusProvider {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        let (state, _) = watch::channel(UpdateState::initializing());
        Self { store, state }
    }

    /// Replace the replica. Storage failures are logged, flip the state to
    /// INTERRUPTED and surface as `Err`; `Ok(applied)` reports whether the
    /// dataset was actually accepted.
    pub fn init(&self, all_data: AllData, version: i64) -> Result<bool, StoreError> {
        self.store.init(all_data, version).inspect_err(|e| {
            self.handle_store_error(DATA_STORAGE_INIT_ERROR, e);
        })
    }

    /// Apply one entity update; same error contract as [`Self::init`].
    pub fn upsert(
        &self,
        category: Category,
        key: &str,
        entity: Arc<Entity>,
        version: i64,
    ) -> Result<bool, StoreError> {
        self.store
            .upsert(category, key, entity, version)
            .inspect_err(|e| {
                self.handle_store_error(DATA_STORAGE_UPDATE_ERROR, e);
            })
    }

    fn handle_store_error(&self, error_type: &str, error: &StoreError) {
        warn!(error = %error, "data store error, update processor will retry");
        self.update_state(UpdateState::interrupted(error_type, error.to_string()));
    }

    pub fn get(&self, category: Category, key: &str) -> Option<Arc<Entity>> {
        self.store.get(category, key)
    }

    pub fn get_all(&self, category: Category) -> HashMap<String, Arc<Entity>> {
        self.store.get_all(category)
    }

    pub fn initialized(&self) -> bool {
        self.store.initialized()
    }

    pub fn latest_version(&self) -> i64 {
        self.store.latest_version()
    }

    pub fn current_state(&self) -> UpdateState {
        self.state.borrow().clone()
    }

    /// Apply a state transition and wake all waiters.
    ///
    /// An INTERRUPTED request while still INITIALIZING keeps the state at
    /// INITIALIZING: interruption is only meaningful after a successful
    /// start. A same-type update refreshes the error track but keeps
    /// `state_since`.
    pub fn update_state(&self, new_state: UpdateState) {
        self.state.send_if_modified(|current| {
            let mut new_type = new_state.state_type;
            if new_type == StateType::Interrupted && current.state_type == StateType::Initializing {
                new_type = StateType::Initializing;
            }
            if new_type != current.state_type || new_state.error_track.is_some() {
                let state_since = if new_type != current.state_type {
                    new_state.state_since
                } else {
                    current.state_since
                };
                *current = UpdateState {
                    state_type: new_type,
                    state_since,
                    error_track: new_state.error_track,
                };
                true
            } else {
                false
            }
        });
    }

    /// Wait until the state becomes OK (`true`) or OFF (`false`), or the
    /// timeout expires (`false`). A timeout of zero or less waits forever.
    pub async fn wait_for_ok(&self, timeout_secs: f64) -> bool {
        let mut receiver = self.state.subscribe();
        let settled = receiver.wait_for(|state| {
            matches!(state.state_type, StateType::Ok | StateType::Off)
        });
        if timeout_secs <= 0.0 {
            match settled.await {
                Ok(state) => state.state_type == StateType::Ok,
                Err(_) => false,
            }
        } else {
            match tokio::time::timeout(Duration::from_secs_f64(timeout_secs), settled).await {
                Ok(Ok(state)) => state.state_type == StateType::Ok,
                _ => false,
            }
        }
    }
}
