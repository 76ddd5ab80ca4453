//! flagstream - a server-side feature-flag SDK.
//!
//! The client keeps a local replica of flag and segment definitions in sync
//! over a streaming WebSocket channel, evaluates flags deterministically for
//! a given end user, and ships evaluation telemetry back in batches for
//! analytics and experimentation.
//!
//! ```no_run
//! use flagstream::{Config, FlagClient, User};
//!
//! # async fn run() -> Result<(), flagstream::Error> {
//! let config = Config::builder(
//!     "<env-secret>",
//!     "https://events.example.com",
//!     "wss://stream.example.com",
//! )
//! .build();
//! let client = FlagClient::new(config).await?;
//!
//! let user = User::builder("user-key").name("User Name").build()?;
//! let enabled = client.variation("my-flag", &user, false);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod errors;
pub mod evaluator;
pub mod event_processor;
pub mod events;
pub mod notices;
mod protocol;
pub mod sender;
pub mod status;
pub mod store;
pub mod streaming;
pub mod task;
pub mod types;
pub mod user;

pub use client::{AllFlagStates, DEFAULT_START_WAIT, FlagClient};
pub use config::{Config, ConfigBuilder, HttpConfig, WebSocketConfig};
pub use errors::{Error, StoreError};
pub use evaluator::{
    EvalResult, REASON_CLIENT_NOT_READY, REASON_ERROR, REASON_FALLTHROUGH, REASON_FLAG_NOT_FOUND,
    REASON_FLAG_OFF, REASON_RULE_MATCH, REASON_TARGET_MATCH, REASON_USER_NOT_SPECIFIED,
    REASON_WRONG_TYPE,
};
pub use event_processor::{DefaultEventProcessor, EventProcessor, NullEventProcessor};
pub use events::{Event, Metric};
pub use notices::{
    FLAG_CHANGE_NOTICE_TYPE, FlagChangedNotice, ListenerHandle, Notice, NoticeBroadcaster,
    NoticeListener,
};
pub use sender::{HttpEventSender, SendError, Sender};
pub use status::{ErrorTrack, StateType, UpdateState, UpdateStatusProvider};
pub use store::{AllData, Category, DataStore, MemoryDataStore, NullDataStore};
pub use streaming::{NullUpdateProcessor, StreamingProcessor, UpdateProcessor};
pub use task::{Ready, RepeatableTask};
pub use types::{EvalDetail, FeatureFlag, FlagState, FlagType, FlagValue, Segment};
pub use user::{AttributeValue, User, UserBuilder};
