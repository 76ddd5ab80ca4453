//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Once;

use flagstream::{Config, FlagClient, User};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Route SDK logs to the test writer; safe to call from every test.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}

/// A full data-sync envelope covering every flag shape the tests exercise.
pub const DATASET: &str = include_str!("../data/flags.json");

pub fn user(key: &str) -> User {
    User::builder(key).name(key).build().unwrap()
}

pub fn user_with(key: &str, attribute: &str, value: &str) -> User {
    User::builder(key)
        .name(key)
        .custom(attribute, value)
        .build()
        .unwrap()
}

pub fn offline_config() -> Config {
    Config::builder("secret", "http://events.local", "ws://stream.local")
        .offline(true)
        .build()
}

/// An offline client preloaded with [`DATASET`].
pub async fn offline_client() -> FlagClient {
    init_test_logging();
    let client = FlagClient::with_start_wait(offline_config(), 1.0)
        .await
        .expect("offline client");
    assert!(client.initialize_from_external_json(DATASET));
    client
}
