//! Telemetry event payloads: user registration, flag evaluations and
//! custom metrics, all shipped per user.

use chrono::Utc;
use serde_json::{Value, json};

use crate::evaluator::EvalResult;
use crate::user::User;

const METRIC_ROUTE: &str = "index/metric";
const METRIC_TYPE: &str = "CustomEvent";
const APP_TYPE: &str = "rustserverside";

/// One evaluated variation attached to a [`FlagEvent`].
#[derive(Debug, Clone)]
pub struct FlagEventVariation {
    result: EvalResult,
    timestamp: i64,
}

impl FlagEventVariation {
    pub fn new(result: EvalResult) -> Self {
        Self {
            result,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "featureFlagKey": self.result.key_name,
            "sendToExperiment": self.result.send_to_experiment,
            "timestamp": self.timestamp,
            "variation": {
                "id": self.result.variation_id,
                "value": self.result.value,
                "reason": self.result.reason,
            },
        })
    }
}

/// A named numeric measurement for experimentation.
#[derive(Debug, Clone)]
pub struct Metric {
    event_name: String,
    numeric_value: f64,
    timestamp: i64,
}

impl Metric {
    pub fn new(event_name: impl Into<String>, numeric_value: f64) -> Self {
        Self {
            event_name: event_name.into(),
            numeric_value,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "eventName": self.event_name,
            "numericValue": self.numeric_value,
            "route": METRIC_ROUTE,
            "type": METRIC_TYPE,
            "appType": APP_TYPE,
            "timestamp": self.timestamp,
        })
    }
}

/// A telemetry event bound for the analytics side.
#[derive(Debug, Clone)]
pub enum Event {
    /// Registers an end user.
    User { user: User },
    /// Evaluation results for one user.
    Flag {
        user: User,
        variations: Vec<FlagEventVariation>,
    },
    /// Custom metrics for one user.
    Metric { user: User, metrics: Vec<Metric> },
}

impl Event {
    pub fn user(user: User) -> Self {
        Event::User { user }
    }

    pub fn flag(user: User) -> Self {
        Event::Flag {
            user,
            variations: Vec::new(),
        }
    }

    pub fn metric(user: User) -> Self {
        Event::Metric {
            user,
            metrics: Vec::new(),
        }
    }

    /// Attach an evaluated variation. Failed evaluations are not shippable
    /// and are dropped here.
    pub fn add_variation(&mut self, variation: FlagEventVariation) {
        if let Event::Flag { variations, .. } = self
            && variation.result.is_success()
        {
            variations.push(variation);
        }
    }

    pub fn add_metric(&mut self, metric: Metric) {
        if let Event::Metric { metrics, .. } = self {
            metrics.push(metric);
        }
    }

    /// Whether this event carries anything worth shipping.
    pub fn is_send_event(&self) -> bool {
        match self {
            Event::User { .. } => true,
            Event::Flag { variations, .. } => !variations.is_empty(),
            Event::Metric { metrics, .. } => !metrics.is_empty(),
        }
    }

    pub(crate) fn to_json(&self) -> Value {
        match self {
            Event::User { user } => json!({"user": user.to_json()}),
            Event::Flag { user, variations } => json!({
                "user": user.to_json(),
                "variations": variations.iter().map(FlagEventVariation::to_json).collect::<Vec<_>>(),
            }),
            Event::Metric { user, metrics } => json!({
                "user": user.to_json(),
                "metrics": metrics.iter().map(Metric::to_json).collect::<Vec<_>>(),
            }),
        }
    }
}
