//! Tracing layer that posts ERROR events to an alert webhook as JSON.
//!
//! At most one alert per `MIN_INTERVAL`; an identical message is not repeated
//! within `DEDUP_WINDOW`. Delivery is spawned on the Tokio runtime.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const MIN_INTERVAL: Duration = Duration::from_secs(10);
const DEDUP_WINDOW: Duration = Duration::from_secs(60);

pub struct AlertLayer {
    webhook_url: String,
    service: &'static str,
    http: reqwest::Client,
    throttle: Mutex<Throttle>,
}

/// Send budget shared by all events.
#[derive(Default)]
struct Throttle {
    last_sent: Option<Instant>,
    /// (message hash, sent at)
    recent: Vec<(u64, Instant)>,
}

impl Throttle {
    fn admit(&mut self, hash: u64, now: Instant) -> bool {
        self.recent
            .retain(|(_, ts)| now.saturating_duration_since(*ts) < DEDUP_WINDOW);

        let is_dup = self.recent.iter().any(|(h, _)| *h == hash);
        let too_soon = self
            .last_sent
            .is_some_and(|last| now.saturating_duration_since(last) < MIN_INTERVAL);

        if is_dup || too_soon {
            return false;
        }
        self.last_sent = Some(now);
        self.recent.push((hash, now));
        true
    }
}

impl AlertLayer {
    pub fn new(webhook_url: String, service: &'static str) -> Self {
        Self {
            webhook_url,
            service,
            http: reqwest::Client::new(),
            throttle: Mutex::new(Throttle::default()),
        }
    }
}

impl<S: Subscriber> Layer<S> for AlertLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::ERROR {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let message = visitor.message();

        let hash = {
            let mut h = DefaultHasher::new();
            message.hash(&mut h);
            h.finish()
        };

        let admitted = match self.throttle.lock() {
            Ok(mut throttle) => throttle.admit(hash, Instant::now()),
            Err(_) => false,
        };
        if !admitted {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let meta = event.metadata();
        let payload = serde_json::json!({
            "service": self.service,
            "level": "error",
            "message": message,
            "target": meta.target(),
            "location": format!("{}:{}", meta.file().unwrap_or("?"), meta.line().unwrap_or(0)),
            "at": chrono::Utc::now().to_rfc3339(),
        });
        let client = self.http.clone();
        let url = self.webhook_url.clone();

        runtime.spawn(async move {
            let _ = client.post(&url).json(&payload).send().await;
        });
    }
}

/// Collects the `message` field and any structured fields of an event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn message(&self) -> String {
        if self.fields.is_empty() {
            return self.message.clone();
        }
        let extras: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if self.message.is_empty() {
            extras.join(", ")
        } else {
            format!("{} ({})", self.message, extras.join(", "))
        }
    }

    fn push(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push(field, format!("{:?}", value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, value.to_string());
    }
}
