//! Common test infrastructure for the looper integration tests.
//!
//! - [`Transcript`]: shared, ordered record of which tasks ran and when
//! - [`capture_tracing_events`]: run a closure under a capturing subscriber

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use looper::{Runnable, Scheduler};

/// Ordered log of task executions shared between tasks and the test body.
#[derive(Clone, Default)]
pub struct Transcript {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().expect("transcript mutex").push(entry.into());
    }

    /// A task that appends `label` when it runs.
    pub fn task(&self, label: &str) -> Runnable {
        let transcript = self.clone();
        let label = label.to_string();
        Runnable::new(move || transcript.push(label.clone()))
    }

    /// A task that appends `label@<virtual time>` when it runs.
    pub fn timed_task(&self, label: &str, scheduler: &Arc<Scheduler>) -> Runnable {
        let transcript = self.clone();
        let scheduler = Arc::clone(scheduler);
        let label = label.to_string();
        Runnable::new(move || transcript.push(format!("{label}@{}", scheduler.current_time())))
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().expect("transcript mutex").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("transcript mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: tracing::Level,
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    pub fn event_name(&self) -> Option<&str> {
        self.fields.get("event").map(String::as_str)
    }
}

#[derive(Clone, Default)]
struct CaptureLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CaptureLayer {
    fn snapshot(&self) -> Vec<CapturedEvent> {
        self.events.lock().expect("events mutex").clone()
    }
}

struct FieldVisitor<'a> {
    fields: &'a mut BTreeMap<String, String>,
}

impl tracing::field::Visit for FieldVisitor<'_> {
    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}

impl<S> tracing_subscriber::Layer<S> for CaptureLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut fields = BTreeMap::new();
        let mut visitor = FieldVisitor {
            fields: &mut fields,
        };
        event.record(&mut visitor);
        self.events
            .lock()
            .expect("events mutex")
            .push(CapturedEvent {
                level: *event.metadata().level(),
                fields,
            });
    }
}

/// Run `f` with a thread-local subscriber that records every event.
pub fn capture_tracing_events<T>(f: impl FnOnce() -> T) -> (T, Vec<CapturedEvent>) {
    use tracing_subscriber::layer::SubscriberExt as _;

    let capture = CaptureLayer::default();
    let subscriber = tracing_subscriber::registry().with(capture.clone());
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, capture.snapshot())
}

pub fn events_named<'a>(events: &'a [CapturedEvent], name: &str) -> Vec<&'a CapturedEvent> {
    events
        .iter()
        .filter(|event| event.event_name() == Some(name))
        .collect()
}
