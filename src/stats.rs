//! In-memory request statistics.
//!
//! [`EventLog`] is a fixed-capacity ring-buffer of translator request
//! events: once full, the oldest entry is evicted to make room for the
//! newest. Bounded, O(1) memory regardless of request volume. The pipeline
//! records through the [`MetricsSink`] trait; the ring buffer and its
//! aggregations back the `/internal/stats/*` endpoints.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

/// How the request was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationMode {
    Passthrough,
    Translate,
}

impl TranslationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Translate => "translate",
        }
    }
}

/// Why passthrough was not used (or `None` when it was).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackReason {
    None,
    NoCompatibleEndpoints,
    TranslatorDoesNotSupportPassthrough,
    CannotPassthrough,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::NoCompatibleEndpoints => "no-compatible-endpoints",
            Self::TranslatorDoesNotSupportPassthrough => "translator-does-not-support-passthrough",
            Self::CannotPassthrough => "cannot-passthrough",
        }
    }
}

/// Single-shot record emitted once per translator request.
#[derive(Debug, Clone, Serialize)]
pub struct TranslatorEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub translator: String,
    pub model: Option<String>,
    pub mode: TranslationMode,
    pub fallback: FallbackReason,
    pub success: bool,
    pub is_streaming: bool,
    pub latency_ms: u64,
}

impl TranslatorEvent {
    pub fn new(translator: &str, mode: TranslationMode, latency_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            translator: translator.to_string(),
            model: None,
            mode,
            fallback: FallbackReason::None,
            success,
            is_streaming: false,
            latency_ms,
        }
    }

    pub fn with_model(mut self, model: Option<&str>) -> Self {
        self.model = model.map(str::to_string);
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackReason) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn streaming(mut self, is_streaming: bool) -> Self {
        self.is_streaming = is_streaming;
        self
    }
}

/// Where the pipeline reports events. Implementations serialise internally.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: TranslatorEvent);
}

/// Fixed-capacity ring-buffer of recent events.
///
/// [`record`][MetricsSink::record] uses a non-blocking `try_lock` so it
/// never delays request handling; under lock contention the event is
/// silently dropped.
pub struct EventLog {
    capacity: usize,
    events: Mutex<VecDeque<TranslatorEvent>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, events: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Up to `limit` recent events, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TranslatorEvent> {
        let events = self.events.lock().await;
        events.iter().rev().take(limit).cloned().collect()
    }

    /// Per-translator aggregates over the buffered window.
    pub async fn translator_stats(&self) -> Vec<TranslatorStats> {
        let events = self.events.lock().await;
        let mut by_name: std::collections::HashMap<String, TranslatorStats> = Default::default();

        for e in events.iter() {
            let s = by_name.entry(e.translator.clone()).or_insert_with(|| TranslatorStats {
                translator: e.translator.clone(),
                ..Default::default()
            });
            s.total += 1;
            if !e.success {
                s.errors += 1;
            }
            match e.mode {
                TranslationMode::Passthrough => s.passthrough += 1,
                TranslationMode::Translate => s.translate += 1,
            }
            if e.is_streaming {
                s.streaming += 1;
            }
            s.latency_sum_ms += e.latency_ms;
        }

        let mut all: Vec<TranslatorStats> = by_name.into_values().collect();
        for s in &mut all {
            s.avg_latency_ms =
                if s.total == 0 { 0.0 } else { s.latency_sum_ms as f64 / s.total as f64 };
        }
        all.sort_by(|a, b| a.translator.cmp(&b.translator));
        all
    }

    /// Request counts per model over the buffered window.
    pub async fn model_counts(&self) -> Vec<ModelCount> {
        let events = self.events.lock().await;
        let mut counts: std::collections::HashMap<String, usize> = Default::default();
        for e in events.iter() {
            let model = e.model.clone().unwrap_or_else(|| "(none)".into());
            *counts.entry(model).or_default() += 1;
        }
        let mut all: Vec<ModelCount> =
            counts.into_iter().map(|(model, requests)| ModelCount { model, requests }).collect();
        all.sort_by(|a, b| b.requests.cmp(&a.requests).then_with(|| a.model.cmp(&b.model)));
        all
    }
}

impl MetricsSink for EventLog {
    fn record(&self, event: TranslatorEvent) {
        if let Ok(mut events) = self.events.try_lock() {
            if events.len() == self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        }
    }
}

/// Aggregates for one translator.
#[derive(Debug, Default, Serialize)]
pub struct TranslatorStats {
    pub translator: String,
    pub total: usize,
    pub errors: usize,
    pub passthrough: usize,
    pub translate: usize,
    pub streaming: usize,
    #[serde(skip)]
    latency_sum_ms: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct ModelCount {
    pub model: String,
    pub requests: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(translator: &str, mode: TranslationMode, success: bool) -> TranslatorEvent {
        TranslatorEvent::new(translator, mode, 25, success)
    }

    #[tokio::test]
    async fn record_and_read_back() {
        let log = EventLog::new(10);
        log.record(event("anthropic", TranslationMode::Passthrough, true));

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].translator, "anthropic");
        assert_eq!(recent[0].fallback, FallbackReason::None);
    }

    #[tokio::test]
    async fn oldest_event_evicted_at_capacity() {
        let log = EventLog::new(2);
        log.record(event("a", TranslationMode::Translate, true));
        log.record(event("b", TranslationMode::Translate, true));
        log.record(event("c", TranslationMode::Translate, true));

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|e| e.translator != "a"));
    }

    #[tokio::test]
    async fn recent_returns_newest_first() {
        let log = EventLog::new(10);
        log.record(event("first", TranslationMode::Translate, true));
        log.record(event("second", TranslationMode::Translate, true));

        let recent = log.recent(10).await;
        assert_eq!(recent[0].translator, "second");
    }

    #[tokio::test]
    async fn translator_stats_aggregate_modes_and_errors() {
        let log = EventLog::new(10);
        log.record(event("anthropic", TranslationMode::Passthrough, true).streaming(true));
        log.record(event("anthropic", TranslationMode::Translate, false));
        log.record(event("anthropic", TranslationMode::Translate, true));

        let stats = log.translator_stats().await;
        assert_eq!(stats.len(), 1);
        let s = &stats[0];
        assert_eq!(s.total, 3);
        assert_eq!(s.errors, 1);
        assert_eq!(s.passthrough, 1);
        assert_eq!(s.translate, 2);
        assert_eq!(s.streaming, 1);
        assert!((s.avg_latency_ms - 25.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn model_counts_sorted_by_volume() {
        let log = EventLog::new(10);
        log.record(event("a", TranslationMode::Translate, true).with_model(Some("m1")));
        log.record(event("a", TranslationMode::Translate, true).with_model(Some("m2")));
        log.record(event("a", TranslationMode::Translate, true).with_model(Some("m2")));
        log.record(event("a", TranslationMode::Translate, true).with_model(None));

        let counts = log.model_counts().await;
        assert_eq!(counts[0].model, "m2");
        assert_eq!(counts[0].requests, 2);
        assert!(counts.iter().any(|c| c.model == "(none)"));
    }

    #[test]
    fn events_have_unique_ids() {
        let a = event("x", TranslationMode::Translate, true);
        let b = event("x", TranslationMode::Translate, true);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn fallback_reason_strings_are_kebab_case() {
        assert_eq!(FallbackReason::CannotPassthrough.as_str(), "cannot-passthrough");
        assert_eq!(
            FallbackReason::TranslatorDoesNotSupportPassthrough.as_str(),
            "translator-does-not-support-passthrough"
        );
    }
}
