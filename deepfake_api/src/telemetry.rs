use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;

pub struct Metrics {
    request_counter: Counter<u64>,
    detection_duration: Histogram<u64>,
    detection_counter: Counter<u64>,
    fallback_counter: Counter<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("deepfake_api");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let detection_duration = meter
            .u64_histogram("detection_duration_ms")
            .with_boundaries(duration_boundaries(10, 120_000))
            .with_description("Duration of detection runs in milliseconds")
            .build();

        let detection_counter = meter
            .u64_counter("detections_total")
            .with_description("Completed detections by media type and label")
            .build();

        let fallback_counter = meter
            .u64_counter("explanation_fallbacks_total")
            .with_description("Explanations answered with fallback text")
            .build();

        Ok(Metrics {
            request_counter,
            detection_duration,
            detection_counter,
            fallback_counter,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_detection(&self, media: &str, label: &str, duration_ms: u64) {
        let attributes = vec![
            KeyValue::new("media", media.to_string()),
            KeyValue::new("label", label.to_string()),
        ];
        self.detection_counter.add(1, &attributes);
        self.detection_duration
            .record(duration_ms, &[KeyValue::new("media", media.to_string())]);
    }

    pub fn record_fallback(&self, intent: &str) {
        let attributes = vec![KeyValue::new("intent", intent.to_string())];
        self.fallback_counter.add(1, &attributes);
    }
}

/// Doubling bucket bounds from `start` up to and including the first bound
/// past `end`.
fn duration_boundaries(start: u64, end: u64) -> Vec<f64> {
    std::iter::successors(Some(start.max(1)), |&bound| (bound < end).then(|| bound * 2))
        .map(|bound| bound as f64)
        .collect()
}
