use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

const METER_NAME: &str = "object_detection_api";

pub struct Metrics {
    request_counter: Counter<u64>,
    inference_duration: Histogram<u64>,
    detections_counter: Counter<u64>,
    // Keeps the reader alive once another provider takes the global slot.
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build prometheus exporter: {:?}", e))?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter(METER_NAME);
        global::set_meter_provider(provider.clone());

        let request_counter = meter
            .u64_counter("upload_requests_total")
            .with_description("Upload requests by outcome")
            .build();

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(duration_boundaries())
            .with_description("Duration of decode and detection in milliseconds")
            .build();

        let detections_counter = meter
            .u64_counter("detections_total")
            .with_description("Objects returned to clients")
            .build();

        Ok(Metrics {
            request_counter,
            inference_duration,
            detections_counter,
            _provider: provider,
            registry,
        })
    }

    pub fn record_request(&self, outcome: &str) {
        let attributes = [KeyValue::new("outcome", outcome.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_inference_duration(&self, duration_ms: u64, outcome: &str) {
        let attributes = [KeyValue::new("outcome", outcome.to_string())];
        self.inference_duration.record(duration_ms, &attributes);
    }

    pub fn record_detections(&self, count: usize) {
        self.detections_counter.add(count as u64, &[]);
    }
}

/// Roughly logarithmic buckets from 5 ms to 10 s.
fn duration_boundaries() -> Vec<f64> {
    [1, 2, 5]
        .iter()
        .cycle()
        .zip([1, 1, 1, 10, 10, 10, 100, 100, 100, 1000, 1000, 1000, 10000])
        .map(|(mantissa, scale)| (mantissa * scale) as f64)
        .filter(|&boundary| boundary >= 5.0)
        .collect()
}
