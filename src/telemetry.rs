use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider, UpDownCounter},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    frames_captured: Counter<u64>,
    batches_flushed: Counter<u64>,
    batch_size: Histogram<u64>,
    flush_duration: Histogram<u64>,
    persistence_failures: Counter<u64>,
    rejected_connections: Counter<u64>,
    active_streams: UpDownCounter<i64>,
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

        let meter = provider.meter("seed_sorter");
        global::set_meter_provider(provider);

        let frames_captured = meter
            .u64_counter("frames_captured_total")
            .with_description("Frames pulled from the frame source")
            .build();

        let batches_flushed = meter
            .u64_counter("batches_flushed_total")
            .with_description("Batches closed and classified")
            .build();

        let batch_size = meter
            .u64_histogram("batch_size")
            .with_boundaries(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0])
            .with_description("Frames per flushed batch")
            .build();

        let flush_duration = meter
            .u64_histogram("flush_duration_ms")
            .with_boundaries(generate_boundaries((5, 25, 35, 115, 1015)))
            .with_description("Time from the flushing submission to its results, in milliseconds")
            .build();

        let persistence_failures = meter
            .u64_counter("persistence_failures_total")
            .with_description("Result commits that were rolled back")
            .build();

        let rejected_connections = meter
            .u64_counter("rejected_connections_total")
            .with_description("Stream connections refused at handshake")
            .build();

        let active_streams = meter
            .i64_up_down_counter("active_streams")
            .with_description("Streams currently running")
            .build();

        Ok(Metrics {
            frames_captured,
            batches_flushed,
            batch_size,
            flush_duration,
            persistence_failures,
            rejected_connections,
            active_streams,
            registry,
        })
    }

    pub fn record_frame(&self) {
        self.frames_captured.add(1, &[]);
    }

    pub fn record_flush(&self, size: usize, duration_ms: u64) {
        self.batches_flushed.add(1, &[]);
        self.batch_size.record(size as u64, &[]);
        self.flush_duration.record(duration_ms, &[]);
    }

    pub fn record_persistence_failure(&self) {
        self.persistence_failures.add(1, &[]);
    }

    pub fn record_rejected_connection(&self, reason: &str) {
        let attributes = vec![KeyValue::new("reason", reason.to_string())];
        self.rejected_connections.add(1, &attributes);
    }

    pub fn stream_opened(&self) {
        self.active_streams.add(1, &[]);
    }

    pub fn stream_closed(&self) {
        self.active_streams.add(-1, &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
