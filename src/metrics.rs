use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};

/// Counters recorded by the transfer engine.
#[derive(Clone)]
pub struct TransferMetrics {
    pub blobs_written: Counter<u64>,
    pub blobs_skipped: Counter<u64>,
    pub blob_size_histogram: Histogram<f64>,
}

impl TransferMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            blobs_written: meter
                .u64_counter("blobs_written_total")
                .with_description("Blobs committed to the destination store")
                .with_unit(Unit::new("blobs"))
                .init(),
            blobs_skipped: meter
                .u64_counter("blobs_skipped_total")
                .with_description("Blobs already present or mounted at the destination")
                .with_unit(Unit::new("blobs"))
                .init(),
            blob_size_histogram: meter
                .f64_histogram("blob_size_bytes")
                .with_description("Size of transferred blobs in bytes")
                .with_unit(Unit::new("bytes"))
                .init(),
        }
    }

    /// Instruments from the global meter provider, a no-op until one is installed.
    pub fn global() -> Self {
        Self::new(&global::meter("imgferry"))
    }
}
