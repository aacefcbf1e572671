use crate::protocol::schema::{Schema, SchemaField, INSTRUMENTATION_SCHEMA_NAME};
use crate::protocol::value::{OmlValue, OmlValueKind};
use crossbeam_utils::atomic::AtomicCell;
use once_cell::sync::Lazy;

/// Out-of-band client health counters, reported through the reserved
/// `_client_instrumentation` stream instead of errors on the inject path.
pub struct Counters {
    measurements_injected: AtomicCell<u32>,
    measurements_dropped: AtomicCell<u32>,
    bytes_allocated: AtomicCell<u64>,
    bytes_freed: AtomicCell<u64>,
    bytes_max: AtomicCell<u64>,
}

static COUNTERS: Lazy<Counters> = Lazy::new(|| Counters {
    measurements_injected: AtomicCell::new(0),
    measurements_dropped: AtomicCell::new(0),
    bytes_allocated: AtomicCell::new(0),
    bytes_freed: AtomicCell::new(0),
    bytes_max: AtomicCell::new(0),
});

pub fn counters() -> &'static Counters {
    &COUNTERS
}

impl Counters {
    pub fn injected(&self) {
        self.measurements_injected
            .store(self.measurements_injected.load().wrapping_add(1));
    }

    pub fn dropped(&self) {
        self.measurements_dropped
            .store(self.measurements_dropped.load().wrapping_add(1));
    }

    /// A row buffer of `n` bytes was marshalled...
    pub fn row_allocated(&self, n: usize) {
        let allocated = self.bytes_allocated.load().wrapping_add(n as u64);
        self.bytes_allocated.store(allocated);
        let in_use = allocated.saturating_sub(self.bytes_freed.load());
        if in_use > self.bytes_max.load() {
            self.bytes_max.store(in_use);
        }
    }

    /// ... and released once handed to the sink.
    pub fn row_freed(&self, n: usize) {
        self.bytes_freed
            .store(self.bytes_freed.load().wrapping_add(n as u64));
    }

    pub fn snapshot(&self) -> Vec<OmlValue> {
        let allocated = self.bytes_allocated.load();
        let freed = self.bytes_freed.load();
        vec![
            OmlValue::UInt32(self.measurements_injected.load()),
            OmlValue::UInt32(self.measurements_dropped.load()),
            OmlValue::UInt64(allocated),
            OmlValue::UInt64(freed),
            OmlValue::UInt64(allocated.saturating_sub(freed)),
            OmlValue::UInt64(self.bytes_max.load()),
        ]
    }
}

/// Schema of the instrumentation stream at the given index.
pub fn schema(index: u32) -> Schema {
    Schema::new(
        index,
        INSTRUMENTATION_SCHEMA_NAME,
        vec![
            SchemaField::new("measurements_injected", OmlValueKind::UInt32),
            SchemaField::new("measurements_dropped", OmlValueKind::UInt32),
            SchemaField::new("bytes_allocated", OmlValueKind::UInt64),
            SchemaField::new("bytes_freed", OmlValueKind::UInt64),
            SchemaField::new("bytes_in_use", OmlValueKind::UInt64),
            SchemaField::new("bytes_max", OmlValueKind::UInt64),
        ],
    )
}
