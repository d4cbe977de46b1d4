//! Stream telemetry.
//! By default, nothing is recorded unless a sink is installed via `set_telemetry_sink`.
//! Human-readable logs go through `tracing` independently of any sink.

pub mod types;

pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Implement this to receive one [`StreamLog`] per finished upstream stream.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - `record_stream` may be called from any runtime worker; it must not block or panic.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_stream(&self, log: StreamLog);
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

/// Install a global telemetry sink. Returns `false` if a sink is already installed.
///
/// This is a write-once global for the process lifetime (backed by `OnceCell`).
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

/// Emit a stream summary if a sink is installed.
#[inline]
pub(crate) fn emit_stream(log: StreamLog) {
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record_stream(log);
    }
}
