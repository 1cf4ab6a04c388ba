//! Prometheus metrics with label cardinality protection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::TapedeckError;

/// Guard against installing the recorder twice.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Call outcomes accepted as `outcome` label values.
///
/// Anything else is bucketed as `"__unknown__"`.
pub const KNOWN_OUTCOMES: [&str; 10] = [
    "always_live",
    "await_only",
    "limited_only",
    "mock_only",
    "recorded",
    "gone",
    "forbidden",
    "precondition_failed",
    "live_error",
    "busy",
];

/// Live call results accepted as `result` label values.
const KNOWN_LIVE_RESULTS: [&str; 4] = ["ok", "error", "timeout", "no_route"];

fn sanitize<'a>(value: &'a str, known: &[&str]) -> &'a str {
    if known.contains(&value) { value } else { "__unknown__" }
}

/// Sanitizes an outcome for use as a metrics label.
#[must_use]
pub fn sanitize_outcome_label(outcome: &str) -> &str {
    sanitize(outcome, &KNOWN_OUTCOMES)
}

/// Installs the global recorder.
///
/// With `port` a Prometheus listener is started on `127.0.0.1:<port>`;
/// without one metrics are recorded but not exported.
///
/// # Errors
///
/// Returns `TapedeckError::Io` if the recorder or listener cannot be
/// installed.
pub fn init_metrics(port: Option<u16>) -> Result<(), TapedeckError> {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        tracing::debug!("metrics already initialized, skipping");
        return Ok(());
    }
    port.map_or_else(
        || PrometheusBuilder::new().install_recorder().map(|_| ()),
        |p| {
            PrometheusBuilder::new()
                .with_http_listener(([127, 0, 0, 1], p))
                .install()
        },
    )
    .map_err(|e| TapedeckError::Io(std::io::Error::other(e.to_string())))?;

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!("tapedeck_calls_total", "Virtualized calls handled, by outcome");
    describe_histogram!(
        "tapedeck_call_duration_seconds",
        "Time from gate entry to response, in seconds"
    );
    describe_counter!("tapedeck_live_calls_total", "Calls forwarded to a live backend");
    describe_counter!("tapedeck_tape_saves_total", "Tape file writes, by result");
    describe_counter!("tapedeck_chapters_recorded_total", "Chapters recorded");
    describe_gauge!("tapedeck_tapes", "Tapes currently loaded");
}

/// Records a handled call.
pub fn record_call(outcome: &str, duration: Duration) {
    let label = sanitize_outcome_label(outcome);
    counter!("tapedeck_calls_total", "outcome" => label.to_owned()).increment(1);
    histogram!("tapedeck_call_duration_seconds").record(duration.as_secs_f64());
}

/// Records a live backend call.
pub fn record_live_call(result: &str) {
    let label = sanitize(result, &KNOWN_LIVE_RESULTS);
    counter!("tapedeck_live_calls_total", "result" => label.to_owned()).increment(1);
}

/// Records a tape file write.
pub fn record_tape_save(success: bool) {
    let result = if success { "ok" } else { "error" };
    counter!("tapedeck_tape_saves_total", "result" => result).increment(1);
}

/// Records a newly recorded chapter.
pub fn record_chapter_recorded() {
    counter!("tapedeck_chapters_recorded_total").increment(1);
}

/// Sets the loaded tape gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_tapes(count: usize) {
    gauge!("tapedeck_tapes").set(count as f64);
}
