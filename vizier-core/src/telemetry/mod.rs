//! Per-turn telemetry.
//!
//! Spans and events always go through `tracing`. A [`TurnLog`] is handed to
//! the process-wide [`TelemetrySink`] at the end of every turn, finished or
//! failed, once one has been installed with [`set_telemetry_sink`].

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Receiver of turn records. Called on whichever thread finished the turn,
/// after the turn's callbacks have been decided, so it must not block.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_turn(&self, log: TurnLog);
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

// Unit tests run in parallel on one process-wide sink; only threads that opt in emit.
#[cfg(test)]
thread_local! {
    static TEST_CAPTURE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install the sink. The first caller wins; later calls return `false`.
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

#[cfg(test)]
fn capturing() -> bool {
    TEST_CAPTURE.with(|c| c.get())
}

#[cfg(not(test))]
fn capturing() -> bool {
    true
}

pub(crate) fn emit_turn(log: TurnLog) {
    if !capturing() {
        return;
    }
    match TELEMETRY_SINK.get() {
        Some(sink) => sink.record_turn(log),
        None => tracing::trace!(session.id = ?log.session_id, "no telemetry sink installed"),
    }
}

/// Opt the current test thread in or out of sink emission.
#[cfg(test)]
pub fn test_set_capture_enabled(enabled: bool) {
    TEST_CAPTURE.with(|c| c.set(enabled));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_is_per_thread_and_off_by_default() {
        assert!(!capturing());
        test_set_capture_enabled(true);
        assert!(capturing());
        let other = std::thread::spawn(capturing).join().unwrap();
        assert!(!other);
        test_set_capture_enabled(false);
        assert!(!capturing());
    }

    #[test]
    fn emitting_without_opt_in_is_a_no_op() {
        emit_turn(TurnLog::new().session_id("quiet").error("transport", "down"));
    }
}
