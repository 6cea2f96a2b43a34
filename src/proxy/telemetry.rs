//! Telemetry (spec §4.J / §6): a guarded emission helper so every call site
//! shares one `logging_enabled` check instead of repeating `if enabled {
//! tracing::info!(...) }` inline, which is how the teacher's `server.rs` does
//! it at each call site today.

use std::sync::atomic::{AtomicBool, Ordering};

static LOGGING_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn set_logging_enabled(enabled: bool) {
    LOGGING_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn logging_enabled() -> bool {
    LOGGING_ENABLED.load(Ordering::Relaxed)
}

/// Emit one of the named events from spec §6, iff logging is enabled.
/// `event` is always one of the fixed event-name strings the spec lists —
/// callers pass the literal so the name shows up verbatim in the log line.
macro_rules! emit {
    ($event:expr $(, $field:tt)* $(,)?) => {
        if $crate::proxy::telemetry::logging_enabled() {
            tracing::info!(event = $event $(, $field)*);
        }
    };
}

pub(crate) use emit;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_enabled_round_trips() {
        set_logging_enabled(true);
        assert!(logging_enabled());
        set_logging_enabled(false);
        assert!(!logging_enabled());
    }
}
