//! Creation-site stack capture for diagnostics.

use std::backtrace::Backtrace;

/// Capture the current stack as text, regardless of `RUST_BACKTRACE`.
pub fn capture() -> String {
    Backtrace::force_capture().to_string()
}

/// Capture only when stack logging is on.
pub fn capture_if(enabled: bool) -> Option<String> {
    enabled.then(capture)
}
