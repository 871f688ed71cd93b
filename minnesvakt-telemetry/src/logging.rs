//! ## minnesvakt-telemetry::logging
//! **Subscriber initialization for the diagnostic stream**
//!
//! The allocation subsystem emits its diagnostics through `tracing`;
//! this module wires up the formatting subscriber. Diagnostic text is
//! advisory only and is not part of any functional contract.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone)]
pub struct EventLogger;

impl EventLogger {
    pub fn init() {
        fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_thread_names(true)
            .with_span_events(FmtSpan::ENTER)
            .init()
    }
}
