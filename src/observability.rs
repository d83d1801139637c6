//! Observability utilities: subscriber setup and a kernel event bridge.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::kernel::{ExecutionObserver, KernelEvent};
use crate::types::ObservabilityConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize tracing with default settings.
pub fn init_tracing() {
    init_tracing_with(&ObservabilityConfig::default());
}

/// Initialize the tracing subscriber once for the process.
///
/// `RUST_LOG` overrides the configured level and
/// `OFFICE_KERNEL_LOG_FORMAT=json` overrides the configured format.
pub fn init_tracing_with(config: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
        let json = std::env::var("OFFICE_KERNEL_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(config.json_logs);

        let result = if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

/// Forwards every [`KernelEvent`] to `tracing` as a serialized event on the
/// `office_kernel::events` target.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn on_event(&self, event: &KernelEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => tracing::info!(
                target: "office_kernel::events",
                "kernel_event: label={}, event={}",
                event.label(),
                payload
            ),
            Err(err) => tracing::warn!("kernel_event_unserializable: error={}", err),
        }
    }
}
