//! Telemetry initialization: `tracing` + `tracing-subscriber` with an `EnvFilter`,
//! console output only. No OpenTelemetry/OTLP exporter — the gateway's log-level
//! mapping (spec.md §7) is served entirely by `tracing`'s own levels.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry().with(env_filter).with(tracing_subscriber::fmt::layer()).try_init()?;

    Ok(())
}
