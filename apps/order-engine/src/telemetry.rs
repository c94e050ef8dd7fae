//! Logging and trace export setup.
//!
//! Installs a `tracing` subscriber built from [`LoggingConfig`], with an
//! optional OpenTelemetry layer exporting spans over OTLP.
//!
//! # Configuration
//!
//! - `RUST_LOG`: Filter directives; overrides `logging.level`
//! - `OTEL_ENABLED`: Set to `true` to export spans (default: `false`)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP gRPC endpoint (default: `http://localhost:4317`)
//! - `OTEL_SERVICE_NAME`: Service name for traces (default: `order-engine`)
//!
//! # Usage
//!
//! ```rust,ignore
//! use order_engine::telemetry::init_telemetry;
//!
//! let config = load_config(None)?;
//! let _guard = init_telemetry(&config.observability.logging);
//! ```

use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

const DEFAULT_ENDPOINT: &str = "http://localhost:4317";
const DEFAULT_SERVICE_NAME: &str = "order-engine";

/// Guard that shuts down the tracer provider on drop.
#[derive(Debug)]
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Returns true if spans are being exported.
    #[must_use]
    pub const fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Error shutting down tracer provider: {e:?}");
        }
    }
}

/// Install the global subscriber.
///
/// Falls back to console-only logging if the OTLP exporter cannot be built.
/// A second call leaves the first subscriber in place.
#[must_use]
pub fn init_telemetry(logging: &LoggingConfig) -> TelemetryGuard {
    let otel_enabled = std::env::var("OTEL_ENABLED")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(logging)));

    if !otel_enabled {
        let installed = Registry::default()
            .with(env_filter)
            .with(fmt_layer(logging))
            .try_init();
        if let Err(e) = installed {
            eprintln!("Tracing subscriber already installed: {e}");
        }
        return TelemetryGuard { provider: None };
    }

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string());

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("Failed to create OTLP exporter: {e:?}, falling back to console logging");
            let installed = Registry::default()
                .with(env_filter)
                .with(fmt_layer(logging))
                .try_init();
            if let Err(e) = installed {
                eprintln!("Tracing subscriber already installed: {e}");
            }
            return TelemetryGuard { provider: None };
        }
    };

    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(exporter)
        .build();
    let tracer = provider.tracer(service_name.clone());

    let installed = Registry::default()
        .with(env_filter)
        .with(fmt_layer(logging))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init();
    if let Err(e) = installed {
        eprintln!("Tracing subscriber already installed: {e}");
        return TelemetryGuard {
            provider: Some(provider),
        };
    }

    tracing::info!(
        service_name = %service_name,
        endpoint = %endpoint,
        "OpenTelemetry initialized"
    );

    TelemetryGuard {
        provider: Some(provider),
    }
}

/// Filter used when `RUST_LOG` is unset.
fn default_directive(logging: &LoggingConfig) -> String {
    format!("order_engine={}", logging.level.to_lowercase())
}

fn fmt_layer<S>(logging: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer().with_target(true);
    if logging.is_json() {
        layer
            .json()
            .with_current_span(logging.include_spans)
            .with_span_list(logging.include_spans)
            .boxed()
    } else {
        layer.pretty().with_ansi(false).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_scopes_level_to_crate() {
        let logging = LoggingConfig {
            level: "DEBUG".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(default_directive(&logging), "order_engine=debug");
    }

    #[test]
    fn console_guard_does_not_export() {
        let guard = TelemetryGuard { provider: None };
        assert!(!guard.is_exporting());
    }
}
