// Logging and tracing bootstrap
//
// Console output through tracing-subscriber with an EnvFilter, plus an optional
// OTLP span exporter when OTEL_EXPORTER_OTLP_ENDPOINT is set.

use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_SERVICE_NAME: &str = "bulkmut";
const DEFAULT_FILTER: &str = "info";

/// HTTP stack targets capped at `warn` unless the filter names them
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "h2", "reqwest", "rustls", "tonic"];

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`
    pub otlp_endpoint: Option<String>,
    pub environment: Option<String>,
    pub enable_console: bool,
    /// Filter directive such as `info` or `bulkmut_engine=debug`
    pub log_filter: Option<String>,
    /// Remote account the process mutates, exported as `bulkmut.account`
    pub account: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: None,
            otlp_endpoint: None,
            environment: None,
            enable_console: true,
            log_filter: None,
            account: None,
        }
    }
}

impl TelemetryConfig {
    /// Read `OTEL_SERVICE_NAME`, `OTEL_SERVICE_VERSION`,
    /// `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_ENVIRONMENT` and
    /// `RUST_LOG` (falling back to `LOG_LEVEL`)
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string()),
            service_version: std::env::var("OTEL_SERVICE_VERSION").ok(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            environment: std::env::var("OTEL_ENVIRONMENT").ok(),
            enable_console: true,
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            account: None,
        }
    }

    pub fn with_service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    fn filter(&self) -> EnvFilter {
        let requested = self.log_filter.as_deref().unwrap_or(DEFAULT_FILTER);
        let (mut filter, directives) = match EnvFilter::try_new(requested) {
            Ok(filter) => (filter, requested),
            Err(_) => (EnvFilter::new(DEFAULT_FILTER), DEFAULT_FILTER),
        };
        for target in QUIET_TARGETS {
            if directives.contains(target) {
                continue;
            }
            if let Ok(directive) = format!("{target}=warn").parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

/// Shuts the tracer provider down (flushing pending spans) when dropped
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shutdown tracer provider: {e:?}");
            }
        }
    }
}

/// Install the global subscriber
///
/// Keep the returned guard alive until the process exits.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let mut resource_attrs = vec![KeyValue::new("service.name", config.service_name.clone())];
    if let Some(version) = &config.service_version {
        resource_attrs.push(KeyValue::new("service.version", version.clone()));
    }
    if let Some(env) = &config.environment {
        resource_attrs.push(KeyValue::new("deployment.environment", env.clone()));
    }
    if let Some(account) = &config.account {
        resource_attrs.push(KeyValue::new("bulkmut.account", account.clone()));
    }
    let resource = Resource::builder().with_attributes(resource_attrs).build();

    let console_layer = config.enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(config.filter())
    });

    let (provider, otel_layer, otel_status) = match &config.otlp_endpoint {
        Some(endpoint) => match build_otlp_tracer(endpoint, resource) {
            Ok((provider, tracer)) => {
                let layer = tracing_opentelemetry::layer()
                    .with_tracer(tracer)
                    .with_filter(config.filter());
                (Some(provider), Some(layer), Some(Ok(endpoint.clone())))
            }
            Err(e) => (None, None, Some(Err(e.to_string()))),
        },
        None => (None, None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(console_layer)
        .with(otel_layer)
        .try_init();
    if installed.is_err() {
        // A subscriber already exists (tests, embedding applications)
        return TelemetryGuard { provider };
    }

    match otel_status {
        Some(Ok(endpoint)) => tracing::info!(
            endpoint = %endpoint,
            account = config.account.as_deref().unwrap_or("-"),
            "OpenTelemetry tracing enabled"
        ),
        Some(Err(e)) => tracing::warn!(
            error = %e,
            "Failed to initialize OTLP tracer, continuing without tracing"
        ),
        None => tracing::debug!("OpenTelemetry tracing disabled"),
    }

    TelemetryGuard { provider }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn build_otlp_tracer(
    endpoint: &str,
    resource: Resource,
) -> Result<(SdkTracerProvider, opentelemetry_sdk::trace::Tracer), BoxError> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = provider.tracer(DEFAULT_SERVICE_NAME);
    Ok((provider, tracer))
}
