use opentelemetry::trace::TraceId;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

///  Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _; // opentelemetry::Context -> opentelemetry::trace::Span
    use tracing_opentelemetry::OpenTelemetrySpanExt as _; // tracing::Span to opentelemetry::Context

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

#[cfg(feature = "telemetry")]
async fn init_tracer() -> anyhow::Result<opentelemetry::sdk::trace::Tracer> {
    let otlp_endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL")
        .map_err(|_| anyhow::anyhow!("Need a otel tracing collector configured"))?;

    let channel = tonic::transport::Channel::from_shared(otlp_endpoint)?
        .connect()
        .await?;

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_channel(channel))
        .with_trace_config(opentelemetry::sdk::trace::config().with_resource(
            opentelemetry::sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                "service.name",
                "pgcluster-controller",
            )]),
        ))
        .install_batch(opentelemetry::runtime::Tokio)?;
    Ok(tracer)
}

/// Initialize tracing
pub async fn init() -> anyhow::Result<()> {
    // Setup tracing layers
    #[cfg(feature = "telemetry")]
    let telemetry = tracing_opentelemetry::layer().with_tracer(init_tracer().await?);
    let logger = tracing_subscriber::fmt::layer()
        .compact()
        .with_line_number(true)
        .with_target(true);
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    // Decide on layers
    #[cfg(feature = "telemetry")]
    let collector = Registry::default().with(telemetry).with(logger).with(env_filter);
    #[cfg(not(feature = "telemetry"))]
    let collector = Registry::default().with(logger).with(env_filter);

    // Initialize tracing
    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}
