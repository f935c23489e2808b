use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::MeterProviderBuilder,
    propagation::TraceContextPropagator,
    runtime,
    trace::{self, RandomIdGenerator, Sampler},
    Resource,
};
use opentelemetry_semantic_conventions::resource::{
    DEPLOYMENT_ENVIRONMENT, SERVICE_NAME, SERVICE_VERSION,
};
use prometheus::{Encoder, TextEncoder};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Initialize OTLP trace export and the Prometheus metrics registry.
pub fn init_telemetry() -> anyhow::Result<()> {
    let resource = Resource::new(vec![
        KeyValue::new(SERVICE_NAME, "perimeter-api"),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        KeyValue::new(
            DEPLOYMENT_ENVIRONMENT,
            std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        ),
    ]);

    let trace_config = trace::config()
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_max_events_per_span(64)
        .with_max_attributes_per_span(32)
        .with_resource(resource.clone());

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(otlp_endpoint.clone()),
        )
        .with_trace_config(trace_config)
        .install_batch(runtime::Tokio)?;

    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("perimeter_api=debug,tower_http=info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .with(telemetry_layer)
        .init();

    global::set_text_map_propagator(TraceContextPropagator::new());

    init_metrics(resource)?;

    tracing::info!("telemetry initialized, OTLP endpoint {}", otlp_endpoint);
    Ok(())
}

fn init_metrics(resource: Resource) -> anyhow::Result<()> {
    let prometheus_registry = prometheus::Registry::new();

    let prometheus_exporter = opentelemetry_prometheus::exporter()
        .with_registry(prometheus_registry.clone())
        .build()?;

    let meter_provider = MeterProviderBuilder::default()
        .with_reader(prometheus_exporter)
        .with_resource(resource)
        .build();

    global::set_meter_provider(meter_provider);

    PROMETHEUS_REGISTRY
        .set(prometheus_registry)
        .map_err(|_| anyhow::anyhow!("Prometheus registry already initialized"))?;

    Ok(())
}

use std::sync::OnceLock;
static PROMETHEUS_REGISTRY: OnceLock<prometheus::Registry> = OnceLock::new();

/// Render Prometheus metrics for the `/metrics` endpoint.
pub fn get_metrics() -> anyhow::Result<String> {
    let registry = PROMETHEUS_REGISTRY
        .get()
        .ok_or_else(|| anyhow::anyhow!("Prometheus registry not initialized"))?;

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}

pub fn shutdown_telemetry() {
    tracing::info!("shutting down telemetry providers");
    global::shutdown_tracer_provider();
}

/// Pipeline counters. `handle()` lazily binds against the global meter, so
/// it is safe to touch from tests and background tasks alike.
pub mod metrics {
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram},
    };
    use std::sync::OnceLock;

    pub struct Metrics {
        pub api_requests: Counter<u64>,
        pub api_errors: Counter<u64>,
        pub api_duration: Histogram<f64>,
        pub alerts_created: Counter<u64>,
        pub alerts_deduped: Counter<u64>,
        pub bans_issued: Counter<u64>,
        pub suspensions: Counter<u64>,
        pub rate_limited: Counter<u64>,
        pub forwarder_deliveries: Counter<u64>,
        pub forwarder_failures: Counter<u64>,
    }

    static METRICS: OnceLock<Metrics> = OnceLock::new();

    pub fn handle() -> &'static Metrics {
        METRICS.get_or_init(|| {
            let meter = global::meter("perimeter-api");

            Metrics {
                api_requests: meter
                    .u64_counter("api.requests")
                    .with_description("Total number of API requests")
                    .init(),

                api_errors: meter
                    .u64_counter("api.errors")
                    .with_description("Total number of API error responses")
                    .init(),

                api_duration: meter
                    .f64_histogram("api.duration")
                    .with_description("API request duration in seconds")
                    .with_unit(opentelemetry::metrics::Unit::new("s"))
                    .init(),

                alerts_created: meter
                    .u64_counter("pipeline.alerts.created")
                    .with_description("Alerts persisted after deduplication")
                    .init(),

                alerts_deduped: meter
                    .u64_counter("pipeline.alerts.deduped")
                    .with_description("Alerts suppressed by the dedupe window")
                    .init(),

                bans_issued: meter
                    .u64_counter("pipeline.bans.issued")
                    .with_description("Automatic and manual bans written")
                    .init(),

                suspensions: meter
                    .u64_counter("pipeline.suspensions")
                    .with_description("Automatic account suspensions")
                    .init(),

                rate_limited: meter
                    .u64_counter("pipeline.rate_limited")
                    .with_description("Requests rejected by the rate limiter")
                    .init(),

                forwarder_deliveries: meter
                    .u64_counter("forwarder.deliveries")
                    .with_description("Webhook deliveries that succeeded")
                    .init(),

                forwarder_failures: meter
                    .u64_counter("forwarder.failures")
                    .with_description("Webhook deliveries that exhausted retries")
                    .init(),
            }
        })
    }
}

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{Request, Response},
    middleware::Next,
};
use opentelemetry::trace::{FutureExt, TraceContextExt, Tracer};
use std::time::Instant;

/// Span + request metrics for every inbound request.
pub async fn trace_middleware(req: Request<Body>, next: Next) -> Response<Body> {
    let start = Instant::now();

    let tracer = global::tracer("perimeter-api");
    let method = req.method().to_string();
    let uri = req.uri().path().to_string();

    let matched_path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| uri.clone());

    let span = tracer
        .span_builder(format!("{} {}", method, matched_path))
        .with_kind(opentelemetry::trace::SpanKind::Server)
        .with_attributes(vec![
            KeyValue::new("http.method", method.clone()),
            KeyValue::new("http.target", uri),
        ])
        .start(&tracer);

    let cx = opentelemetry::Context::current_with_span(span);

    let m = metrics::handle();
    m.api_requests.add(
        1,
        &[
            KeyValue::new("method", method.clone()),
            KeyValue::new("endpoint", matched_path.clone()),
        ],
    );

    let response = next.run(req).with_context(cx.clone()).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16();

    let span = cx.span();
    span.set_attribute(KeyValue::new("http.status_code", i64::from(status)));

    if status >= 400 {
        m.api_errors.add(
            1,
            &[
                KeyValue::new("method", method.clone()),
                KeyValue::new("endpoint", matched_path.clone()),
                KeyValue::new("status", i64::from(status)),
            ],
        );
        if status >= 500 {
            span.set_status(opentelemetry::trace::Status::error("Server error"));
        }
    }

    m.api_duration.record(
        duration,
        &[
            KeyValue::new("method", method),
            KeyValue::new("endpoint", matched_path),
            KeyValue::new("status", i64::from(status)),
        ],
    );

    span.end();

    response
}
