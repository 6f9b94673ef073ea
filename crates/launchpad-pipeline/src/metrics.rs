//! Prometheus metrics and the `/metrics` + `/health` endpoint

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

const MINT_DURATION_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0];

/// Pipeline metrics registered on their own registry
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    reservations_total: IntCounterVec,
    queue_messages_total: IntCounterVec,
    chain_submissions_total: IntCounterVec,
    mint_duration: HistogramVec,
    lock_held: IntGauge,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reservations_total = IntCounterVec::new(
            Opts::new("launchpad_reservations_total", "Reservation attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(reservations_total.clone()))?;

        let queue_messages_total = IntCounterVec::new(
            Opts::new("launchpad_queue_messages_total", "Mint queue messages by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(queue_messages_total.clone()))?;

        let chain_submissions_total = IntCounterVec::new(
            Opts::new(
                "launchpad_chain_submissions_total",
                "Backend transaction submissions",
            ),
            &["operation", "result"],
        )?;
        registry.register(Box::new(chain_submissions_total.clone()))?;

        let mint_duration = HistogramVec::new(
            HistogramOpts::new(
                "launchpad_mint_duration_seconds",
                "Time from message receipt to commit",
            )
            .buckets(MINT_DURATION_BUCKETS.to_vec()),
            &["operation"],
        )?;
        registry.register(Box::new(mint_duration.clone()))?;

        let lock_held = IntGauge::new(
            "launchpad_mint_lock_held",
            "1 while this process owns the mint lock",
        )?;
        registry.register(Box::new(lock_held.clone()))?;

        Ok(Self {
            registry,
            reservations_total,
            queue_messages_total,
            chain_submissions_total,
            mint_duration,
            lock_held,
        })
    }

    pub fn reservation(&self, outcome: &str) {
        self.reservations_total.with_label_values(&[outcome]).inc();
    }

    pub fn queue_message(&self, outcome: &str) {
        self.queue_messages_total.with_label_values(&[outcome]).inc();
    }

    pub fn chain_submission(&self, operation: &str, result: &str) {
        self.chain_submissions_total
            .with_label_values(&[operation, result])
            .inc();
    }

    pub fn observe_mint(&self, operation: &str, seconds: f64) {
        self.mint_duration
            .with_label_values(&[operation])
            .observe(seconds);
    }

    pub fn set_lock_held(&self, held: bool) {
        self.lock_held.set(i64::from(held));
    }

    pub fn reservation_count(&self, outcome: &str) -> u64 {
        self.reservations_total.with_label_values(&[outcome]).get()
    }

    pub fn queue_message_count(&self, outcome: &str) -> u64 {
        self.queue_messages_total.with_label_values(&[outcome]).get()
    }

    /// Prometheus text exposition of every registered metric
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Start the metrics server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<PipelineMetrics>,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Metrics server listening on {}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    Ok(handle)
}

/// Health check handler
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().timestamp(),
        "service": "launchpad-pipeline"
    }))
}

async fn metrics_handler(State(metrics): State<Arc<PipelineMetrics>>) -> Result<String, StatusCode> {
    metrics
        .encode_text()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
