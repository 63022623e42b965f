//! Prometheus metrics for the sro operator.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::crd::PoolRole;
use crate::stage::RolloutStage;

/// Labels for reconcile metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub cluster: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub cluster: String,
}

/// Labels for the stage gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    pub cluster: String,
    pub stage: String,
}

/// Labels for rollout actions.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ActionLabels {
    pub cluster: String,
    pub pool: String,
    pub action: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ApiCallLabels {
    pub operation: String,
    pub code: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: String,
}

/// All Prometheus metrics for the operator.
pub struct Metrics {
    pub reconcile_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Family<ClusterLabels, Histogram>,
    pub rollout_stage_info: Family<StageLabels, Gauge>,
    pub rollout_action_total: Family<ActionLabels, Counter>,
    pub api_request_duration_seconds: Family<ApiCallLabels, Histogram>,
    pub api_request_attempts_total: Family<OperationLabels, Counter>,
    pub api_rate_limited_total: Family<OperationLabels, Counter>,
}

const RECONCILE_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

const API_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "sro_reconcile",
            "Total number of reconcile calls",
            reconcile_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(RECONCILE_BUCKETS.iter().copied())
            });
        registry.register(
            "sro_reconcile_duration_seconds",
            "Duration of reconcile calls in seconds",
            reconcile_duration_seconds.clone(),
        );

        let rollout_stage_info = Family::<StageLabels, Gauge>::default();
        registry.register(
            "sro_rollout_stage_info",
            "Current rollout stage (1=active, 0=inactive)",
            rollout_stage_info.clone(),
        );

        let rollout_action_total = Family::<ActionLabels, Counter>::default();
        registry.register(
            "sro_rollout_action",
            "Total number of mutating rollout actions issued",
            rollout_action_total.clone(),
        );

        let api_request_duration_seconds =
            Family::<ApiCallLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(API_BUCKETS.iter().copied())
            });
        registry.register(
            "sro_api_request_duration_seconds",
            "Duration of Azure API requests in seconds",
            api_request_duration_seconds.clone(),
        );

        let api_request_attempts_total = Family::<OperationLabels, Counter>::default();
        registry.register(
            "sro_api_request_attempts",
            "Total number of Azure API requests that passed the backpressure gate",
            api_request_attempts_total.clone(),
        );

        let api_rate_limited_total = Family::<OperationLabels, Counter>::default();
        registry.register(
            "sro_api_rate_limited",
            "Total number of Azure API requests answered with 429",
            api_rate_limited_total.clone(),
        );

        Self {
            reconcile_total,
            reconcile_duration_seconds,
            rollout_stage_info,
            rollout_action_total,
            api_request_duration_seconds,
            api_request_attempts_total,
            api_rate_limited_total,
        }
    }

    pub fn record_reconcile(&self, cluster: &str, result: &str, secs: f64) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                cluster: cluster.to_string(),
                result: result.to_string(),
            })
            .inc();
        self.reconcile_duration_seconds
            .get_or_create(&ClusterLabels {
                cluster: cluster.to_string(),
            })
            .observe(secs);
    }

    /// Set the stage gauge: 1 for `current`, 0 for every other stage.
    pub fn set_stage(&self, cluster: &str, current: RolloutStage) {
        for stage in RolloutStage::ALL {
            self.rollout_stage_info
                .get_or_create(&StageLabels {
                    cluster: cluster.to_string(),
                    stage: stage.to_string(),
                })
                .set(i64::from(stage == current));
        }
    }

    pub fn record_action(&self, cluster: &str, pool: PoolRole, action: &str) {
        self.rollout_action_total
            .get_or_create(&ActionLabels {
                cluster: cluster.to_string(),
                pool: pool.to_string(),
                action: action.to_string(),
            })
            .inc();
    }

    /// Called once per request that reaches the network.
    pub fn record_api_attempt(&self, operation: &str) {
        self.api_request_attempts_total
            .get_or_create(&OperationLabels {
                operation: operation.to_string(),
            })
            .inc();
    }

    pub fn record_api_call(&self, operation: &str, code: &str, secs: f64) {
        self.api_request_duration_seconds
            .get_or_create(&ApiCallLabels {
                operation: operation.to_string(),
                code: code.to_string(),
            })
            .observe(secs);
        if code == "429" {
            self.api_rate_limited_total
                .get_or_create(&OperationLabels {
                    operation: operation.to_string(),
                })
                .inc();
        }
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Metrics server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
