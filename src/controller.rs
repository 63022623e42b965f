//! `ManagedCluster` controller - reconcile dispatch and error policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::azure::AzureFactory;
use crate::crd::{ManagedCluster, ManagedClusterStatus};
use crate::drain::KubeDrainCoordinator;
use crate::error::{Result, SroError};
use crate::nodes::KubeNodeVersionSource;
use crate::rollout::{PassEvent, PassOutcome, SecretBootstrapStore, StageMachine, TemplateBuilder};
use crate::stage::PersistedStage;
use crate::status;
use crate::telemetry::health::HealthState;
use crate::telemetry::metrics::Metrics;

const TRANSIENT_REQUEUE: Duration = Duration::from_secs(10);
const ERROR_REQUEUE: Duration = Duration::from_secs(60);
const MIN_RATE_LIMIT_REQUEUE: Duration = Duration::from_secs(1);

/// Shared context for the controller.
pub struct Context {
    pub kube_client: kube::Client,
    pub azure: AzureFactory,
    pub versions: KubeNodeVersionSource,
    pub bootstrap: SecretBootstrapStore,
    pub builder: TemplateBuilder,
    pub metrics: Arc<Metrics>,
    pub health: HealthState,
    pub poll_interval: Duration,
}

/// Reconcile a `ManagedCluster`: one stage machine pass.
pub async fn reconcile(obj: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let cluster_id = obj.spec.cluster_id.clone();

    let result = reconcile_pass(&obj, &ctx).await;

    let label = match &result {
        Ok(_) => "success",
        Err(e) if e.is_rate_limited() => "rate_limited",
        Err(_) => "error",
    };
    ctx.metrics
        .record_reconcile(&cluster_id, label, started.elapsed().as_secs_f64());
    ctx.health.mark_progress(Utc::now());

    if let Err(e) = &result
        && needs_fresh_credentials(e)
    {
        warn!(cluster = %cluster_id, "Dropping cached Azure clients: {}", e);
        ctx.azure.invalidate(&cluster_id);
    }
    result
}

async fn reconcile_pass(obj: &ManagedCluster, ctx: &Context) -> Result<Action> {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let cluster_id = obj.spec.cluster_id.as_str();
    let api: Api<ManagedCluster> = Api::namespaced(ctx.kube_client.clone(), &namespace);

    let current = PersistedStage::from_annotations(obj.metadata.annotations.as_ref())?;
    debug!(cluster = cluster_id, stage = %current.stage, "Reconciling {}/{}", namespace, name);

    let clients = ctx.azure.for_cluster(obj).await?;
    let drains = KubeDrainCoordinator::for_cluster(ctx.kube_client.clone(), obj);
    let machine = StageMachine {
        templates: &clients.templates,
        scale_sets: &clients.scale_sets,
        drains: &drains,
        versions: &ctx.versions,
        bootstrap: &ctx.bootstrap,
        builder: &ctx.builder,
    };

    let outcome = machine.run_pass(obj, &current).await?;

    if let Some(next) = &outcome.next {
        status::patch_stage(&api, &name, next).await?;
        info!(cluster = cluster_id, from = %current.stage, to = %next.stage, "Stage transition");
    }
    ctx.metrics.set_stage(cluster_id, outcome.stage_after(&current));
    if let Some((pool, action)) = outcome.event.pool_action() {
        ctx.metrics.record_action(cluster_id, pool, action);
    }

    if let Some(reason) = outcome.event.reason() {
        let message = outcome.event.to_string();
        let recorder = status::EventRecorder::new(ctx.kube_client.clone(), obj);
        if outcome.event.is_failure() {
            recorder.publish_warning(reason, &message).await;
        } else {
            recorder.publish(reason, &message).await;
        }

        let mut new_status = obj.status.clone().unwrap_or_default();
        apply_event(&mut new_status, &outcome.event);
        new_status.observed_generation = obj.metadata.generation.unwrap_or(0);
        if let Err(e) = status::patch_status(&api, &name, &new_status).await {
            warn!("Failed to patch status for {}: {}", name, e);
        }
    } else if let PassEvent::Waiting(reason) = &outcome.event {
        debug!(cluster = cluster_id, stage = %current.stage, "Waiting: {}", reason);
    }

    Ok(requeue_after(&outcome, ctx.poll_interval))
}

/// Record a pass event on the status.
fn apply_event(status: &mut ManagedClusterStatus, event: &PassEvent) {
    status.last_action = Some(event.to_string());
    match event {
        PassEvent::TemplateSubmitted { .. } => {
            status::set_condition(status, "Provisioned", "False", "Provisioning", None);
            status::set_condition(status, "Ready", "False", "RolloutInProgress", None);
        }
        PassEvent::ProvisioningSucceeded { .. } => {
            status::set_condition(status, "Provisioned", "True", "DeploymentSucceeded", None);
        }
        PassEvent::ProvisioningFailed { message, .. } => {
            status::set_condition(
                status,
                "Provisioned",
                "False",
                "DeploymentFailed",
                Some(message.clone()),
            );
        }
        PassEvent::UpgradeStarted
        | PassEvent::ModelUpdated { .. }
        | PassEvent::DrainRequested { .. }
        | PassEvent::Reimaged { .. } => {
            status::set_condition(
                status,
                "Ready",
                "False",
                "InstancesUpgrading",
                Some(event.to_string()),
            );
        }
        PassEvent::CycleCompleted => {
            status::set_condition(status, "Ready", "True", "Converged", None);
        }
        PassEvent::Idle | PassEvent::Waiting(_) => {}
    }
}

fn requeue_after(outcome: &PassOutcome, poll_interval: Duration) -> Action {
    match outcome.event {
        PassEvent::Idle => Action::await_change(),
        _ => Action::requeue(poll_interval),
    }
}

fn needs_fresh_credentials(err: &SroError) -> bool {
    matches!(
        err,
        SroError::Credentials(_) | SroError::Azure { status: 401 | 403, .. }
    )
}

/// Delay before retrying a failed reconcile.
fn retry_delay(err: &SroError, now: DateTime<Utc>) -> Duration {
    if let Some(retry_at) = err.retry_at() {
        return (retry_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(MIN_RATE_LIMIT_REQUEUE);
    }
    if err.is_transient() {
        TRANSIENT_REQUEUE
    } else {
        ERROR_REQUEUE
    }
}

/// Error policy for the controller.
pub fn error_policy(obj: Arc<ManagedCluster>, err: &SroError, _ctx: Arc<Context>) -> Action {
    let delay = retry_delay(err, Utc::now());
    if err.is_rate_limited() {
        warn!(
            cluster = %obj.spec.cluster_id,
            retry_in_secs = delay.as_secs(),
            "Rate limited: {}",
            err
        );
    } else {
        error!(
            cluster = %obj.spec.cluster_id,
            retry_in_secs = delay.as_secs(),
            "Reconcile failed for {}: {}",
            obj.name_any(),
            err
        );
    }
    Action::requeue(delay)
}
