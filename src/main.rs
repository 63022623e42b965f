//! sro - Scale set Rollout Operator for managed Kubernetes clusters on Azure.
//!
//! Watches `ManagedCluster` resources, applies their infrastructure template
//! and rolls scale-set nodes one at a time, draining through `NodeDrain`
//! records before every reimage.

mod azure;
mod config;
mod controller;
mod crd;
mod drain;
mod error;
mod logging;
mod nodes;
mod rollout;
mod stage;
mod status;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::StreamExt;
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, CustomResourceExt};
use tracing::{error, info};

use azure::AzureFactory;
use azure::credentials::{ClusterCredentialProvider, SecretCredentialProvider, StaticCredentialProvider};
use config::{BUILD_DATE, COMMIT, Config, VERSION};
use controller::Context;
use crd::{ManagedCluster, NodeDrain};
use nodes::KubeNodeVersionSource;
use rollout::{SecretBootstrapStore, TemplateBuilder};

#[tokio::main]
async fn main() {
    let config = Config::from_args();

    if config.print_crds {
        if let Err(e) = print_crds() {
            eprintln!("Failed to render CRDs: {e}");
            std::process::exit(1);
        }
        return;
    }

    logging::init(&config.log_format, &config.log_level);

    info!(
        "Starting sro v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );

    if let Err(e) = run(config).await {
        error!("Operator failed: {:#}", e);
        std::process::exit(1);
    }
}

fn print_crds() -> Result<()> {
    let managed_cluster = serde_yaml::to_string(&ManagedCluster::crd())?;
    let node_drain = serde_yaml::to_string(&NodeDrain::crd())?;
    print!("{managed_cluster}---\n{node_drain}");
    Ok(())
}

/// Main operator loop.
async fn run(config: Config) -> Result<()> {
    config.validate()?;
    config.display();

    let client = kube::Client::try_default()
        .await
        .context("Failed to build Kubernetes client")?;
    info!("Connected to Kubernetes API server");

    // Initialize Prometheus metrics
    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(telemetry::metrics::Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = telemetry::health::HealthState::new();
    let health_state_clone = health_state.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::health::serve(health_port, health_state_clone).await {
            error!("Health server failed: {}", e);
        }
    });

    let registry_clone = registry.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::metrics::serve(metrics_port, registry_clone).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let http = reqwest::Client::builder()
        .timeout(config.api_timeout())
        .build()
        .context("Failed to build HTTP client")?;
    let static_provider = config.static_principal().map(|sp| {
        info!(subscription = %sp.subscription_id, "Static Azure credentials configured");
        StaticCredentialProvider::new(sp, &config.login_endpoint, http.clone())
    });
    let credentials = ClusterCredentialProvider::new(
        static_provider,
        SecretCredentialProvider::new(client.clone(), &config.login_endpoint, http),
    );

    let azure = AzureFactory::new(
        Arc::new(credentials),
        Some(metrics.clone()),
        &config.arm_endpoint,
        config.api_timeout(),
        config.client_cache_ttl(),
    );

    let ctx = Arc::new(Context {
        kube_client: client.clone(),
        azure,
        versions: KubeNodeVersionSource::new(client.clone()),
        bootstrap: SecretBootstrapStore::new(client.clone()),
        builder: TemplateBuilder::new(config.template_base_url.clone()),
        metrics,
        health: health_state.clone(),
        poll_interval: config.poll_interval(),
    });

    let (clusters, drains): (Api<ManagedCluster>, Api<NodeDrain>) = match &config.watch_namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    // Mark as ready once controller starts
    health_state.set_ready(true);

    info!("Starting ManagedCluster controller");
    Controller::new(clusters, WatcherConfig::default())
        .owns(drains, WatcherConfig::default())
        .shutdown_on_signal()
        .run(controller::reconcile, controller::error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("Reconciled: {:?}", o),
                Err(e) => error!("Reconcile failed: {:?}", e),
            }
        })
        .await;

    info!("Controller stopped");
    Ok(())
}
