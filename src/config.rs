//! Operator configuration from flags and environment.

use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;

use crate::azure::credentials::ServicePrincipal;
use crate::error::{Result, SroError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Scale set rollout operator for managed Kubernetes clusters on Azure.
#[derive(Parser, Debug, Clone)]
#[command(name = "sro")]
#[command(about = "Rolls out scale-set nodes of managed Kubernetes clusters on Azure")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Config {
    /// Port for /healthz and /readyz
    #[arg(long, env = "HEALTH_PORT", default_value = "8080")]
    pub health_port: u16,

    /// Port for /metrics
    #[arg(long, env = "METRICS_PORT", default_value = "8081")]
    pub metrics_port: u16,

    /// Log format: json or pretty
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Requeue interval while a rollout is active
    #[arg(long, env = "POLL_INTERVAL_SECONDS", default_value = "30")]
    pub poll_interval_seconds: u64,

    /// Timeout for each Azure API request
    #[arg(long, env = "API_TIMEOUT_SECONDS", default_value = "30")]
    pub api_timeout_seconds: u64,

    /// Lifetime of cached per-cluster Azure clients
    #[arg(long, env = "CLIENT_CACHE_TTL_SECONDS", default_value = "600")]
    pub client_cache_ttl_seconds: u64,

    /// Azure Resource Manager endpoint
    #[arg(long, env = "ARM_ENDPOINT", default_value = "https://management.azure.com")]
    pub arm_endpoint: String,

    /// Azure AD login endpoint
    #[arg(long, env = "LOGIN_ENDPOINT", default_value = "https://login.microsoftonline.com")]
    pub login_endpoint: String,

    /// Base URL templates are published under; templates are sent inline when unset
    #[arg(long, env = "TEMPLATE_BASE_URL")]
    pub template_base_url: Option<String>,

    /// Tenant of the static service principal
    #[arg(long, env = "AZURE_TENANT_ID")]
    pub azure_tenant_id: Option<String>,

    /// Client id of the static service principal
    #[arg(long, env = "AZURE_CLIENT_ID")]
    pub azure_client_id: Option<String>,

    /// Client secret of the static service principal
    #[arg(long, env = "AZURE_CLIENT_SECRET", hide_env_values = true)]
    pub azure_client_secret: Option<String>,

    /// Subscription of the static service principal
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID")]
    pub azure_subscription_id: Option<String>,

    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Print the CRDs as YAML and exit
    #[arg(long, default_value = "false")]
    pub print_crds: bool,
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Reject inconsistent settings before anything starts.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("azure-tenant-id", self.azure_tenant_id.as_deref()),
            ("azure-client-id", self.azure_client_id.as_deref()),
            ("azure-client-secret", self.azure_client_secret.as_deref()),
            ("azure-subscription-id", self.azure_subscription_id.as_deref()),
        ];
        let set = fields
            .iter()
            .filter(|(_, v)| v.is_some_and(|v| !v.is_empty()))
            .count();
        if set != 0 && set != fields.len() {
            let missing: Vec<&str> = fields
                .iter()
                .filter(|(_, v)| v.is_none_or(str::is_empty))
                .map(|(name, _)| *name)
                .collect();
            return Err(SroError::Config(format!(
                "static credentials are incomplete, missing: {}",
                missing.join(", ")
            )));
        }

        if self.poll_interval_seconds == 0 {
            return Err(SroError::Config("poll-interval-seconds must be positive".to_string()));
        }
        if self.api_timeout_seconds == 0 {
            return Err(SroError::Config("api-timeout-seconds must be positive".to_string()));
        }
        Ok(())
    }

    /// The static service principal, when all of its flags are set.
    pub fn static_principal(&self) -> Option<ServicePrincipal> {
        Some(ServicePrincipal {
            tenant_id: self.azure_tenant_id.clone().filter(|v| !v.is_empty())?,
            client_id: self.azure_client_id.clone().filter(|v| !v.is_empty())?,
            client_secret: SecretString::from(
                self.azure_client_secret.clone().filter(|v| !v.is_empty())?,
            ),
            subscription_id: self.azure_subscription_id.clone().filter(|v| !v.is_empty())?,
        })
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub const fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }

    pub const fn client_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.client_cache_ttl_seconds)
    }

    pub fn display(&self) {
        tracing::info!(
            health_port = self.health_port,
            metrics_port = self.metrics_port,
            poll_interval_seconds = self.poll_interval_seconds,
            api_timeout_seconds = self.api_timeout_seconds,
            client_cache_ttl_seconds = self.client_cache_ttl_seconds,
            arm_endpoint = %self.arm_endpoint,
            template_base_url = ?self.template_base_url,
            watch_namespace = ?self.watch_namespace,
            static_credentials = self.azure_client_id.is_some(),
            "Configuration initialized"
        );
    }
}
