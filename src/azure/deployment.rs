//! Template application through Azure Resource Manager deployments.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, info};

use super::client::RateLimitedClient;
use crate::error::Result;
use crate::rollout::template::DeploymentTemplate;

const RESOURCES_API_VERSION: &str = "2021-04-01";

/// Classified state of a template application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentState {
    /// No deployment exists under the reference.
    NotFound,
    /// Provider is still applying (`Accepted`, `Running`, ...).
    InProgress(String),
    Succeeded,
    /// `Failed` or `Canceled`, with the provider's error message if any.
    Failed(String),
}

impl DeploymentState {
    pub fn classify(provisioning_state: &str, error: Option<String>) -> Self {
        match provisioning_state {
            "Succeeded" => Self::Succeeded,
            "Failed" | "Canceled" => Self::Failed(
                error.unwrap_or_else(|| format!("deployment {}", provisioning_state.to_lowercase())),
            ),
            other => Self::InProgress(other.to_string()),
        }
    }
}

/// Template application API.
#[async_trait]
pub trait TemplateApi: Send + Sync {
    /// Submit a template; returns the operation reference to poll.
    async fn submit(&self, template: &DeploymentTemplate) -> Result<String>;

    async fn get_status(&self, operation_ref: &str) -> Result<DeploymentState>;
}

#[derive(Deserialize)]
struct DeploymentResource {
    #[serde(default)]
    properties: DeploymentProperties,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DeploymentProperties {
    #[serde(default)]
    provisioning_state: String,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// ARM deployments in one resource group.
pub struct ArmTemplateApi {
    client: Arc<RateLimitedClient>,
    subscription_id: String,
    resource_group: String,
}

impl ArmTemplateApi {
    pub const fn new(client: Arc<RateLimitedClient>, subscription_id: String, resource_group: String) -> Self {
        Self {
            client,
            subscription_id,
            resource_group,
        }
    }

    fn deployment_path(&self, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Resources/deployments/{}?api-version={}",
            self.subscription_id, self.resource_group, name, RESOURCES_API_VERSION
        )
    }
}

/// Request body for a deployment PUT.
pub fn deployment_body(template: &DeploymentTemplate) -> serde_json::Value {
    let mut properties = serde_json::json!({
        "mode": "Incremental",
        "parameters": template.parameters,
    });
    match &template.template_link {
        Some(uri) => {
            properties["templateLink"] = serde_json::json!({
                "uri": uri,
                "contentVersion": "1.0.0.0",
            });
        }
        None => properties["template"] = template.template.clone(),
    }
    serde_json::json!({
        "properties": properties,
        "tags": { "sro.io/content-hash": template.content_hash },
    })
}

#[async_trait]
impl TemplateApi for ArmTemplateApi {
    async fn submit(&self, template: &DeploymentTemplate) -> Result<String> {
        info!(
            deployment = %template.name,
            content_hash = %template.content_hash,
            "Submitting deployment"
        );
        let body = deployment_body(template);
        self.client
            .send(
                "deployment::submit",
                Method::PUT,
                &self.deployment_path(&template.name),
                Some(&body),
            )
            .await?
            .error_for_status()?;
        Ok(template.name.clone())
    }

    async fn get_status(&self, operation_ref: &str) -> Result<DeploymentState> {
        let resp = self
            .client
            .send(
                "deployment::get",
                Method::GET,
                &self.deployment_path(operation_ref),
                None,
            )
            .await?;
        if resp.is_not_found() {
            return Ok(DeploymentState::NotFound);
        }
        let resource: DeploymentResource = resp.error_for_status()?.json()?;
        let error = resource
            .properties
            .error
            .map(|e| format!("{}: {}", e.code, e.message));
        let state = DeploymentState::classify(&resource.properties.provisioning_state, error);
        debug!(deployment = operation_ref, state = ?state, "Deployment status");
        Ok(state)
    }
}
