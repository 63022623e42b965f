//! Stage and status patch helpers, condition builders, and event recording.

use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Api;
use kube::Resource;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::debug;

use crate::crd::{ClusterCondition, ManagedCluster, ManagedClusterStatus};
use crate::error::{Result, SroError};
use crate::stage::PersistedStage;

const FIELD_MANAGER: &str = "sro";

/// Persist the rollout stage. This is the only write of the stage in a pass.
pub async fn patch_stage(api: &Api<ManagedCluster>, name: &str, stage: &PersistedStage) -> Result<()> {
    debug!("Patching stage for {}: stage={}", name, stage.stage);

    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&stage.to_patch()))
        .await?;
    Ok(())
}

/// Patch the status subresource of a `ManagedCluster`.
pub async fn patch_status(
    api: &Api<ManagedCluster>,
    name: &str,
    status: &ManagedClusterStatus,
) -> Result<()> {
    // The network outputs belong to the network provisioner; never write them back.
    let mut value = serde_json::to_value(status)
        .map_err(|e| SroError::KubernetesApi(format!("failed to encode status: {e}")))?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("network");
    }

    let patch = serde_json::json!({ "status": value });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Set a condition on the status. The transition time only moves when the
/// condition status changes.
pub fn set_condition(
    status: &mut ManagedClusterStatus,
    condition_type: &str,
    condition_status: &str,
    reason: &str,
    message: Option<String>,
) {
    let now = Utc::now();
    let last_transition_time = status
        .conditions
        .iter()
        .find(|c| c.r#type == condition_type && c.status == condition_status)
        .map_or(now, |c| c.last_transition_time);

    status.conditions.retain(|c| c.r#type != condition_type);
    status.conditions.push(ClusterCondition {
        r#type: condition_type.to_string(),
        status: condition_status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time,
    });
}

/// Event recorder bundled with its target `ObjectReference`.
pub struct EventRecorder {
    recorder: Recorder,
    obj_ref: ObjectReference,
}

impl EventRecorder {
    /// Create an event recorder for the given `ManagedCluster`.
    pub fn new(client: kube::Client, obj: &ManagedCluster) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
            obj_ref: obj.object_ref(&()),
        }
    }

    /// Publish a Normal event.
    pub async fn publish(&self, reason: &str, message: &str) {
        self.recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note: Some(message.into()),
                    action: reason.into(),
                    secondary: None,
                },
                &self.obj_ref,
            )
            .await
            .unwrap_or_else(|e| tracing::warn!("Failed to publish event: {}", e));
    }

    /// Publish a Warning event.
    pub async fn publish_warning(&self, reason: &str, message: &str) {
        self.recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: reason.into(),
                    note: Some(message.into()),
                    action: reason.into(),
                    secondary: None,
                },
                &self.obj_ref,
            )
            .await
            .unwrap_or_else(|e| tracing::warn!("Failed to publish warning event: {}", e));
    }
}
