//! Rollout stage persisted as annotations on the `ManagedCluster` itself.
//!
//! The stage survives operator restarts; nothing about it is inferred from
//! instance state.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::SroError;

pub const STAGE_ANNOTATION: &str = "sro.io/rollout-stage";
pub const DEPLOYMENT_ANNOTATION: &str = "sro.io/deployment";
pub const APPLIED_GENERATION_ANNOTATION: &str = "sro.io/last-applied-generation";

/// Checkpoint of the rollout state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RolloutStage {
    #[default]
    Unset,
    DeploymentInitialized,
    ProvisioningSuccessful,
    InstancesUpgrading,
}

impl RolloutStage {
    pub const ALL: [Self; 4] = [
        Self::Unset,
        Self::DeploymentInitialized,
        Self::ProvisioningSuccessful,
        Self::InstancesUpgrading,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::DeploymentInitialized => "DeploymentInitialized",
            Self::ProvisioningSuccessful => "ProvisioningSuccessful",
            Self::InstancesUpgrading => "InstancesUpgrading",
        }
    }

    /// Whether `self -> next` is one of the five transitions the machine makes.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unset, Self::DeploymentInitialized)
                | (Self::DeploymentInitialized, Self::ProvisioningSuccessful | Self::Unset)
                | (Self::ProvisioningSuccessful, Self::InstancesUpgrading)
                | (Self::InstancesUpgrading, Self::Unset)
        )
    }
}

impl std::fmt::Display for RolloutStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => write!(f, "Unset"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl FromStr for RolloutStage {
    type Err = SroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "Unset" => Ok(Self::Unset),
            "DeploymentInitialized" => Ok(Self::DeploymentInitialized),
            "ProvisioningSuccessful" => Ok(Self::ProvisioningSuccessful),
            "InstancesUpgrading" => Ok(Self::InstancesUpgrading),
            other => Err(SroError::InvalidStage(other.to_string())),
        }
    }
}

/// Everything the machine keeps between passes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistedStage {
    pub stage: RolloutStage,
    /// Template operation reference while a deployment is being awaited.
    pub deployment: Option<String>,
    /// Generation whose rollout last ran to completion.
    pub applied_generation: Option<i64>,
}

impl PersistedStage {
    /// Read the persisted stage from resource annotations.
    pub fn from_annotations(annotations: Option<&BTreeMap<String, String>>) -> Result<Self, SroError> {
        let Some(annotations) = annotations else {
            return Ok(Self::default());
        };

        let stage = annotations
            .get(STAGE_ANNOTATION)
            .map_or(Ok(RolloutStage::Unset), |s| s.parse())?;
        let deployment = annotations
            .get(DEPLOYMENT_ANNOTATION)
            .filter(|d| !d.is_empty())
            .cloned();
        let applied_generation = annotations
            .get(APPLIED_GENERATION_ANNOTATION)
            .and_then(|g| g.parse().ok());

        Ok(Self {
            stage,
            deployment,
            applied_generation,
        })
    }

    /// Merge-patch body writing this stage. `None` removes an annotation.
    pub fn to_patch(&self) -> serde_json::Value {
        let stage = match self.stage {
            RolloutStage::Unset => serde_json::Value::Null,
            s => serde_json::Value::String(s.as_str().to_string()),
        };
        serde_json::json!({
            "metadata": {
                "annotations": {
                    STAGE_ANNOTATION: stage,
                    DEPLOYMENT_ANNOTATION: self.deployment,
                    APPLIED_GENERATION_ANNOTATION: self.applied_generation.map(|g| g.to_string()),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_round_trip_names() {
        for stage in RolloutStage::ALL {
            let parsed: RolloutStage = stage.as_str().parse().unwrap();
            assert_eq!(parsed, stage);
        }
        assert_eq!("Unset".parse::<RolloutStage>().unwrap(), RolloutStage::Unset);
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let err = "Exploding".parse::<RolloutStage>().unwrap_err();
        assert!(matches!(err, SroError::InvalidStage(_)));
    }

    #[test]
    fn test_allowed_transitions() {
        use RolloutStage::*;
        assert!(Unset.can_transition_to(DeploymentInitialized));
        assert!(DeploymentInitialized.can_transition_to(ProvisioningSuccessful));
        assert!(DeploymentInitialized.can_transition_to(Unset));
        assert!(ProvisioningSuccessful.can_transition_to(InstancesUpgrading));
        assert!(InstancesUpgrading.can_transition_to(Unset));

        assert!(!Unset.can_transition_to(InstancesUpgrading));
        assert!(!ProvisioningSuccessful.can_transition_to(Unset));
        assert!(!InstancesUpgrading.can_transition_to(DeploymentInitialized));
        assert!(!Unset.can_transition_to(Unset));
    }

    #[test]
    fn test_from_missing_annotations() {
        let p = PersistedStage::from_annotations(None).unwrap();
        assert_eq!(p, PersistedStage::default());
    }

    #[test]
    fn test_from_annotations() {
        let mut a = BTreeMap::new();
        a.insert(STAGE_ANNOTATION.to_string(), "DeploymentInitialized".to_string());
        a.insert(DEPLOYMENT_ANNOTATION.to_string(), "sro-c1-abc".to_string());
        a.insert(APPLIED_GENERATION_ANNOTATION.to_string(), "4".to_string());
        let p = PersistedStage::from_annotations(Some(&a)).unwrap();
        assert_eq!(p.stage, RolloutStage::DeploymentInitialized);
        assert_eq!(p.deployment.as_deref(), Some("sro-c1-abc"));
        assert_eq!(p.applied_generation, Some(4));
    }

    #[test]
    fn test_patch_unset_removes_stage() {
        let p = PersistedStage {
            stage: RolloutStage::Unset,
            deployment: None,
            applied_generation: Some(7),
        };
        let patch = p.to_patch();
        let annotations = &patch["metadata"]["annotations"];
        assert!(annotations[STAGE_ANNOTATION].is_null());
        assert!(annotations[DEPLOYMENT_ANNOTATION].is_null());
        assert_eq!(annotations[APPLIED_GENERATION_ANNOTATION], "7");
    }

    #[test]
    fn test_patch_sets_stage() {
        let p = PersistedStage {
            stage: RolloutStage::InstancesUpgrading,
            deployment: None,
            applied_generation: None,
        };
        let patch = p.to_patch();
        assert_eq!(
            patch["metadata"]["annotations"][STAGE_ANNOTATION],
            "InstancesUpgrading"
        );
    }
}
