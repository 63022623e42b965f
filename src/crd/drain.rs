//! `NodeDrain` CRD: one record per node pending or undergoing drain.
//!
//! The operator creates and deletes these objects; an external drain agent
//! cordons and evicts the node and appends a terminal condition.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Request to drain one node of a managed cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[kube(
    group = "sro.io",
    version = "v1alpha1",
    kind = "NodeDrain",
    namespaced,
    status = "NodeDrainStatus",
    printcolumn = r#"{"name":"NODE","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"CLUSTER","type":"string","jsonPath":".spec.clusterId"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeDrainSpec {
    pub node_name: String,
    pub cluster_id: String,
}

/// Terminal outcomes reported by the drain agent.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum DrainConditionType {
    Drained,
    TimedOut,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DrainCondition {
    pub r#type: DrainConditionType,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeDrainStatus {
    /// Append-only; written by the drain agent only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DrainCondition>,
}

impl NodeDrain {
    /// Object name for the drain record of `node_name` in cluster `cluster_id`.
    ///
    /// One name per node, so the API server rejects a second active record.
    pub fn object_name(cluster_id: &str, node_name: &str) -> String {
        format!("{cluster_id}-{node_name}").to_lowercase()
    }

    /// True once the drain agent has reported `Drained` or `TimedOut`.
    pub fn is_terminal(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.status.eq_ignore_ascii_case("true"))
        })
    }

    /// The terminal condition type, if one has been reported.
    pub fn outcome(&self) -> Option<DrainConditionType> {
        self.status.as_ref().and_then(|s| {
            s.conditions
                .iter()
                .find(|c| c.status.eq_ignore_ascii_case("true"))
                .map(|c| c.r#type)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_with(conditions: Vec<DrainCondition>) -> NodeDrain {
        let mut d = NodeDrain::new(
            "c1-worker-000001",
            NodeDrainSpec {
                node_name: "worker-000001".to_string(),
                cluster_id: "c1".to_string(),
            },
        );
        d.status = Some(NodeDrainStatus { conditions });
        d
    }

    #[test]
    fn test_object_name() {
        assert_eq!(NodeDrain::object_name("C1", "Master-000000"), "c1-master-000000");
    }

    #[test]
    fn test_no_status_not_terminal() {
        let mut d = drain_with(vec![]);
        d.status = None;
        assert!(!d.is_terminal());
        assert!(d.outcome().is_none());
    }

    #[test]
    fn test_drained_is_terminal() {
        let d = drain_with(vec![DrainCondition {
            r#type: DrainConditionType::Drained,
            status: "True".to_string(),
            last_transition_time: None,
        }]);
        assert!(d.is_terminal());
        assert_eq!(d.outcome(), Some(DrainConditionType::Drained));
    }

    #[test]
    fn test_timed_out_is_terminal() {
        let d = drain_with(vec![DrainCondition {
            r#type: DrainConditionType::TimedOut,
            status: "True".to_string(),
            last_transition_time: Some(Utc::now()),
        }]);
        assert_eq!(d.outcome(), Some(DrainConditionType::TimedOut));
    }

    #[test]
    fn test_false_condition_not_terminal() {
        let d = drain_with(vec![DrainCondition {
            r#type: DrainConditionType::Drained,
            status: "False".to_string(),
            last_transition_time: None,
        }]);
        assert!(!d.is_terminal());
    }
}
