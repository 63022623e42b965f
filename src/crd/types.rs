//! Shared pool types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Role of a scale-set pool within the cluster.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PoolRole {
    Master,
    Worker,
}

impl PoolRole {
    /// Rollout order: masters are fully converged before workers are touched.
    pub const ROLLOUT_ORDER: [Self; 2] = [Self::Master, Self::Worker];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Worker => "worker",
        }
    }
}

impl std::fmt::Display for PoolRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A data disk attached to every instance of a pool.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataDiskSpec {
    /// Logical role of the disk (e.g., "etcd", "containers").
    pub role: String,
    /// Logical unit number the disk is attached at.
    pub lun: i32,
    /// Disk size in GiB.
    pub size_gb: u32,
}
