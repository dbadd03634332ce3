//! Types for the comprehensive listing / merge read path.

use serde::{Deserialize, Serialize};

use crate::instance::Instance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Local,
    Novita,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataConsistency {
    Consistent,
    LocalNewer,
    NovitaNewer,
    Conflicted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComprehensiveInstanceView {
    #[serde(flatten)]
    pub instance: Instance,
    pub source: Source,
    pub data_consistency: DataConsistency,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePerformance {
    pub local_fetch_ms: u64,
    pub provider_fetch_ms: u64,
    pub merge_ms: u64,
    pub total_ms: u64,
    pub cache_hit_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComprehensiveListResponse {
    pub instances: Vec<ComprehensiveInstanceView>,
    pub performance: MergePerformance,
}
