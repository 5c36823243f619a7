//! Core record shapes shared by the ingestion and serving pipelines.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "kubetools-core";

/// Synthetic category that matches every record.
pub const ALL_CATEGORIES: &str = "All";

/// Fixed namespace key the vote map is persisted under.
pub const VOTES_STORAGE_KEY: &str = "kubetools-votes";

/// File name of the dataset artifact inside the data directory.
pub const DATASET_FILE_NAME: &str = "tools.json";

/// One cataloged tool.
///
/// `id` is assigned in row-encounter order during a single parse run and is only stable
/// across runs when the source ordering is. `category` is never absent: it is the nearest
/// preceding section header or the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub id: u32,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub stars: u64,
}

/// Ordered sequence of records, written once per ingestion run.
pub type Dataset = Vec<ToolRecord>;

/// Per-tool local vote counts keyed by [`ToolRecord::id`].
///
/// Serialized as a JSON object whose keys are the stringified ids.
pub type VoteMap = BTreeMap<u32, u64>;
