//! Aggregated search response.

use scatter_common::ShardSearchFailure;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::results::SearchHit;

/// Per-request shard counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStats {
    pub total: usize,
    pub successful: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub total_hits: u64,
    pub max_score: Option<f32>,
    pub shards: ShardStats,
    /// Non-fatal shard failures, in shard order.
    pub shard_failures: Vec<ShardSearchFailure>,
    pub took_ms: u64,
    pub point_in_time_id: Option<String>,
}

impl SearchResponse {
    /// Response of a request that matched no shards.
    pub fn empty(took_ms: u64, point_in_time_id: Option<String>) -> Self {
        Self {
            hits: Vec::new(),
            total_hits: 0,
            max_score: None,
            shards: ShardStats::default(),
            shard_failures: Vec::new(),
            took_ms,
            point_in_time_id,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.shards.failed > 0
    }

    /// Client-facing JSON body.
    pub fn to_json(&self) -> Value {
        let failures: Vec<Value> = self
            .shard_failures
            .iter()
            .map(|f| {
                json!({
                    "shard": f.shard_id.as_ref().map(|s| s.id),
                    "index": f.index(),
                    "node": f.target.as_ref().map(|t| t.to_string()),
                    "reason": {
                        "type": f.cause.kind(),
                        "reason": f.reason(),
                    },
                    "status": f.cause.status(),
                })
            })
            .collect();
        let mut body = json!({
            "took": self.took_ms,
            "_shards": {
                "total": self.shards.total,
                "successful": self.shards.successful,
                "skipped": self.shards.skipped,
                "failed": self.shards.failed,
            },
            "hits": {
                "total": self.total_hits,
                "max_score": self.max_score,
                "hits": self.hits,
            },
        });
        if !failures.is_empty() {
            body["_shards"]["failures"] = Value::Array(failures);
        }
        if let Some(pit) = &self.point_in_time_id {
            body["pit_id"] = Value::String(pit.clone());
        }
        body
    }
}
