//! Shared result types for node execution.
//!
//! These are plain values: produced once per executed node, never mutated.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome classification for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Success,
    Failure,
    Skipped,
}

/// Immutable result of running (or skipping) one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    pub status: NodeStatus,
    pub output: String,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeResult {
    pub fn success(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: NodeStatus::Success,
            output: output.into(),
            duration,
            error: None,
        }
    }

    pub fn failure(output: impl Into<String>, duration: Duration, error: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Failure,
            output: output.into(),
            duration,
            error: Some(error.into()),
        }
    }

    /// Result recorded for a node whose skip predicate held. Zero duration.
    pub fn skipped() -> Self {
        Self {
            status: NodeStatus::Skipped,
            output: String::new(),
            duration: Duration::ZERO,
            error: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == NodeStatus::Failure
    }
}

/// Token accounting reported by agent dispatchers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_duration_as_millis_and_omits_empty_error() {
        let result = NodeResult::success("ok", Duration::from_millis(1500));
        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["status"], "success");
        assert_eq!(json["duration_ms"], 1500);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn skipped_has_zero_duration() {
        let result = NodeResult::skipped();
        assert_eq!(result.status, NodeStatus::Skipped);
        assert_eq!(result.duration, Duration::ZERO);
        assert!(!result.is_failure());
    }
}
