// Run Report
// Per-target terminal outcomes of a standardization run

use crate::cache::CacheStats;
use crate::error::{ErrorKind, PipelineError};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Terminal status of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Succeeded,
    Failed,
    /// Rule disabled in the configuration
    Skipped,
}

/// One target's entry in the run report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub target_id: String,
    pub status: TargetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock time across all attempts, backoff included
    pub duration: Duration,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
}

impl TargetReport {
    pub fn succeeded(
        target_id: impl Into<String>,
        duration: Duration,
        attempts: u32,
        output_path: Option<String>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            status: TargetStatus::Succeeded,
            error_kind: None,
            error: None,
            duration,
            attempts,
            output_path,
        }
    }

    pub fn failed(
        target_id: impl Into<String>,
        error: &PipelineError,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            status: TargetStatus::Failed,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
            duration,
            attempts,
            output_path: None,
        }
    }

    pub fn skipped(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            status: TargetStatus::Skipped,
            error_kind: None,
            error: None,
            duration: Duration::ZERO,
            attempts: 0,
            output_path: None,
        }
    }
}

/// Outcome of a run, one entry per configured rule in configuration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub entries: Vec<TargetReport>,
    pub duration: Duration,
    pub cache: CacheStats,
}

impl RunReport {
    pub fn get(&self, target_id: &str) -> Option<&TargetReport> {
        self.entries.iter().find(|e| e.target_id == target_id)
    }

    pub fn count(&self, status: TargetStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(TargetStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(TargetStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(TargetStatus::Skipped)
    }

    /// True when no target failed and at least one succeeded
    pub fn success(&self) -> bool {
        self.failed() == 0 && self.succeeded() > 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &TargetReport> {
        self.entries
            .iter()
            .filter(|e| e.status == TargetStatus::Failed)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
