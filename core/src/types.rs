//! Shared primitive types used across the simulator and the batch pipeline.

use serde::{Deserialize, Serialize};

/// Simulated time, in whole seconds since the event start.
pub type SimSeconds = u64;

/// A stable, unique identifier for any catalog entity (tile, team, player, activity).
pub type EntityId = String;

/// The canonical batch identifier.
pub type BatchId = String;

/// The canonical run identifier.
pub type RunId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Local,
    Distributed,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local       => "local",
            Self::Distributed => "distributed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local"       => Some(Self::Local),
            "distributed" => Some(Self::Distributed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending   => "pending",
            Self::Running   => "running",
            Self::Completed => "completed",
            Self::Error     => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending"   => Some(Self::Pending),
            "running"   => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "error"     => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending   => "pending",
            Self::Running   => "running",
            Self::Completed => "completed",
            Self::Failed    => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending"   => Some(Self::Pending),
            "running"   => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed"    => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_regardless_of_case_and_padding() {
        assert_eq!(ExecutionMode::parse(" Distributed\n"), Some(ExecutionMode::Distributed));
        assert_eq!(BatchStatus::parse("COMPLETED"), Some(BatchStatus::Completed));
        assert_eq!(BatchStatus::parse("  running "), Some(BatchStatus::Running));
        assert_eq!(RunStatus::parse("Failed"), Some(RunStatus::Failed));
        assert_eq!(RunStatus::parse("\tpending"), Some(RunStatus::Pending));
        assert_eq!(RunStatus::parse("done"), None);
    }

    #[test]
    fn labels_round_trip_through_as_str() {
        for status in [BatchStatus::Pending, BatchStatus::Running, BatchStatus::Completed, BatchStatus::Error] {
            assert_eq!(BatchStatus::parse(status.as_str()), Some(status));
        }
        for status in [RunStatus::Pending, RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
    }
}
