//! Saga status state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The status of a saga instance in its lifecycle.
///
/// State transitions:
/// ```text
/// Started ──► Running ──┬──► Completed
///                       ├──► Retrying ──► Running
///                       ├──► Failed
///                       └──► Compensating ──┬──► Compensated
///                                           └──► CompensationFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Saga has been created but no step has run yet.
    #[default]
    Started,

    /// A step is being executed.
    Running,

    /// The current step failed transiently and is scheduled to run again.
    Retrying,

    /// A step failed and compensating actions are in progress.
    Compensating,

    /// All steps completed successfully (terminal state).
    Completed,

    /// A step failed before anything needed undoing (terminal state).
    Failed,

    /// Compensation finished after a failure (terminal state).
    Compensated,

    /// Compensation exhausted its retries; needs an operator (terminal state).
    CompensationFailed,
}

impl SagaStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [SagaStatus; 8] = [
        SagaStatus::Started,
        SagaStatus::Running,
        SagaStatus::Retrying,
        SagaStatus::Compensating,
        SagaStatus::Completed,
        SagaStatus::Failed,
        SagaStatus::Compensated,
        SagaStatus::CompensationFailed,
    ];

    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Started, Running)
                | (Started, Compensating)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Running, Compensating)
                | (Retrying, Running)
                | (Retrying, Compensating)
                | (Compensating, Compensated)
                | (Compensating, CompensationFailed)
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::Failed
                | SagaStatus::Compensated
                | SagaStatus::CompensationFailed
        )
    }

    /// Returns true if a recovery sweep may pick this saga up again.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            SagaStatus::Running | SagaStatus::Retrying | SagaStatus::Compensating
        )
    }

    /// Returns the status name as stored and logged.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Started => "STARTED",
            SagaStatus::Running => "RUNNING",
            SagaStatus::Retrying => "RETRYING",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Failed => "FAILED",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::CompensationFailed => "COMPENSATION_FAILED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::UnknownVariant {
                kind: "saga status",
                value: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_started() {
        assert_eq!(SagaStatus::default(), SagaStatus::Started);
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(SagaStatus::Started.can_transition_to(SagaStatus::Running));
        assert!(SagaStatus::Running.can_transition_to(SagaStatus::Running));
        assert!(SagaStatus::Running.can_transition_to(SagaStatus::Completed));
    }

    #[test]
    fn test_retry_loop() {
        assert!(SagaStatus::Running.can_transition_to(SagaStatus::Retrying));
        assert!(SagaStatus::Retrying.can_transition_to(SagaStatus::Running));
        assert!(!SagaStatus::Retrying.can_transition_to(SagaStatus::Completed));
    }

    #[test]
    fn test_compensation_transitions() {
        assert!(SagaStatus::Running.can_transition_to(SagaStatus::Compensating));
        assert!(SagaStatus::Compensating.can_transition_to(SagaStatus::Compensated));
        assert!(SagaStatus::Compensating.can_transition_to(SagaStatus::CompensationFailed));
        assert!(!SagaStatus::Compensating.can_transition_to(SagaStatus::Running));
    }

    #[test]
    fn test_terminal_states_never_transition() {
        for from in SagaStatus::ALL.into_iter().filter(SagaStatus::is_terminal) {
            for to in SagaStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SagaStatus::Started.is_terminal());
        assert!(!SagaStatus::Running.is_terminal());
        assert!(!SagaStatus::Retrying.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::CompensationFailed.is_terminal());
    }

    #[test]
    fn test_round_trips_through_str() {
        for status in SagaStatus::ALL {
            assert_eq!(status.as_str().parse::<SagaStatus>().unwrap(), status);
        }
        assert!("PAUSED".parse::<SagaStatus>().is_err());
    }

    #[test]
    fn test_serialization_matches_column_value() {
        let json = serde_json::to_string(&SagaStatus::CompensationFailed).unwrap();
        assert_eq!(json, "\"COMPENSATION_FAILED\"");
    }
}
