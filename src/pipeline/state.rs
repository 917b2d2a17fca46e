//! Run state machine.
//!
//! `Ingest → Extract → Classify → Generate → Done`, with `Error` reachable
//! from any stage. `Done` and `Error` are terminal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::pipeline::types::Stage;

/// Phase of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Ingest,
    Extract,
    Classify,
    Generate,
    Done,
    Error,
}

impl RunPhase {
    /// Initial phase of every run.
    pub const INITIAL: RunPhase = RunPhase::Ingest;

    /// Check if this phase allows transitioning to another phase.
    pub fn can_transition_to(&self, target: RunPhase) -> bool {
        use RunPhase::*;

        matches!(
            (self, target),
            (Ingest, Extract)
                | (Extract, Classify)
                | (Classify, Generate)
                | (Generate, Done)
                | (Ingest, Error)
                | (Extract, Error)
                | (Classify, Error)
                | (Generate, Error)
        )
    }

    /// Check if this is a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// The stage admitting batches in this phase.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Ingest => Some(Stage::Ingest),
            Self::Extract => Some(Stage::Extract),
            Self::Classify => Some(Stage::Classify),
            Self::Generate => Some(Stage::Generate),
            Self::Done | Self::Error => None,
        }
    }

    /// The phase that follows a successfully drained stage.
    pub fn after_drain(&self) -> Option<RunPhase> {
        match self.stage()?.next() {
            Some(stage) => Some(stage.into()),
            None => Some(Self::Done),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Extract => "extract",
            Self::Classify => "classify",
            Self::Generate => "generate",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl From<Stage> for RunPhase {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Ingest => Self::Ingest,
            Stage::Extract => Self::Extract,
            Stage::Classify => Self::Classify,
            Stage::Generate => Self::Generate,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(Self::Ingest),
            "extract" => Ok(Self::Extract),
            "classify" => Ok(Self::Classify),
            "generate" => Ok(Self::Generate),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown run phase: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions_valid() {
        assert!(RunPhase::Ingest.can_transition_to(RunPhase::Extract));
        assert!(RunPhase::Extract.can_transition_to(RunPhase::Classify));
        assert!(RunPhase::Classify.can_transition_to(RunPhase::Generate));
        assert!(RunPhase::Generate.can_transition_to(RunPhase::Done));
        for phase in [
            RunPhase::Ingest,
            RunPhase::Extract,
            RunPhase::Classify,
            RunPhase::Generate,
        ] {
            assert!(phase.can_transition_to(RunPhase::Error));
        }
    }

    #[test]
    fn phase_transitions_invalid() {
        assert!(!RunPhase::Ingest.can_transition_to(RunPhase::Classify));
        assert!(!RunPhase::Done.can_transition_to(RunPhase::Ingest));
        assert!(!RunPhase::Error.can_transition_to(RunPhase::Extract));
        assert!(!RunPhase::Done.can_transition_to(RunPhase::Error));
        assert!(!RunPhase::Extract.can_transition_to(RunPhase::Ingest));
    }

    #[test]
    fn terminal_phases() {
        assert!(RunPhase::Done.is_terminal());
        assert!(RunPhase::Error.is_terminal());
        assert!(!RunPhase::Generate.is_terminal());
        assert_eq!(RunPhase::Done.stage(), None);
    }

    #[test]
    fn after_drain_walks_the_pipeline() {
        let mut phase = RunPhase::INITIAL;
        let mut seen = vec![phase];
        while let Some(next) = phase.after_drain() {
            assert!(phase.can_transition_to(next));
            phase = next;
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                RunPhase::Ingest,
                RunPhase::Extract,
                RunPhase::Classify,
                RunPhase::Generate,
                RunPhase::Done
            ]
        );
    }

    #[test]
    fn run_phase_serde_roundtrip() {
        let json = serde_json::to_string(&RunPhase::Classify).unwrap();
        assert_eq!(json, "\"classify\"");
        let parsed: RunPhase = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, RunPhase::Classify);
        assert_eq!("error".parse::<RunPhase>().unwrap(), RunPhase::Error);
    }
}
