//! Orchestrator state machine.
//!
//! ```text
//! Init ─> Validate ─> InstallOverrides ─> [Align] ─┐
//!                                                  ▼
//!        ┌──────────── RowSetup ─> PreRoll ─> Arm ─> Fly ─> Drain ─> RowDone ─┐
//!        └────────────────────────────────────────────────────────────────────┤
//!                                                                             ▼
//!  (any running state) ─> Error ─────────────────────────────> RestoreOverrides ─> Done
//! ```
//!
//! `RestoreOverrides` is entered exactly once per run, from `RowDone` on success or
//! from `Error` on failure.

use serde::{Deserialize, Serialize};

/// State of a fly-scan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorState {
    /// Run created, nothing checked yet
    Init,
    /// Checking the scan request
    Validate,
    /// Installing process-wide overrides (deadbands, trigger sources, shutter)
    InstallOverrides,
    /// Peak-up at the start position
    Align,
    /// Configuring detectors and the trigger buffer for a row
    RowSetup,
    /// Moving to the pre-roll position and converging
    PreRoll,
    /// Setting fly velocity, arming detectors, kicking off the trigger buffer
    Arm,
    /// Triggering detectors and flying the fast axis
    Fly,
    /// Stopping the scaler, completing and collecting the trigger buffer
    Drain,
    /// Row finished
    RowDone,
    /// A failure or abort was observed
    Error,
    /// Putting back every override
    RestoreOverrides,
    /// Run finished
    Done,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrchestratorState::Init => "INIT",
            OrchestratorState::Validate => "VALIDATE",
            OrchestratorState::InstallOverrides => "INSTALL_OVERRIDES",
            OrchestratorState::Align => "ALIGN",
            OrchestratorState::RowSetup => "ROW_SETUP",
            OrchestratorState::PreRoll => "PRE_ROLL",
            OrchestratorState::Arm => "ARM",
            OrchestratorState::Fly => "FLY",
            OrchestratorState::Drain => "DRAIN",
            OrchestratorState::RowDone => "ROW_DONE",
            OrchestratorState::Error => "ERROR",
            OrchestratorState::RestoreOverrides => "RESTORE_OVERRIDES",
            OrchestratorState::Done => "DONE",
        };
        f.write_str(name)
    }
}

impl OrchestratorState {
    /// Whether a failure in this state goes through `Error`.
    pub fn is_running(&self) -> bool {
        !matches!(
            self,
            OrchestratorState::Init
                | OrchestratorState::Validate
                | OrchestratorState::Error
                | OrchestratorState::RestoreOverrides
                | OrchestratorState::Done
        )
    }

    /// Check whether `next` may follow this state.
    pub fn can_transition_to(&self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;

        if next == Error {
            return self.is_running();
        }
        matches!(
            (self, next),
            (Init, Validate)
                | (Validate, InstallOverrides)
                | (InstallOverrides, Align)
                | (InstallOverrides, RowSetup)
                | (Align, RowSetup)
                | (RowSetup, PreRoll)
                | (PreRoll, Arm)
                | (Arm, Fly)
                | (Fly, Drain)
                | (Drain, RowDone)
                | (RowDone, RowSetup)
                | (RowDone, RestoreOverrides)
                | (Error, RestoreOverrides)
                | (RestoreOverrides, Done)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrchestratorState::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            Init,
            Validate,
            InstallOverrides,
            Align,
            RowSetup,
            PreRoll,
            Arm,
            Fly,
            Drain,
            RowDone,
            RowSetup,
            PreRoll,
            Arm,
            Fly,
            Drain,
            RowDone,
            RestoreOverrides,
            Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_error_only_from_running_states() {
        for state in [InstallOverrides, Align, RowSetup, PreRoll, Arm, Fly, Drain, RowDone] {
            assert!(state.can_transition_to(Error), "{state}");
        }
        for state in [Init, Validate, Error, RestoreOverrides, Done] {
            assert!(!state.can_transition_to(Error), "{state}");
        }
        assert!(Error.can_transition_to(RestoreOverrides));
    }

    #[test]
    fn test_restore_is_not_skippable() {
        assert!(!RowDone.can_transition_to(Done));
        assert!(!Error.can_transition_to(Done));
        assert!(!Fly.can_transition_to(RowDone));
        assert!(!Done.can_transition_to(Init));
    }

    #[test]
    fn test_display() {
        assert_eq!(RestoreOverrides.to_string(), "RESTORE_OVERRIDES");
        assert_eq!(PreRoll.to_string(), "PRE_ROLL");
    }
}
