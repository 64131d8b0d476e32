//! Phase transition invariants.
//!
//! Validates a requested phase against the counts recorded on the cycle:
//! - `RED` requires the cycle is not complete.
//! - `GREEN` requires at least one failing test.
//! - `REFACTOR`/`COMPLETE` require zero failing and at least one passing test.

use crate::core::types::{Cycle, Phase};

/// Test counts a transition is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestCounts {
    pub passing: u32,
    pub failing: u32,
}

impl TestCounts {
    pub fn of(cycle: &Cycle) -> Self {
        Self {
            passing: cycle.tests_passing,
            failing: cycle.tests_failing,
        }
    }
}

/// Check whether `current -> target` is legal for the given counts.
///
/// Returns a stable, human-readable reason on violation.
pub fn check_transition(current: Phase, target: Phase, counts: TestCounts) -> Result<(), String> {
    if current == Phase::Complete {
        return Err(format!(
            "cycle is COMPLETE; start a new cycle instead of moving to {}",
            target
        ));
    }

    match target {
        Phase::Ready => Err("cannot return to READY; READY is only the initial phase".to_string()),
        Phase::Red => Ok(()),
        Phase::Green if counts.failing == 0 => Err(format!(
            "GREEN requires at least one failing test (failing={})",
            counts.failing
        )),
        Phase::Green => Ok(()),
        Phase::Refactor | Phase::Complete if counts.failing > 0 => Err(format!(
            "{} requires all tests passing (failing={})",
            target, counts.failing
        )),
        Phase::Refactor | Phase::Complete if counts.passing == 0 => Err(format!(
            "{} requires at least one passing test (passing={})",
            target, counts.passing
        )),
        Phase::Refactor | Phase::Complete => Ok(()),
    }
}

/// True if the phase allows recording an implementation.
pub fn accepts_implementation(phase: Phase) -> bool {
    matches!(phase, Phase::Red | Phase::Green)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(passing: u32, failing: u32) -> TestCounts {
        TestCounts { passing, failing }
    }

    #[test]
    fn red_allowed_from_any_open_phase() {
        for phase in [Phase::Ready, Phase::Red, Phase::Green, Phase::Refactor] {
            assert!(check_transition(phase, Phase::Red, counts(0, 0)).is_ok());
        }
    }

    #[test]
    fn complete_is_terminal() {
        let err = check_transition(Phase::Complete, Phase::Red, counts(1, 0)).unwrap_err();
        assert_eq!(
            err,
            "cycle is COMPLETE; start a new cycle instead of moving to RED"
        );
    }

    #[test]
    fn green_requires_failing_test() {
        let err = check_transition(Phase::Red, Phase::Green, counts(2, 0)).unwrap_err();
        assert_eq!(err, "GREEN requires at least one failing test (failing=0)");
        assert!(check_transition(Phase::Red, Phase::Green, counts(0, 1)).is_ok());
    }

    #[test]
    fn refactor_requires_all_passing() {
        let err = check_transition(Phase::Green, Phase::Refactor, counts(3, 1)).unwrap_err();
        assert_eq!(err, "REFACTOR requires all tests passing (failing=1)");
        let err = check_transition(Phase::Green, Phase::Refactor, counts(0, 0)).unwrap_err();
        assert_eq!(err, "REFACTOR requires at least one passing test (passing=0)");
        assert!(check_transition(Phase::Green, Phase::Refactor, counts(3, 0)).is_ok());
    }

    #[test]
    fn complete_requires_all_passing() {
        assert!(check_transition(Phase::Refactor, Phase::Complete, counts(0, 0)).is_err());
        assert!(check_transition(Phase::Green, Phase::Complete, counts(1, 0)).is_ok());
    }

    #[test]
    fn ready_is_never_a_target() {
        assert!(check_transition(Phase::Red, Phase::Ready, counts(0, 0)).is_err());
    }

    /// Walks a full valid sequence; the phase always equals the last accepted target.
    #[test]
    fn valid_sequence_tracks_last_target() {
        let steps = [
            (Phase::Red, counts(0, 0)),
            (Phase::Green, counts(0, 1)),
            (Phase::Refactor, counts(1, 0)),
            (Phase::Red, counts(1, 0)),
            (Phase::Green, counts(1, 1)),
            (Phase::Complete, counts(2, 0)),
        ];
        let mut phase = Phase::Ready;
        for (target, counts) in steps {
            check_transition(phase, target, counts).expect("valid transition");
            phase = target;
        }
        assert_eq!(phase, Phase::Complete);
    }

    #[test]
    fn implementation_only_in_red_or_green() {
        assert!(accepts_implementation(Phase::Red));
        assert!(accepts_implementation(Phase::Green));
        assert!(!accepts_implementation(Phase::Ready));
        assert!(!accepts_implementation(Phase::Refactor));
        assert!(!accepts_implementation(Phase::Complete));
    }
}
