use crate::error::StateMachineError;
use crate::types::CalcState;

/// Validates a calc-state transition.
///
/// Illegal transitions return an error; with the `strict-debug` feature
/// they panic instead so tests surface them at the call site.
pub fn validate_transition(from: CalcState, to: CalcState) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal calc-state transition attempted: {from:?} -> {to:?}");

        #[cfg(not(feature = "strict-debug"))]
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// Done, error and budget_limited end a job, not the trip: they re-enter
/// scheduling exactly like idle.
pub fn allowed_transitions(from: CalcState) -> &'static [CalcState] {
    use CalcState::*;
    match from {
        Idle => &[Queued, Running],
        // Queued -> Idle only when the job is dropped before a worker saw it.
        Queued => &[Running, Idle],
        Running => &[Done, Error, BudgetLimited],
        Done | Error | BudgetLimited => &[Queued, Running],
    }
}

fn allowed(from: CalcState, to: CalcState) -> bool {
    allowed_transitions(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_only_ends_in_job_outcomes() {
        for to in CalcState::ALL {
            let ok = validate_transition(CalcState::Running, to).is_ok();
            let expected = matches!(
                to,
                CalcState::Done | CalcState::Error | CalcState::BudgetLimited
            );
            assert_eq!(ok, expected, "running -> {to}");
        }
    }

    #[test]
    fn running_is_never_reentered_from_running() {
        assert!(validate_transition(CalcState::Running, CalcState::Running).is_err());
    }
}
