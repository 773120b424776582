//! Multi-step operations with compensating rollback.
//!
//! A transaction is scheduled as one queued action. Its steps run in order
//! against the same handle; when one fails, the rollback hooks of the steps
//! that already succeeded run in reverse order before the outcome is
//! reported. A step or hook that panics counts as a failed one.

use std::panic::{self, AssertUnwindSafe};

use crate::error::{BoxError, panic_message};

type StepFn<H> = Box<dyn FnOnce(&mut H) -> Result<(), BoxError> + Send + 'static>;

/// One step of a transaction, with an optional hook that undoes it.
pub struct TransactionStep<H> {
    name: String,
    apply: StepFn<H>,
    rollback: Option<StepFn<H>>,
}

impl<H> TransactionStep<H> {
    pub fn new(
        name: impl Into<String>,
        apply: impl FnOnce(&mut H) -> Result<(), BoxError> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            apply: Box::new(apply),
            rollback: None,
        }
    }

    /// Hook invoked if a later step fails.
    pub fn with_rollback(
        mut self,
        rollback: impl FnOnce(&mut H) -> Result<(), BoxError> + Send + 'static,
    ) -> Self {
        self.rollback = Some(Box::new(rollback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_rollback(&self) -> bool {
        self.rollback.is_some()
    }
}

impl<H> std::fmt::Debug for TransactionStep<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStep")
            .field("name", &self.name)
            .field("has_rollback", &self.rollback.is_some())
            .finish()
    }
}

/// How a transaction ended.
#[derive(Debug)]
pub enum TransactionOutcome {
    Committed {
        steps: usize,
    },
    /// A step failed and every available rollback hook succeeded.
    RolledBack {
        failed_step: usize,
        name: String,
        error: BoxError,
    },
    /// A step failed and at least one rollback hook failed too. `error` is
    /// still the step's error; `rollback_error` is the first hook failure.
    RollbackFailed {
        failed_step: usize,
        name: String,
        error: BoxError,
        rollback_step: usize,
        rollback_error: BoxError,
    },
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    /// The failing step's error, if the transaction did not commit.
    pub fn error(&self) -> Option<&BoxError> {
        match self {
            Self::Committed { .. } => None,
            Self::RolledBack { error, .. } | Self::RollbackFailed { error, .. } => Some(error),
        }
    }

    pub fn into_result(self) -> Result<(), TransactionError> {
        match self {
            Self::Committed { .. } => Ok(()),
            Self::RolledBack {
                failed_step,
                name,
                error,
            } => Err(TransactionError {
                index: failed_step,
                name,
                source: error,
                rollback: None,
            }),
            Self::RollbackFailed {
                failed_step,
                name,
                error,
                rollback_error,
                ..
            } => Err(TransactionError {
                index: failed_step,
                name,
                source: error,
                rollback: Some(rollback_error),
            }),
        }
    }
}

/// A failed transaction step. The step's error is primary; a rollback
/// failure rides along as secondary.
#[derive(Debug, thiserror::Error)]
#[error("transaction step {index} ({name}) failed: {source}")]
pub struct TransactionError {
    pub index: usize,
    pub name: String,
    #[source]
    pub source: BoxError,
    pub rollback: Option<BoxError>,
}

/// Run `steps` in order against `handle`, rolling back on the first failure.
pub fn run_steps<H>(handle: &mut H, steps: Vec<TransactionStep<H>>) -> TransactionOutcome {
    let total = steps.len();
    let mut applied: Vec<(usize, String, Option<StepFn<H>>)> = Vec::with_capacity(total);

    for (index, step) in steps.into_iter().enumerate() {
        let TransactionStep {
            name,
            apply,
            rollback,
        } = step;

        let error = match guarded(apply, handle) {
            Ok(()) => {
                applied.push((index, name, rollback));
                continue;
            }
            Err(error) => error,
        };

        tracing::debug!(step = index, %name, error = %error, "Transaction step failed, rolling back");

        let mut secondary: Option<(usize, BoxError)> = None;
        for (done, done_name, rollback) in applied.into_iter().rev() {
            let Some(rollback) = rollback else {
                continue;
            };
            if let Err(e) = guarded(rollback, handle) {
                tracing::warn!(step = done, name = %done_name, error = %e, "Rollback hook failed");
                if secondary.is_none() {
                    secondary = Some((done, e));
                }
            }
        }

        return match secondary {
            None => TransactionOutcome::RolledBack {
                failed_step: index,
                name,
                error,
            },
            Some((rollback_step, rollback_error)) => TransactionOutcome::RollbackFailed {
                failed_step: index,
                name,
                error,
                rollback_step,
                rollback_error,
            },
        };
    }

    TransactionOutcome::Committed { steps: total }
}

/// Run a step or hook, turning a panic into its error.
fn guarded<H>(f: StepFn<H>, handle: &mut H) -> Result<(), BoxError> {
    match panic::catch_unwind(AssertUnwindSafe(|| f(handle))) {
        Ok(result) => result,
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref())).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Handle that records what happened to it.
    #[derive(Default)]
    struct Journal {
        entries: Vec<String>,
    }

    fn record(entry: &'static str) -> impl FnOnce(&mut Journal) -> Result<(), BoxError> + Send {
        move |j: &mut Journal| {
            j.entries.push(entry.to_string());
            Ok(())
        }
    }

    #[test]
    fn all_steps_commit() {
        let mut journal = Journal::default();
        let outcome = run_steps(
            &mut journal,
            vec![
                TransactionStep::new("one", record("apply 1")),
                TransactionStep::new("two", record("apply 2")),
            ],
        );

        assert!(matches!(outcome, TransactionOutcome::Committed { steps: 2 }));
        assert_eq!(journal.entries, vec!["apply 1", "apply 2"]);
        assert!(outcome.into_result().is_ok());
    }

    #[test]
    fn failing_step_rolls_back_earlier_steps_in_reverse() {
        let mut journal = Journal::default();
        let outcome = run_steps(
            &mut journal,
            vec![
                TransactionStep::new("one", record("apply 1")).with_rollback(record("undo 1")),
                TransactionStep::new("two", record("apply 2")).with_rollback(record("undo 2")),
                TransactionStep::new("three", |_: &mut Journal| Err("step three broke".into()))
                    .with_rollback(record("undo 3")),
                TransactionStep::new("four", record("apply 4")),
            ],
        );

        assert_eq!(
            journal.entries,
            vec!["apply 1", "apply 2", "undo 2", "undo 1"]
        );
        match outcome {
            TransactionOutcome::RolledBack {
                failed_step,
                name,
                error,
            } => {
                assert_eq!(failed_step, 2);
                assert_eq!(name, "three");
                assert_eq!(error.to_string(), "step three broke");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn rollback_failure_keeps_original_error_primary() {
        let mut journal = Journal::default();
        let outcome = run_steps(
            &mut journal,
            vec![
                TransactionStep::new("one", record("apply 1")).with_rollback(record("undo 1")),
                TransactionStep::new("two", record("apply 2"))
                    .with_rollback(|_: &mut Journal| Err("undo 2 broke".into())),
                TransactionStep::new("three", |_: &mut Journal| Err("step three broke".into())),
            ],
        );

        // The failing hook does not stop earlier hooks from running.
        assert_eq!(journal.entries, vec!["apply 1", "apply 2", "undo 1"]);

        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.index, 2);
        assert_eq!(err.source.to_string(), "step three broke");
        assert_eq!(
            err.rollback.as_ref().map(|e| e.to_string()).as_deref(),
            Some("undo 2 broke")
        );
        assert_eq!(
            err.to_string(),
            "transaction step 2 (three) failed: step three broke"
        );
    }

    #[test]
    fn panicking_step_rolls_back_earlier_steps() {
        let mut journal = Journal::default();
        let outcome = run_steps(
            &mut journal,
            vec![
                TransactionStep::new("one", record("apply 1")).with_rollback(record("undo 1")),
                TransactionStep::new("two", |_: &mut Journal| -> Result<(), BoxError> {
                    panic!("step two exploded");
                }),
                TransactionStep::new("three", record("apply 3")),
            ],
        );

        assert_eq!(journal.entries, vec!["apply 1", "undo 1"]);
        match outcome {
            TransactionOutcome::RolledBack {
                failed_step,
                name,
                error,
            } => {
                assert_eq!(failed_step, 1);
                assert_eq!(name, "two");
                assert_eq!(error.to_string(), "panicked: step two exploded");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn panicking_hook_is_a_rollback_failure() {
        let mut journal = Journal::default();
        let outcome = run_steps(
            &mut journal,
            vec![
                TransactionStep::new("one", record("apply 1")).with_rollback(record("undo 1")),
                TransactionStep::new("two", record("apply 2")).with_rollback(
                    |_: &mut Journal| -> Result<(), BoxError> { panic!("undo 2 exploded") },
                ),
                TransactionStep::new("three", |_: &mut Journal| Err("step three broke".into())),
            ],
        );

        assert_eq!(journal.entries, vec!["apply 1", "apply 2", "undo 1"]);
        match outcome {
            TransactionOutcome::RollbackFailed {
                failed_step,
                rollback_step,
                rollback_error,
                ..
            } => {
                assert_eq!(failed_step, 2);
                assert_eq!(rollback_step, 1);
                assert_eq!(rollback_error.to_string(), "panicked: undo 2 exploded");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn steps_without_hooks_are_skipped_on_rollback() {
        let mut journal = Journal::default();
        let outcome = run_steps(
            &mut journal,
            vec![
                TransactionStep::new("plain", record("apply 1")),
                TransactionStep::new("fails", |_: &mut Journal| Err("nope".into())),
            ],
        );
        assert!(matches!(
            outcome,
            TransactionOutcome::RolledBack { failed_step: 1, .. }
        ));
        assert_eq!(journal.entries, vec!["apply 1"]);
    }

    #[test]
    fn empty_transaction_commits() {
        let mut journal = Journal::default();
        let outcome = run_steps(&mut journal, Vec::new());
        assert!(matches!(outcome, TransactionOutcome::Committed { steps: 0 }));
    }

    #[test]
    fn step_debug_hides_closures() {
        let step = TransactionStep::new("insert", record("x")).with_rollback(record("y"));
        assert!(step.has_rollback());
        assert_eq!(
            format!("{step:?}"),
            "TransactionStep { name: \"insert\", has_rollback: true }"
        );
    }
}
