//! Transaction boundary around each step operation.
//!
//! No subsystem joins a shared transaction, so every step execution and every
//! compensation commits on its own. A later failure therefore never silently
//! undoes an earlier, already visible effect; undoing is the job of the
//! step's `delete`.

use crate::step::StepResult;

pub trait TransactionSupport: Send + Sync {
    /// Run `work` in a fresh, independent transaction: commit when it returns
    /// `Ok`, roll back when it returns `Err`. The result is passed through.
    fn invoke_in_new_tx(&self, work: &mut dyn FnMut() -> StepResult) -> StepResult;
}

/// For deployments without a transactional resource: runs the work as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransaction;

impl TransactionSupport for NoTransaction {
    fn invoke_in_new_tx(&self, work: &mut dyn FnMut() -> StepResult) -> StepResult {
        work()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepError;

    #[test]
    fn no_transaction_passes_result_through() {
        let tx = NoTransaction;
        let mut calls = 0;
        assert!(tx
            .invoke_in_new_tx(&mut || {
                calls += 1;
                Ok(())
            })
            .is_ok());
        let err = tx
            .invoke_in_new_tx(&mut || Err(StepError::failed("rolled back")))
            .unwrap_err();
        assert_eq!(err.to_string(), "rolled back");
        assert_eq!(calls, 1);
    }
}
