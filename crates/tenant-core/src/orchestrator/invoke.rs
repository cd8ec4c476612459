//! Invoking step operations with panic isolation and an optional time bound.
//!
//! Every operation runs inside its own transaction. Without a timeout it runs
//! inline on the caller's thread. With a timeout it runs, transaction
//! included, on a dedicated worker thread against clones of its inputs; the
//! clones are written back once the worker answers. A worker that overruns
//! its timeout is waited for during the grace period, so its step is only
//! compensated after it stopped. A worker still running after the grace
//! period keeps the run's tenant lease until it exits.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::model::{TenantInfo, TenantInitializationContext, TenantStepData};
use crate::step::{Step, StepError, StepResult};
use crate::tx::TransactionSupport;

use super::lease::TenantLease;

/// Invokes the step operations of one run.
pub(crate) struct Invoker {
    tx: Arc<dyn TransactionSupport>,
    timeout: Option<Duration>,
    grace: Duration,
    lease: Arc<TenantLease>,
}

/// When a bounded worker answered.
enum Bounded<T> {
    InTime(T),
    /// After the timeout, within the grace period.
    Late(T),
    /// Not at all; the worker is still running.
    Running,
}

impl Invoker {
    pub(crate) fn new(
        tx: Arc<dyn TransactionSupport>,
        timeout: Option<Duration>,
        grace: Duration,
        lease: TenantLease,
    ) -> Self {
        Self {
            tx,
            timeout,
            grace,
            lease: Arc::new(lease),
        }
    }

    pub(crate) fn execute(
        &self,
        step: &Arc<dyn Step>,
        data: &mut TenantStepData,
        ctx: &mut TenantInitializationContext,
    ) -> StepResult {
        let id = step.identifier().to_string();
        let Some(timeout) = self.timeout else {
            return self
                .tx
                .invoke_in_new_tx(&mut || inline(&id, || step.execute(data, ctx)));
        };

        let worker_step = Arc::clone(step);
        let worker_tx = Arc::clone(&self.tx);
        let worker_id = id.clone();
        let mut worker_data = data.clone();
        let mut worker_ctx = ctx.clone();
        let outcome = self.bounded(&id, timeout, move || {
            let result = worker_tx.invoke_in_new_tx(&mut || {
                inline(&worker_id, || {
                    worker_step.execute(&mut worker_data, &mut worker_ctx)
                })
            });
            (result, worker_data, worker_ctx)
        })?;

        match outcome {
            // Written back on failure too: compensation may need what the step recorded.
            Bounded::InTime((result, out_data, out_ctx)) => {
                *data = out_data;
                *ctx = out_ctx;
                result
            }
            Bounded::Late((_, out_data, out_ctx)) => {
                *data = out_data;
                *ctx = out_ctx;
                Err(StepError::TimedOut { step: id, timeout })
            }
            Bounded::Running => Err(StepError::StillRunning { step: id, timeout }),
        }
    }

    pub(crate) fn delete(
        &self,
        step: &Arc<dyn Step>,
        data: &TenantStepData,
        tenant: Option<&TenantInfo>,
        is_rollback: bool,
    ) -> StepResult {
        let id = step.identifier().to_string();
        let Some(timeout) = self.timeout else {
            return self.tx.invoke_in_new_tx(&mut || {
                inline(&id, || step.delete(data, tenant, is_rollback))
            });
        };

        let worker_step = Arc::clone(step);
        let worker_tx = Arc::clone(&self.tx);
        let worker_id = id.clone();
        let worker_data = data.clone();
        let worker_tenant = tenant.cloned();
        let outcome = self.bounded(&id, timeout, move || {
            worker_tx.invoke_in_new_tx(&mut || {
                inline(&worker_id, || {
                    worker_step.delete(&worker_data, worker_tenant.as_ref(), is_rollback)
                })
            })
        })?;

        match outcome {
            Bounded::InTime(result) => result,
            Bounded::Late(_) => Err(StepError::TimedOut { step: id, timeout }),
            Bounded::Running => Err(StepError::StillRunning { step: id, timeout }),
        }
    }

    fn bounded<T, F>(&self, step_id: &str, timeout: Duration, work: F) -> Result<Bounded<T>, StepError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let lease = Arc::clone(&self.lease);
        let handle = thread::Builder::new()
            .name(format!("step-{step_id}"))
            .spawn(move || {
                let value = work();
                // Released before answering: a run that got its answer holds the last handle.
                drop(lease);
                let _ = tx.send(value);
            })
            .map_err(|e| StepError::failed(format!("cannot start worker for step '{step_id}': {e}")))?;

        let late = match rx.recv_timeout(timeout) {
            Ok(value) => return Ok(Bounded::InTime(value)),
            Err(RecvTimeoutError::Disconnected) => return Err(worker_lost(step_id, handle)),
            Err(RecvTimeoutError::Timeout) => {
                warn!(step = %step_id, ?timeout, grace = ?self.grace, "step overran its timeout, waiting for it to stop");
                rx.recv_timeout(self.grace)
            }
        };
        match late {
            Ok(value) => Ok(Bounded::Late(value)),
            Err(RecvTimeoutError::Disconnected) => Err(worker_lost(step_id, handle)),
            Err(RecvTimeoutError::Timeout) => {
                warn!(step = %step_id, ?timeout, "step still running after its grace period, tenant stays leased until it stops");
                Ok(Bounded::Running)
            }
        }
    }
}

fn inline(step_id: &str, work: impl FnOnce() -> StepResult) -> StepResult {
    panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
        Err(StepError::Panicked {
            step: step_id.to_string(),
            message: panic_message(payload.as_ref()),
        })
    })
}

fn worker_lost(step_id: &str, handle: JoinHandle<()>) -> StepError {
    let message = match handle.join() {
        Err(payload) => panic_message(payload.as_ref()),
        Ok(()) => "worker exited without a result".to_string(),
    };
    StepError::Panicked {
        step: step_id.to_string(),
        message,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::lease::TenantLeases;
    use crate::tx::NoTransaction;
    use std::sync::Mutex;
    use std::time::Instant;

    enum Behaviour {
        Succeed,
        Sleep(Duration),
        Panic,
        FailAfterRecording,
    }

    struct Sample(Behaviour);

    impl Step for Sample {
        fn identifier(&self) -> &str {
            "sample"
        }

        fn execute(
            &self,
            data: &mut TenantStepData,
            ctx: &mut TenantInitializationContext,
        ) -> StepResult {
            data.set_property("thread", thread::current().name().unwrap_or("-"));
            match &self.0 {
                Behaviour::Succeed => {
                    data.set_property("created", "yes");
                    ctx.set_attribute("sample", "ran");
                    Ok(())
                }
                Behaviour::Sleep(d) => {
                    thread::sleep(*d);
                    data.set_property("woke", "yes");
                    Ok(())
                }
                Behaviour::Panic => panic!("sample exploded"),
                Behaviour::FailAfterRecording => {
                    data.set_property("resource", "r-42");
                    Err(StepError::failed("half done"))
                }
            }
        }

        fn delete(&self, _: &TenantStepData, _: Option<&TenantInfo>, _: bool) -> StepResult {
            match &self.0 {
                Behaviour::Panic => std::panic::panic_any(String::from("delete exploded")),
                Behaviour::Sleep(d) => {
                    thread::sleep(*d);
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    /// Remembers the thread each transaction was opened on.
    #[derive(Default)]
    struct ThreadTx {
        threads: Mutex<Vec<String>>,
    }

    impl TransactionSupport for ThreadTx {
        fn invoke_in_new_tx(&self, work: &mut dyn FnMut() -> StepResult) -> StepResult {
            let name = thread::current().name().unwrap_or("-").to_string();
            self.threads.lock().unwrap().push(name);
            work()
        }
    }

    fn sample(b: Behaviour) -> Arc<dyn Step> {
        Arc::new(Sample(b))
    }

    fn invoker(leases: &TenantLeases, timeout: Option<Duration>, grace: Duration) -> Invoker {
        let lease = leases.try_acquire("acme.com").unwrap();
        Invoker::new(Arc::new(NoTransaction), timeout, grace, lease)
    }

    #[test]
    fn inline_execute_mutates_in_place() {
        let leases = TenantLeases::new();
        let inv = invoker(&leases, None, Duration::ZERO);
        let step = sample(Behaviour::Succeed);
        let mut data = TenantStepData::new("sample");
        let mut ctx = TenantInitializationContext::new();
        inv.execute(&step, &mut data, &mut ctx).unwrap();
        assert_eq!(data.property("created"), Some("yes"));
        assert_eq!(ctx.attribute("sample"), Some("ran"));
    }

    #[test]
    fn bounded_execute_writes_results_back() {
        let leases = TenantLeases::new();
        let inv = invoker(&leases, Some(Duration::from_secs(5)), Duration::ZERO);
        let step = sample(Behaviour::Succeed);
        let mut data = TenantStepData::new("sample");
        let mut ctx = TenantInitializationContext::new();
        inv.execute(&step, &mut data, &mut ctx).unwrap();
        assert_eq!(data.property("created"), Some("yes"));
        assert_eq!(data.property("thread"), Some("step-sample"));
        assert_eq!(ctx.attribute("sample"), Some("ran"));
    }

    #[test]
    fn bounded_execute_keeps_partial_data_on_failure() {
        let leases = TenantLeases::new();
        let inv = invoker(&leases, Some(Duration::from_secs(5)), Duration::ZERO);
        let step = sample(Behaviour::FailAfterRecording);
        let mut data = TenantStepData::new("sample");
        let mut ctx = TenantInitializationContext::new();
        let err = inv.execute(&step, &mut data, &mut ctx).unwrap_err();
        assert_eq!(err.to_string(), "half done");
        assert_eq!(data.property("resource"), Some("r-42"));
    }

    #[test]
    fn transaction_is_opened_on_the_thread_running_the_step() {
        let leases = TenantLeases::new();
        let tx = Arc::new(ThreadTx::default());
        let lease = leases.try_acquire("acme.com").unwrap();
        let inv = Invoker::new(tx.clone(), Some(Duration::from_secs(5)), Duration::ZERO, lease);
        let step = sample(Behaviour::Succeed);
        let mut data = TenantStepData::new("sample");
        let mut ctx = TenantInitializationContext::new();

        inv.execute(&step, &mut data, &mut ctx).unwrap();
        inv.delete(&step, &data, None, true).unwrap();

        assert_eq!(*tx.threads.lock().unwrap(), ["step-sample", "step-sample"]);
        assert_eq!(data.property("thread"), Some("step-sample"));
    }

    #[test]
    fn overrun_within_grace_waits_for_the_worker() {
        let leases = TenantLeases::new();
        let inv = invoker(&leases, Some(Duration::from_millis(20)), Duration::from_secs(5));
        let step = sample(Behaviour::Sleep(Duration::from_millis(300)));
        let mut data = TenantStepData::new("sample");
        let mut ctx = TenantInitializationContext::new();

        let started = Instant::now();
        let err = inv.execute(&step, &mut data, &mut ctx).unwrap_err();
        assert!(matches!(err, StepError::TimedOut { ref step, .. } if step == "sample"));
        assert!(started.elapsed() >= Duration::from_millis(300));
        // What the late step recorded is kept for its compensation.
        assert_eq!(data.property("woke"), Some("yes"));

        let err = inv.delete(&step, &data, None, true).unwrap_err();
        assert!(matches!(err, StepError::TimedOut { .. }));
    }

    #[test]
    fn overrun_past_grace_keeps_lease_until_worker_stops() {
        let leases = TenantLeases::new();
        let inv = invoker(&leases, Some(Duration::from_millis(20)), Duration::ZERO);
        let step = sample(Behaviour::Sleep(Duration::from_millis(500)));
        let mut data = TenantStepData::new("sample");
        let mut ctx = TenantInitializationContext::new();

        let err = inv.execute(&step, &mut data, &mut ctx).unwrap_err();
        assert!(err.is_still_running());
        assert!(data.property("woke").is_none());

        drop(inv);
        assert!(leases.is_held("acme.com"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while leases.is_held("acme.com") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!leases.is_held("acme.com"));
    }

    #[test]
    fn lease_is_released_with_the_invoker_after_in_time_work() {
        let leases = TenantLeases::new();
        let inv = invoker(&leases, Some(Duration::from_secs(5)), Duration::ZERO);
        let step = sample(Behaviour::Succeed);
        let mut data = TenantStepData::new("sample");
        let mut ctx = TenantInitializationContext::new();
        inv.execute(&step, &mut data, &mut ctx).unwrap();

        drop(inv);
        assert!(!leases.is_held("acme.com"));
    }

    #[test]
    fn panics_become_step_errors() {
        let leases = TenantLeases::new();
        let step = sample(Behaviour::Panic);
        let mut data = TenantStepData::new("sample");
        let mut ctx = TenantInitializationContext::new();

        let inline = invoker(&leases, None, Duration::ZERO);
        let err = inline.execute(&step, &mut data, &mut ctx).unwrap_err();
        assert!(matches!(err, StepError::Panicked { ref message, .. } if message == "sample exploded"));
        let err = inline.delete(&step, &data, None, true).unwrap_err();
        assert!(matches!(err, StepError::Panicked { ref message, .. } if message == "delete exploded"));
        drop(inline);

        let bounded = invoker(&leases, Some(Duration::from_secs(5)), Duration::ZERO);
        let err = bounded.execute(&step, &mut data, &mut ctx).unwrap_err();
        assert!(matches!(err, StepError::Panicked { ref message, .. } if message == "sample exploded"));
    }
}
