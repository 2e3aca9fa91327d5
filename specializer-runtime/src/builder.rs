//! Variant builder seam
//!
//! The core never generates code itself. A [`VariantBuilder`] receives the
//! original callable and an optimization plan and hands back a specialized
//! callable, either right away or through a background job the core polls.

use specializer_core::{Callable, OptimizationPlan};
use tokio::sync::oneshot;

/// `Ok(None)` means the builder declined the plan
pub type BuildResult = anyhow::Result<Option<Callable>>;

/// Outcome of asking a builder for a variant
pub enum BuildJob {
    Ready(BuildResult),
    /// Still running; resolved by sending on the paired channel
    Pending(oneshot::Receiver<BuildResult>),
}

/// Progress of a [`BuildJob`]
pub enum JobStatus {
    Done(BuildResult),
    Running,
    /// The sending side was dropped without a result
    Abandoned,
}

impl BuildJob {
    /// A pending job plus the sender that completes it
    pub fn channel() -> (oneshot::Sender<BuildResult>, BuildJob) {
        let (tx, rx) = oneshot::channel();
        (tx, BuildJob::Pending(rx))
    }

    /// Non-blocking check for completion
    pub fn poll(&mut self) -> JobStatus {
        match self {
            BuildJob::Ready(_) => {
                match std::mem::replace(self, BuildJob::Ready(Ok(None))) {
                    BuildJob::Ready(result) => JobStatus::Done(result),
                    BuildJob::Pending(_) => JobStatus::Running,
                }
            }
            BuildJob::Pending(rx) => match rx.try_recv() {
                Ok(result) => JobStatus::Done(result),
                Err(oneshot::error::TryRecvError::Empty) => JobStatus::Running,
                Err(oneshot::error::TryRecvError::Closed) => JobStatus::Abandoned,
            },
        }
    }
}

/// Produces specialized variants of a callable
pub trait VariantBuilder: Send + Sync {
    fn build(&self, original: &Callable, plan: &OptimizationPlan, signature: &str) -> BuildJob;
}

impl<F> VariantBuilder for F
where
    F: Fn(&Callable, &OptimizationPlan, &str) -> BuildResult + Send + Sync,
{
    fn build(&self, original: &Callable, plan: &OptimizationPlan, signature: &str) -> BuildJob {
        BuildJob::Ready(self(original, plan, signature))
    }
}

/// Builder that returns the original callable unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityBuilder;

impl VariantBuilder for IdentityBuilder {
    fn build(&self, original: &Callable, _plan: &OptimizationPlan, _signature: &str) -> BuildJob {
        BuildJob::Ready(Ok(Some(original.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specializer_core::{callable, Value};

    fn original() -> Callable {
        callable(|_: &[Value]| Ok(Value::Int(1)))
    }

    #[test]
    fn test_identity_returns_original() {
        let f = original();
        let mut job = IdentityBuilder.build(&f, &OptimizationPlan::empty(), "int32");
        match job.poll() {
            JobStatus::Done(Ok(Some(g))) => assert!(std::sync::Arc::ptr_eq(&f, &g)),
            _ => panic!("identity builder should finish immediately"),
        }
    }

    #[test]
    fn test_closure_builder_can_decline() {
        let decline = |_: &Callable, _: &OptimizationPlan, _: &str| -> BuildResult { Ok(None) };
        let mut job = decline.build(&original(), &OptimizationPlan::empty(), "");
        assert!(matches!(job.poll(), JobStatus::Done(Ok(None))));
    }

    #[test]
    fn test_pending_job_lifecycle() {
        let (tx, mut job) = BuildJob::channel();
        assert!(matches!(job.poll(), JobStatus::Running));
        assert!(tx.send(Ok(Some(original()))).is_ok());
        assert!(matches!(job.poll(), JobStatus::Done(Ok(Some(_)))));

        let (tx, mut job) = BuildJob::channel();
        drop(tx);
        assert!(matches!(job.poll(), JobStatus::Abandoned));
    }
}
