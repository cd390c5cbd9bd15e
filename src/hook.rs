//! Post-transition callback
use super::log::{Action, ApprovalLog, FsmApprovalLog};
use super::types::InstanceKey;

/// What just happened to an instance.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub key: &'a InstanceKey,
    pub action: &'a Action,
    pub sequence: u64,
    pub status: FsmApprovalLog,
}

/// Called after an entry has been appended, with the full ordered log of the instance.
/// Used for notifications and materialized views. An error here never undoes the append.
pub trait TransitionHook: Send + Sync {
    fn on_transition(
        &self,
        ctx: &TransitionContext<'_>,
        logs: &[ApprovalLog],
    ) -> anyhow::Result<()>;
}

impl<F> TransitionHook for F
where
    F: Fn(&TransitionContext<'_>, &[ApprovalLog]) -> anyhow::Result<()> + Send + Sync,
{
    fn on_transition(
        &self,
        ctx: &TransitionContext<'_>,
        logs: &[ApprovalLog],
    ) -> anyhow::Result<()> {
        self(ctx, logs)
    }
}

pub struct NoopHook;

impl TransitionHook for NoopHook {
    fn on_transition(&self, _: &TransitionContext<'_>, _: &[ApprovalLog]) -> anyhow::Result<()> {
        Ok(())
    }
}
