//! Approval workflow engine: machine management and the transition state machine
use super::config::{EngineConfig, HookFailure};
use super::error::{MachineError, StoreError, TransitionError};
use super::hook::{TransitionContext, TransitionHook};
use super::log::{self, Action, ApprovalLog, FsmApprovalLog, Instance, InstanceState, LogTrack};
use super::machine::{Machine, MachineDefinition};
use super::permission::{
    can_act, can_edit, can_refuse, level_can_edit_fields, submitter_can_edit_fields,
};
use super::request::{FsmApproveLog, FsmCreateLog, FsmDetailLog, MachineFilter, TransitionOutcome};
use super::store::ApprovalStore;
use super::types::{
    Category, InstanceKey, LOG_ID_HRP, RoleId, TimeStamp, UserId, new_uuid_to_bech32,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A hook delivery that failed and waits in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub key: InstanceKey,
    pub sequence: u64,
    pub attempts: u32,
    pub last_error: String,
}

// the entry a transition is about to append
struct Step {
    level: usize,
    role_id: RoleId,
    user_id: UserId,
    action: Action,
    opinion: String,
    machine_version: Option<String>,
}

pub struct ApprovalEngine {
    store: Arc<dyn ApprovalStore>,
    hook: Arc<dyn TransitionHook>,
    config: EngineConfig,
    // built machines by category and definition digest
    cache: RwLock<HashMap<(Category, String), Arc<Machine>>>,
    outbox: Mutex<VecDeque<PendingDelivery>>,
}

impl ApprovalEngine {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        hook: Arc<dyn TransitionHook>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            hook,
            config,
            cache: RwLock::new(HashMap::new()),
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    // =========================================================================
    // Machine definitions
    // =========================================================================

    /// Validates and registers a definition for a new category.
    pub fn create_machine(&self, def: MachineDefinition) -> anyhow::Result<Arc<Machine>> {
        let machine = Arc::new(def.build()?);
        let version = def.digest()?;

        self.store
            .insert_machine(&def, &version)
            .map_err(machine_error)?;
        tracing::info!(
            category = def.category,
            name = %def.name,
            levels = def.levels.len(),
            %version,
            "machine created"
        );
        self.cache
            .write()
            .insert((def.category, version), machine.clone());

        Ok(machine)
    }

    /// Replaces a definition. Refused once any instance of the category exists.
    pub fn update_machine(&self, def: MachineDefinition) -> anyhow::Result<Arc<Machine>> {
        let machine = Arc::new(def.build()?);
        let version = def.digest()?;

        self.store
            .replace_machine_if_unused(&def, &version)
            .map_err(machine_error)?;
        tracing::info!(category = def.category, name = %def.name, %version, "machine updated");
        self.cache
            .write()
            .insert((def.category, version), machine.clone());

        Ok(machine)
    }

    /// Removes a definition. Refused once any instance of the category exists.
    pub fn delete_machine(&self, category: Category) -> anyhow::Result<bool> {
        let removed = self
            .store
            .remove_machine_if_unused(category)
            .map_err(machine_error)?;
        if removed {
            tracing::info!(category, "machine deleted");
        }

        Ok(removed)
    }

    pub fn find_machines(&self, filter: &MachineFilter) -> anyhow::Result<Vec<MachineDefinition>> {
        let mut found: Vec<MachineDefinition> = self
            .store
            .list_machines()?
            .into_iter()
            .filter(|def| filter.matches(def))
            .collect();
        found.sort_by_key(|def| def.category);
        Ok(found)
    }

    /// The current machine of a category. The definition is read from the store on
    /// every call and built once per version.
    pub fn machine(&self, category: Category) -> anyhow::Result<Arc<Machine>> {
        Ok(self.current_machine(category)?.1)
    }

    fn current_machine(&self, category: Category) -> anyhow::Result<(String, Arc<Machine>)> {
        let def = self.store.get_machine(category)?;
        let version = def.digest()?;
        let machine = self.built(category, &version, || Ok(def))?;
        Ok((version, machine))
    }

    fn machine_version(&self, category: Category, version: &str) -> anyhow::Result<Arc<Machine>> {
        self.built(category, version, || {
            Ok(self.store.get_machine_version(category, version)?)
        })
    }

    fn built<F>(&self, category: Category, version: &str, load: F) -> anyhow::Result<Arc<Machine>>
    where
        F: FnOnce() -> anyhow::Result<MachineDefinition>,
    {
        let cache_key = (category, version.to_string());
        if let Some(machine) = self.cache.read().get(&cache_key) {
            return Ok(machine.clone());
        }

        let machine = Arc::new(load()?.build()?);
        self.cache.write().insert(cache_key, machine.clone());
        Ok(machine)
    }

    // the machine the current chain of `logs` was submitted under
    fn chain_machine(
        &self,
        category: Category,
        logs: &[ApprovalLog],
    ) -> anyhow::Result<Arc<Machine>> {
        match log::chain_machine_version(logs) {
            Some(version) => self.machine_version(category, version),
            None => self.machine(category),
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Opens a new chain for the record. Legal when nothing was submitted yet or the
    /// previous chain has ended or been cancelled.
    pub fn submit(&self, r: &FsmCreateLog) -> anyhow::Result<TransitionOutcome> {
        let key = r.key();
        let (_, logs, instance) = self.load(&key)?;

        if instance.is_some_and(|i| !i.state.is_terminal()) {
            return reject(&key, "submit", TransitionError::RepeatSubmit);
        }

        // a new chain runs under the definition current at submit time
        let (version, machine) = self.current_machine(key.category)?;
        let step = Step {
            level: 0,
            role_id: r.submitter_role_id,
            user_id: r.submitter_user_id,
            action: Action::Submit,
            opinion: String::new(),
            machine_version: Some(version),
        };
        self.commit(&machine, &key, logs, step, Some(TransitionError::RepeatSubmit))
    }

    pub fn approve(&self, r: &FsmApproveLog) -> anyhow::Result<TransitionOutcome> {
        let key = r.key();
        let (machine, logs, instance) = self.load(&key)?;

        let Some(level) = approving_level(instance.as_ref(), r.level) else {
            return reject(&key, "approve", TransitionError::NoPermissionOrEnded);
        };
        let authorized = machine
            .level(level)
            .is_some_and(|l| can_act(l, r.approval_role_id, r.approval_user_id));
        if !authorized {
            return reject(&key, "approve", TransitionError::NoPermissionApprove);
        }

        let step = Step {
            level,
            role_id: r.approval_role_id,
            user_id: r.approval_user_id,
            action: Action::Approve,
            opinion: r.approval_opinion.clone(),
            machine_version: None,
        };
        self.commit(&machine, &key, logs, step, Some(TransitionError::NoPermissionOrEnded))
    }

    pub fn refuse(&self, r: &FsmApproveLog) -> anyhow::Result<TransitionOutcome> {
        let key = r.key();
        let (machine, logs, instance) = self.load(&key)?;

        let Some(level) = approving_level(instance.as_ref(), r.level) else {
            return reject(&key, "refuse", TransitionError::NoPermissionOrEnded);
        };
        let authorized = machine
            .level(level)
            .is_some_and(|l| can_refuse(l, r.approval_role_id, r.approval_user_id));
        if !authorized {
            return reject(&key, "refuse", TransitionError::NoPermissionRefuse);
        }

        let step = Step {
            level,
            role_id: r.approval_role_id,
            user_id: r.approval_user_id,
            action: Action::Refuse,
            opinion: r.approval_opinion.clone(),
            machine_version: None,
        };
        self.commit(&machine, &key, logs, step, Some(TransitionError::NoPermissionOrEnded))
    }

    /// Sends a refused instance back to the first level. Only the submitter may do
    /// this, and only with fields the machine lets the submitter edit.
    pub fn resubmit(&self, r: &FsmDetailLog) -> anyhow::Result<TransitionOutcome> {
        let key = r.key();
        let (machine, logs, instance) = self.load(&key)?;

        let waiting = instance.is_some_and(|i| {
            i.state == InstanceState::WaitingResubmit && i.is_submitter(r.approval_user_id)
        });
        if !waiting {
            return reject(&key, "resubmit", TransitionError::Status);
        }
        let keys = r.keys();
        if !submitter_can_edit_fields(&machine, keys.iter().map(String::as_str)) {
            return reject(&key, "resubmit", TransitionError::NoEditLogDetailPermission);
        }

        let step = Step {
            level: 0,
            role_id: r.approval_role_id,
            user_id: r.approval_user_id,
            action: Action::Resubmit { keys },
            opinion: r.approval_opinion.clone(),
            machine_version: None,
        };
        self.commit(&machine, &key, logs, step, Some(TransitionError::Status))
    }

    /// The submitter's answer to a fully approved instance when the machine asks for
    /// confirmation. Declining sends it back for resubmission.
    pub fn confirm(&self, r: &FsmApproveLog) -> anyhow::Result<TransitionOutcome> {
        let key = r.key();
        let (machine, logs, instance) = self.load(&key)?;

        let waiting = instance.is_some_and(|i| {
            i.state == InstanceState::WaitingConfirm && i.is_submitter(r.approval_user_id)
        });
        if !waiting {
            return reject(&key, "confirm", TransitionError::Status);
        }

        let step = Step {
            level: machine.levels.len(),
            role_id: r.approval_role_id,
            user_id: r.approval_user_id,
            action: Action::Confirm {
                approved: r.approved,
            },
            opinion: r.approval_opinion.clone(),
            machine_version: None,
        };
        self.commit(&machine, &key, logs, step, Some(TransitionError::Status))
    }

    /// Withdraws an instance before anybody acted on it.
    pub fn cancel(&self, r: &FsmApproveLog) -> anyhow::Result<TransitionOutcome> {
        let key = r.key();
        let (machine, logs, instance) = self.load(&key)?;

        let Some(instance) = instance else {
            return reject(&key, "cancel", TransitionError::Status);
        };
        if !instance.is_submitter(r.approval_user_id) {
            return reject(&key, "cancel", TransitionError::OnlySubmitterCancel);
        }
        if instance.chain_len != 1 || instance.state.is_terminal() {
            return reject(&key, "cancel", TransitionError::StartedCannotCancel);
        }

        let step = Step {
            level: 0,
            role_id: r.approval_role_id,
            user_id: r.approval_user_id,
            action: Action::Cancel,
            opinion: r.approval_opinion.clone(),
            machine_version: None,
        };
        self.commit(&machine, &key, logs, step, Some(TransitionError::StartedCannotCancel))
    }

    /// Records a detail edit without moving the state. Allowed for an approver of the
    /// current level that may edit those fields, or for the submitter before the first
    /// level has approved.
    pub fn edit_detail(&self, r: &FsmDetailLog) -> anyhow::Result<TransitionOutcome> {
        let key = r.key();
        let (machine, logs, instance) = self.load(&key)?;
        let keys = r.keys();
        if keys.is_empty() {
            return reject(&key, "edit", TransitionError::NoEditLogDetailPermission);
        }

        let level = instance
            .as_ref()
            .and_then(|i| i.state.approving_level().map(|level| (i, level)))
            .filter(|(i, level)| {
                let by_approver = machine.level(*level).is_some_and(|l| {
                    can_edit(l, r.approval_role_id, r.approval_user_id)
                        && level_can_edit_fields(l, keys.iter().map(String::as_str))
                });
                let by_submitter = *level == 0
                    && i.is_submitter(r.approval_user_id)
                    && submitter_can_edit_fields(&machine, keys.iter().map(String::as_str));
                by_approver || by_submitter
            })
            .map(|(_, level)| level);
        let Some(level) = level else {
            return reject(&key, "edit", TransitionError::NoEditLogDetailPermission);
        };

        let step = Step {
            level,
            role_id: r.approval_role_id,
            user_id: r.approval_user_id,
            action: Action::Edit { keys },
            opinion: r.approval_opinion.clone(),
            machine_version: None,
        };
        self.commit(&machine, &key, logs, step, None)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn logs(&self, key: &InstanceKey) -> anyhow::Result<Vec<ApprovalLog>> {
        Ok(self.store.list_logs(key)?)
    }

    pub fn instance(&self, key: &InstanceKey) -> anyhow::Result<Option<Instance>> {
        let (_, _, instance) = self.load(key)?;
        Ok(instance)
    }

    pub fn status(&self, key: &InstanceKey) -> anyhow::Result<FsmApprovalLog> {
        let (machine, logs, _) = self.load(key)?;
        Ok(log::project(&machine, &logs))
    }

    pub fn track(&self, key: &InstanceKey) -> anyhow::Result<Vec<LogTrack>> {
        let (machine, logs, _) = self.load(key)?;
        Ok(log::track(&machine, &logs))
    }

    /// Verifies the stored log of `key` is an unbroken hash chain.
    pub fn audit(&self, key: &InstanceKey) -> anyhow::Result<()> {
        Ok(log::verify_audit_trail(&self.store.list_logs(key)?)?)
    }

    // =========================================================================
    // Hook outbox
    // =========================================================================

    pub fn outbox(&self) -> Vec<PendingDelivery> {
        self.outbox.lock().iter().cloned().collect()
    }

    /// Retries deferred hook deliveries and returns how many went through. Deliveries
    /// that keep failing are dropped after `max_delivery_attempts`.
    pub fn flush_outbox(&self) -> usize {
        let pending: Vec<PendingDelivery> = self.outbox.lock().drain(..).collect();
        let mut delivered = 0;

        for mut delivery in pending {
            match self.redeliver(&delivery) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    delivery.attempts += 1;
                    delivery.last_error = format!("{e:#}");
                    if delivery.attempts >= self.config.max_delivery_attempts {
                        tracing::error!(
                            key = %delivery.key,
                            sequence = delivery.sequence,
                            attempts = delivery.attempts,
                            "giving up on transition hook delivery: {}",
                            delivery.last_error
                        );
                    } else {
                        self.defer(delivery);
                    }
                }
            }
        }

        delivered
    }

    fn redeliver(&self, delivery: &PendingDelivery) -> anyhow::Result<()> {
        let mut logs = self.store.list_logs(&delivery.key)?;
        // the hook sees the log as it was right after that transition
        logs.retain(|l| l.sequence <= delivery.sequence);
        let machine = self.chain_machine(delivery.key.category, &logs)?;

        let Some(last) = logs.last() else {
            return Ok(());
        };
        let ctx = TransitionContext {
            key: &delivery.key,
            action: &last.action,
            sequence: last.sequence,
            status: log::project(&machine, &logs),
        };
        self.hook.on_transition(&ctx, &logs)
    }

    fn defer(&self, delivery: PendingDelivery) {
        let mut outbox = self.outbox.lock();
        if outbox.len() >= self.config.outbox_capacity {
            if let Some(dropped) = outbox.pop_front() {
                tracing::error!(
                    key = %dropped.key,
                    sequence = dropped.sequence,
                    "outbox full, dropping hook delivery"
                );
            }
        }
        outbox.push_back(delivery);
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn load(
        &self,
        key: &InstanceKey,
    ) -> anyhow::Result<(Arc<Machine>, Vec<ApprovalLog>, Option<Instance>)> {
        let logs = self.store.list_logs(key)?;
        let machine = self.chain_machine(key.category, &logs)?;
        let instance = Instance::derive(&machine, &logs);
        Ok((machine, logs, instance))
    }

    /// Appends `step` on top of `logs` with a conditional write, then notifies the hook.
    ///
    /// Losing the append race reports `on_conflict`, the error the caller would have got
    /// had it read the newer log. Without one the store's conflict is returned as is.
    fn commit(
        &self,
        machine: &Machine,
        key: &InstanceKey,
        mut logs: Vec<ApprovalLog>,
        step: Step,
        on_conflict: Option<TransitionError>,
    ) -> anyhow::Result<TransitionOutcome> {
        let expected = logs.last().map(|l| l.sequence).unwrap_or_default();
        let prev_hash = logs.last().map(ApprovalLog::digest).transpose()?;

        let entry = ApprovalLog {
            id: new_uuid_to_bech32(LOG_ID_HRP)?,
            key: key.clone(),
            sequence: expected + 1,
            level_index: u32::try_from(step.level)?,
            actor_role_id: step.role_id,
            actor_user_id: step.user_id,
            action: step.action,
            opinion: step.opinion,
            created_at: TimeStamp::new(),
            prev_hash,
            machine_version: step.machine_version,
        };

        match self.store.append_log(key, expected, &entry) {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                tracing::warn!(%key, action = entry.action.name(), "lost append race: {e}");
                return Err(match on_conflict {
                    Some(err) => err.into(),
                    None => e.into(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let sequence = entry.sequence;
        logs.push(entry);
        let status = log::project(machine, &logs);
        tracing::info!(
            %key,
            sequence,
            action = logs[logs.len() - 1].action.name(),
            end = status.end,
            waiting_confirm = status.waiting_confirm,
            waiting_resubmit = status.waiting_resubmit,
            cancel = status.cancel,
            "approval transition committed"
        );

        self.notify(key, &logs, status)?;

        Ok(TransitionOutcome { status, logs })
    }

    fn notify(
        &self,
        key: &InstanceKey,
        logs: &[ApprovalLog],
        status: FsmApprovalLog,
    ) -> anyhow::Result<()> {
        let Some(last) = logs.last() else {
            return Ok(());
        };
        let ctx = TransitionContext {
            key,
            action: &last.action,
            sequence: last.sequence,
            status,
        };

        let Err(e) = self.hook.on_transition(&ctx, logs) else {
            return Ok(());
        };
        tracing::warn!(%key, sequence = last.sequence, "transition hook failed: {e:#}");

        match self.config.hook_failure {
            HookFailure::Propagate => Err(e.context(format!(
                "entry {} of {key} is committed but the transition hook failed",
                last.sequence
            ))),
            HookFailure::Defer => {
                self.defer(PendingDelivery {
                    key: key.clone(),
                    sequence: last.sequence,
                    attempts: 1,
                    last_error: format!("{e:#}"),
                });
                Ok(())
            }
        }
    }
}

// Level the instance is waiting on, if it matches the level the caller pinned.
fn approving_level(instance: Option<&Instance>, pinned: Option<usize>) -> Option<usize> {
    instance?
        .state
        .approving_level()
        .filter(|level| pinned.is_none_or(|want| want == *level))
}

fn reject(
    key: &InstanceKey,
    action: &str,
    err: TransitionError,
) -> anyhow::Result<TransitionOutcome> {
    tracing::debug!(%key, action, "transition rejected: {err}");
    Err(err.into())
}

// store guards surface as machine errors
fn machine_error(e: StoreError) -> anyhow::Error {
    match e {
        StoreError::MachineExists(category) => MachineError::Exists(category).into(),
        StoreError::MachineInUse(category) => MachineError::InUse(category).into(),
        e => e.into(),
    }
}
