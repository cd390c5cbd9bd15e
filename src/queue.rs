//! Approving-queue listing
//!
//! The caller fetches instances however it likes (`LogStore::list_instances` plus
//! `list_logs`, a SQL view, ...) and this keeps the ones waiting on a given actor.
use super::log::{ApprovalLog, Instance};
use super::machine::Machine;
use super::permission::is_pending;
use super::types::{InstanceKey, RoleId, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingItem {
    pub key: InstanceKey,
    pub level: usize,
    pub level_name: String,
    pub submitter_role_id: RoleId,
    pub submitter_user_id: UserId,
}

/// Instances of `machine` currently sitting at a level this actor may approve.
pub fn approving<I>(
    machine: &Machine,
    instances: I,
    role_id: RoleId,
    user_id: UserId,
) -> Vec<PendingItem>
where
    I: IntoIterator<Item = (InstanceKey, Vec<ApprovalLog>)>,
{
    instances
        .into_iter()
        .filter(|(key, _)| key.category == machine.category)
        .filter_map(|(key, logs)| {
            let instance = Instance::derive(machine, &logs)?;
            let level = instance.state.approving_level()?;
            let current = machine.level(level)?;
            is_pending(current, role_id, user_id).then(|| PendingItem {
                key,
                level,
                level_name: current.name.clone(),
                submitter_role_id: instance.submitter_role_id,
                submitter_user_id: instance.submitter_user_id,
            })
        })
        .collect()
}
