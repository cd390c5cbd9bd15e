//! Request and response shapes of the exposed operations
//!
//! Field names are the wire contract, so every type here serializes in camelCase.
use super::log::{ApprovalLog, FsmApprovalLog};
use super::types::{Category, InstanceKey, RoleId, UserId};
use serde::{Deserialize, Serialize};

/// Opens an approval instance for a business record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsmCreateLog {
    pub category: Category,
    pub uuid: String,
    pub submitter_role_id: RoleId,
    pub submitter_user_id: UserId,
}

/// Approve, refuse, confirm and cancel all take this shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsmApproveLog {
    pub category: Category,
    pub uuid: String,
    pub approval_role_id: RoleId,
    pub approval_user_id: UserId,
    #[serde(default)]
    pub approval_opinion: String,
    #[serde(default)]
    pub approved: bool,
    /// Pins the level the caller saw. A stale pin fails instead of acting on the next
    /// level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsmDetailField {
    pub key: String,
    pub val: String,
}

/// Resubmit and detail edits carry the changed fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsmDetailLog {
    pub category: Category,
    pub uuid: String,
    pub approval_role_id: RoleId,
    pub approval_user_id: UserId,
    #[serde(default)]
    pub approval_opinion: String,
    #[serde(default)]
    pub fields: Vec<FsmDetailField>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOutcome {
    #[serde(flatten)]
    pub status: FsmApprovalLog,
    pub logs: Vec<ApprovalLog>,
}

/// Filters for listing machines; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MachineFilter {
    pub category: Option<Category>,
    pub name: String,
    pub submitter_name: String,
    pub submitter_confirm: Option<bool>,
}

impl FsmCreateLog {
    pub fn new(key: &InstanceKey, role_id: RoleId, user_id: UserId) -> Self {
        Self {
            category: key.category,
            uuid: key.uuid.clone(),
            submitter_role_id: role_id,
            submitter_user_id: user_id,
        }
    }
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.category, self.uuid.clone())
    }
}

impl FsmApproveLog {
    pub fn new(key: &InstanceKey, role_id: RoleId, user_id: UserId) -> Self {
        Self {
            category: key.category,
            uuid: key.uuid.clone(),
            approval_role_id: role_id,
            approval_user_id: user_id,
            ..Self::default()
        }
    }
    pub fn set_opinion(mut self, opinion: &str) -> Self {
        self.approval_opinion = opinion.to_string();
        self
    }
    pub fn set_approved(mut self, approved: bool) -> Self {
        self.approved = approved;
        self
    }
    pub fn at_level(mut self, level: usize) -> Self {
        self.level = Some(level);
        self
    }
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.category, self.uuid.clone())
    }
}

impl FsmDetailLog {
    pub fn new(key: &InstanceKey, role_id: RoleId, user_id: UserId) -> Self {
        Self {
            category: key.category,
            uuid: key.uuid.clone(),
            approval_role_id: role_id,
            approval_user_id: user_id,
            ..Self::default()
        }
    }
    pub fn set_opinion(mut self, opinion: &str) -> Self {
        self.approval_opinion = opinion.to_string();
        self
    }
    pub fn add_field(mut self, key: &str, val: &str) -> Self {
        self.fields.push(FsmDetailField {
            key: key.to_string(),
            val: val.to_string(),
        });
        self
    }
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.category, self.uuid.clone())
    }
    /// Changed field keys, deduplicated, in first-seen order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            if !keys.contains(&field.key) {
                keys.push(field.key.clone());
            }
        }
        keys
    }
}

impl MachineFilter {
    pub fn matches(&self, def: &crate::machine::MachineDefinition) -> bool {
        self.category.is_none_or(|c| c == def.category)
            && (self.name.is_empty() || def.name.contains(&self.name))
            && (self.submitter_name.is_empty() || def.submitter_name.contains(&self.submitter_name))
            && self
                .submitter_confirm
                .is_none_or(|c| c == def.submitter_confirm)
    }
}
