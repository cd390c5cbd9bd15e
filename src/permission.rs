//! Authorization predicates over resolved levels
use super::machine::{Level, Machine};
use super::types::{RoleId, UserId};

pub fn can_act(level: &Level, role_id: RoleId, user_id: UserId) -> bool {
    level.users.contains(&user_id) || level.roles.contains(&role_id)
}

pub fn can_edit(level: &Level, role_id: RoleId, user_id: UserId) -> bool {
    level.edit && can_act(level, role_id, user_id)
}

pub fn can_refuse(level: &Level, role_id: RoleId, user_id: UserId) -> bool {
    level.refuse && can_act(level, role_id, user_id)
}

pub fn submitter_can_edit_field(machine: &Machine, key: &str) -> bool {
    machine.submitter_edit_fields.contains(key)
}

pub fn submitter_can_edit_fields<'a>(
    machine: &Machine,
    mut keys: impl Iterator<Item = &'a str>,
) -> bool {
    keys.all(|key| submitter_can_edit_field(machine, key))
}

pub fn level_can_edit_fields<'a>(level: &Level, mut keys: impl Iterator<Item = &'a str>) -> bool {
    keys.all(|key| level.edit_fields.contains(key))
}

/// Whether an instance sitting at `level` is waiting on this actor. Listing queries
/// outside the engine filter with this; it never touches storage.
pub fn is_pending(level: &Level, role_id: RoleId, user_id: UserId) -> bool {
    can_act(level, role_id, user_id)
}
