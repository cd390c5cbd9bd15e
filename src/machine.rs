//! Machine definitions and the level graph builder
use super::error::MachineError;
use super::types::{Category, RoleId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Raw definition of one approval step. Id and field lists are comma separated, as
/// they arrive from the back-office forms.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
#[serde(rename_all = "camelCase", default)]
pub struct LevelDefinition {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub edit: bool,
    #[n(2)]
    pub refuse: bool,
    #[n(3)]
    pub edit_fields: String,
    #[n(4)]
    pub roles: String,
    #[n(5)]
    pub users: String,
}

/// Raw workflow definition for one category. This is what gets persisted; a
/// [`Machine`] is built from it on load.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
#[serde(rename_all = "camelCase", default)]
pub struct MachineDefinition {
    #[n(0)]
    pub category: Category,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub submitter_name: String,
    #[n(3)]
    pub submitter_edit_fields: String,
    #[n(4)]
    pub submitter_confirm: bool,
    #[n(5)]
    pub submitter_confirm_edit_fields: String,
    #[n(6)]
    pub levels: Vec<LevelDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Level {
    pub name: String,
    pub edit: bool,
    pub refuse: bool,
    pub edit_fields: BTreeSet<String>,
    pub roles: BTreeSet<RoleId>,
    pub users: BTreeSet<UserId>,
}

/// A validated workflow. Immutable once built; share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub category: Category,
    pub name: String,
    pub submitter_name: String,
    pub submitter_edit_fields: BTreeSet<String>,
    pub submitter_confirm: bool,
    // stored and exposed, but no transition consults it yet
    pub submitter_confirm_edit_fields: BTreeSet<String>,
    pub levels: Vec<Level>,
}

impl LevelDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
    pub fn set_edit(mut self, edit: bool) -> Self {
        self.edit = edit;
        self
    }
    pub fn set_refuse(mut self, refuse: bool) -> Self {
        self.refuse = refuse;
        self
    }
    pub fn set_edit_fields(mut self, fields: &str) -> Self {
        self.edit_fields = fields.to_string();
        self
    }
    pub fn set_roles(mut self, roles: &str) -> Self {
        self.roles = roles.to_string();
        self
    }
    pub fn set_users(mut self, users: &str) -> Self {
        self.users = users.to_string();
        self
    }

    fn build(&self) -> Result<Level, MachineError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(MachineError::EventNameEmpty);
        }

        let level = Level {
            name: name.to_string(),
            edit: self.edit,
            refuse: self.refuse,
            edit_fields: parse_fields(&self.edit_fields),
            roles: parse_ids(&self.roles)?,
            users: parse_ids(&self.users)?,
        };
        if level.roles.is_empty() && level.users.is_empty() {
            tracing::warn!(
                level = %level.name,
                "level has no roles or users, nobody can act on it"
            );
        }

        Ok(level)
    }
}

impl MachineDefinition {
    /// Construct a new builder object for the given category
    pub fn new(category: Category) -> Self {
        Self {
            category,
            ..Self::default()
        }
    }
    pub fn set_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
    pub fn set_submitter_name(mut self, name: &str) -> Self {
        self.submitter_name = name.to_string();
        self
    }
    pub fn set_submitter_edit_fields(mut self, fields: &str) -> Self {
        self.submitter_edit_fields = fields.to_string();
        self
    }
    pub fn set_submitter_confirm(mut self, confirm: bool) -> Self {
        self.submitter_confirm = confirm;
        self
    }
    pub fn set_submitter_confirm_edit_fields(mut self, fields: &str) -> Self {
        self.submitter_confirm_edit_fields = fields.to_string();
        self
    }
    pub fn add_level(mut self, level: LevelDefinition) -> Self {
        self.levels.push(level);
        self
    }

    /// Validates the definition and resolves every level's authorization sets.
    ///
    /// Checks run in a fixed order: empty level list, blank level names, then the
    /// uniqueness of the terminal level.
    pub fn build(&self) -> Result<Machine, MachineError> {
        if self.levels.is_empty() {
            return Err(MachineError::EventsEmpty);
        }
        if self.levels.iter().any(|l| l.name.trim().is_empty()) {
            return Err(MachineError::EventNameEmpty);
        }
        ensure_unique_names(&self.levels)?;

        let levels = self
            .levels
            .iter()
            .map(LevelDefinition::build)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Machine {
            category: self.category,
            name: self.name.clone(),
            submitter_name: self.submitter_name.clone(),
            submitter_edit_fields: parse_fields(&self.submitter_edit_fields),
            submitter_confirm: self.submitter_confirm,
            submitter_confirm_edit_fields: parse_fields(&self.submitter_confirm_edit_fields),
            levels,
        })
    }
}

impl MachineDefinition {
    /// sha256 over the CBOR encoding. Submit entries record it so a chain is always
    /// replayed under the definition it started with.
    pub fn digest(&self) -> anyhow::Result<String> {
        let cbor = minicbor::to_vec(self)?;
        Ok(sha256::digest(&cbor))
    }
}

impl Machine {
    pub fn level(&self, index: usize) -> Option<&Level> {
        self.levels.get(index)
    }
    /// Whether approving `index` completes the level sequence.
    pub fn is_last_level(&self, index: usize) -> bool {
        index + 1 >= self.levels.len()
    }
}

// Each level hands off to the next one by name, so a repeated name makes the end
// point of the sequence ambiguous.
fn ensure_unique_names(levels: &[LevelDefinition]) -> Result<(), MachineError> {
    let mut seen = HashSet::new();
    if levels.iter().all(|level| seen.insert(level.name.trim())) {
        Ok(())
    } else {
        Err(MachineError::EventEndPointNotUnique)
    }
}

fn parse_ids(raw: &str) -> Result<BTreeSet<u64>, MachineError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>().map_err(|_| MachineError::InvalidId(s.to_string())))
        .collect()
}

fn parse_fields(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_parsed_once_and_deduplicated() {
        let ids = parse_ids(" 3, 1,,3 ,2 ").unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn bad_id_token_is_reported() {
        assert_eq!(
            parse_ids("1,x2"),
            Err(MachineError::InvalidId("x2".to_string()))
        );
    }

    #[test]
    fn definition_cbor_roundtrip() {
        let def = MachineDefinition::new(4)
            .set_name("leave")
            .set_submitter_edit_fields("reason, days")
            .add_level(LevelDefinition::new("lead").set_roles("5"));

        let encoded = minicbor::to_vec(&def).unwrap();
        let decoded: MachineDefinition = minicbor::decode(&encoded).unwrap();

        assert_eq!(def, decoded);
        assert_eq!(def.digest().unwrap(), decoded.digest().unwrap());
        assert_ne!(
            def.digest().unwrap(),
            def.clone().set_submitter_confirm(true).digest().unwrap()
        );
    }
}
