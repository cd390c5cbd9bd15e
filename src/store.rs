//! Storage collaborators of the engine
use super::error::StoreError;
use super::log::ApprovalLog;
use super::machine::MachineDefinition;
use super::types::{Category, InstanceKey};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};

/// Machine definitions, current and replaced.
///
/// A category counts as in use once it has any log entry. Implementations check that
/// atomically with the write, so a definition never changes under a submitted
/// instance however the writes interleave with [`LogStore::append_log`].
pub trait MachineStore: Send + Sync {
    fn get_machine(&self, category: Category) -> Result<MachineDefinition, StoreError>;
    /// The definition stored under `version`, whether or not it is still current.
    fn get_machine_version(
        &self,
        category: Category,
        version: &str,
    ) -> Result<MachineDefinition, StoreError>;
    /// Registers the first definition of a category.
    fn insert_machine(&self, def: &MachineDefinition, version: &str) -> Result<(), StoreError>;
    /// Replaces the definition of a category that has no log entries.
    fn replace_machine_if_unused(
        &self,
        def: &MachineDefinition,
        version: &str,
    ) -> Result<(), StoreError>;
    /// Removes the definition of a category that has no log entries. Returns whether
    /// a machine was removed.
    fn remove_machine_if_unused(&self, category: Category) -> Result<bool, StoreError>;
    fn list_machines(&self) -> Result<Vec<MachineDefinition>, StoreError>;
}

pub trait LogStore: Send + Sync {
    /// Conditional append. Succeeds only while the stored head sequence of `key` is
    /// still `expected_sequence` (0 for an empty log), otherwise fails with
    /// [`StoreError::Conflict`] and writes nothing. The caller numbers the entry
    /// `expected_sequence + 1`; that number is returned on success.
    fn append_log(
        &self,
        key: &InstanceKey,
        expected_sequence: u64,
        entry: &ApprovalLog,
    ) -> Result<u64, StoreError>;
    /// All entries of `key` in sequence order.
    fn list_logs(&self, key: &InstanceKey) -> Result<Vec<ApprovalLog>, StoreError>;
    fn list_instances(&self, category: Category) -> Result<Vec<InstanceKey>, StoreError>;
}

/// One backend holding both machines and logs, which the in-use guard needs.
pub trait ApprovalStore: MachineStore + LogStore {}

impl<T: MachineStore + LogStore + ?Sized> ApprovalStore for T {}

#[derive(Default)]
struct Machines {
    current: BTreeMap<Category, MachineDefinition>,
    versions: HashMap<(Category, String), MachineDefinition>,
}

/// Process-local store. The head check and the push happen under one lock, and
/// machine writes hold that same lock while they look for log entries.
#[derive(Default)]
pub struct MemoryStore {
    machines: RwLock<Machines>,
    logs: Mutex<HashMap<InstanceKey, Vec<ApprovalLog>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn in_use(logs: &HashMap<InstanceKey, Vec<ApprovalLog>>, category: Category) -> bool {
    logs.iter()
        .any(|(key, chain)| key.category == category && !chain.is_empty())
}

impl MachineStore for MemoryStore {
    fn get_machine(&self, category: Category) -> Result<MachineDefinition, StoreError> {
        self.machines
            .read()
            .current
            .get(&category)
            .cloned()
            .ok_or(StoreError::MachineNotFound(category))
    }

    fn get_machine_version(
        &self,
        category: Category,
        version: &str,
    ) -> Result<MachineDefinition, StoreError> {
        self.machines
            .read()
            .versions
            .get(&(category, version.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::MachineVersionNotFound {
                category,
                version: version.to_string(),
            })
    }

    fn insert_machine(&self, def: &MachineDefinition, version: &str) -> Result<(), StoreError> {
        let mut machines = self.machines.write();
        if machines.current.contains_key(&def.category) {
            return Err(StoreError::MachineExists(def.category));
        }

        machines
            .versions
            .insert((def.category, version.to_string()), def.clone());
        machines.current.insert(def.category, def.clone());
        Ok(())
    }

    fn replace_machine_if_unused(
        &self,
        def: &MachineDefinition,
        version: &str,
    ) -> Result<(), StoreError> {
        // lock order: logs, then machines
        let logs = self.logs.lock();
        let mut machines = self.machines.write();
        if !machines.current.contains_key(&def.category) {
            return Err(StoreError::MachineNotFound(def.category));
        }
        if in_use(&logs, def.category) {
            return Err(StoreError::MachineInUse(def.category));
        }

        machines
            .versions
            .insert((def.category, version.to_string()), def.clone());
        machines.current.insert(def.category, def.clone());
        Ok(())
    }

    fn remove_machine_if_unused(&self, category: Category) -> Result<bool, StoreError> {
        let logs = self.logs.lock();
        if in_use(&logs, category) {
            return Err(StoreError::MachineInUse(category));
        }
        Ok(self.machines.write().current.remove(&category).is_some())
    }

    fn list_machines(&self) -> Result<Vec<MachineDefinition>, StoreError> {
        Ok(self.machines.read().current.values().cloned().collect())
    }
}

impl LogStore for MemoryStore {
    fn append_log(
        &self,
        key: &InstanceKey,
        expected_sequence: u64,
        entry: &ApprovalLog,
    ) -> Result<u64, StoreError> {
        let mut logs = self.logs.lock();
        let chain = logs.entry(key.clone()).or_default();

        let actual = chain.last().map(|l| l.sequence).unwrap_or_default();
        if actual != expected_sequence {
            return Err(StoreError::Conflict {
                expected: expected_sequence,
                actual,
            });
        }

        chain.push(entry.clone());
        Ok(expected_sequence + 1)
    }

    fn list_logs(&self, key: &InstanceKey) -> Result<Vec<ApprovalLog>, StoreError> {
        Ok(self.logs.lock().get(key).cloned().unwrap_or_default())
    }

    fn list_instances(&self, category: Category) -> Result<Vec<InstanceKey>, StoreError> {
        let mut keys: Vec<InstanceKey> = self
            .logs
            .lock()
            .iter()
            .filter(|(key, logs)| key.category == category && !logs.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
