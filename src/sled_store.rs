//! sled backed storage
//!
//! `machines` holds the current definition per category and `machine_versions` every
//! definition ever stored, keyed by category and version. `logs` is keyed by category,
//! uuid length, uuid and sequence, and `heads` holds the last sequence per instance.
//! `in_use` marks categories with at least one log entry. The head check and the
//! writes of an append share one sled transaction; machine writes check `in_use` in
//! theirs.
use super::error::StoreError;
use super::log::ApprovalLog;
use super::machine::MachineDefinition;
use super::store::{LogStore, MachineStore};
use super::types::{Category, InstanceKey};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::sync::Arc;

pub struct SledStore {
    machines: sled::Tree,
    versions: sled::Tree,
    logs: sled::Tree,
    heads: sled::Tree,
    in_use: sled::Tree,
}

impl SledStore {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, StoreError> {
        Ok(Self {
            machines: instance.open_tree("machines")?,
            versions: instance.open_tree("machine_versions")?,
            logs: instance.open_tree("logs")?,
            heads: instance.open_tree("heads")?,
            in_use: instance.open_tree("in_use")?,
        })
    }
}

fn head_key(key: &InstanceKey) -> Vec<u8> {
    let mut k = key.category.to_be_bytes().to_vec();
    k.extend_from_slice(key.uuid.as_bytes());
    k
}

// length prefixed so one uuid can never be the prefix of another
fn log_prefix(key: &InstanceKey) -> Vec<u8> {
    let mut k = key.category.to_be_bytes().to_vec();
    k.extend_from_slice(&(key.uuid.len() as u32).to_be_bytes());
    k.extend_from_slice(key.uuid.as_bytes());
    k
}

fn log_key(key: &InstanceKey, sequence: u64) -> Vec<u8> {
    let mut k = log_prefix(key);
    k.extend_from_slice(&sequence.to_be_bytes());
    k
}

fn version_key(category: Category, version: &str) -> Vec<u8> {
    let mut k = category.to_be_bytes().to_vec();
    k.extend_from_slice(version.as_bytes());
    k
}

fn decode_sequence(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = raw.len().min(8);
    buf[..n].copy_from_slice(&raw[..n]);
    u64::from_be_bytes(buf)
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, StoreError> {
    minicbor::to_vec(value).map_err(|e| StoreError::Encode(e.to_string()))
}

fn abort<T>(e: StoreError) -> Result<T, ConflictableTransactionError<StoreError>> {
    Err(ConflictableTransactionError::Abort(e))
}

fn finish<T>(res: Result<T, TransactionError<StoreError>>) -> Result<T, StoreError> {
    match res {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(StoreError::Sled(e)),
    }
}

impl MachineStore for SledStore {
    fn get_machine(&self, category: Category) -> Result<MachineDefinition, StoreError> {
        match self.machines.get(category.to_be_bytes())? {
            Some(raw) => Ok(minicbor::decode(&raw)?),
            None => Err(StoreError::MachineNotFound(category)),
        }
    }

    fn get_machine_version(
        &self,
        category: Category,
        version: &str,
    ) -> Result<MachineDefinition, StoreError> {
        match self.versions.get(version_key(category, version))? {
            Some(raw) => Ok(minicbor::decode(&raw)?),
            None => Err(StoreError::MachineVersionNotFound {
                category,
                version: version.to_string(),
            }),
        }
    }

    fn insert_machine(&self, def: &MachineDefinition, version: &str) -> Result<(), StoreError> {
        let category = def.category.to_be_bytes();
        let versioned = version_key(def.category, version);
        let cbor = encode(def)?;

        let res = (&self.machines, &self.versions).transaction(
            |(machines, versions)| -> Result<(), ConflictableTransactionError<StoreError>> {
                if machines.get(category)?.is_some() {
                    return abort(StoreError::MachineExists(def.category));
                }
                versions.insert(versioned.as_slice(), cbor.as_slice())?;
                machines.insert(&category[..], cbor.as_slice())?;
                Ok(())
            },
        );
        finish(res)
    }

    fn replace_machine_if_unused(
        &self,
        def: &MachineDefinition,
        version: &str,
    ) -> Result<(), StoreError> {
        let category = def.category.to_be_bytes();
        let versioned = version_key(def.category, version);
        let cbor = encode(def)?;

        let res = (&self.machines, &self.versions, &self.in_use).transaction(
            |(machines, versions, in_use)| -> Result<(), ConflictableTransactionError<StoreError>> {
                if machines.get(category)?.is_none() {
                    return abort(StoreError::MachineNotFound(def.category));
                }
                if in_use.get(category)?.is_some() {
                    return abort(StoreError::MachineInUse(def.category));
                }
                versions.insert(versioned.as_slice(), cbor.as_slice())?;
                machines.insert(&category[..], cbor.as_slice())?;
                Ok(())
            },
        );
        finish(res)
    }

    fn remove_machine_if_unused(&self, category: Category) -> Result<bool, StoreError> {
        let key = category.to_be_bytes();

        let res = (&self.machines, &self.in_use).transaction(
            |(machines, in_use)| -> Result<bool, ConflictableTransactionError<StoreError>> {
                if in_use.get(key)?.is_some() {
                    return abort(StoreError::MachineInUse(category));
                }
                Ok(machines.remove(&key[..])?.is_some())
            },
        );
        finish(res)
    }

    fn list_machines(&self) -> Result<Vec<MachineDefinition>, StoreError> {
        self.machines
            .iter()
            .values()
            .map(|raw| -> Result<MachineDefinition, StoreError> {
                Ok(minicbor::decode(&raw?)?)
            })
            .collect()
    }
}

impl LogStore for SledStore {
    fn append_log(
        &self,
        key: &InstanceKey,
        expected_sequence: u64,
        entry: &ApprovalLog,
    ) -> Result<u64, StoreError> {
        let next = expected_sequence + 1;
        let head = head_key(key);
        let log = log_key(key, next);
        let cbor = encode(entry)?;

        let category = key.category.to_be_bytes();

        let res = (&self.logs, &self.heads, &self.in_use).transaction(
            |(logs, heads, in_use)| -> Result<u64, ConflictableTransactionError<StoreError>> {
                let actual = heads
                    .get(&head)?
                    .map(|raw| decode_sequence(&raw))
                    .unwrap_or_default();
                if actual != expected_sequence {
                    return abort(StoreError::Conflict {
                        expected: expected_sequence,
                        actual,
                    });
                }

                logs.insert(log.as_slice(), cbor.as_slice())?;
                heads.insert(head.as_slice(), &next.to_be_bytes()[..])?;
                if in_use.get(category)?.is_none() {
                    in_use.insert(&category[..], &[] as &[u8])?;
                }
                Ok(next)
            },
        );
        finish(res)
    }

    fn list_logs(&self, key: &InstanceKey) -> Result<Vec<ApprovalLog>, StoreError> {
        self.logs
            .scan_prefix(log_prefix(key))
            .values()
            .map(|raw| -> Result<ApprovalLog, StoreError> { Ok(minicbor::decode(&raw?)?) })
            .collect()
    }

    fn list_instances(&self, category: Category) -> Result<Vec<InstanceKey>, StoreError> {
        self.heads
            .scan_prefix(category.to_be_bytes())
            .keys()
            .map(|raw| -> Result<InstanceKey, StoreError> {
                let raw = raw?;
                let uuid = String::from_utf8_lossy(&raw[4..]).into_owned();
                Ok(InstanceKey::new(category, uuid))
            })
            .collect()
    }
}
