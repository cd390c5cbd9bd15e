use crate::types::Category;

/// Raised while building or managing machine definitions, never during a transition.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MachineError {
    #[error("events is empty")]
    EventsEmpty,
    #[error("event name is empty")]
    EventNameEmpty,
    #[error("event end position is not unique or has no end position")]
    EventEndPointNotUnique,
    #[error("'{0}' is not a valid role or user id")]
    InvalidId(String),
    #[error("machine for category {0} already exists")]
    Exists(Category),
    #[error("machine for category {0} is referenced by approval instances")]
    InUse(Category),
}

/// Runtime transition failures, returned to the caller as-is.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("approval record already exists")]
    RepeatSubmit,
    #[error("illegal approval status")]
    Status,
    #[error("no permission to pass the approval")]
    NoPermissionApprove,
    #[error("no permission to refuse approval")]
    NoPermissionRefuse,
    #[error("no permission to approve or approval ended")]
    NoPermissionOrEnded,
    #[error("no permission to edit log detail")]
    NoEditLogDetailPermission,
    #[error("only the submitter can cancel")]
    OnlySubmitterCancel,
    #[error("the process is already in progress and cannot be cancelled halfway")]
    StartedCannotCancel,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("stale append: expected head sequence {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("no machine registered for category {0}")]
    MachineNotFound(Category),
    #[error("no machine version {version} stored for category {category}")]
    MachineVersionNotFound { category: Category, version: String },
    #[error("a machine is already registered for category {0}")]
    MachineExists(Category),
    #[error("category {0} has approval logs")]
    MachineInUse(Category),
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AuditError {
    #[error("sequence {0} does not follow its predecessor")]
    SequenceOrder(u64),
    #[error("entry {0} does not link to the digest of its predecessor")]
    BrokenLink(u64),
}
