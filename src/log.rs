//! Approval log entries and the state derived from them
//!
//! The log of an instance is append-only. Nothing about the status is stored: the
//! current [`InstanceState`] is replayed from the entries of the latest chain every
//! time it is needed.
use super::error::AuditError;
use super::machine::Machine;
use super::types::{InstanceKey, RoleId, TimeStamp, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    #[n(0)]
    Submit,
    #[n(1)]
    Approve,
    #[n(2)]
    Refuse,
    #[n(3)]
    Resubmit {
        #[n(0)]
        keys: Vec<String>, // field keys changed, never their values
    },
    #[n(4)]
    Confirm {
        #[n(0)]
        approved: bool,
    },
    #[n(5)]
    Cancel,
    #[n(6)]
    Edit {
        #[n(0)]
        keys: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalLog {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7
    #[n(1)]
    pub key: InstanceKey,
    #[n(2)]
    pub sequence: u64,
    #[n(3)]
    pub level_index: u32,
    #[n(4)]
    pub actor_role_id: RoleId,
    #[n(5)]
    pub actor_user_id: UserId,
    #[n(6)]
    pub action: Action,
    #[n(7)]
    pub opinion: String,
    #[n(8)]
    pub created_at: TimeStamp,
    #[n(9)]
    pub prev_hash: Option<String>, // digest of the entry before this one
    /// Version of the machine definition a chain runs under, set on submit entries.
    #[n(10)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_version: Option<String>,
}

/// Where an instance currently stands. `Approving(0)` is the freshly submitted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Approving(usize),
    WaitingConfirm,
    WaitingResubmit,
    Cancelled,
    End,
}

/// Status projection returned with every transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsmApprovalLog {
    pub end: bool,
    pub waiting_confirm: bool,
    pub waiting_resubmit: bool,
    pub cancel: bool,
}

/// The current chain of an instance, replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub submitter_role_id: RoleId,
    pub submitter_user_id: UserId,
    pub state: InstanceState,
    pub chain_len: usize,
}

/// One row of the human readable timeline of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogTrack {
    pub created_at: TimeStamp,
    pub sequence: u64,
    pub name: String,
    pub action: String,
    pub opinion: String,
    pub actor_role_id: RoleId,
    pub actor_user_id: UserId,
    pub end: bool,
    pub cancel: bool,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Submit => "submit",
            Action::Approve => "approve",
            Action::Refuse => "refuse",
            Action::Resubmit { .. } => "resubmit",
            Action::Confirm { .. } => "confirm",
            Action::Cancel => "cancel",
            Action::Edit { .. } => "edit",
        }
    }
}

impl ApprovalLog {
    /// sha256 over the CBOR encoding of this entry, used to link the next one.
    pub fn digest(&self) -> anyhow::Result<String> {
        let cbor = minicbor::to_vec(self)?;
        Ok(sha256::digest(&cbor))
    }
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::End | InstanceState::Cancelled)
    }

    pub fn approving_level(&self) -> Option<usize> {
        match self {
            InstanceState::Approving(level) => Some(*level),
            _ => None,
        }
    }

    pub fn projection(&self) -> FsmApprovalLog {
        FsmApprovalLog {
            end: *self == InstanceState::End,
            waiting_confirm: *self == InstanceState::WaitingConfirm,
            waiting_resubmit: *self == InstanceState::WaitingResubmit,
            cancel: *self == InstanceState::Cancelled,
        }
    }

    fn initial(machine: &Machine) -> Self {
        // a machine without levels has nothing to approve
        if machine.levels.is_empty() {
            InstanceState::End
        } else {
            InstanceState::Approving(0)
        }
    }

    /// Applies one action. Terminal states absorb everything, and actions that make no
    /// sense for the current state leave it untouched.
    pub fn step(self, machine: &Machine, action: &Action) -> Self {
        if self.is_terminal() {
            return self;
        }

        match (self, action) {
            (_, Action::Submit) | (_, Action::Resubmit { .. }) => Self::initial(machine),
            (InstanceState::Approving(level), Action::Approve) => {
                if !machine.is_last_level(level) {
                    InstanceState::Approving(level + 1)
                } else if machine.submitter_confirm {
                    InstanceState::WaitingConfirm
                } else {
                    InstanceState::End
                }
            }
            (InstanceState::Approving(_), Action::Refuse) => InstanceState::WaitingResubmit,
            (InstanceState::WaitingConfirm, Action::Confirm { approved: true }) => {
                InstanceState::End
            }
            (InstanceState::WaitingConfirm, Action::Confirm { approved: false }) => {
                InstanceState::WaitingResubmit
            }
            (_, Action::Cancel) => InstanceState::Cancelled,
            (state, _) => state,
        }
    }
}

impl Instance {
    /// Replays the latest chain of `logs`. `None` when nothing was ever submitted.
    pub fn derive(machine: &Machine, logs: &[ApprovalLog]) -> Option<Self> {
        let chain = current_chain(logs);
        let submit = chain.first()?;

        let state = chain[1..]
            .iter()
            .fold(InstanceState::initial(machine), |state, log| {
                state.step(machine, &log.action)
            });

        Some(Self {
            submitter_role_id: submit.actor_role_id,
            submitter_user_id: submit.actor_user_id,
            state,
            chain_len: chain.len(),
        })
    }

    pub fn is_submitter(&self, user_id: UserId) -> bool {
        self.submitter_user_id == user_id
    }
}

/// Entries from the last submit onwards. Earlier chains are history only.
pub fn current_chain(logs: &[ApprovalLog]) -> &[ApprovalLog] {
    match logs.iter().rposition(|l| l.action == Action::Submit) {
        Some(start) => &logs[start..],
        None => &[],
    }
}

/// Machine version recorded by the submit that opened the current chain. `None` for
/// an empty log or a submit written without one.
pub fn chain_machine_version(logs: &[ApprovalLog]) -> Option<&str> {
    current_chain(logs).first()?.machine_version.as_deref()
}

/// Projection of the current chain; all false when nothing was submitted.
pub fn project(machine: &Machine, logs: &[ApprovalLog]) -> FsmApprovalLog {
    Instance::derive(machine, logs)
        .map(|i| i.state.projection())
        .unwrap_or_default()
}

/// Timeline of every entry, all chains included, named after the level or the
/// submitter that acted.
pub fn track(machine: &Machine, logs: &[ApprovalLog]) -> Vec<LogTrack> {
    let mut state = None::<InstanceState>;

    logs.iter()
        .map(|log| {
            let next = match (state, &log.action) {
                (_, Action::Submit) => InstanceState::initial(machine),
                (Some(s), action) => s.step(machine, action),
                // entries before any submit cannot move anything
                (None, _) => InstanceState::Approving(0),
            };
            state = Some(next);

            let name = match log.action {
                Action::Approve | Action::Refuse => machine
                    .level(log.level_index as usize)
                    .map(|l| l.name.clone())
                    .unwrap_or_default(),
                Action::Edit { .. } if !is_submitter_entry(logs, log) => machine
                    .level(log.level_index as usize)
                    .map(|l| l.name.clone())
                    .unwrap_or_default(),
                _ => machine.submitter_name.clone(),
            };

            LogTrack {
                created_at: log.created_at.clone(),
                sequence: log.sequence,
                name,
                action: log.action.name().to_string(),
                opinion: log.opinion.clone(),
                actor_role_id: log.actor_role_id,
                actor_user_id: log.actor_user_id,
                end: next == InstanceState::End,
                cancel: next == InstanceState::Cancelled,
            }
        })
        .collect()
}

fn is_submitter_entry(logs: &[ApprovalLog], log: &ApprovalLog) -> bool {
    logs.iter()
        .take_while(|l| l.sequence <= log.sequence)
        .filter(|l| l.action == Action::Submit)
        .last()
        .is_some_and(|submit| submit.actor_user_id == log.actor_user_id)
}

/// Checks that sequences strictly increase and every entry links to the digest of
/// its predecessor.
pub fn verify_audit_trail(logs: &[ApprovalLog]) -> Result<(), AuditError> {
    let mut prev: Option<&ApprovalLog> = None;
    for log in logs {
        match prev {
            None => {
                if log.prev_hash.is_some() {
                    return Err(AuditError::BrokenLink(log.sequence));
                }
            }
            Some(p) => {
                if log.sequence <= p.sequence {
                    return Err(AuditError::SequenceOrder(log.sequence));
                }
                let digest = p
                    .digest()
                    .map_err(|_| AuditError::BrokenLink(log.sequence))?;
                if log.prev_hash.as_deref() != Some(digest.as_str()) {
                    return Err(AuditError::BrokenLink(log.sequence));
                }
            }
        }
        prev = Some(log);
    }
    Ok(())
}
