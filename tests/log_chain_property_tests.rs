//! Property-based tests for approval log state derivation
//!
//! The status of an instance is never stored, it is replayed from the log. These
//! tests drive arbitrary action sequences through the replay and through the engine
//! and check the invariants that must hold whatever the sequence.
//!
//! Covered:
//!
//! 1. Determinism of the replay
//! 2. At most one projection flag at a time
//! 3. Terminal states absorb every later entry
//! 4. N sequential approvals end an N level workflow, with or without confirmation
//! 5. A refusal at any level restarts at level 0 after resubmission
//!
//! Storage and hook behaviour live in the scenario tests.

use approval_fsm::{
    ApprovalEngine, EngineConfig, TransitionError,
    hook::NoopHook,
    log::{Action, ApprovalLog, FsmApprovalLog, Instance, InstanceState, project},
    machine::{LevelDefinition, Machine, MachineDefinition},
    request::{FsmApproveLog, FsmCreateLog, FsmDetailLog},
    store::MemoryStore,
    types::{InstanceKey, TimeStamp},
};
use proptest::prelude::*;
use std::sync::Arc;

/// Level `i` is approved by role `10 + i`.
fn definition(levels: usize, confirm: bool) -> MachineDefinition {
    (0..levels).fold(
        MachineDefinition::new(1)
            .set_submitter_confirm(confirm)
            .set_submitter_edit_fields("title"),
        |def, i| {
            def.add_level(
                LevelDefinition::new(&format!("level_{i}"))
                    .set_roles(&(10 + i).to_string())
                    .set_refuse(true),
            )
        },
    )
}

fn machine(levels: usize, confirm: bool) -> Machine {
    definition(levels, confirm).build().unwrap()
}

fn engine(levels: usize, confirm: bool) -> ApprovalEngine {
    let engine = ApprovalEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(NoopHook),
        EngineConfig::default(),
    );
    engine.create_machine(definition(levels, confirm)).unwrap();
    engine
}

/// Strategy to generate any action other than submit
fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::Approve),
        Just(Action::Refuse),
        Just(Action::Resubmit { keys: vec![] }),
        any::<bool>().prop_map(|approved| Action::Confirm { approved }),
        Just(Action::Cancel),
        Just(Action::Edit {
            keys: vec!["title".to_string()]
        }),
    ]
}

/// Strategy to generate a chain: a submit followed by 0-12 arbitrary actions
fn chain_strategy() -> impl Strategy<Value = Vec<ApprovalLog>> {
    prop::collection::vec(action_strategy(), 0..=12).prop_map(|actions| {
        std::iter::once(Action::Submit)
            .chain(actions)
            .enumerate()
            .map(|(i, action)| ApprovalLog {
                id: format!("alog_{i}"),
                key: InstanceKey::new(1, "prop"),
                sequence: i as u64 + 1,
                level_index: 0,
                actor_role_id: 1,
                actor_user_id: 1,
                action,
                opinion: String::new(),
                created_at: TimeStamp::new(),
                prev_hash: None,
                machine_version: None,
            })
            .collect()
    })
}

fn flags(status: FsmApprovalLog) -> usize {
    [
        status.end,
        status.waiting_confirm,
        status.waiting_resubmit,
        status.cancel,
    ]
    .into_iter()
    .filter(|f| *f)
    .count()
}

// PROPERTY TESTS
proptest! {
    /// Property: replaying the same log always yields the same instance
    #[test]
    fn prop_derivation_is_deterministic(
        logs in chain_strategy(),
        levels in 1usize..5,
        confirm in any::<bool>(),
    ) {
        let m = machine(levels, confirm);
        prop_assert_eq!(Instance::derive(&m, &logs), Instance::derive(&m, &logs));
    }

    /// Property: the projection never reports two states at once, and reports none
    /// exactly while an approval level is pending
    #[test]
    fn prop_projection_flags_are_exclusive(
        logs in chain_strategy(),
        levels in 1usize..5,
        confirm in any::<bool>(),
    ) {
        let m = machine(levels, confirm);
        let status = project(&m, &logs);
        let state = Instance::derive(&m, &logs).unwrap().state;

        prop_assert!(flags(status) <= 1);
        prop_assert_eq!(flags(status) == 0, state.approving_level().is_some());
    }

    /// Property: once End or Cancelled, no later entry of the chain changes the state
    #[test]
    fn prop_terminal_states_are_stable(
        logs in chain_strategy(),
        tail in prop::collection::vec(action_strategy(), 1..=6),
        levels in 1usize..4,
    ) {
        let m = machine(levels, false);
        let before = Instance::derive(&m, &logs).unwrap().state;
        prop_assume!(before.is_terminal());

        let mut extended = logs.clone();
        for action in tail {
            let mut next = extended[extended.len() - 1].clone();
            next.sequence += 1;
            next.action = action;
            extended.push(next);
        }

        prop_assert_eq!(Instance::derive(&m, &extended).unwrap().state, before);
    }

    /// Property: N authorized approvals end an N level workflow with N + 1 entries
    #[test]
    fn prop_sequential_approvals_end_the_workflow(levels in 1usize..7) {
        let engine = engine(levels, false);
        let key = InstanceKey::new(1, "prop");
        engine.submit(&FsmCreateLog::new(&key, 1, 1)).unwrap();

        let mut last = None;
        for i in 0..levels {
            last = Some(engine.approve(&FsmApproveLog::new(&key, 10 + i as u64, 99)).unwrap());
        }
        let out = last.unwrap();

        prop_assert_eq!(out.status, FsmApprovalLog { end: true, ..Default::default() });
        prop_assert_eq!(out.logs.len(), levels + 1);
    }

    /// Property: with submitter confirmation the same run stops at WaitingConfirm
    #[test]
    fn prop_confirmation_holds_the_end(levels in 1usize..7, approved in any::<bool>()) {
        let engine = engine(levels, true);
        let key = InstanceKey::new(1, "prop");
        engine.submit(&FsmCreateLog::new(&key, 1, 1)).unwrap();
        for i in 0..levels {
            engine.approve(&FsmApproveLog::new(&key, 10 + i as u64, 99)).unwrap();
        }
        prop_assert!(engine.status(&key).unwrap().waiting_confirm);

        let out = engine
            .confirm(&FsmApproveLog::new(&key, 1, 1).set_approved(approved))
            .unwrap();
        prop_assert_eq!(out.status.end, approved);
        prop_assert_eq!(out.status.waiting_resubmit, !approved);
    }

    /// Property: a refusal at any level resubmits to level 0, not to the refused level
    #[test]
    fn prop_resubmit_restarts_at_first_level(
        (levels, refused_at) in (2usize..7).prop_flat_map(|n| (Just(n), 0..n)),
    ) {
        let engine = engine(levels, false);
        let key = InstanceKey::new(1, "prop");
        engine.submit(&FsmCreateLog::new(&key, 1, 1)).unwrap();
        for i in 0..refused_at {
            engine.approve(&FsmApproveLog::new(&key, 10 + i as u64, 99)).unwrap();
        }
        let role = 10 + refused_at as u64;
        engine.refuse(&FsmApproveLog::new(&key, role, 99)).unwrap();

        let err = engine.approve(&FsmApproveLog::new(&key, role, 99)).unwrap_err();
        prop_assert_eq!(
            err.downcast_ref::<TransitionError>(),
            Some(&TransitionError::NoPermissionOrEnded)
        );

        engine.resubmit(&FsmDetailLog::new(&key, 1, 1)).unwrap();
        let instance = engine.instance(&key).unwrap().unwrap();
        prop_assert_eq!(instance.state, InstanceState::Approving(0));
        prop_assert_eq!(engine.logs(&key).unwrap().len(), refused_at + 3);
    }
}
