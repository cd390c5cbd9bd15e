//! Smoke Screen Unit tests for the approval engine components
//!
//! These tests exercise the building blocks in isolation from the engine: the level
//! graph builder, the permission predicates and the log helpers. They mostly cover the
//! happy path plus the documented rejections.

use approval_fsm::{
    MachineError, is_pending,
    error::AuditError,
    log::{self, Action, ApprovalLog, FsmApprovalLog, Instance, InstanceState},
    machine::{LevelDefinition, MachineDefinition},
    permission::{can_act, can_edit, can_refuse, submitter_can_edit_field},
    types::{InstanceKey, TimeStamp},
};

fn entry(sequence: u64, action: Action, role: u64, user: u64) -> ApprovalLog {
    ApprovalLog {
        id: format!("alog_{sequence}"),
        key: InstanceKey::new(1, "abc"),
        sequence,
        level_index: 0,
        actor_role_id: role,
        actor_user_id: user,
        action,
        opinion: String::new(),
        created_at: TimeStamp::new(),
        prev_hash: None,
        machine_version: None,
    }
}

// hash-link the entries the way the engine does on append
fn linked(mut logs: Vec<ApprovalLog>) -> Vec<ApprovalLog> {
    for i in 1..logs.len() {
        logs[i].prev_hash = Some(logs[i - 1].digest().unwrap());
    }
    logs
}

// LEVEL GRAPH BUILDER TESTS
#[cfg(test)]
mod builder_tests {
    use super::*;

    #[test]
    fn zero_levels_are_rejected() {
        let err = MachineDefinition::new(1).set_name("empty").build().unwrap_err();
        assert_eq!(err, MachineError::EventsEmpty);
    }

    #[test]
    fn blank_level_names_are_rejected() {
        let err = MachineDefinition::new(1)
            .add_level(LevelDefinition::new("lead").set_roles("1"))
            .add_level(LevelDefinition::new("   ").set_roles("2"))
            .build()
            .unwrap_err();
        assert_eq!(err, MachineError::EventNameEmpty);
    }

    #[test]
    fn name_check_runs_before_terminal_check() {
        let err = MachineDefinition::new(1)
            .add_level(LevelDefinition::new("lead"))
            .add_level(LevelDefinition::new("lead"))
            .add_level(LevelDefinition::new(""))
            .build()
            .unwrap_err();
        assert_eq!(err, MachineError::EventNameEmpty);
    }

    #[test]
    fn repeated_level_names_make_the_end_ambiguous() {
        let err = MachineDefinition::new(1)
            .add_level(LevelDefinition::new("lead").set_roles("1"))
            .add_level(LevelDefinition::new("finance").set_roles("2"))
            .add_level(LevelDefinition::new("lead").set_roles("3"))
            .build()
            .unwrap_err();
        assert_eq!(err, MachineError::EventEndPointNotUnique);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let err = MachineDefinition::new(1)
            .add_level(LevelDefinition::new("lead").set_roles("1,two"))
            .build()
            .unwrap_err();
        assert_eq!(err, MachineError::InvalidId("two".to_string()));
    }

    #[test]
    fn built_machine_keeps_order_and_resolved_sets() {
        let machine = MachineDefinition::new(3)
            .set_name("purchase")
            .set_submitter_name("applicant")
            .set_submitter_edit_fields("title, amount,")
            .set_submitter_confirm(true)
            .set_submitter_confirm_edit_fields("receipt")
            .add_level(LevelDefinition::new("lead").set_roles("5,5,6"))
            .add_level(LevelDefinition::new("cfo").set_users("7"))
            .build()
            .unwrap();

        assert_eq!(machine.category, 3);
        assert_eq!(
            machine.levels.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
            vec!["lead", "cfo"]
        );
        assert_eq!(machine.levels[0].roles.len(), 2);
        assert!(machine.levels[1].users.contains(&7));
        assert!(machine.is_last_level(1));
        assert!(!machine.is_last_level(0));
        assert_eq!(machine.submitter_edit_fields.len(), 2);
        assert!(machine.submitter_confirm_edit_fields.contains("receipt"));
    }

    #[test]
    fn definition_reads_wire_names() {
        let json = r#"{
            "category": 2,
            "name": "leave",
            "submitterName": "employee",
            "submitterEditFields": "days",
            "submitterConfirm": false,
            "levels": [
                {"name": "manager", "refuse": true, "roles": "3"},
                {"name": "hr", "edit": true, "editFields": "days", "users": "11,12"}
            ]
        }"#;
        let def: MachineDefinition = serde_json::from_str(json).unwrap();
        let machine = def.build().unwrap();

        assert_eq!(machine.submitter_name, "employee");
        assert!(machine.levels[0].refuse);
        assert!(machine.levels[1].edit_fields.contains("days"));
        assert_eq!(machine.levels[1].users.len(), 2);
    }
}

// PERMISSION RESOLVER TESTS
#[cfg(test)]
mod permission_tests {
    use super::*;

    #[test]
    fn pending_matches_role_or_user() {
        let machine = MachineDefinition::new(1)
            .set_submitter_edit_fields("title")
            .add_level(LevelDefinition::new("lead").set_roles("5").set_users("9"))
            .build()
            .unwrap();
        let lead = &machine.levels[0];

        assert!(is_pending(lead, 5, 0));
        assert!(is_pending(lead, 0, 9));
        assert!(!is_pending(lead, 9, 5));
        assert_eq!(is_pending(lead, 5, 1), can_act(lead, 5, 1));

        assert!(!can_edit(lead, 5, 0));
        assert!(!can_refuse(lead, 5, 0));
        assert!(submitter_can_edit_field(&machine, "title"));
        assert!(!submitter_can_edit_field(&machine, "amount"));
    }
}

// LOG AND PROJECTION TESTS
#[cfg(test)]
mod log_tests {
    use super::*;

    fn machine(confirm: bool) -> approval_fsm::machine::Machine {
        MachineDefinition::new(1)
            .set_submitter_confirm(confirm)
            .add_level(LevelDefinition::new("L0").set_roles("5"))
            .add_level(LevelDefinition::new("L1").set_users("7"))
            .build()
            .unwrap()
    }

    #[test]
    fn nothing_submitted_projects_all_false() {
        assert_eq!(log::project(&machine(false), &[]), FsmApprovalLog::default());
        assert_eq!(Instance::derive(&machine(false), &[]), None);
    }

    #[test]
    fn level_index_counts_approvals_since_last_resubmit() {
        let m = machine(false);
        let logs = vec![
            entry(1, Action::Submit, 1, 1),
            entry(2, Action::Approve, 5, 50),
            entry(3, Action::Refuse, 0, 7),
            entry(4, Action::Resubmit { keys: vec![] }, 1, 1),
            entry(5, Action::Approve, 5, 50),
        ];
        let instance = Instance::derive(&m, &logs).unwrap();

        assert_eq!(instance.state, InstanceState::Approving(1));
        assert_eq!(instance.chain_len, 5);
        assert!(instance.is_submitter(1));
    }

    #[test]
    fn edits_do_not_move_the_state() {
        let m = machine(false);
        let logs = vec![
            entry(1, Action::Submit, 1, 1),
            entry(2, Action::Edit { keys: vec!["title".into()] }, 1, 1),
        ];
        assert_eq!(
            Instance::derive(&m, &logs).map(|i| i.state),
            Some(InstanceState::Approving(0))
        );
    }

    #[test]
    fn confirmation_projection() {
        let m = machine(true);
        let mut logs = vec![
            entry(1, Action::Submit, 1, 1),
            entry(2, Action::Approve, 5, 50),
            entry(3, Action::Approve, 0, 7),
        ];
        assert!(log::project(&m, &logs).waiting_confirm);

        logs.push(entry(4, Action::Confirm { approved: true }, 1, 1));
        assert_eq!(
            log::project(&m, &logs),
            FsmApprovalLog {
                end: true,
                ..Default::default()
            }
        );
    }

    #[test]
    fn audit_trail_detects_tampering() {
        let logs = linked(vec![
            entry(1, Action::Submit, 1, 1),
            entry(2, Action::Approve, 5, 50),
            entry(3, Action::Approve, 0, 7),
        ]);
        assert_eq!(log::verify_audit_trail(&logs), Ok(()));

        let mut edited = logs.clone();
        edited[1].opinion = "rewritten".to_string();
        assert_eq!(
            log::verify_audit_trail(&edited),
            Err(AuditError::BrokenLink(3))
        );

        let mut reordered = logs.clone();
        reordered[2].sequence = 2;
        assert_eq!(
            log::verify_audit_trail(&reordered),
            Err(AuditError::SequenceOrder(2))
        );
    }
}
