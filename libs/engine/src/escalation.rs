//! Failure escalation: wait, hard reboot, then give up.

use chrono::{DateTime, TimeDelta, Utc};

use crate::{Action, Catalog, Checkpoint, TransitionError, LOST, REBOOT};

/// What happened to an action after a failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureResponse {
    /// Still within budget; try again next tick.
    Waiting { elapsed: TimeDelta },

    /// The reboot process was started; the action resumes at `checkpoint`
    /// once the resource is back.
    HardReboot { checkpoint: Checkpoint },

    /// The lost timeout expired and the action is now `lost`.
    Lost { elapsed: TimeDelta },
}

/// Apply the escalation ladder to an action whose step just failed.
///
/// `updated_at` is initialized to `now` when unset. A hard reboot is
/// attempted once per checkpoint and never from inside the reboot process.
/// When a reboot is pending or was just started, the lost timeout is not
/// consulted this tick.
pub fn escalate(
    action: &mut Action,
    catalog: &Catalog,
    now: DateTime<Utc>,
) -> Result<FailureResponse, TransitionError> {
    let updated_at = *action.updated_at.get_or_insert(now);
    let elapsed = now - updated_at;

    let state = action.bare_state().unwrap_or_default().to_string();
    let Some(desc) = catalog.descriptor(&state).copied() else {
        action.state = Some(LOST.to_string());
        return Err(TransitionError::UnknownState(state));
    };

    let checkpoint = action.checkpoint();
    if desc.before_reboot > 0
        && action.process != REBOOT
        && action.reboot_checkpoint != checkpoint
    {
        if elapsed <= seconds(desc.before_reboot) {
            return Ok(FailureResponse::Waiting { elapsed });
        }
        if let Some(checkpoint) = checkpoint {
            action.reboot_checkpoint = Some(checkpoint.clone());
            action.init_process(REBOOT, catalog, now)?;
            return Ok(FailureResponse::HardReboot { checkpoint });
        }
    }

    if desc.lost > 0 && elapsed > seconds(desc.lost) {
        if action.process != REBOOT {
            action.reboot_checkpoint = checkpoint;
        }
        action.state = Some(LOST.to_string());
        return Ok(FailureResponse::Lost { elapsed });
    }

    Ok(FailureResponse::Waiting { elapsed })
}

fn seconds(secs: u64) -> TimeDelta {
    TimeDelta::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{apply_success, next_step, REBOOTED};
    use chrono::TimeZone;

    const CATALOG: &str = r#"
[[processes]]
name = "deploy"
states = ["boot_conf", "turn_on", "ssh_test", "deployed"]

[[processes]]
name = "reboot"
states = ["turn_off", "coming_back", "rebooted"]

[[states]]
name = "boot_conf"
exec = true

[[states]]
name = "turn_on"
exec = true
post = true
before_reboot = 60
lost = 90

[[states]]
name = "ssh_test"
post = true
lost = 30

[[states]]
name = "deployed"

[[states]]
name = "turn_off"
exec = true
lost = 40

[[states]]
name = "coming_back"
post = true
lost = 40

[[states]]
name = "rebooted"
"#;

    fn catalog() -> Catalog {
        Catalog::from_toml_str(CATALOG).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    /// An action that entered `turn_on` at t=0.
    fn in_turn_on(catalog: &Catalog) -> Action {
        let mut action = Action::new("node-3");
        action.init_process("deploy", catalog, at(0)).unwrap();
        action.advance(catalog, at(0)).unwrap();
        assert_eq!(action.state.as_deref(), Some("turn_on"));
        action
    }

    #[test]
    fn test_first_failure_initializes_updated_at() {
        let catalog = catalog();
        let mut action = in_turn_on(&catalog);
        action.updated_at = None;

        let response = escalate(&mut action, &catalog, at(10)).unwrap();
        assert_eq!(
            response,
            FailureResponse::Waiting {
                elapsed: TimeDelta::zero()
            }
        );
        assert_eq!(action.updated_at, Some(at(10)));
    }

    #[test]
    fn test_waits_until_before_reboot() {
        let catalog = catalog();
        let mut action = in_turn_on(&catalog);
        let before = action.clone();

        let response = escalate(&mut action, &catalog, at(60)).unwrap();
        assert!(matches!(response, FailureResponse::Waiting { .. }));
        assert_eq!(action, before);
    }

    #[test]
    fn test_hard_reboot_after_before_reboot() {
        let catalog = catalog();
        let mut action = in_turn_on(&catalog);

        let response = escalate(&mut action, &catalog, at(61)).unwrap();
        let expected = Checkpoint::new("deploy", 1);
        assert_eq!(
            response,
            FailureResponse::HardReboot {
                checkpoint: expected.clone()
            }
        );
        assert_eq!(action.process, REBOOT);
        assert_eq!(action.state.as_deref(), Some("turn_off"));
        assert_eq!(action.reboot_checkpoint, Some(expected));
        assert_eq!(action.updated_at, Some(at(61)));
    }

    #[test]
    fn test_reboot_precedes_lost() {
        let catalog = catalog();
        for t in 61..90 {
            let mut action = in_turn_on(&catalog);
            escalate(&mut action, &catalog, at(t)).unwrap();
            assert_eq!(action.process, REBOOT, "t = {t}");
            assert!(!action.is_lost(), "t = {t}");
        }
    }

    #[test]
    fn test_second_failure_at_same_point_is_lost() {
        let catalog = catalog();
        let mut action = in_turn_on(&catalog);
        action.reboot_checkpoint = action.checkpoint();

        let response = escalate(&mut action, &catalog, at(80)).unwrap();
        assert!(matches!(response, FailureResponse::Waiting { .. }));

        let response = escalate(&mut action, &catalog, at(91)).unwrap();
        assert!(matches!(response, FailureResponse::Lost { .. }));
        assert!(action.is_lost());
        assert_eq!(action.reboot_checkpoint, Some(Checkpoint::new("deploy", 1)));
    }

    #[test]
    fn test_lost_without_reboot_budget_saves_checkpoint() {
        let catalog = catalog();
        let mut action = in_turn_on(&catalog);
        action.advance(&catalog, at(0)).unwrap();
        assert_eq!(action.bare_state(), Some("ssh_test"));

        escalate(&mut action, &catalog, at(31)).unwrap();
        assert!(action.is_lost());
        assert_eq!(action.reboot_checkpoint, Some(Checkpoint::new("deploy", 2)));
    }

    #[test]
    fn test_lost_during_reboot_keeps_first_checkpoint() {
        let catalog = catalog();
        let mut action = in_turn_on(&catalog);
        escalate(&mut action, &catalog, at(61)).unwrap();

        let response = escalate(&mut action, &catalog, at(61 + 41)).unwrap();
        assert!(matches!(response, FailureResponse::Lost { .. }));
        assert_eq!(action.reboot_checkpoint, Some(Checkpoint::new("deploy", 1)));
    }

    #[test]
    fn test_deploy_scenario_ends_lost_when_reboot_never_completes() {
        let catalog = catalog();
        let mut action = Action::new("node-3");
        action.init_process("deploy", &catalog, at(0)).unwrap();
        assert_eq!(action.state_idx, Some(0));
        assert_eq!(action.state.as_deref(), Some("boot_conf"));

        let step = next_step(&action, &catalog).unwrap();
        apply_success(&mut action, &step, &catalog, at(0)).unwrap();

        // turn_on keeps failing every tick
        let mut t = 0;
        while action.process != REBOOT {
            t += 3;
            escalate(&mut action, &catalog, at(t)).unwrap();
            assert!(!action.is_lost());
        }
        assert!(t > 60 && t < 90);

        // and the reboot never comes back
        while !action.is_lost() {
            t += 3;
            escalate(&mut action, &catalog, at(t)).unwrap();
            assert_ne!(action.state.as_deref(), Some(REBOOTED));
        }
        assert!(t > 90);
        assert_eq!(action.reboot_checkpoint, Some(Checkpoint::new("deploy", 1)));
    }

    #[test]
    fn test_unknown_state_is_lost() {
        let catalog = catalog();
        let mut action = in_turn_on(&catalog);
        action.state = Some("warp_drive".into());
        let err = escalate(&mut action, &catalog, at(1)).unwrap_err();
        assert_eq!(err, TransitionError::UnknownState("warp_drive".into()));
        assert!(action.is_lost());
    }
}
