//! Driver sub-step selection and success handling.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::{Action, Catalog, TransitionError};

const EXEC_SUFFIX: &str = "_exec";
const POST_SUFFIX: &str = "_post";

/// Which half of a state a driver step implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// Do the work.
    Exec,
    /// Poll for completion.
    Post,
}

impl StepKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Exec => EXEC_SUFFIX,
            Self::Post => POST_SUFFIX,
        }
    }
}

/// A driver step to invoke, displayed as its function name (`turn_on_exec`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Step {
    pub state: String,
    pub kind: StepKind,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.state, self.kind.suffix())
    }
}

/// Strip an `_exec` or `_post` suffix from a state name.
pub fn bare_state(state: &str) -> &str {
    state
        .strip_suffix(EXEC_SUFFIX)
        .or_else(|| state.strip_suffix(POST_SUFFIX))
        .unwrap_or(state)
}

/// The step to run for the action's current state.
///
/// A suffixed state names its step directly. A bare state runs its exec half
/// when it has one, its post half otherwise. Returns `None` for terminal or
/// unknown states and for actions that have not started.
pub fn next_step(action: &Action, catalog: &Catalog) -> Option<Step> {
    let state = action.state.as_deref()?;
    let bare = bare_state(state);
    let desc = catalog.descriptor(bare)?;

    let kind = if state.ends_with(POST_SUFFIX) {
        StepKind::Post
    } else if state.ends_with(EXEC_SUFFIX) || desc.exec {
        StepKind::Exec
    } else if desc.post {
        StepKind::Post
    } else {
        return None;
    };

    Some(Step {
        state: bare.to_string(),
        kind,
    })
}

/// Record a successful step.
///
/// An exec half followed by a post half moves the action to `<state>_post`
/// without advancing; the post runs on the next tick. Anything else advances
/// to the next state of the process.
pub fn apply_success(
    action: &mut Action,
    step: &Step,
    catalog: &Catalog,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    let desc = catalog
        .descriptor(&step.state)
        .ok_or_else(|| TransitionError::UnknownState(step.state.clone()))?;

    if step.kind == StepKind::Exec && desc.post {
        action.state = Some(format!("{}{}", step.state, POST_SUFFIX));
        return Ok(());
    }
    action.advance(catalog, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProcessVariant, StateDescriptor};
    use chrono::TimeZone;
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn catalog() -> Catalog {
        let desc = |exec, post| StateDescriptor {
            exec,
            post,
            ..Default::default()
        };
        let states = vec![
            ("boot_conf".to_string(), desc(true, false)),
            ("turn_on".to_string(), desc(true, true)),
            ("ssh_test".to_string(), desc(false, true)),
            ("deployed".to_string(), desc(false, false)),
        ];
        let processes = vec![ProcessVariant {
            name: "deploy".into(),
            environments: vec![],
            states: ["boot_conf", "turn_on", "ssh_test", "deployed"]
                .map(String::from)
                .to_vec(),
        }];
        Catalog::new(processes, states, BTreeMap::new()).unwrap()
    }

    fn action_in(state: &str, idx: usize) -> Action {
        let mut action = Action::new("node-1");
        action.process = "deploy".into();
        action.state = Some(state.to_string());
        action.state_idx = Some(idx);
        action
    }

    #[rstest]
    #[case("turn_on_exec", "turn_on")]
    #[case("turn_on_post", "turn_on")]
    #[case("turn_on", "turn_on")]
    #[case("post_office", "post_office")]
    fn test_bare_state(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(bare_state(input), expected);
    }

    #[rstest]
    #[case("boot_conf", Some("boot_conf_exec"))]
    #[case("turn_on", Some("turn_on_exec"))]
    #[case("turn_on_post", Some("turn_on_post"))]
    #[case("ssh_test", Some("ssh_test_post"))]
    #[case("deployed", None)]
    #[case("lost", None)]
    fn test_next_step(#[case] state: &str, #[case] expected: Option<&str>) {
        let step = next_step(&action_in(state, 0), &catalog());
        assert_eq!(step.map(|s| s.to_string()).as_deref(), expected);
    }

    #[test]
    fn test_exec_success_moves_to_post_without_advancing() {
        let catalog = catalog();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut action = action_in("turn_on", 1);
        let step = next_step(&action, &catalog).unwrap();

        apply_success(&mut action, &step, &catalog, now).unwrap();
        assert_eq!(action.state.as_deref(), Some("turn_on_post"));
        assert_eq!(action.state_idx, Some(1));
        assert_eq!(action.updated_at, None);

        let step = next_step(&action, &catalog).unwrap();
        apply_success(&mut action, &step, &catalog, now).unwrap();
        assert_eq!(action.state.as_deref(), Some("ssh_test"));
        assert_eq!(action.state_idx, Some(2));
    }

    #[test]
    fn test_exec_only_success_advances() {
        let catalog = catalog();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut action = action_in("boot_conf", 0);
        let step = next_step(&action, &catalog).unwrap();
        apply_success(&mut action, &step, &catalog, now).unwrap();
        assert_eq!(action.state.as_deref(), Some("turn_on"));
    }
}
