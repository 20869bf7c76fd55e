use std::fmt;

use super::{ErrorKind, Result};

/// Desired end state of one instance
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Started,
    Stopped,
    Detached,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TargetState::Started => write!(f, "started"),
            TargetState::Stopped => write!(f, "stopped"),
            TargetState::Detached => write!(f, "detached"),
        }
    }
}

/// A per-index override, as accepted on the CLI and in `job_states`
///
/// `recreate` is not an end state; it forces VM replacement on the way to
/// `started`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StateOverride {
    Started,
    Stopped,
    Detached,
    Recreate,
}

impl StateOverride {
    pub fn parse(s: &str, path: &str) -> Result<StateOverride> {
        match s {
            "started" => Ok(StateOverride::Started),
            "stopped" => Ok(StateOverride::Stopped),
            "detached" => Ok(StateOverride::Detached),
            "recreate" => Ok(StateOverride::Recreate),
            _ => Err(ErrorKind::InvalidValue(
                path.into(),
                "must be one of started|stopped|detached|recreate".into(),
            ).into()),
        }
    }

    pub fn target(&self) -> TargetState {
        match self {
            StateOverride::Stopped => TargetState::Stopped,
            StateOverride::Detached => TargetState::Detached,
            _ => TargetState::Started,
        }
    }
}

/// Transition classification produced by the preparer
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Recreate,
    Delete,
    Noop,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Recreate => write!(f, "recreate"),
            Action::Delete => write!(f, "delete"),
            Action::Noop => write!(f, "noop"),
        }
    }
}

/// One `(job, index)` slot of the plan
///
/// Parsed fields are fixed after `Plan::parse`; the binding fields (vm,
/// disk, digests, action) are filled in by the preparer before any updater
/// touches the instance.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Instance {
    pub job: String,
    pub index: u32,
    pub target: TargetState,
    pub recreate: bool,
    pub pool: String,
    pub networks: Vec<String>,
    pub persistent_disk: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_digest: Option<String>,
    pub action: Action,
}

impl Instance {
    pub fn id(&self) -> String {
        format!("{}/{}", self.job, self.index)
    }
}
