use crate::LaunchError;

/// Progress of a single launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Unstarted,
    BundleCreated,
    Ready,
    Running,
    Exited,
    Killed,
    Failed,
}

impl LaunchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Killed | Self::Failed)
    }
}

impl std::fmt::Display for LaunchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchState::Unstarted => write!(f, "unstarted"),
            LaunchState::BundleCreated => write!(f, "bundle-created"),
            LaunchState::Ready => write!(f, "ready"),
            LaunchState::Running => write!(f, "running"),
            LaunchState::Exited => write!(f, "exited"),
            LaunchState::Killed => write!(f, "killed"),
            LaunchState::Failed => write!(f, "failed"),
        }
    }
}

pub fn validate_transition(from: LaunchState, to: LaunchState) -> Result<(), LaunchError> {
    let valid = matches!(
        (from, to),
        (LaunchState::Unstarted, LaunchState::BundleCreated)
            | (LaunchState::BundleCreated, LaunchState::Ready)
            | (LaunchState::Ready, LaunchState::Running)
            | (LaunchState::Running, LaunchState::Exited | LaunchState::Killed)
            | (_, LaunchState::Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(LaunchError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
