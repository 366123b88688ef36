//! Invocation status and lifecycle events.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Where an invocation is in its lifecycle.
///
/// `Idle → Running → {Success, Errored, Cancelled}`; terminal states are final.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    #[default]
    Idle,
    Running,
    Success,
    Errored,
    Cancelled,
}

impl InvocationStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Errored | Self::Cancelled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Success => "success",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }

    pub(crate) fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Idle => next == Self::Running,
            Self::Running => next.is_terminal(),
            Self::Success | Self::Errored | Self::Cancelled => false,
        }
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvocationStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "errored" => Ok(Self::Errored),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(crate::Error::message(format!(
                "unknown invocation status: {other}"
            ))),
        }
    }
}

/// Something that happened to a job, used to pick hooks and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Begin,
    Complete,
    Success,
    Errored,
    Cancelled,
    Broken,
    Fixed,
    Enabled,
    Disabled,
}

impl LifecycleEvent {
    pub const ALL: [Self; 9] = [
        Self::Begin,
        Self::Complete,
        Self::Success,
        Self::Errored,
        Self::Cancelled,
        Self::Broken,
        Self::Fixed,
        Self::Enabled,
        Self::Disabled,
    ];

    /// Stable flag string carried in notifications.
    #[must_use]
    pub fn flag(self) -> &'static str {
        match self {
            Self::Begin => "job.begin",
            Self::Complete => "job.complete",
            Self::Success => "job.success",
            Self::Errored => "job.errored",
            Self::Cancelled => "job.cancelled",
            Self::Broken => "job.broken",
            Self::Fixed => "job.fixed",
            Self::Enabled => "job.enabled",
            Self::Disabled => "job.disabled",
        }
    }

    /// The event reported when an invocation ends in `status`.
    #[must_use]
    pub fn for_outcome(status: InvocationStatus) -> Option<Self> {
        match status {
            InvocationStatus::Success => Some(Self::Success),
            InvocationStatus::Errored => Some(Self::Errored),
            InvocationStatus::Cancelled => Some(Self::Cancelled),
            InvocationStatus::Idle | InvocationStatus::Running => None,
        }
    }

    /// Broken or fixed, comparing an outcome with the one before it.
    #[must_use]
    pub fn transition(
        previous: Option<InvocationStatus>,
        current: InvocationStatus,
    ) -> Option<Self> {
        match (previous?, current) {
            (InvocationStatus::Success, InvocationStatus::Errored) => Some(Self::Broken),
            (InvocationStatus::Errored, InvocationStatus::Success) => Some(Self::Fixed),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{InvocationStatus::*, *},
        rstest::rstest,
    };

    #[rstest]
    #[case(None, Errored, None)]
    #[case(None, Success, None)]
    #[case(Some(Success), Errored, Some(LifecycleEvent::Broken))]
    #[case(Some(Errored), Success, Some(LifecycleEvent::Fixed))]
    #[case(Some(Success), Success, None)]
    #[case(Some(Errored), Errored, None)]
    #[case(Some(Cancelled), Errored, None)]
    #[case(Some(Errored), Cancelled, None)]
    fn transitions(
        #[case] previous: Option<InvocationStatus>,
        #[case] current: InvocationStatus,
        #[case] expected: Option<LifecycleEvent>,
    ) {
        assert_eq!(LifecycleEvent::transition(previous, current), expected);
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [Success, Errored, Cancelled] {
            for next in [Idle, Running, Success, Errored, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(Idle.can_transition_to(Running));
        assert!(!Idle.can_transition_to(Success));
        assert!(Running.can_transition_to(Cancelled));
    }

    #[test]
    fn flags_are_unique() {
        let mut flags: Vec<_> = LifecycleEvent::ALL.iter().map(|e| e.flag()).collect();
        flags.sort_unstable();
        flags.dedup();
        assert_eq!(flags.len(), LifecycleEvent::ALL.len());
    }
}
