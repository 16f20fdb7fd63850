//! The activity lifecycle state machine.

/// The lifecycle state of an activity.
///
/// Transitions only move forward, and each state is entered at most once:
///
/// ```text
/// (unset) → Init → Ready → Cleanup → Close
/// ```
///
/// - **Init**: the client asked to start; the plugin is being set up.
/// - **Ready**: the start reply went out; the plugin is live.
/// - **Cleanup**: the activity is being closed.
/// - **Close**: the plugin is gone. Terminal.
///
/// States can be skipped: closing an activity that was never started goes
/// straight from unset to `Cleanup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleStatus {
    Init,
    Ready,
    Cleanup,
    Close,
}

impl LifecycleStatus {
    /// Returns the following state, or `None` after `Close`.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Init => Some(Self::Ready),
            Self::Ready => Some(Self::Cleanup),
            Self::Cleanup => Some(Self::Close),
            Self::Close => None,
        }
    }

    /// Returns `true` if moving from `current` to `self` goes forward.
    pub fn follows(self, current: Option<Self>) -> bool {
        current.is_none_or(|c| self > c)
    }

    /// Returns `true` once the activity is being torn down.
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Cleanup | Self::Close)
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Ready => write!(f, "ready"),
            Self::Cleanup => write!(f, "cleanup"),
            Self::Close => write!(f, "close"),
        }
    }
}
