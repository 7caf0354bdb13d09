//! Cache refresh strategies and their timer transitions.

use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// Policy governing when a service's cached endpoints are refreshed or dropped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Serve from the cache and re-poll the registry in the background every TTL.
    #[default]
    MaintainViaPoll,
    /// Serve from the cache and drop the cached list every TTL.
    TimedEject,
    /// Query the registry on every call; no timer.
    AlwaysPoll,
}

/// What a service's timer does when it fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerAction {
    /// Start a background refresh.
    Refresh,
    /// Clear the cached endpoint list.
    Eject,
    /// Nothing; the timer is not rearmed.
    Expire,
}

impl Strategy {
    /// Whether every lookup must go to the registry.
    pub(crate) fn polls_every_call(self) -> bool {
        matches!(self, Self::AlwaysPoll)
    }

    /// Whether a timer is armed after a refresh completes.
    pub(crate) fn arms_timer(self) -> bool {
        !matches!(self, Self::AlwaysPoll)
    }

    /// Transition taken when an armed timer fires under this strategy.
    pub(crate) fn on_timer(self) -> TimerAction {
        match self {
            Self::MaintainViaPoll => TimerAction::Refresh,
            Self::TimedEject => TimerAction::Eject,
            Self::AlwaysPoll => TimerAction::Expire,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::MaintainViaPoll => "maintain-via-poll",
            Self::TimedEject => "timed-eject",
            Self::AlwaysPoll => "always-poll",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "maintain-via-poll" => Ok(Self::MaintainViaPoll),
            "timed-eject" => Ok(Self::TimedEject),
            "always-poll" => Ok(Self::AlwaysPoll),
            other => Err(ParseError::new("cache strategy", other)),
        }
    }
}
