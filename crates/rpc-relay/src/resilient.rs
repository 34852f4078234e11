//! Reconnection policy shared by observer endpoints and inspector sessions.
//!
//! [`ResilientLink`] does no I/O and owns no timers. Callers report what
//! happened to their channel and the page, and get back the [`NextStep`] to
//! take.

use std::time::Duration;

use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Retry after `delay`, at most `max_attempts` times in a row, only while
    /// the page is visible.
    Bounded { max_attempts: u32, delay: Duration },
    /// Try once each time the page becomes visible again.
    OnVisibility,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// The host went away for good; nothing will reconnect.
    Unavailable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextStep {
    ConnectNow,
    RetryAfter(Duration),
    AwaitVisibility,
    GiveUp,
    Nothing,
}

#[derive(Clone, Debug)]
pub struct ResilientLink {
    policy: ReconnectPolicy,
    state: LinkState,
    attempts: u32,
    visible: bool,
}

impl ResilientLink {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: LinkState::Disconnected,
            attempts: 0,
            visible: true,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn begin_connect(&mut self) {
        if self.state != LinkState::Unavailable {
            self.state = LinkState::Connecting;
        }
    }

    pub fn connected(&mut self) {
        if self.state != LinkState::Unavailable {
            self.state = LinkState::Connected;
            self.attempts = 0;
        }
    }

    /// The channel dropped, or a connection attempt failed.
    pub fn disconnected(&mut self) -> NextStep {
        if self.state == LinkState::Unavailable {
            return NextStep::GiveUp;
        }
        self.state = LinkState::Disconnected;
        self.plan_retry()
    }

    pub fn visibility_changed(&mut self, visible: bool) -> NextStep {
        self.visible = visible;
        if self.state != LinkState::Disconnected {
            return NextStep::Nothing;
        }
        if !visible {
            // a pending retry must not fire while hidden
            return NextStep::AwaitVisibility;
        }
        match self.policy {
            ReconnectPolicy::OnVisibility => NextStep::ConnectNow,
            ReconnectPolicy::Bounded { max_attempts, .. } => {
                if self.attempts < max_attempts {
                    NextStep::ConnectNow
                } else {
                    NextStep::GiveUp
                }
            }
        }
    }

    /// The page resumed from the back/forward cache with its old state. The
    /// old channel is dead even if nothing said so; start over.
    pub fn restored_from_cache(&mut self) -> NextStep {
        self.visible = true;
        self.restart()
    }

    /// Drop whatever the link was doing and connect again with a fresh
    /// attempt budget.
    pub fn restart(&mut self) -> NextStep {
        if self.state == LinkState::Unavailable {
            return NextStep::GiveUp;
        }
        self.state = LinkState::Disconnected;
        self.attempts = 0;
        NextStep::ConnectNow
    }

    /// Terminal: the host runtime is gone.
    pub fn invalidate(&mut self) {
        self.state = LinkState::Unavailable;
    }

    fn plan_retry(&mut self) -> NextStep {
        match self.policy {
            ReconnectPolicy::OnVisibility => NextStep::AwaitVisibility,
            ReconnectPolicy::Bounded { max_attempts, delay } => {
                if !self.visible {
                    return NextStep::AwaitVisibility;
                }
                if self.attempts >= max_attempts {
                    debug!(attempts = self.attempts, "reconnect attempts exhausted");
                    return NextStep::GiveUp;
                }
                self.attempts += 1;
                debug!(attempt = self.attempts, max_attempts, "scheduling reconnect");
                NextStep::RetryAfter(delay)
            }
        }
    }
}
