//! Tab-follow decisions.
//!
//! [`TabFollow`] is the only writer of the [`TargetBinding`]. It turns target
//! lifecycle notifications into a [`FollowDecision`]; carrying the decision
//! out (draining, stopping and starting screencasts) is the frame source's
//! job.

use pagereel_core::TargetId;

/// Which target frames are taken from, and which one is next in line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetBinding {
    /// Target whose screencast feeds the recording.
    pub current_target_id: TargetId,
    /// Newest tab opened while the current one is still alive.
    pub pending_switch_target_id: Option<TargetId>,
}

/// What the frame source should do after a notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FollowDecision {
    /// Keep the current subscription.
    Stay,
    /// Drain the old target, then subscribe to this one.
    SwitchTo(TargetId),
    /// The current target lost its screencast but lives; subscribe again.
    Resubscribe,
    /// The current target is gone and there is nothing to switch to.
    Lost,
}

/// Tab-follow state machine for one recording session.
#[derive(Debug)]
pub struct TabFollow {
    binding: TargetBinding,
    follow_new_tab: bool,
    current_alive: bool,
}

impl TabFollow {
    /// Start bound to the page's primary target.
    pub fn new(primary: TargetId, follow_new_tab: bool) -> Self {
        Self {
            binding: TargetBinding {
                current_target_id: primary,
                pending_switch_target_id: None,
            },
            follow_new_tab,
            current_alive: true,
        }
    }

    /// Current binding.
    pub fn binding(&self) -> &TargetBinding {
        &self.binding
    }

    /// Target currently recorded.
    pub fn current(&self) -> &TargetId {
        &self.binding.current_target_id
    }

    /// Whether the current target is still open.
    pub fn is_current_alive(&self) -> bool {
        self.current_alive
    }

    /// A new tab appeared.
    ///
    /// While the current target lives the new tab becomes the pending
    /// candidate (newest wins). Once the current target is gone, a new tab
    /// is switched to immediately.
    pub fn on_target_created(&mut self, target: TargetId) -> FollowDecision {
        if !self.follow_new_tab || target == self.binding.current_target_id {
            return FollowDecision::Stay;
        }
        if self.current_alive {
            self.binding.pending_switch_target_id = Some(target);
            FollowDecision::Stay
        } else {
            self.switch(target)
        }
    }

    /// A tab closed.
    pub fn on_target_destroyed(&mut self, target: &TargetId) -> FollowDecision {
        if self.binding.pending_switch_target_id.as_ref() == Some(target) {
            self.binding.pending_switch_target_id = None;
            return FollowDecision::Stay;
        }
        if *target != self.binding.current_target_id || !self.current_alive {
            return FollowDecision::Stay;
        }
        self.current_alive = false;
        match self.take_pending() {
            Some(next) => self.switch(next),
            None => FollowDecision::Lost,
        }
    }

    /// A tab navigated. Only navigations that ended the current target's
    /// screencast matter.
    pub fn on_navigated(&mut self, target: &TargetId, screencast_ended: bool) -> FollowDecision {
        if !screencast_ended || *target != self.binding.current_target_id || !self.current_alive {
            return FollowDecision::Stay;
        }
        match self.take_pending() {
            Some(next) => self.switch(next),
            None => FollowDecision::Resubscribe,
        }
    }

    fn take_pending(&mut self) -> Option<TargetId> {
        if self.follow_new_tab {
            self.binding.pending_switch_target_id.take()
        } else {
            None
        }
    }

    fn switch(&mut self, next: TargetId) -> FollowDecision {
        self.binding.current_target_id = next.clone();
        self.binding.pending_switch_target_id = None;
        self.current_alive = true;
        FollowDecision::SwitchTo(next)
    }
}
