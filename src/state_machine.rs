//! Batch item lifecycle:
//! Pending → CacheCheck → {CacheHit → Done | CacheMiss → AwaitSlot → InFlight →
//! {Success → Delay → Done | Failure → ReportError → Done}}.
//! Aborted is reachable from any non-terminal state when the batch context ends.

use serde::Serialize;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ItemState {
    Pending,
    CacheCheck,
    CacheHit,
    CacheMiss,
    AwaitSlot,
    InFlight,
    Success,
    Failure,
    Delay,
    ReportError,
    Done,
    Aborted,
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ItemState::Pending => "Pending",
            ItemState::CacheCheck => "CacheCheck",
            ItemState::CacheHit => "CacheHit",
            ItemState::CacheMiss => "CacheMiss",
            ItemState::AwaitSlot => "AwaitSlot",
            ItemState::InFlight => "InFlight",
            ItemState::Success => "Success",
            ItemState::Failure => "Failure",
            ItemState::Delay => "Delay",
            ItemState::ReportError => "ReportError",
            ItemState::Done => "Done",
            ItemState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Done | ItemState::Aborted)
    }

    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: ItemState) -> bool {
        matches!(
            (self, next),
            (ItemState::Pending, ItemState::CacheCheck)
                | (ItemState::CacheCheck, ItemState::CacheHit)
                | (ItemState::CacheCheck, ItemState::CacheMiss)
                | (ItemState::CacheHit, ItemState::Done)
                | (ItemState::CacheMiss, ItemState::AwaitSlot)
                | (ItemState::AwaitSlot, ItemState::InFlight)
                | (ItemState::InFlight, ItemState::Success)
                | (ItemState::InFlight, ItemState::Failure)
                | (ItemState::Success, ItemState::Delay)
                | (ItemState::Success, ItemState::Done) // value came from cache after all
                | (ItemState::Delay, ItemState::Done)
                | (ItemState::Failure, ItemState::ReportError)
                | (ItemState::ReportError, ItemState::Done)
        ) || (!self.is_terminal() && next == ItemState::Aborted)
    }
}

/// Tracks one item through the lifecycle, logging each step.
#[derive(Debug)]
pub struct ItemLifecycle {
    index: usize,
    state: ItemState,
}

impl ItemLifecycle {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: ItemState::Pending,
        }
    }

    pub fn current(&self) -> ItemState {
        self.state
    }

    /// Attempt a transition. Returns Ok(new_state) or Err with reason.
    pub fn transition(&mut self, next: ItemState) -> Result<ItemState, String> {
        let current = self.state;
        if !current.can_transition_to(next) {
            let msg = format!("invalid item transition: {} -> {}", current, next);
            warn!(index = self.index, "{}", msg);
            return Err(msg);
        }
        self.state = next;
        trace!(index = self.index, from = %current, to = %next, "item_transition");
        Ok(next)
    }

    /// Advance and ignore invalid steps (they are already logged).
    pub fn advance(&mut self, next: ItemState) {
        let _ = self.transition(next);
    }
}
