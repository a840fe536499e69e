use tokio::sync::watch;

use crate::{
    error::PuppetError,
    types::{SessionState, StableState},
};

/// Session on/off state machine.
///
/// Every change goes through a single check-and-set on the underlying `watch`
/// channel, so two transitions can never overlap and waiters observe each
/// committed state.
#[derive(Debug)]
pub struct SessionStateMachine {
    state: watch::Sender<SessionState>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        let (state, _) = watch::channel(SessionState::Off);
        Self { state }
    }
}

impl SessionStateMachine {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch every committed state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Record a pending transition toward `target`.
    pub fn begin(&self, target: StableState) -> Result<(), PuppetError> {
        self.try_begin(target)
            .map_err(|current| PuppetError::invalid_transition(current, begin_action(target)))
    }

    /// Like [`Self::begin`] but hands back the observed state on rejection so
    /// callers can pick a more specific error.
    pub fn try_begin(&self, target: StableState) -> Result<(), SessionState> {
        self.commit(|current| next_on_begin(current, target))
            .map(|_| ())
    }

    /// Resolve the pending transition toward `target`.
    pub fn complete(&self, target: StableState) -> Result<(), PuppetError> {
        self.commit(|current| next_on_complete(current, target))
            .map(|_| ())
            .map_err(|current| PuppetError::invalid_transition(current, complete_action(target)))
    }

    /// Abandon the pending transition and return to the stable state it left.
    pub fn rollback(&self) -> Result<StableState, PuppetError> {
        self.commit(next_on_rollback)
            .map(|next| match next {
                SessionState::On => StableState::On,
                _ => StableState::Off,
            })
            .map_err(|current| PuppetError::invalid_transition(current, "rollback"))
    }

    /// Suspend until the state equals `target`. Never times out on its own.
    pub async fn await_state(&self, target: StableState) -> Result<(), PuppetError> {
        let target = SessionState::from(target);
        let mut rx = self.state.subscribe();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| PuppetError::backend("session state channel closed"))
    }

    /// Suspend until no transition is pending and return the settled state.
    pub async fn await_settled(&self) -> Result<StableState, PuppetError> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|state| !state.is_pending())
            .await
            .map(|state| state.stable())
            .map_err(|_| PuppetError::backend("session state channel closed"))?;
        settled.ok_or_else(|| PuppetError::backend("session state did not settle"))
    }

    fn commit<F>(&self, step: F) -> Result<SessionState, SessionState>
    where
        F: FnOnce(SessionState) -> Option<SessionState>,
    {
        let mut outcome = Err(SessionState::Off);
        self.state.send_if_modified(|state| match step(*state) {
            Some(next) => {
                *state = next;
                outcome = Ok(next);
                true
            }
            None => {
                outcome = Err(*state);
                false
            }
        });
        outcome
    }
}

fn next_on_begin(current: SessionState, target: StableState) -> Option<SessionState> {
    let required = match target {
        StableState::On => SessionState::Off,
        StableState::Off => SessionState::On,
    };
    (current == required).then(|| target.pending())
}

fn next_on_complete(current: SessionState, target: StableState) -> Option<SessionState> {
    (current == target.pending()).then(|| target.into())
}

fn next_on_rollback(current: SessionState) -> Option<SessionState> {
    match current {
        SessionState::PendingOn => Some(SessionState::Off),
        SessionState::PendingOff => Some(SessionState::On),
        SessionState::Off | SessionState::On => None,
    }
}

fn begin_action(target: StableState) -> &'static str {
    match target {
        StableState::On => "begin(on)",
        StableState::Off => "begin(off)",
    }
}

fn complete_action(target: StableState) -> &'static str {
    match target {
        StableState::On => "complete(on)",
        StableState::Off => "complete(off)",
    }
}
