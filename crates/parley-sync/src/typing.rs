//! Debounced "I am typing" broadcaster for the local user.
//!
//! ```text
//!            non-empty input / send true, arm timer
//!   Idle  ------------------------------------------->  Active
//!    ^                                                   |  |
//!    |   empty input | timer expiry | send | shutdown    |  | further input:
//!    +------------------- send false --------------------+  | re-arm timer
//!                                                           v
//! ```
//!
//! Every input change replaces the outstanding timer. Timer expiries are not
//! applied by the timer task itself: it only reports its generation through
//! the `on_expired` callback, and the owner feeds that back into
//! [`TypingBroadcaster::expired`] on its own task. Stale generations are
//! ignored, so only the most recent timer can end an `Active` phase.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use parley_shared::{ConversationKey, UserId};

use crate::channels::PresenceChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingState {
    Idle,
    Active,
}

pub struct TypingBroadcaster {
    conversation: ConversationKey,
    user: UserId,
    presence: Option<Arc<dyn PresenceChannel>>,
    timeout: Duration,
    state: TypingState,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    on_expired: Arc<dyn Fn(u64) + Send + Sync>,
    signals: Option<mpsc::UnboundedSender<bool>>,
}

impl TypingBroadcaster {
    /// `presence` may be absent, in which case the state machine still runs
    /// but nothing is broadcast.
    pub fn new(
        conversation: ConversationKey,
        user: UserId,
        presence: Option<Arc<dyn PresenceChannel>>,
        timeout: Duration,
        on_expired: impl Fn(u64) + Send + Sync + 'static,
    ) -> Self {
        Self {
            conversation,
            user,
            presence,
            timeout,
            state: TypingState::Idle,
            generation: 0,
            timer: None,
            on_expired: Arc::new(on_expired),
            signals: None,
        }
    }

    pub fn state(&self) -> TypingState {
        self.state
    }

    /// The composer text changed.
    pub fn input_changed(&mut self, text: &str) {
        if text.trim().is_empty() {
            self.stop();
            return;
        }

        if self.state == TypingState::Idle {
            self.state = TypingState::Active;
            self.emit(true);
        }
        self.arm_timer();
    }

    /// A timer of generation `generation` fired. Returns `true` if it ended
    /// the active phase.
    pub fn expired(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != TypingState::Active {
            debug!(generation, current = self.generation, "ignoring stale typing timer");
            return false;
        }
        self.timer = None;
        self.state = TypingState::Idle;
        self.emit(false);
        true
    }

    /// Retract any active broadcast right away.
    pub fn stop(&mut self) {
        self.cancel_timer();
        if self.state == TypingState::Active {
            self.state = TypingState::Idle;
            self.emit(false);
        }
    }

    /// Final retraction on teardown. Queued signals are still delivered, then
    /// the forwarding task exits.
    pub fn shutdown(&mut self) {
        self.stop();
        self.signals = None;
    }

    fn arm_timer(&mut self) {
        self.cancel_timer();
        let generation = self.generation;
        let deadline = tokio::time::Instant::now() + self.timeout;
        let on_expired = Arc::clone(&self.on_expired);
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_expired(generation);
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
    }

    fn emit(&mut self, is_typing: bool) {
        let Some(presence) = &self.presence else {
            return;
        };
        let signals = self.signals.get_or_insert_with(|| {
            spawn_forwarder(
                Arc::clone(presence),
                self.conversation.clone(),
                self.user.clone(),
            )
        });
        if signals.send(is_typing).is_err() {
            debug!("typing forwarder is gone");
        }
    }
}

impl Drop for TypingBroadcaster {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Forward typing signals one at a time so they reach the channel in the
/// order they were produced. Failures are ignored.
fn spawn_forwarder(
    presence: Arc<dyn PresenceChannel>,
    conversation: ConversationKey,
    user: UserId,
) -> mpsc::UnboundedSender<bool> {
    let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
    tokio::spawn(async move {
        while let Some(is_typing) = rx.recv().await {
            if let Err(e) = presence.set_typing(&conversation, &user, is_typing).await {
                debug!(conversation = %conversation, is_typing, error = %e, "typing signal failed");
            }
        }
    });
    tx
}
