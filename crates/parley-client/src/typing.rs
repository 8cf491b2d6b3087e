use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use parley_types::models::UserId;

/// Idle time after the last keystroke before typing is cleared.
pub const DEFAULT_TYPING_WINDOW: Duration = Duration::from_secs(3);

/// Where typing state changes are sent. Fire-and-forget.
pub trait TypingOutbox: Send + Sync + 'static {
    fn set_typing(&self, partner: UserId, is_typing: bool);
}

/// Collapses keystrokes into one `true` per burst and one `false` when the
/// burst ends, with a single idle timer per partner.
///
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct TypingDebouncer {
    outbox: Arc<dyn TypingOutbox>,
    window: Duration,
    state: Arc<Mutex<DebounceState>>,
}

#[derive(Default)]
struct DebounceState {
    bursts: HashMap<UserId, Burst>,
    next_generation: u64,
}

struct Burst {
    timer: CancellationToken,
    generation: u64,
}

impl TypingDebouncer {
    pub fn new(outbox: Arc<dyn TypingOutbox>) -> Self {
        Self::with_window(outbox, DEFAULT_TYPING_WINDOW)
    }

    pub fn with_window(outbox: Arc<dyn TypingOutbox>, window: Duration) -> Self {
        Self {
            outbox,
            window,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    /// Record a keystroke towards `partner` and re-arm the idle timer.
    pub fn keystroke(&self, partner: UserId) {
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        let timer = CancellationToken::new();

        match state.bursts.insert(partner, Burst { timer: timer.clone(), generation }) {
            Some(previous) => previous.timer.cancel(),
            None => self.outbox.set_typing(partner, true),
        }
        drop(state);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(this.window) => this.expire(partner, generation),
            }
        });
    }

    /// End the burst now, e.g. right after the message was sent.
    pub fn stop(&self, partner: UserId) {
        let removed = self.lock().bursts.remove(&partner);
        if let Some(burst) = removed {
            burst.timer.cancel();
            self.outbox.set_typing(partner, false);
        }
    }

    pub fn is_typing(&self, partner: UserId) -> bool {
        self.lock().bursts.contains_key(&partner)
    }

    fn expire(&self, partner: UserId, generation: u64) {
        let mut state = self.lock();
        // A keystroke may have re-armed the burst while this timer was firing
        if state.bursts.get(&partner).is_some_and(|b| b.generation == generation) {
            state.bursts.remove(&partner);
            drop(state);
            trace!("Typing towards {} went idle", partner);
            self.outbox.set_typing(partner, false);
        }
    }

    fn lock(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
