//! Cancellable one-shot timers
//!
//! A [`PendingAction`] is `Armed` until it either fires or is cancelled;
//! both are terminal. The fire callback receives a [`TimerTicket`] and must
//! claim it before acting, under the same lock that callers cancel under, so
//! a cancel that wins the race always suppresses the action.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Armed,
    Fired,
    Cancelled,
}

/// Handed to the fire callback
pub struct TimerTicket {
    state: Arc<Mutex<TimerState>>,
}

impl TimerTicket {
    /// Move Armed → Fired. False if the timer was cancelled first.
    pub fn claim(&self) -> bool {
        let mut state = self.state.lock();
        if *state != TimerState::Armed {
            return false;
        }
        *state = TimerState::Fired;
        true
    }
}

/// A scheduled action that has not necessarily run yet
pub struct PendingAction {
    kind: &'static str,
    state: Arc<Mutex<TimerState>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl PendingAction {
    /// Run `on_fire` after `delay` unless cancelled
    pub fn spawn<F>(kind: &'static str, delay: Duration, on_fire: F) -> Self
    where
        F: FnOnce(TimerTicket) + Send + 'static,
    {
        let state = Arc::new(Mutex::new(TimerState::Armed));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let ticket = TimerTicket {
            state: state.clone(),
        };

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => on_fire(ticket),
                _ = cancel_rx => {
                    // Sender dropped without an explicit cancel counts too
                    let mut state = ticket.state.lock();
                    if *state == TimerState::Armed {
                        *state = TimerState::Cancelled;
                    }
                }
            }
        });

        Self {
            kind,
            state,
            cancel_tx: Some(cancel_tx),
        }
    }

    /// An action that already ran inline
    pub fn fired(kind: &'static str) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(TimerState::Fired)),
            cancel_tx: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn state(&self) -> TimerState {
        *self.state.lock()
    }

    pub fn is_armed(&self) -> bool {
        self.state() == TimerState::Armed
    }

    /// Cancel if still armed. Returns true if this call cancelled it.
    pub fn cancel(&mut self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != TimerState::Armed {
                return false;
            }
            *state = TimerState::Cancelled;
        }
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
        debug!("Cancelled pending {}", self.kind);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce(TimerTicket) + Send + 'static {
        let counter = counter.clone();
        move |ticket| {
            if ticket.claim() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pending = PendingAction::spawn("PLAY", Duration::from_millis(750), counting(&counter));
        assert!(pending.is_armed());

        tokio::time::sleep(Duration::from_millis(749)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pending.state(), TimerState::Fired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_action() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pending = PendingAction::spawn("PAUSE", Duration::from_millis(100), counting(&counter));

        assert!(pending.cancel());
        assert!(!pending.cancel());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(pending.state(), TimerState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_noop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pending = PendingAction::spawn("PLAY", Duration::from_millis(10), counting(&counter));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!pending.cancel());
        assert_eq!(pending.state(), TimerState::Fired);
        assert!(!PendingAction::fired("PLAY").is_armed());
    }
}
