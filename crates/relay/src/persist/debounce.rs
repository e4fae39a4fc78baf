// Debounced trigger with a max-wait ceiling.
//
// A burst of triggers is coalesced into one call of the action. The call
// fires `wait` after the most recent trigger, but never later than
// `max_wait` after the first trigger of the burst. Two timers drive this: a
// deadline that moves on every trigger and a ceiling fixed when the burst
// starts.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

/// Timing for a debounced action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceWindow {
    pub wait: Duration,
    pub max_wait: Duration,
}

impl DebounceWindow {
    /// `max_wait` is raised to `wait` when configured below it.
    pub fn new(wait: Duration, max_wait: Duration) -> Self {
        Self { wait, max_wait: max_wait.max(wait) }
    }
}

/// Handle used to (re)schedule the debounced action.
///
/// Dropping every handle never cancels a scheduled call: a pending burst
/// still fires at its deadline, after which the background task exits.
#[derive(Debug, Clone)]
pub struct Debounced {
    trigger_tx: mpsc::UnboundedSender<()>,
}

impl Debounced {
    /// Spawn the timer task on the current tokio runtime.
    pub fn spawn<F, Fut>(window: DebounceWindow, action: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_debouncer(window, trigger_rx, action));
        Self { trigger_tx }
    }

    pub fn trigger(&self) {
        let _ = self.trigger_tx.send(());
    }
}

async fn run_debouncer<F, Fut>(
    window: DebounceWindow,
    mut trigger_rx: mpsc::UnboundedReceiver<()>,
    mut action: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    while trigger_rx.recv().await.is_some() {
        let burst_started = Instant::now();
        let ceiling = burst_started + window.max_wait;
        let mut deadline = burst_started + window.wait;
        let mut handles_alive = true;

        while handles_alive {
            tokio::select! {
                biased;
                _ = sleep_until(deadline.min(ceiling)) => break,
                next = trigger_rx.recv() => match next {
                    Some(()) => deadline = Instant::now() + window.wait,
                    None => handles_alive = false,
                },
            }
        }

        if !handles_alive {
            sleep_until(deadline.min(ceiling)).await;
        }

        action().await;

        if !handles_alive {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::sleep;

    use super::{DebounceWindow, Debounced};

    fn counting(window: DebounceWindow) -> (Debounced, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_action = Arc::clone(&calls);
        let debounced = Debounced::spawn(window, move || {
            let calls = Arc::clone(&calls_for_action);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });
        (debounced, calls)
    }

    fn default_window() -> DebounceWindow {
        DebounceWindow::new(Duration::from_millis(2_000), Duration::from_millis(10_000))
    }

    #[test]
    fn max_wait_is_never_below_wait() {
        let window = DebounceWindow::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(window.max_wait, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn single_trigger_fires_after_wait() {
        let (debounced, calls) = counting(default_window());

        debounced.trigger();
        sleep(Duration::from_millis(1_900)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_wait_coalesces_into_one_call() {
        let (debounced, calls) = counting(default_window());

        for _ in 0..5 {
            debounced.trigger();
            sleep(Duration::from_millis(1_000)).await;
        }
        // Last trigger at t=4s, so nothing has fired yet.
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(10_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_triggers_fire_at_max_wait_ceiling() {
        let (debounced, calls) = counting(default_window());

        // Trigger every 500ms for 9.5s: the wait deadline never elapses.
        for _ in 0..20 {
            debounced.trigger();
            sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Ceiling at t=10s.
        sleep(Duration::from_millis(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_editing_session_saves_once_per_max_wait_window() {
        let (debounced, calls) = counting(default_window());

        // 25s of edits every 500ms.
        for _ in 0..50 {
            debounced.trigger();
            sleep(Duration::from_millis(500)).await;
        }
        assert!(calls.load(Ordering::SeqCst) >= 2);

        sleep(Duration::from_millis(2_100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_does_not_cancel_pending_call() {
        let (debounced, calls) = counting(default_window());

        debounced.trigger();
        drop(debounced);

        sleep(Duration::from_millis(2_100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_after_call_starts_a_new_burst() {
        let (debounced, calls) = counting(default_window());

        debounced.trigger();
        sleep(Duration::from_millis(2_100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        debounced.trigger();
        sleep(Duration::from_millis(2_100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
