//! `AuthRefreshScheduler`: per-link one-shot timer that periodically
//! refreshes a link's CBS token and reschedules itself (spec.md §4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Minimum refresh floor: no matter how soon the token expires, the timer
/// never fires sooner than this.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(4 * 60);

/// Buffer added *after* the stated expiry.
///
/// This reproduces a latent defect noted in spec.md §9 ("Open questions"):
/// the source adds the buffer after the expiry instead of subtracting it
/// before, meaning a refresh is scheduled to run five minutes after the
/// token has already expired unless the 4-minute floor rescues it. Kept
/// intentionally for parity — see DESIGN.md.
pub const POST_EXPIRY_BUFFER: Duration = Duration::from_secs(5 * 60);

/// Computes the delay until the next CBS refresh for a token expiring at
/// `expiry_utc`, evaluated relative to `now`.
///
/// `interval = (expiry_utc - now) + 5min`, floored at
/// [`MIN_REFRESH_INTERVAL`]. Always `>= MIN_REFRESH_INTERVAL` (spec.md §8).
pub fn calculate_refresh_interval_at(expiry_utc: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let buffer = chrono::Duration::from_std(POST_EXPIRY_BUFFER).expect("fits in chrono::Duration");
    let raw = (expiry_utc - now) + buffer;
    let raw = raw.to_std().unwrap_or(Duration::ZERO);
    std::cmp::max(raw, MIN_REFRESH_INTERVAL)
}

/// [`calculate_refresh_interval_at`] evaluated against the current time.
pub fn calculate_refresh_interval(expiry_utc: DateTime<Utc>) -> Duration {
    calculate_refresh_interval_at(expiry_utc, Utc::now())
}

/// Abstraction over "send a CBS token and learn its expiry", so the
/// scheduler can be exercised in tests without a live broker.
#[async_trait]
pub trait TokenRefresher: Send + Sync + std::fmt::Debug {
    async fn refresh(&self) -> Result<DateTime<Utc>, String>;
}

/// Handle to a link's refresh timer.
///
/// Disarming stops the timer from firing again; disposing releases the
/// background task. Both are idempotent no-ops once already
/// disarmed/disposed — required because the timer callback and the link's
/// close handler may race (spec.md §5).
#[derive(Debug, Clone)]
pub struct RefreshTimerHandle {
    disarmed: Arc<AtomicBool>,
    task: Arc<AsyncMutex<Option<JoinHandle<()>>>>,
}

impl RefreshTimerHandle {
    pub fn disarm(&self) {
        self.disarmed.store(true, Ordering::SeqCst);
    }

    pub fn is_disarmed(&self) -> bool {
        self.disarmed.load(Ordering::SeqCst)
    }

    /// Disarms (if not already) and aborts the background task. Safe to
    /// call more than once.
    pub async fn dispose(&self) {
        self.disarm();
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

const REFRESH_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Arms a one-shot refresh timer due at `calculate_refresh_interval(initial_expiry)`
/// from now, whose callback refreshes via `refresher` and reschedules itself.
///
/// Mirrors spec.md §4.4 steps 1-6: emit start/complete trace events around
/// every invocation, reschedule only on success with a future expiry, and
/// disarm (never retry at this layer) on failure.
pub fn arm_refresh_timer(
    link_name: String,
    refresher: Arc<dyn TokenRefresher>,
    initial_expiry: DateTime<Utc>,
) -> RefreshTimerHandle {
    let disarmed = Arc::new(AtomicBool::new(false));
    let handle = RefreshTimerHandle {
        disarmed: disarmed.clone(),
        task: Arc::new(AsyncMutex::new(None)),
    };

    let task_slot = handle.task.clone();
    let join = tokio::spawn(refresh_loop(link_name, refresher, initial_expiry, disarmed));

    // `try_lock` is safe here: nothing else can have locked `task_slot` yet,
    // this is the first write after construction.
    if let Ok(mut guard) = task_slot.try_lock() {
        *guard = Some(join);
    }

    handle
}

async fn refresh_loop(
    link_name: String,
    refresher: Arc<dyn TokenRefresher>,
    mut next_expiry: DateTime<Utc>,
    disarmed: Arc<AtomicBool>,
) {
    loop {
        let delay = calculate_refresh_interval(next_expiry);
        tokio::time::sleep(delay).await;

        if disarmed.load(Ordering::SeqCst) {
            return;
        }

        trace!(link = %link_name, "refresh-start");
        match refresher.refresh().await {
            Ok(new_expiry) if new_expiry >= Utc::now() => {
                debug!(link = %link_name, "refresh-complete");
                next_expiry = new_expiry;
            }
            Ok(_expired_already) => {
                // Success, but the server handed back an already-past
                // expiry: leave the timer idle rather than reschedule.
                debug!(link = %link_name, "refresh-complete (stale expiry, not rescheduling)");
                return;
            }
            Err(message) => {
                error!(link = %link_name, error = %message, "refresh-error");
                disarmed.store(true, Ordering::SeqCst);
                debug!(link = %link_name, "refresh-complete");
                return;
            }
        }
    }
}

pub fn refresh_timeout() -> Duration {
    REFRESH_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{self, Duration as TokioDuration};

    #[test]
    fn interval_floors_at_four_minutes_when_expiry_is_soon() {
        let now = Utc::now();
        let expiry = now + chrono::Duration::seconds(30);
        // raw = 30s + 5min = 5m30s, which already exceeds the floor.
        assert_eq!(
            calculate_refresh_interval_at(expiry, now),
            Duration::from_secs(5 * 60 + 30)
        );
    }

    #[test]
    fn interval_uses_floor_when_expiry_already_passed() {
        let now = Utc::now();
        let expiry = now - chrono::Duration::minutes(10);
        // raw = -10min + 5min = -5min -> floored to 4min.
        assert_eq!(calculate_refresh_interval_at(expiry, now), MIN_REFRESH_INTERVAL);
    }

    #[test]
    fn interval_adds_buffer_after_expiry_for_ten_minute_token() {
        let now = Utc::now();
        let expiry = now + chrono::Duration::minutes(10);
        assert_eq!(
            calculate_refresh_interval_at(expiry, now),
            Duration::from_secs(15 * 60)
        );
    }

    #[test]
    fn interval_is_never_below_floor() {
        for minutes in [-60, -5, 0, 1, 5, 30] {
            let now = Utc::now();
            let expiry = now + chrono::Duration::minutes(minutes);
            assert!(calculate_refresh_interval_at(expiry, now) >= MIN_REFRESH_INTERVAL);
        }
    }

    #[derive(Debug)]
    struct CountingRefresher {
        calls: AtomicUsize,
        next_expiry: chrono::Duration,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self) -> Result<DateTime<Utc>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Utc::now() + self.next_expiry)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_reschedules_on_success() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
            next_expiry: chrono::Duration::minutes(10),
        });
        let handle = arm_refresh_timer(
            "link-1".into(),
            refresher.clone(),
            Utc::now() - chrono::Duration::minutes(1),
        );

        // First fire happens at the 4-minute floor.
        time::advance(TokioDuration::from_secs(4 * 60)).await;
        time::sleep(TokioDuration::from_millis(1)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        // Second fire happens 15 minutes later (10min expiry + 5min buffer).
        time::advance(TokioDuration::from_secs(15 * 60)).await;
        time::sleep(TokioDuration::from_millis(1)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);

        handle.dispose().await;
    }

    #[derive(Debug)]
    struct FailingRefresher;

    #[async_trait]
    impl TokenRefresher for FailingRefresher {
        async fn refresh(&self) -> Result<DateTime<Utc>, String> {
            Err("cbs rejected".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_disarms_itself_on_refresh_failure() {
        let handle = arm_refresh_timer("link-1".into(), Arc::new(FailingRefresher), Utc::now());
        time::advance(TokioDuration::from_secs(4 * 60)).await;
        time::sleep(TokioDuration::from_millis(1)).await;
        assert!(handle.is_disarmed());
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
            next_expiry: chrono::Duration::minutes(30),
        });
        let handle = arm_refresh_timer("link-1".into(), refresher, Utc::now());
        handle.dispose().await;
        handle.dispose().await;
        assert!(handle.is_disarmed());
    }
}
