//! `FaultTolerantConnection`: holds at most one open connection, lazily
//! (re)creating it on demand, disposing it exactly once (spec.md §4.2).
//!
//! Modeled as an explicit state machine
//! `{Empty, Opening, Ready, Disposed}` rather than a lazy container, per the
//! design note in spec.md §9 — this makes re-creation-on-fault an explicit
//! transition instead of something a generic `OnceCell` would have to be
//! coerced into supporting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, ScopeError};

/// What the fault-tolerant slot needs to know about a held connection:
/// whether it is still usable, and how to tear it down.
#[async_trait::async_trait]
pub trait FaultTolerantHandle: Clone + Send + Sync + fmt::Debug + 'static {
    /// True once the connection has closed or aborted and can no longer be
    /// handed out; the next caller will trigger a reopen.
    fn is_faulted(&self) -> bool;

    /// Idempotent: disposing an already-disposed connection is a no-op.
    async fn dispose(&self);
}

/// Builds a fresh connection. Implemented by [`super::ConnectionFactory`]
/// for the real transport; fakeable in tests.
#[async_trait::async_trait]
pub trait ConnectionOpener: Send + Sync + 'static {
    type Handle: FaultTolerantHandle;

    async fn open(&self, timeout: Duration) -> Result<Self::Handle>;
}

type SharedOpen<H> = Shared<BoxFuture<'static, std::result::Result<H, Arc<str>>>>;

enum State<H: FaultTolerantHandle> {
    Empty,
    Opening(SharedOpen<H>),
    Ready(H),
    Disposed,
}

impl<H: FaultTolerantHandle> fmt::Debug for State<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Empty => "Empty",
            State::Opening(_) => "Opening",
            State::Ready(_) => "Ready",
            State::Disposed => "Disposed",
        };
        f.write_str(name)
    }
}

/// The single-slot, fault-tolerant connection owner.
pub struct FaultTolerantConnection<O: ConnectionOpener> {
    opener: Arc<O>,
    state: Mutex<State<O::Handle>>,
    /// Invoked (outside the state lock) whenever a held connection is
    /// discovered faulted, i.e. the moment `CloseCoordinator` should fan the
    /// close out to every link that was tracked against the stale
    /// connection (spec.md §4.5/§9). The primary trigger for this hook is
    /// the connection's own background close-watcher task, spawned at open
    /// time against the teacher's push-based `ConnectionHandle::on_close`
    /// (see `AmqpConnectionHandle::spawn_close_watcher`), which fires
    /// immediately on close rather than waiting for a caller to ask for the
    /// connection again. The check here against `Ready(_faulted)` below is
    /// a defensive second path, not the mechanism this hook relies on.
    on_fault: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<O: ConnectionOpener> FaultTolerantConnection<O> {
    pub fn new(opener: O) -> Self {
        FaultTolerantConnection {
            opener: Arc::new(opener),
            state: Mutex::new(State::Empty),
            on_fault: None,
        }
    }

    pub fn with_on_fault_hook(opener: O, on_fault: Arc<dyn Fn() + Send + Sync>) -> Self {
        FaultTolerantConnection {
            opener: Arc::new(opener),
            state: Mutex::new(State::Empty),
            on_fault: Some(on_fault),
        }
    }

    /// Returns the current connection, opening (or reopening, after a fault)
    /// one if necessary. Concurrent callers observing an in-flight open
    /// share its result instead of racing to open their own.
    pub async fn get_or_create(&self, timeout: Duration) -> Result<O::Handle> {
        loop {
            let shared = {
                let mut state = self.state.lock().await;
                match &*state {
                    State::Ready(handle) if !handle.is_faulted() => {
                        return Ok(handle.clone());
                    }
                    State::Ready(_faulted) => {
                        debug!("held connection is faulted, transitioning back to empty");
                        *state = State::Empty;
                        drop(state);
                        if let Some(hook) = &self.on_fault {
                            hook();
                        }
                        continue;
                    }
                    State::Opening(shared) => shared.clone(),
                    State::Disposed => return Err(ScopeError::Disposed),
                    State::Empty => {
                        let opener = self.opener.clone();
                        let fut: BoxFuture<'static, std::result::Result<O::Handle, Arc<str>>> =
                            async move {
                                opener
                                    .open(timeout)
                                    .await
                                    .map_err(|e| Arc::from(e.to_string()))
                            }
                            .boxed();
                        let shared = fut.shared();
                        *state = State::Opening(shared.clone());
                        shared
                    }
                }
            };

            let result = shared.await;
            let mut state = self.state.lock().await;
            // Another caller may have disposed the slot while we awaited.
            if matches!(&*state, State::Disposed) {
                if let Ok(handle) = &result {
                    handle.dispose().await;
                }
                return Err(ScopeError::Disposed);
            }

            return match result {
                Ok(handle) => {
                    *state = State::Ready(handle.clone());
                    Ok(handle)
                }
                Err(message) => {
                    *state = State::Empty;
                    warn!(error = %message, "connection open failed");
                    Err(ScopeError::transport(OpenFailure(message.to_string())))
                }
            };
        }
    }

    /// Disposes the held connection (if any) and rejects all future calls.
    /// Idempotent.
    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, State::Disposed);
        drop(state);
        if let State::Ready(handle) = previous {
            handle.dispose().await;
        }
    }
}

#[derive(Debug)]
struct OpenFailure(String);

impl fmt::Display for OpenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OpenFailure {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct FakeHandle {
        faulted: Arc<AtomicBool>,
        disposed: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl FaultTolerantHandle for FakeHandle {
        fn is_faulted(&self) -> bool {
            self.faulted.load(Ordering::SeqCst)
        }

        async fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct CountingOpener {
        opens: AtomicUsize,
        fail_next: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ConnectionOpener for CountingOpener {
        type Handle = FakeHandle;

        async fn open(&self, _timeout: Duration) -> Result<FakeHandle> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(ScopeError::transport(OpenFailure("boom".into())));
            }
            Ok(FakeHandle {
                faulted: Arc::new(AtomicBool::new(false)),
                disposed: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    #[tokio::test]
    async fn repeated_calls_reuse_the_ready_connection() {
        let ftc = FaultTolerantConnection::new(CountingOpener {
            opens: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        });
        let a = ftc.get_or_create(Duration::from_secs(5)).await.unwrap();
        let b = ftc.get_or_create(Duration::from_secs(5)).await.unwrap();
        assert_eq!(ftc.opener.opens.load(Ordering::SeqCst), 1);
        assert!(!a.is_faulted());
        assert!(!b.is_faulted());
    }

    #[tokio::test]
    async fn faulted_connection_is_reopened() {
        let ftc = FaultTolerantConnection::new(CountingOpener {
            opens: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        });
        let a = ftc.get_or_create(Duration::from_secs(5)).await.unwrap();
        a.faulted.store(true, Ordering::SeqCst);

        let b = ftc.get_or_create(Duration::from_secs(5)).await.unwrap();
        assert_eq!(ftc.opener.opens.load(Ordering::SeqCst), 2);
        assert!(!b.is_faulted());
    }

    #[tokio::test]
    async fn failed_open_leaves_slot_empty_for_retry() {
        let ftc = FaultTolerantConnection::new(CountingOpener {
            opens: AtomicUsize::new(0),
            fail_next: AtomicBool::new(true),
        });
        assert!(ftc.get_or_create(Duration::from_secs(5)).await.is_err());
        let handle = ftc.get_or_create(Duration::from_secs(5)).await.unwrap();
        assert!(!handle.is_faulted());
        assert_eq!(ftc.opener.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dispose_closes_held_connection_and_rejects_future_calls() {
        let ftc = FaultTolerantConnection::new(CountingOpener {
            opens: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        });
        let handle = ftc.get_or_create(Duration::from_secs(5)).await.unwrap();
        ftc.dispose().await;
        assert!(handle.disposed.load(Ordering::SeqCst));

        let err = ftc.get_or_create(Duration::from_secs(5)).await;
        assert!(matches!(err, Err(ScopeError::Disposed)));
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let ftc = FaultTolerantConnection::new(CountingOpener {
            opens: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        });
        ftc.dispose().await;
        ftc.dispose().await;
        assert!(matches!(
            ftc.get_or_create(Duration::from_secs(5)).await,
            Err(ScopeError::Disposed)
        ));
    }

    #[tokio::test]
    async fn concurrent_callers_share_the_in_flight_open() {
        use std::sync::Arc as StdArc;
        let ftc = StdArc::new(FaultTolerantConnection::new(CountingOpener {
            opens: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let ftc = ftc.clone();
            tasks.push(tokio::spawn(async move {
                ftc.get_or_create(Duration::from_secs(5)).await.unwrap()
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(ftc.opener.opens.load(Ordering::SeqCst), 1);
    }
}
