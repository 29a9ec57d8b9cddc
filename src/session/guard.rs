use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result of running an action through a [`SingleFlightGuard`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Flight<T> {
    Completed(T),
    /// Another invocation was already in flight; the action never ran.
    Ignored,
}

impl<T> Flight<T> {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Flight::Ignored)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Flight::Completed(value) => Some(value),
            Flight::Ignored => None,
        }
    }
}

/// Lets at most one invocation of an async action run at a time.
///
/// Cloning shares the in-flight flag.
#[derive(Debug, Default, Clone)]
pub struct SingleFlightGuard {
    in_flight: Arc<AtomicBool>,
}

struct Release<'a>(&'a AtomicBool);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SingleFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Runs `action` unless a previous call is still running.
    ///
    /// The flag is cleared when the action finishes, panics, or the returned
    /// future is dropped mid-flight.
    pub async fn run<Fut, T>(&self, action: Fut) -> Flight<T>
    where
        Fut: Future<Output = T>,
    {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Flight::Ignored;
        }

        let _release = Release(&self.in_flight);
        Flight::Completed(action.await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Duration};

    #[tokio::test(start_paused = true)]
    async fn second_call_is_ignored_while_first_runs() {
        let guard = SingleFlightGuard::new();
        let calls = AtomicUsize::new(0);

        let work = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(50)).await;
            "done"
        };

        let (first, second) = tokio::join!(guard.run(work()), guard.run(work()));
        assert_eq!(first, Flight::Completed("done"));
        assert!(second.is_ignored());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!guard.is_in_flight());

        assert_eq!(guard.run(work()).await, Flight::Completed("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_releases_the_guard() {
        let guard = SingleFlightGuard::new();
        let result: Flight<Result<(), &str>> = guard.run(async { Err("boom") }).await;
        assert_eq!(result, Flight::Completed(Err("boom")));
        assert!(!guard.is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_future_releases_the_guard() {
        let guard = SingleFlightGuard::new();
        let pending = guard.run(sleep(Duration::from_secs(60)));
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert!(!guard.is_in_flight());
    }

    #[tokio::test]
    async fn panic_inside_action_releases_the_guard() {
        let guard = SingleFlightGuard::new();
        let inner = guard.clone();
        let joined = tokio::spawn(async move {
            let _ = inner
                .run(async {
                    panic!("action blew up");
                })
                .await;
        })
        .await;
        assert!(joined.is_err());
        assert!(!guard.is_in_flight());
    }
}
