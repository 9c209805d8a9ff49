//! Per-key admission control for outbound calls.
//!
//! Every key owns an independent bucket: a FIFO admission queue over a
//! sliding window of `requests` per `interval`, plus a semaphore bounding the
//! calls in flight. Buckets never share a lock, so a slow endpoint cannot
//! stall calls against an unrelated one.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use coffer_core::RateLimitSpec;
use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore};
use tokio::time::{Instant, sleep_until};

use crate::error::RateLimitError;

pub struct RateLimiter {
    default_spec: RateLimitSpec,
    overrides: HashMap<String, RateLimitSpec>,
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
    closed: AtomicBool,
    /// Wakes admissions sleeping on a full window when the limiter closes.
    shutdown: Notify,
}

struct Bucket {
    spec: RateLimitSpec,
    /// Admission times inside the current window. The async mutex is fair, so
    /// waiters are admitted in arrival order.
    window: AsyncMutex<VecDeque<Instant>>,
    slots: Semaphore,
}

impl Bucket {
    fn new(spec: RateLimitSpec) -> Self {
        let permits = spec.max_concurrency.unwrap_or(Semaphore::MAX_PERMITS).max(1);
        Self {
            spec,
            window: AsyncMutex::new(VecDeque::with_capacity(spec.requests as usize)),
            slots: Semaphore::new(permits),
        }
    }
}

impl RateLimiter {
    pub fn new(default_spec: RateLimitSpec, overrides: HashMap<String, RateLimitSpec>) -> Self {
        Self {
            default_spec,
            overrides,
            buckets: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// A handle bound to `key`, handed to scanners and price sources.
    pub fn handle(self: &Arc<Self>, key: impl Into<String>) -> RateLimitHandle {
        RateLimitHandle {
            limiter: Arc::clone(self),
            key: key.into().into(),
        }
    }

    /// Run `operation` once it is admitted under `key`.
    ///
    /// The operation's own output (including its errors) is returned as-is;
    /// the outer error only reports a limiter that was closed before admission.
    /// The concurrency slot is released when this future completes or is dropped.
    pub async fn execute<F, Fut>(&self, key: &str, operation: F) -> Result<Fut::Output, RateLimitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let closed = || RateLimitError::Closed {
            key: key.to_string(),
        };
        if self.is_closed() {
            return Err(closed());
        }

        let bucket = self.bucket(key);
        let _slot = bucket.slots.acquire().await.map_err(|_| closed())?;
        self.admit(&bucket).await.map_err(|_| closed())?;

        tracing::trace!(key, "rate limiter admitted call");
        Ok(operation().await)
    }

    /// Reject queued and future admissions. Calls already running finish normally.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        for bucket in buckets.values() {
            bucket.slots.close();
        }
        tracing::debug!(keys = buckets.len(), "rate limiter closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn bucket(&self, key: &str) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let spec = self.overrides.get(key).copied().unwrap_or(self.default_spec);
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Bucket::new(spec)));
        if self.is_closed() {
            bucket.slots.close();
        }
        Arc::clone(bucket)
    }

    /// Wait until the sliding window has room, then record the admission.
    async fn admit(&self, bucket: &Bucket) -> Result<(), ()> {
        let mut window = bucket.window.lock().await;
        loop {
            if self.is_closed() {
                return Err(());
            }
            let now = Instant::now();
            while window
                .front()
                .is_some_and(|admitted| now.duration_since(*admitted) >= bucket.spec.interval)
            {
                window.pop_front();
            }
            if window.len() < bucket.spec.requests as usize {
                window.push_back(now);
                return Ok(());
            }
            if let Some(&oldest) = window.front() {
                let woken = self.shutdown.notified();
                tokio::pin!(woken);
                woken.as_mut().enable();
                if self.is_closed() {
                    return Err(());
                }
                tokio::select! {
                    _ = sleep_until(oldest + bucket.spec.interval) => {}
                    _ = woken => return Err(()),
                }
            }
        }
    }
}

/// A limiter bound to one key.
#[derive(Clone)]
pub struct RateLimitHandle {
    limiter: Arc<RateLimiter>,
    key: Arc<str>,
}

impl RateLimitHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn execute<F, Fut>(&self, operation: F) -> Result<Fut::Output, RateLimitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.limiter.execute(&self.key, operation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn spec(requests: u32, interval_ms: u64, max_concurrency: Option<usize>) -> RateLimitSpec {
        RateLimitSpec {
            requests,
            interval: Duration::from_millis(interval_ms),
            max_concurrency,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn admits_at_most_n_per_interval() {
        const N: usize = 4;
        let limiter = RateLimiter::new(spec(N as u32, 1000, None), HashMap::new());
        let starts = Arc::new(Mutex::new(Vec::new()));

        let calls = (0..3 * N).map(|i| {
            let starts = Arc::clone(&starts);
            let limiter = &limiter;
            async move {
                limiter
                    .execute("K", || async move {
                        starts.lock().unwrap().push(Instant::now());
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        i
                    })
                    .await
            }
        });
        let results = join_all(calls).await;

        let mut completed: Vec<usize> = results.into_iter().map(Result::unwrap).collect();
        completed.sort_unstable();
        assert_eq!(completed, (0..3 * N).collect::<Vec<_>>());

        let mut starts = starts.lock().unwrap().clone();
        starts.sort();
        assert_eq!(starts.len(), 3 * N);
        for pair in starts.windows(N + 1) {
            assert!(pair[N].duration_since(pair[0]) >= Duration::from_millis(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bounds_concurrency() {
        let limiter = RateLimiter::new(spec(100, 1000, Some(2)), HashMap::new());
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let calls = (0..8).map(|_| {
            limiter.execute("K", || async {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            })
        });
        join_all(calls).await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_do_not_share_quota() {
        let limiter = RateLimiter::new(spec(1, 60_000, None), HashMap::new());
        let started = Instant::now();

        let (a, b) = tokio::join!(
            limiter.execute("a", || async { 1 }),
            limiter.execute("b", || async { 2 }),
        );

        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
        assert!(started.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_call_does_not_disturb_others() {
        let limiter = RateLimiter::new(spec(1, 100, Some(1)), HashMap::new());

        let (failed, ok) = tokio::join!(
            limiter.execute("K", || async { Err::<u32, &str>("boom") }),
            limiter.execute("K", || async { Ok::<u32, &str>(7) }),
        );

        assert_eq!(failed.unwrap(), Err("boom"));
        assert_eq!(ok.unwrap(), Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn overrides_apply_per_key() {
        let overrides = HashMap::from([("slow".to_string(), spec(1, 5000, None))]);
        let limiter = RateLimiter::new(spec(10, 1000, None), overrides);
        let started = Instant::now();

        for _ in 0..2 {
            limiter.execute("slow", || async {}).await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn close_cancels_queued_calls_and_lets_running_ones_finish() {
        let limiter = Arc::new(RateLimiter::new(spec(100, 1000, Some(1)), HashMap::new()));
        let (release, hold) = oneshot::channel::<()>();
        let (entered_tx, entered) = oneshot::channel::<()>();

        let running = tokio::spawn({
            let limiter = Arc::clone(&limiter);
            async move {
                limiter
                    .execute("K", || async move {
                        entered_tx.send(()).ok();
                        hold.await.ok();
                        "done"
                    })
                    .await
            }
        });
        entered.await.unwrap();

        let queued = tokio::spawn({
            let limiter = Arc::clone(&limiter);
            async move { limiter.execute("K", || async { "never" }).await }
        });
        tokio::task::yield_now().await;

        limiter.close();
        assert_eq!(
            queued.await.unwrap(),
            Err(RateLimitError::Closed { key: "K".into() })
        );

        release.send(()).unwrap();
        assert_eq!(running.await.unwrap(), Ok("done"));

        let after = limiter.execute("other", || async {}).await;
        assert!(matches!(after, Err(RateLimitError::Closed { .. })));
    }

    #[tokio::test]
    async fn close_wakes_calls_waiting_for_the_window() {
        let limiter = Arc::new(RateLimiter::new(spec(1, 60_000, None), HashMap::new()));
        limiter.execute("K", || async {}).await.unwrap();

        let queued = tokio::spawn({
            let limiter = Arc::clone(&limiter);
            async move { limiter.execute("K", || async { "late" }).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!queued.is_finished());

        limiter.close();
        let outcome = tokio::time::timeout(Duration::from_secs(1), queued)
            .await
            .expect("queued call should wake when the limiter closes")
            .unwrap();
        assert_eq!(outcome, Err(RateLimitError::Closed { key: "K".into() }));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_running_call_frees_its_slot() {
        let limiter = RateLimiter::new(spec(100, 1000, Some(1)), HashMap::new());

        {
            let stuck = limiter.execute("K", || std::future::pending::<()>());
            tokio::pin!(stuck);
            tokio::select! {
                _ = &mut stuck => panic!("pending call completed"),
                _ = tokio::time::sleep(Duration::from_millis(5)) => {}
            }
            assert_eq!(limiter.bucket("K").slots.available_permits(), 0);
        }

        assert_eq!(limiter.bucket("K").slots.available_permits(), 1);
        let next = tokio::time::timeout(Duration::from_secs(1), limiter.execute("K", || async { 3 })).await;
        assert_eq!(next.unwrap(), Ok(3));
    }

    #[tokio::test]
    async fn handle_uses_its_key() {
        let limiter = Arc::new(RateLimiter::new(RateLimitSpec::default(), HashMap::new()));
        let handle = limiter.handle("r1");
        assert_eq!(handle.key(), "r1");
        assert_eq!(handle.execute(|| async { 5 }).await, Ok(5));
    }
}
