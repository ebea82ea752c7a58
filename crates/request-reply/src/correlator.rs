use crate::error::{Error, Result};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};
use uuid::Uuid;

type ResultSender<T> = oneshot::Sender<Result<T>>;

/// A request waiting for its reply.
pub struct PendingRequest<T> {
    registered_at: Instant,
    timeout: Duration,
    provisional: bool,
    sender: ResultSender<T>,
}

impl<T> PendingRequest<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.registered_at) >= self.timeout
    }

    fn expire(self, correlation_id: String) {
        let _ = self.sender.send(Err(Error::ExchangeTimedOut {
            correlation_id,
            timeout: self.timeout,
        }));
    }
}

struct ParkedReply<T> {
    parked_at: Instant,
    payload: T,
}

/// Outcome of [`Correlator::resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The reply was handed to its waiting caller.
    Delivered,

    /// The key is not pending yet but a request is being rekeyed; the reply is
    /// held until the rekey or the next purge.
    Parked,

    /// No caller is waiting for this key. The reply was dropped.
    Unmatched,
}

/// Matches replies to waiting callers by correlation key.
///
/// Every transition out of the pending map goes through a single removal, so a
/// request is either fulfilled or expired, never both.
pub struct Correlator<T> {
    pending: DashMap<String, PendingRequest<T>>,
    parked: DashMap<String, ParkedReply<T>>,
    provisional: AtomicUsize,
    checker_interval: Duration,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl<T> fmt::Debug for Correlator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending.len())
            .field("parked", &self.parked.len())
            .field("checker_interval", &self.checker_interval)
            .finish_non_exhaustive()
    }
}

impl<T> Correlator<T>
where
    T: Send + Sync + 'static,
{
    /// Creates a correlator whose sweep runs every `checker_interval`.
    #[must_use]
    pub fn new(checker_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            parked: DashMap::new(),
            provisional: AtomicUsize::new(0),
            checker_interval,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        })
    }

    /// Registers a request under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateCorrelationKey`] if `key` is already pending.
    /// The earlier request is left untouched.
    pub fn register<K>(self: &Arc<Self>, key: K, timeout: Duration) -> Result<PendingReply<T>>
    where
        K: Into<String>,
    {
        self.insert(key.into(), timeout, false)
    }

    /// Registers a request whose key is only known after sending. The request
    /// must be moved to its real key with [`PendingReply::rekey`].
    #[must_use]
    pub fn register_provisional(self: &Arc<Self>, timeout: Duration) -> PendingReply<T> {
        loop {
            let key = format!("provisional-{}", Uuid::new_v4());
            if let Ok(pending) = self.insert(key, timeout, true) {
                return pending;
            }
        }
    }

    fn insert(
        self: &Arc<Self>,
        key: String,
        timeout: Duration,
        provisional: bool,
    ) -> Result<PendingReply<T>> {
        let registered_at = Instant::now();
        let (sender, receiver) = oneshot::channel();

        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => return Err(Error::DuplicateCorrelationKey(key)),
            Entry::Vacant(vacant) => {
                if provisional {
                    self.provisional.fetch_add(1, Ordering::SeqCst);
                }
                vacant.insert(PendingRequest {
                    registered_at,
                    timeout,
                    provisional,
                    sender,
                });
            }
        }

        trace!(%key, ?timeout, provisional, "registered pending request");

        Ok(PendingReply {
            correlator: Arc::clone(self),
            key,
            deadline: registered_at + timeout,
            timeout,
            receiver,
        })
    }

    /// Removes a pending entry, keeping the provisional count in step.
    fn take(&self, key: &str) -> Option<PendingRequest<T>> {
        let (_, entry) = self.pending.remove(key)?;
        if entry.provisional {
            self.provisional.fetch_sub(1, Ordering::SeqCst);
        }
        Some(entry)
    }

    /// Hands `payload` to the caller waiting on `key`.
    pub fn resolve(&self, key: &str, payload: T) -> Resolution {
        if let Some(entry) = self.take(key) {
            return Self::deliver(key, entry, payload);
        }

        if self.provisional.load(Ordering::SeqCst) == 0 {
            // A rekey inserts before it decrements, so its entry is visible now.
            if let Some(entry) = self.take(key) {
                return Self::deliver(key, entry, payload);
            }
            debug!(correlation_id = %key, "no pending request for reply, dropping");
            return Resolution::Unmatched;
        }

        self.parked.insert(
            key.to_string(),
            ParkedReply {
                parked_at: Instant::now(),
                payload,
            },
        );

        // A rekey may have landed between the lookup and the park.
        if self.pending.contains_key(key) {
            if let Some((_, parked)) = self.parked.remove(key) {
                return self.claim(key, parked.payload);
            }
        }

        trace!(correlation_id = %key, "parked reply while requests are being rekeyed");
        Resolution::Parked
    }

    fn claim(&self, key: &str, payload: T) -> Resolution {
        match self.take(key) {
            Some(entry) => Self::deliver(key, entry, payload),
            None => {
                debug!(correlation_id = %key, "request expired before its reply was claimed");
                Resolution::Unmatched
            }
        }
    }

    fn deliver(key: &str, entry: PendingRequest<T>, payload: T) -> Resolution {
        if entry.sender.send(Ok(payload)).is_ok() {
            trace!(correlation_id = %key, "reply delivered");
            Resolution::Delivered
        } else {
            debug!(correlation_id = %key, "caller stopped waiting, dropping reply");
            Resolution::Unmatched
        }
    }

    fn rekey(&self, provisional: &str, actual: &str) -> Result<()> {
        // Insert under the real key before the provisional count drops, so a
        // concurrent resolve either finds the entry or parks its reply.
        let Some((_, mut entry)) = self.pending.remove(provisional) else {
            // Already expired; the waiter holds the outcome.
            debug!(%provisional, %actual, "request expired before rekey");
            return Ok(());
        };
        entry.provisional = false;

        let inserted = match self.pending.entry(actual.to_string()) {
            Entry::Occupied(_) => Err(entry),
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        };
        self.provisional.fetch_sub(1, Ordering::SeqCst);

        if let Err(entry) = inserted {
            let _ = entry
                .sender
                .send(Err(Error::DuplicateCorrelationKey(actual.to_string())));
            return Err(Error::DuplicateCorrelationKey(actual.to_string()));
        }

        trace!(%provisional, %actual, "rekeyed pending request");

        if let Some((_, parked)) = self.parked.remove(actual) {
            self.claim(actual, parked.payload);
        }

        Ok(())
    }

    /// Whether a request is waiting on `key`.
    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Snapshot of the keys currently waiting for a reply.
    #[must_use]
    pub fn pending_keys(&self) -> Vec<String> {
        self.pending
            .iter()
            .filter(|entry| !entry.value().provisional)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of requests waiting for a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fails every expired request with [`Error::ExchangeTimedOut`] and drops
    /// parked replies older than the checker interval. Returns the number of
    /// expired requests.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut purged = 0;
        for key in expired {
            // Re-checked under the shard lock; the caller may have been served meanwhile.
            if let Some((key, entry)) = self
                .pending
                .remove_if(&key, |_, entry| entry.is_expired(now))
            {
                if entry.provisional {
                    self.provisional.fetch_sub(1, Ordering::SeqCst);
                }
                debug!(correlation_id = %key, timeout = ?entry.timeout, "purging expired request");
                entry.expire(key);
                purged += 1;
            }
        }

        let window = self.checker_interval;
        self.parked.retain(|key, parked| {
            let keep = now.duration_since(parked.parked_at) < window;
            if !keep {
                warn!(correlation_id = %key, "discarding reply that matched no request");
            }
            keep
        });

        purged
    }

    /// Starts the periodic purge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if the sweep is already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }

        let correlator = Arc::downgrade(self);
        let shutdown_token = self.shutdown_token.clone();
        let mut interval = tokio::time::interval(self.checker_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown_token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(correlator) = correlator.upgrade() else {
                            break;
                        };
                        let purged = correlator.purge_expired();
                        if purged > 0 {
                            debug!(purged, remaining = correlator.pending_count(), "purge sweep");
                        }
                    }
                }
            }
        });

        self.task_tracker.close();
        debug!(interval = ?self.checker_interval, "started correlator sweep");

        Ok(())
    }

    /// Stops the sweep and fails every waiting request with [`Error::Stopped`].
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        let keys: Vec<String> = self
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some(entry) = self.take(&key) {
                let _ = entry.sender.send(Err(Error::Stopped));
            }
        }
        self.parked.clear();

        debug!("correlator stopped");
    }
}

/// The caller's handle on a registered request.
pub struct PendingReply<T> {
    correlator: Arc<Correlator<T>>,
    key: String,
    deadline: Instant,
    timeout: Duration,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> fmt::Debug for PendingReply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<T> PendingReply<T>
where
    T: Send + Sync + 'static,
{
    /// The key the request is currently registered under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The timeout the request was registered with.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Moves a provisional registration to its real key. A reply that arrived
    /// for `actual` in the meantime is delivered immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateCorrelationKey`] if `actual` is already
    /// pending.
    pub fn rekey<K>(&mut self, actual: K) -> Result<()>
    where
        K: Into<String>,
    {
        let actual = actual.into();
        self.correlator.rekey(&self.key, &actual)?;
        self.key = actual;
        Ok(())
    }

    /// Withdraws the request without waiting, e.g. because sending failed.
    pub fn cancel(self) {
        if self.correlator.take(&self.key).is_some() {
            trace!(correlation_id = %self.key, "withdrew pending request");
        }
    }

    /// Waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExchangeTimedOut`] carrying the registered timeout if
    /// no reply arrives in time, or [`Error::Stopped`] if the correlator shut
    /// down first.
    pub async fn wait(self) -> Result<T> {
        let Self {
            correlator,
            key,
            deadline,
            timeout,
            mut receiver,
        } = self;

        match tokio::time::timeout_at(deadline.into(), &mut receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Stopped),
            Err(_) => {
                if let Some(entry) = correlator.take(&key) {
                    debug!(correlation_id = %key, ?timeout, "request timed out");
                    entry.expire(key);
                }
                // Whoever removed the entry has sent, or is about to send, the outcome.
                receiver.await.unwrap_or(Err(Error::Stopped))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use tracing_test::traced_test;

    fn correlator() -> Arc<Correlator<&'static str>> {
        Correlator::new(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let correlator = correlator();
        let pending = correlator.register("a", Duration::from_secs(5)).unwrap();

        assert_eq!(correlator.resolve("a", "first"), Resolution::Delivered);
        assert_eq!(correlator.resolve("a", "second"), Resolution::Unmatched);

        assert_eq!(pending.wait().await.unwrap(), "first");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let correlator = correlator();
        let first = correlator.register("dup", Duration::from_secs(5)).unwrap();

        assert_matches!(
            correlator.register("dup", Duration::from_secs(5)),
            Err(Error::DuplicateCorrelationKey(key)) if key == "dup"
        );

        // The first registration is still intact.
        assert_eq!(correlator.resolve("dup", "reply"), Resolution::Delivered);
        assert_eq!(first.wait().await.unwrap(), "reply");
    }

    #[tokio::test]
    async fn test_timeout_carries_configured_duration() {
        let correlator = correlator();
        let timeout = Duration::from_millis(50);
        let pending = correlator.register("slow", timeout).unwrap();

        let error = pending.wait().await.unwrap_err();

        assert_matches!(
            error,
            Error::ExchangeTimedOut { correlation_id, timeout: t }
                if correlation_id == "slow" && t == timeout
        );
        assert_eq!(correlator.resolve("slow", "late"), Resolution::Unmatched);
    }

    #[tokio::test]
    async fn test_late_reply_is_not_delivered() {
        let correlator = correlator();
        let pending = correlator.register("late", Duration::from_millis(30)).unwrap();

        let release = CancellationToken::new();
        let responder = {
            let correlator = Arc::clone(&correlator);
            let release = release.clone();
            tokio::spawn(async move {
                release.cancelled().await;
                correlator.resolve("late", "too late")
            })
        };

        assert_matches!(pending.wait().await, Err(Error::ExchangeTimedOut { .. }));

        release.cancel();
        assert_eq!(responder.await.unwrap(), Resolution::Unmatched);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_expires_waiters() {
        let correlator = correlator();
        let pending = correlator.register("stale", Duration::from_millis(10)).unwrap();
        let fresh = correlator.register("fresh", Duration::from_secs(10)).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(correlator.purge_expired(), 1);

        assert_matches!(pending.wait().await, Err(Error::ExchangeTimedOut { .. }));
        assert!(correlator.is_pending(fresh.key()));
    }

    #[tokio::test]
    async fn test_sweep_runs_until_shutdown() {
        let correlator = correlator();
        correlator.start().unwrap();
        assert_matches!(correlator.start(), Err(Error::AlreadyStarted));

        let _abandoned = correlator.register("abandoned", Duration::from_millis(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(correlator.pending_count(), 0);

        let waiting = correlator.register("waiting", Duration::from_secs(10)).unwrap();
        correlator.shutdown().await;
        assert_matches!(waiting.wait().await, Err(Error::Stopped));
    }

    #[tokio::test]
    async fn test_rekey_matches_parked_reply() {
        let correlator = correlator();
        let mut pending = correlator.register_provisional(Duration::from_secs(5));

        // The reply overtakes the send confirmation.
        assert_eq!(correlator.resolve("ID:1", "fast"), Resolution::Parked);

        pending.rekey("ID:1").unwrap();
        assert_eq!(pending.key(), "ID:1");
        assert_eq!(pending.wait().await.unwrap(), "fast");
    }

    #[tokio::test]
    async fn test_rekey_then_resolve() {
        let correlator = correlator();
        let mut pending = correlator.register_provisional(Duration::from_secs(5));
        assert!(correlator.pending_keys().is_empty());

        pending.rekey("ID:2").unwrap();
        assert_eq!(correlator.pending_keys(), vec!["ID:2".to_string()]);
        assert_eq!(correlator.resolve("ID:2", "reply"), Resolution::Delivered);
        assert_eq!(pending.wait().await.unwrap(), "reply");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_parked_replies_are_discarded() {
        let correlator = correlator();
        let _pending = correlator.register_provisional(Duration::from_secs(5));

        assert_eq!(correlator.resolve("ID:orphan", "lost"), Resolution::Parked);
        tokio::time::sleep(Duration::from_millis(30)).await;
        correlator.purge_expired();

        assert!(logs_contain("discarding reply that matched no request"));
    }

    #[tokio::test]
    async fn test_cancel_withdraws() {
        let correlator = correlator();
        let pending = correlator.register("gone", Duration::from_secs(5)).unwrap();

        pending.cancel();

        assert!(!correlator.is_pending("gone"));
        assert_eq!(correlator.resolve("gone", "x"), Resolution::Unmatched);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resolve_races_timeout() {
        let correlator: Arc<Correlator<usize>> = Correlator::new(Duration::from_millis(5));
        correlator.start().unwrap();

        let mut waiters = Vec::new();
        for i in 0..200 {
            let pending = correlator
                .register(format!("k{i}"), Duration::from_millis(20))
                .unwrap();
            waiters.push(tokio::spawn(pending.wait()));
        }

        let resolver = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                let mut delivered = 0;
                for i in 0..200 {
                    if i % 10 == 0 {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    if correlator.resolve(&format!("k{i}"), i) == Resolution::Delivered {
                        delivered += 1;
                    }
                }
                delivered
            })
        };

        let delivered = resolver.await.unwrap();
        let mut received = 0;
        for (i, waiter) in waiters.into_iter().enumerate() {
            match waiter.await.unwrap() {
                Ok(value) => {
                    assert_eq!(value, i);
                    received += 1;
                }
                Err(error) => assert_matches!(error, Error::ExchangeTimedOut { .. }),
            }
        }

        assert_eq!(delivered, received);
        assert_eq!(correlator.pending_count(), 0);
        correlator.shutdown().await;
    }
}
