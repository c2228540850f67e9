//! CallGroup implementation

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::CallGroupConfig;
use super::error::CallGroupError;
use super::handler::{BatchHandler, FnHandler};
use super::pending::{Outcome, Pending};
use super::status::{FlushTrigger, GroupStatus, Phase};

/// Internal state protected by mutex
struct GroupState<T, R> {
    phase: Phase,

    /// Arrivals still needed before the capacity flush
    remaining: usize,

    /// Payloads in acceptance order
    payloads: Vec<T>,

    /// One sender per registered waiter
    waiters: Vec<oneshot::Sender<Outcome<R>>>,

    /// Timeout task, present only while collecting
    watchdog: Option<JoinHandle<()>>,

    trigger: Option<FlushTrigger>,

    /// Written once, when the group closes
    outcome: Option<Outcome<R>>,
}

struct Inner<T, R> {
    group_id: String,
    capacity: usize,
    timeout: Duration,
    handler: Arc<dyn BatchHandler<T, R>>,
    runtime: Handle,
    state: Mutex<GroupState<T, R>>,
    closed: Notify,
}

/// A single-shot barrier that batches up to `capacity` arrivals into one
/// handler call and hands the handler's outcome to every waiting caller.
///
/// Arrivals are either payload-bearing ([`join`](Self::join)) or signal-only
/// ([`leave`](Self::leave)). The batch is flushed when the last unit of
/// capacity is consumed or when the timeout elapses, whichever comes first.
/// After that every arrival is rejected with
/// [`CallGroupError::CapacityExceeded`].
///
/// The handle is cheap to clone; all clones share one group.
pub struct CallGroup<T, R = ()> {
    inner: Arc<Inner<T, R>>,
}

impl<T, R> Clone for CallGroup<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> fmt::Debug for CallGroup<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallGroup")
            .field("group_id", &self.inner.group_id)
            .field("capacity", &self.inner.capacity)
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

impl<T, R> CallGroup<T, R>
where
    T: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Create a call group around an async closure
    ///
    /// A zero `timeout` disables the watchdog. Must be called from within a
    /// Tokio runtime; the watchdog and the flush run on that runtime.
    pub fn new<F, Fut>(capacity: usize, handler: F, timeout: Duration) -> Result<Self, CallGroupError>
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<R>> + Send + 'static,
    {
        debug!(capacity, ?timeout, "CallGroup::new: called");
        Self::with_handler(capacity, FnHandler::new(handler), timeout)
    }

    /// Create a call group from configuration
    pub fn from_config<F, Fut>(config: &CallGroupConfig, handler: F) -> Result<Self, CallGroupError>
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<R>> + Send + 'static,
    {
        debug!(?config, "CallGroup::from_config: called");
        Self::new(config.capacity, handler, config.timeout())
    }

    /// Create a call group around any [`BatchHandler`]
    pub fn with_handler<H>(capacity: usize, handler: H, timeout: Duration) -> Result<Self, CallGroupError>
    where
        H: BatchHandler<T, R> + 'static,
    {
        debug!(capacity, ?timeout, "CallGroup::with_handler: called");
        if capacity == 0 {
            debug!("CallGroup::with_handler: zero capacity, rejecting");
            return Err(CallGroupError::InvalidArgument(format!(
                "Value {} should be greater than zero! (Parameter 'capacity')",
                capacity
            )));
        }

        let runtime = Handle::try_current().map_err(|e| CallGroupError::NoRuntime(e.to_string()))?;

        let inner = Arc::new(Inner {
            group_id: Uuid::now_v7().to_string(),
            capacity,
            timeout,
            handler: Arc::new(handler),
            runtime,
            state: Mutex::new(GroupState {
                phase: Phase::Collecting,
                remaining: capacity,
                payloads: Vec::with_capacity(capacity),
                waiters: Vec::with_capacity(capacity),
                watchdog: None,
                trigger: None,
                outcome: None,
            }),
            closed: Notify::new(),
        });

        if timeout.is_zero() {
            debug!(group_id = %inner.group_id, "CallGroup::with_handler: zero timeout, no watchdog");
        } else {
            debug!(group_id = %inner.group_id, ?timeout, "CallGroup::with_handler: starting watchdog");
            let watchdog = inner.runtime.spawn(Arc::clone(&inner).watchdog());
            let mut state = inner.lock();
            // A very short timeout may already have fired
            if state.phase == Phase::Collecting {
                state.watchdog = Some(watchdog);
            }
        }

        info!(group_id = %inner.group_id, capacity, "Call group created");
        Ok(Self { inner })
    }

    /// Arrive with a payload and wait for the batch outcome
    ///
    /// Fails immediately with `CapacityExceeded` once the group is flushing
    /// or closed; in that case nothing is recorded.
    pub fn join(&self, payload: T) -> Result<Pending<R>, CallGroupError> {
        debug!(group_id = %self.inner.group_id, "CallGroup::join: called");
        let pending = self.arrive(Some(payload), true)?;
        pending.ok_or(CallGroupError::Abandoned)
    }

    /// Arrive without a payload and without waiting for the outcome
    pub fn leave(&self) -> Result<(), CallGroupError> {
        debug!(group_id = %self.inner.group_id, "CallGroup::leave: called");
        self.arrive(None, false)?;
        Ok(())
    }

    /// Arrive without a payload but wait for the batch outcome
    pub fn leave_and_wait(&self) -> Result<Pending<R>, CallGroupError> {
        debug!(group_id = %self.inner.group_id, "CallGroup::leave_and_wait: called");
        let pending = self.arrive(None, true)?;
        pending.ok_or(CallGroupError::Abandoned)
    }

    fn arrive(&self, payload: Option<T>, wait: bool) -> Result<Option<Pending<R>>, CallGroupError> {
        let inner = &self.inner;
        let (pending, batch) = {
            let mut state = inner.lock();

            if state.phase != Phase::Collecting {
                warn!(group_id = %inner.group_id, phase = %state.phase, "Arrival rejected, capacity exceeded");
                return Err(CallGroupError::CapacityExceeded {
                    capacity: inner.capacity,
                    phase: state.phase,
                });
            }

            if let Some(payload) = payload {
                state.payloads.push(payload);
            }
            state.remaining -= 1;

            let pending = if wait {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                Some(Pending::new(rx))
            } else {
                None
            };

            debug!(
                group_id = %inner.group_id,
                remaining = state.remaining,
                collected = state.payloads.len(),
                "CallGroup::arrive: accepted"
            );

            let batch = if state.remaining == 0 {
                debug!(group_id = %inner.group_id, "CallGroup::arrive: capacity reached");
                Some(inner.begin_flush(&mut state, FlushTrigger::Capacity))
            } else {
                None
            };

            (pending, batch)
        };

        if let Some(batch) = batch {
            let flusher = Arc::clone(inner);
            inner.runtime.spawn(async move { flusher.flush(batch).await });
        }

        Ok(pending)
    }

    /// Wait until the handler has run and every waiter has been released
    pub async fn closed(&self) {
        debug!(group_id = %self.inner.group_id, "CallGroup::closed: called");
        let notified = self.inner.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.phase() == Phase::Closed {
            debug!("CallGroup::closed: already closed");
            return;
        }
        notified.await;
    }

    /// Unique id of this group, used in log lines
    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Arrivals still needed to trigger the capacity flush
    pub fn remaining(&self) -> usize {
        self.inner.lock().remaining
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    /// The recorded outcome, once the group is closed
    pub fn outcome(&self) -> Option<Outcome<R>> {
        self.inner.lock().outcome.clone()
    }

    /// Snapshot of the group's bookkeeping
    pub fn status(&self) -> GroupStatus {
        debug!(group_id = %self.inner.group_id, "CallGroup::status: called");
        let state = self.inner.lock();
        GroupStatus {
            group_id: self.inner.group_id.clone(),
            capacity: self.inner.capacity,
            remaining: state.remaining,
            collected: state.payloads.len(),
            waiters: state.waiters.len(),
            phase: state.phase,
            trigger: state.trigger,
        }
    }
}

impl<T, R> Inner<T, R>
where
    T: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, GroupState<T, R>> {
        // The guarded sections run no user code, so a poisoned lock still holds consistent state
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move a collecting group to flushing and take its batch
    ///
    /// Caller must hold the lock and have seen `Phase::Collecting`.
    fn begin_flush(&self, state: &mut GroupState<T, R>, trigger: FlushTrigger) -> Vec<T> {
        debug!(group_id = %self.group_id, ?trigger, "Inner::begin_flush: called");
        state.phase = Phase::Flushing;
        state.trigger = Some(trigger);

        if let Some(watchdog) = state.watchdog.take() {
            if trigger == FlushTrigger::Capacity {
                debug!(group_id = %self.group_id, "Inner::begin_flush: cancelling watchdog");
                watchdog.abort();
            }
        }

        std::mem::take(&mut state.payloads)
    }

    /// Run the handler once, record the outcome and release every waiter
    async fn flush(&self, batch: Vec<T>) {
        let batch_size = batch.len();
        info!(group_id = %self.group_id, batch_size, "Flushing batch");

        let result = AssertUnwindSafe(self.handler.handle(batch)).catch_unwind().await;
        let outcome = match result {
            Ok(Ok(value)) => {
                debug!(group_id = %self.group_id, "Inner::flush: handler succeeded");
                Ok(value)
            }
            Ok(Err(e)) => {
                warn!(group_id = %self.group_id, error = %e, "Batch handler failed");
                Err(CallGroupError::HandlerFailed(Arc::new(e)))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(group_id = %self.group_id, %message, "Batch handler panicked");
                Err(CallGroupError::HandlerPanicked(message))
            }
        };

        let waiters = {
            let mut state = self.lock();
            debug_assert!(state.outcome.is_none(), "outcome recorded twice");
            state.outcome = Some(outcome.clone());
            state.phase = Phase::Closed;
            std::mem::take(&mut state.waiters)
        };

        let waiter_count = waiters.len();
        for waiter in waiters {
            // A waiter that dropped its Pending no longer cares
            let _ = waiter.send(outcome.clone());
        }

        self.closed.notify_waiters();
        info!(group_id = %self.group_id, batch_size, waiter_count, success = outcome.is_ok(), "Call group closed");
    }

    async fn watchdog(self: Arc<Self>) {
        tokio::time::sleep(self.timeout).await;

        let batch = {
            let mut state = self.lock();
            if state.phase != Phase::Collecting {
                debug!(group_id = %self.group_id, phase = %state.phase, "Inner::watchdog: already flushed");
                return;
            }
            info!(group_id = %self.group_id, remaining = state.remaining, "Timeout elapsed before capacity was reached");
            self.begin_flush(&mut state, FlushTrigger::Timeout)
        };

        self.flush(batch).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler that records every batch it sees
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<Vec<i32>>>>,
        fail: Option<&'static str>,
        delay: Duration,
    }

    impl Recorder {
        fn failing(message: &'static str) -> Self {
            Self {
                fail: Some(message),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Vec<i32>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchHandler<i32, usize> for Recorder {
        async fn handle(&self, batch: Vec<i32>) -> eyre::Result<usize> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let len = batch.len();
            self.calls.lock().unwrap().push(batch);
            match self.fail {
                Some(message) => Err(eyre::eyre!(message)),
                None => Ok(len),
            }
        }
    }

    struct Exploder;

    #[async_trait]
    impl BatchHandler<i32, ()> for Exploder {
        async fn handle(&self, _batch: Vec<i32>) -> eyre::Result<()> {
            panic!("handler exploded")
        }
    }

    fn group(capacity: usize, recorder: &Recorder) -> CallGroup<i32, usize> {
        CallGroup::with_handler(capacity, recorder.clone(), Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn test_zero_capacity_rejected() {
        let result = CallGroup::<i32>::new(0, |_| async { Ok::<_, eyre::Report>(()) }, Duration::from_secs(1));
        let err = result.unwrap_err();
        assert!(matches!(err, CallGroupError::InvalidArgument(_)));
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn test_requires_runtime() {
        let result = CallGroup::<i32>::new(1, |_| async { Ok::<_, eyre::Report>(()) }, Duration::from_secs(1));
        assert!(matches!(result, Err(CallGroupError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_single_join() {
        let recorder = Recorder::default();
        let group = group(1, &recorder);

        let outcome = group.join(42).unwrap().await;

        assert_eq!(outcome.unwrap(), 1);
        assert_eq!(recorder.calls(), vec![vec![42]]);
        assert_eq!(group.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn test_join_then_leave() {
        let recorder = Recorder::default();
        let group = group(2, &recorder);

        let pending = group.join(1).unwrap();
        assert_eq!(group.remaining(), 1);
        group.leave().unwrap();

        assert_eq!(pending.await.unwrap(), 1);
        assert_eq!(recorder.calls(), vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_third_leave_fails() {
        let recorder = Recorder::default();
        let group = group(2, &recorder);

        group.leave().unwrap();
        group.leave().unwrap();

        let err = group.leave().unwrap_err();
        assert!(err.is_capacity_exceeded());

        group.closed().await;
        assert_eq!(recorder.calls(), vec![Vec::<i32>::new()]);
    }

    #[tokio::test]
    async fn test_joins_share_outcome_in_order() {
        let recorder = Recorder::default();
        let group = group(3, &recorder);

        let a = group.join(1).unwrap();
        let b = group.join(2).unwrap();
        let c = group.join(3).unwrap();

        let (a, b, c) = tokio::join!(a, b, c);
        assert_eq!(a.unwrap(), 3);
        assert_eq!(b.unwrap(), 3);
        assert_eq!(c.unwrap(), 3);
        assert_eq!(recorder.calls(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_rejected_join_does_not_mutate() {
        let recorder = Recorder {
            delay: Duration::from_millis(50),
            ..Default::default()
        };
        let group = group(1, &recorder);

        let pending = group.join(1).unwrap();
        // Handler is still sleeping, group is flushing
        let err = group.join(2).unwrap_err();
        assert!(matches!(
            err,
            CallGroupError::CapacityExceeded {
                capacity: 1,
                phase: Phase::Flushing
            }
        ));

        pending.await.unwrap();
        assert_eq!(recorder.calls(), vec![vec![1]]);
        assert!(group.join(3).unwrap_err().is_capacity_exceeded());
        assert!(group.leave_and_wait().unwrap_err().is_capacity_exceeded());
    }

    #[tokio::test]
    async fn test_timeout_flushes_partial_batch() {
        let recorder = Recorder::default();
        let group = CallGroup::<i32, usize>::with_handler(2, recorder.clone(), Duration::from_millis(10)).unwrap();

        let outcome = group.join(1).unwrap().await;

        assert_eq!(outcome.unwrap(), 1);
        assert_eq!(recorder.calls(), vec![vec![1]]);
        assert_eq!(group.status().trigger, Some(FlushTrigger::Timeout));
        assert!(group.leave().unwrap_err().is_capacity_exceeded());
    }

    #[tokio::test]
    async fn test_timeout_with_no_arrivals() {
        let recorder = Recorder::default();
        let group = CallGroup::<i32, usize>::with_handler(3, recorder.clone(), Duration::from_millis(10)).unwrap();

        group.closed().await;

        assert_eq!(recorder.calls(), vec![Vec::<i32>::new()]);
        assert_eq!(group.outcome().unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_watchdog_cancelled_by_capacity_flush() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        let group = CallGroup::new(
            1,
            move |batch: Vec<i32>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, eyre::Report>(batch.len()) }
            },
            Duration::from_millis(20),
        )
        .unwrap();

        group.join(7).unwrap().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(group.status().trigger, Some(FlushTrigger::Capacity));
    }

    #[tokio::test]
    async fn test_zero_timeout_disables_watchdog() {
        let recorder = Recorder::default();
        let group = CallGroup::<i32, usize>::with_handler(2, recorder.clone(), Duration::ZERO).unwrap();

        let pending = group.join(1).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(group.phase(), Phase::Collecting);
        assert!(recorder.calls().is_empty());

        group.join(2).unwrap().await.unwrap();
        assert_eq!(pending.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_handler_failure_fans_out() {
        let recorder = Recorder::failing("backend unavailable");
        let group = group(2, &recorder);

        let a = group.join(1).unwrap();
        let b = group.join(2).unwrap();
        let (a, b) = tokio::join!(a, b);

        let a = a.unwrap_err();
        let b = b.unwrap_err();
        assert!(a.is_handler_failure());
        assert!(a.to_string().contains("backend unavailable"));
        assert!(a.same_failure(&b));
        assert!(a.same_failure(&group.outcome().unwrap().unwrap_err()));
        assert_eq!(recorder.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_panic_fans_out() {
        let group = CallGroup::<i32, ()>::with_handler(2, Exploder, Duration::from_secs(1)).unwrap();

        let a = group.join(1).unwrap();
        let b = group.leave_and_wait().unwrap();
        let (a, b) = tokio::join!(a, b);

        assert!(matches!(a, Err(CallGroupError::HandlerPanicked(ref m)) if m.contains("handler exploded")));
        assert!(a.unwrap_err().same_failure(&b.unwrap_err()));
        assert_eq!(group.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn test_status_tracks_arrivals() {
        let recorder = Recorder::default();
        let group = group(3, &recorder);

        let _pending = group.join(10).unwrap();
        group.leave().unwrap();

        let status = group.status();
        assert_eq!(status.capacity, 3);
        assert_eq!(status.remaining, 1);
        assert_eq!(status.arrivals(), 2);
        assert_eq!(status.collected, 1);
        assert_eq!(status.waiters, 1);
        assert_eq!(status.phase, Phase::Collecting);
        assert_eq!(status.trigger, None);
        assert!(group.outcome().is_none());
    }

    #[tokio::test]
    async fn test_dropped_pending_does_not_block_others() {
        let recorder = Recorder::default();
        let group = group(2, &recorder);

        drop(group.join(1).unwrap());
        let outcome = group.join(2).unwrap().await;

        assert_eq!(outcome.unwrap(), 2);
        assert_eq!(recorder.calls(), vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn test_abandoned_when_group_dropped_without_watchdog() {
        let recorder = Recorder::default();
        let group = CallGroup::<i32, usize>::with_handler(2, recorder.clone(), Duration::ZERO).unwrap();

        let pending = group.join(1).unwrap();
        drop(group);

        assert!(matches!(pending.await, Err(CallGroupError::Abandoned)));
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_arrivals_flush_once() {
        let recorder = Recorder::default();
        let group = group(16, &recorder);

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let group = group.clone();
                tokio::spawn(async move { group.join(i).unwrap().await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 16);
        }

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        let mut batch = calls[0].clone();
        batch.sort();
        assert_eq!(batch, (0..16).collect::<Vec<_>>());
        assert!(group.join(99).unwrap_err().is_capacity_exceeded());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_arrivals_from_plain_threads() {
        let recorder = Recorder::default();
        let group = group(4, &recorder);

        let threads: Vec<_> = (0..4)
            .map(|i| {
                let group = group.clone();
                std::thread::spawn(move || if i % 2 == 0 { group.join(i).map(Some) } else { group.leave().map(|_| None) })
            })
            .collect();

        let mut pendings = Vec::new();
        for thread in threads {
            if let Some(pending) = thread.join().unwrap().unwrap() {
                pendings.push(pending);
            }
        }

        for pending in pendings {
            assert_eq!(pending.await.unwrap(), 2);
        }
        let mut batch = recorder.calls()[0].clone();
        batch.sort();
        assert_eq!(batch, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_closed_after_close_returns_immediately() {
        let recorder = Recorder::default();
        let group = group(1, &recorder);

        group.leave().unwrap();
        group.closed().await;
        tokio::time::timeout(Duration::from_millis(100), group.closed())
            .await
            .expect("closed() should resolve once the group is closed");
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "unknown panic payload");
    }
}
