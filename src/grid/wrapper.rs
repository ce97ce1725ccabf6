//! The race coordinator for a single `new_stream` call.
//!
//! Envoy's `WrapperCallbacks` lives as long as at least one
//! `ConnectionAttemptCallbacks` is outstanding, independent of whether the
//! caller it originally served has already been answered; that's what
//! lets an H2 win get delivered immediately while a still-pending H3
//! attempt keeps running so its connection can land in the pool's cache.
//! We model that directly: `Wrapper::start` spawns its own task that
//! outlives the caller-visible result channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{self, Error, Kind};
use crate::grid::attempt::{Attempt, AttemptOutcome, AttemptStart};
use crate::grid::h3_tracker::H3StatusTracker;
use crate::grid::origin::Origin;
use crate::grid::pool::{CancelPolicy, PoolHandle, Protocol, StreamOptions, StreamReady};

/// One entry in a wrapper's attempt schedule: which pool, and how long
/// after the wrapper started it should begin (zero for the first attempt
/// in every race).
pub(crate) struct PlannedAttempt {
    pub pool: Arc<dyn PoolHandle>,
    pub start_after: Duration,
}

pub(crate) struct WrapperConfig {
    pub origin: Origin,
    pub options: StreamOptions,
    /// Whether this request is allowed to use H3 at all. When false, no H3
    /// attempt is ever started for it and the H3-failed flag below starts
    /// out already set, so a later H2 success still marks H3 broken.
    pub can_use_h3: bool,
    pub plan: Vec<PlannedAttempt>,
}

/// What a call to [`Grid::new_stream`](crate::Grid::new_stream) returns.
pub enum NewStreamOutcome {
    /// Resolved before anything was spawned: no handle, nothing to cancel.
    Immediate(Result<StreamReady, Error>),
    Pending {
        handle: StreamHandle,
        result: oneshot::Receiver<Result<StreamReady, Error>>,
    },
}

/// The caller-facing cancellation token for a pending race.
///
/// Dropping it without calling `cancel` is equivalent to
/// `cancel(CancelPolicy::Default)`: the race keeps running in the
/// background so a late-arriving connection still gets cached, but the
/// wrapper stops caring whether anyone is listening for the result.
pub struct StreamHandle {
    cancel_tx: Option<oneshot::Sender<CancelPolicy>>,
}

impl StreamHandle {
    pub fn cancel(mut self, policy: CancelPolicy) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(policy);
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(CancelPolicy::Default);
        }
    }
}

/// Start racing `config.plan`. Pools whose scheduled start is already due
/// are started synchronously, before anything is spawned, so a pool that
/// already has a warm connection resolves with no task at all: the
/// "Immediate" path.
///
/// The returned `teardown` sender is distinct from the caller's own
/// cancellation handle: the grid keeps it to flush races still running
/// when the grid itself is dropped, without needing joint ownership of
/// the caller-facing `StreamHandle`.
pub(crate) struct WrapperStart {
    pub outcome: NewStreamOutcome,
    pub teardown: Option<oneshot::Sender<()>>,
}

pub(crate) fn start(config: WrapperConfig, h3_tracker: Arc<dyn H3StatusTracker>) -> WrapperStart {
    let WrapperConfig { origin, options, can_use_h3, plan } = config;
    let mut plan: VecDeque<PlannedAttempt> = plan.into();
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel::<AttemptOutcome>();
    let mut pending: HashMap<Protocol, Attempt> = HashMap::new();
    let mut last_failure: Option<Error> = None;
    let mut h3_attempt_failed = !can_use_h3;
    let mut h2_attempt_succeeded = false;

    while matches!(plan.front(), Some(p) if p.start_after.is_zero()) {
        let planned = plan.pop_front().unwrap();
        let protocol = planned.pool.protocol();
        log::debug!("{origin}: starting {protocol} attempt");
        match Attempt::start(planned.pool, origin.clone(), options, outcome_tx.clone()) {
            AttemptStart::Immediate(Ok(ready)) => {
                if ready.protocol != Protocol::Http3 {
                    h2_attempt_succeeded = true;
                }
                maybe_mark_h3_broken(&h3_tracker, &origin, h3_attempt_failed, h2_attempt_succeeded);
                return WrapperStart {
                    outcome: NewStreamOutcome::Immediate(Ok(ready)),
                    teardown: None,
                };
            }
            AttemptStart::Immediate(Err(failure)) => {
                if protocol == Protocol::Http3 {
                    h3_attempt_failed = true;
                }
                maybe_mark_h3_broken(&h3_tracker, &origin, h3_attempt_failed, h2_attempt_succeeded);
                record_failure(&failure, &mut last_failure);
                if pending.is_empty() && plan.is_empty() {
                    return WrapperStart {
                        outcome: NewStreamOutcome::Immediate(Err(last_failure.unwrap())),
                        teardown: None,
                    };
                }
                // Another pool is still in the race; don't make the caller
                // wait out the happy-eyeballs delay for it.
                make_due_now(&mut plan);
            }
            AttemptStart::Pending(attempt) => {
                pending.insert(protocol, attempt);
            }
        }
    }

    let (result_tx, result_rx) = oneshot::channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let (teardown_tx, teardown_rx) = oneshot::channel();
    let start_instant = Instant::now();

    tokio::spawn(run(
        origin,
        options,
        plan,
        pending,
        outcome_tx,
        outcome_rx,
        h3_tracker,
        last_failure,
        h3_attempt_failed,
        h2_attempt_succeeded,
        Some(result_tx),
        cancel_rx,
        teardown_rx,
        start_instant,
    ));

    WrapperStart {
        outcome: NewStreamOutcome::Pending {
            handle: StreamHandle {
                cancel_tx: Some(cancel_tx),
            },
            result: result_rx,
        },
        teardown: Some(teardown_tx),
    }
}

fn make_due_now(plan: &mut VecDeque<PlannedAttempt>) {
    if let Some(next) = plan.front_mut() {
        next.start_after = Duration::ZERO;
    }
}

/// H3 is only marked broken once this request has both seen an H3 failure
/// and had an H2 success to fall back on; an H3 failure on its own (with no
/// surviving H2 attempt) says nothing about whether H3 itself is broken.
fn maybe_mark_h3_broken(
    h3_tracker: &Arc<dyn H3StatusTracker>,
    origin: &Origin,
    h3_attempt_failed: bool,
    h2_attempt_succeeded: bool,
) {
    if h3_attempt_failed && h2_attempt_succeeded {
        log::debug!("{origin}: h3 failed and h2 succeeded for this request, marking broken");
        h3_tracker.mark_broken(origin);
    }
}

fn record_failure(failure: &crate::grid::pool::PoolFailure, last_failure: &mut Option<Error>) {
    *last_failure = Some(Error::with_reason(
        failure.reason.kind(),
        failure.reason.transport_reason().to_string(),
    ));
}

#[allow(clippy::too_many_arguments)]
async fn run(
    origin: Origin,
    options: StreamOptions,
    mut plan: VecDeque<PlannedAttempt>,
    mut pending: HashMap<Protocol, Attempt>,
    outcome_tx: mpsc::UnboundedSender<AttemptOutcome>,
    mut outcome_rx: mpsc::UnboundedReceiver<AttemptOutcome>,
    h3_tracker: Arc<dyn H3StatusTracker>,
    mut last_failure: Option<Error>,
    mut h3_attempt_failed: bool,
    mut h2_attempt_succeeded: bool,
    mut result_tx: Option<oneshot::Sender<Result<StreamReady, Error>>>,
    mut cancel_rx: oneshot::Receiver<CancelPolicy>,
    mut teardown_rx: oneshot::Receiver<()>,
    start_instant: Instant,
) {
    let mut cancel_seen = false;
    let mut teardown_seen = false;

    loop {
        if pending.is_empty() && plan.is_empty() {
            break;
        }

        let deadline = plan.front().map(|p| start_instant + p.start_after);

        tokio::select! {
            biased;

            _ = &mut teardown_rx, if !teardown_seen => {
                teardown_seen = true;
                log::trace!("{origin}: grid torn down, closing excess attempts");
                for (_, mut attempt) in pending.drain() {
                    attempt.cancel(CancelPolicy::CloseExcess);
                }
                plan.clear();
                if let Some(tx) = result_tx.take() {
                    let _ = tx.send(Err(error::teardown()));
                }
                break;
            }

            policy = &mut cancel_rx, if !cancel_seen => {
                cancel_seen = true;
                if let Ok(CancelPolicy::CloseExcess) = policy {
                    log::trace!("{origin}: caller cancelled, closing excess attempts");
                    for (_, mut attempt) in pending.drain() {
                        attempt.cancel(CancelPolicy::CloseExcess);
                    }
                    plan.clear();
                    if let Some(tx) = result_tx.take() {
                        let _ = tx.send(Err(error::cancelled()));
                    }
                    break;
                }
                // Default: let the race keep running in the background so a
                // late connection is still cached; just stop caring about
                // delivering a result to whoever dropped the handle.
            }

            _ = tokio::time::sleep_until(deadline.unwrap()), if deadline.is_some() => {
                let planned = plan.pop_front().unwrap();
                let protocol = planned.pool.protocol();
                log::debug!("{origin}: starting {protocol} attempt");
                match Attempt::start(planned.pool, origin.clone(), options, outcome_tx.clone()) {
                    AttemptStart::Immediate(result) => {
                        let _ = outcome_tx.send(AttemptOutcome { protocol, result });
                    }
                    AttemptStart::Pending(attempt) => {
                        pending.insert(protocol, attempt);
                    }
                }
            }

            Some(outcome) = outcome_rx.recv() => {
                pending.remove(&outcome.protocol);
                match outcome.result {
                    Ok(ready) => {
                        if outcome.protocol == Protocol::Http3 {
                            for (_, mut attempt) in pending.drain() {
                                attempt.cancel(CancelPolicy::CloseExcess);
                            }
                        } else {
                            h2_attempt_succeeded = true;
                        }
                        maybe_mark_h3_broken(&h3_tracker, &origin, h3_attempt_failed, h2_attempt_succeeded);
                        // H2 winning while H3 is still pending leaves it
                        // running on purpose: no cancel call here.
                        if let Some(tx) = result_tx.take() {
                            let _ = tx.send(Ok(ready));
                        }
                    }
                    Err(failure) => {
                        if outcome.protocol == Protocol::Http3 {
                            h3_attempt_failed = true;
                        }
                        maybe_mark_h3_broken(&h3_tracker, &origin, h3_attempt_failed, h2_attempt_succeeded);
                        record_failure(&failure, &mut last_failure);
                        if !plan.is_empty() {
                            make_due_now(&mut plan);
                        }
                    }
                }
            }
        }
    }

    if let Some(tx) = result_tx.take() {
        let err = last_failure
            .take()
            .unwrap_or_else(|| Error::new(Kind::LocalConnectionFailure, None));
        let _ = tx.send(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::pool::{DrainBehavior, IdleCallback, NewStreamFuture, PoolFailure};
    use std::sync::Mutex;
    use tokio::sync::oneshot as std_oneshot;

    struct FakePool {
        protocol: Protocol,
        completion: Mutex<Option<std_oneshot::Receiver<Result<StreamReady, PoolFailure>>>>,
    }

    impl FakePool {
        fn new(protocol: Protocol) -> (Arc<Self>, std_oneshot::Sender<Result<StreamReady, PoolFailure>>) {
            let (tx, rx) = std_oneshot::channel();
            (
                Arc::new(FakePool {
                    protocol,
                    completion: Mutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    impl PoolHandle for FakePool {
        fn protocol(&self) -> Protocol {
            self.protocol
        }

        fn new_stream(&self, _origin: &Origin, _options: StreamOptions) -> NewStreamFuture {
            let rx = self.completion.lock().unwrap().take().expect("single use fake");
            Box::pin(async move {
                rx.await.unwrap_or_else(|_| {
                    Err(PoolFailure {
                        reason: Error::new(Kind::LocalConnectionFailure, None),
                        connection_used: false,
                    })
                })
            })
        }

        fn has_active_connections(&self) -> bool {
            false
        }

        fn is_idle(&self) -> bool {
            true
        }

        fn add_idle_callback(&self, _callback: IdleCallback) {}

        fn drain_connections(&self, _behavior: DrainBehavior) {}
    }

    fn stream_ready(protocol: Protocol) -> StreamReady {
        StreamReady {
            protocol,
            encoder: Box::new(()),
        }
    }

    fn origin() -> Origin {
        Origin::new("example.com", 443)
    }

    #[tokio::test(start_paused = true)]
    async fn s1_h3_wins_before_h2_is_even_started() {
        let (h3_pool, h3_tx) = FakePool::new(Protocol::Http3);
        let (h2_pool, _h2_tx) = FakePool::new(Protocol::Http2);
        let tracker: Arc<dyn H3StatusTracker> =
            Arc::new(crate::grid::h3_tracker::InMemoryH3StatusTracker::new());

        let plan = vec![
            PlannedAttempt { pool: h3_pool, start_after: Duration::ZERO },
            PlannedAttempt { pool: h2_pool, start_after: Duration::from_millis(300) },
        ];
        let started = start(
            WrapperConfig { origin: origin(), options: StreamOptions::default(), can_use_h3: true, plan },
            tracker,
        );

        let NewStreamOutcome::Pending { result, .. } = started.outcome else {
            panic!("expected a pending race");
        };

        h3_tx.send(Ok(stream_ready(Protocol::Http3))).unwrap();
        let resolved = result.await.unwrap().unwrap();
        assert_eq!(resolved.protocol, Protocol::Http3);
    }

    #[tokio::test(start_paused = true)]
    async fn s2_h2_wins_while_h3_keeps_running() {
        let (h3_pool, h3_tx) = FakePool::new(Protocol::Http3);
        let (h2_pool, h2_tx) = FakePool::new(Protocol::Http2);
        let tracker: Arc<dyn H3StatusTracker> =
            Arc::new(crate::grid::h3_tracker::InMemoryH3StatusTracker::new());

        let plan = vec![
            PlannedAttempt { pool: h3_pool, start_after: Duration::ZERO },
            PlannedAttempt { pool: h2_pool, start_after: Duration::from_millis(300) },
        ];
        let started = start(
            WrapperConfig { origin: origin(), options: StreamOptions::default(), can_use_h3: true, plan },
            tracker.clone(),
        );
        let NewStreamOutcome::Pending { result, .. } = started.outcome else {
            panic!("expected a pending race");
        };

        tokio::time::advance(Duration::from_millis(300)).await;
        h2_tx.send(Ok(stream_ready(Protocol::Http2))).unwrap();
        let resolved = result.await.unwrap().unwrap();
        assert_eq!(resolved.protocol, Protocol::Http2);

        // H3 is still racing in the background; let it land and confirm
        // the tracker sees it rather than the task being torn down.
        h3_tx.send(Ok(stream_ready(Protocol::Http3))).unwrap();
        tokio::task::yield_now().await;
        assert!(tracker.is_broken(&origin()) == false);
    }

    #[tokio::test(start_paused = true)]
    async fn s3_h3_post_handshake_failure_marks_broken() {
        let (h3_pool, h3_tx) = FakePool::new(Protocol::Http3);
        let (h2_pool, h2_tx) = FakePool::new(Protocol::Http2);
        let tracker: Arc<dyn H3StatusTracker> =
            Arc::new(crate::grid::h3_tracker::InMemoryH3StatusTracker::new());

        let plan = vec![
            PlannedAttempt { pool: h3_pool, start_after: Duration::ZERO },
            PlannedAttempt { pool: h2_pool, start_after: Duration::from_millis(300) },
        ];
        let started = start(
            WrapperConfig { origin: origin(), options: StreamOptions::default(), can_use_h3: true, plan },
            tracker.clone(),
        );
        let NewStreamOutcome::Pending { result, .. } = started.outcome else {
            panic!("expected a pending race");
        };

        h3_tx
            .send(Err(PoolFailure {
                reason: Error::new(Kind::RemoteConnectionFailure, None),
                connection_used: true,
            }))
            .unwrap();
        // The H3 failure should pull H2's start forward instead of waiting
        // out the remaining eyeballs delay.
        tokio::task::yield_now().await;
        h2_tx.send(Ok(stream_ready(Protocol::Http2))).unwrap();

        let resolved = result.await.unwrap().unwrap();
        assert_eq!(resolved.protocol, Protocol::Http2);
        assert!(tracker.is_broken(&origin()));
    }

    #[tokio::test(start_paused = true)]
    async fn h3_failure_without_an_h2_success_does_not_mark_broken() {
        let (h3_pool, h3_tx) = FakePool::new(Protocol::Http3);
        let (h2_pool, h2_tx) = FakePool::new(Protocol::Http2);
        let tracker: Arc<dyn H3StatusTracker> =
            Arc::new(crate::grid::h3_tracker::InMemoryH3StatusTracker::new());

        let plan = vec![
            PlannedAttempt { pool: h3_pool, start_after: Duration::ZERO },
            PlannedAttempt { pool: h2_pool, start_after: Duration::from_millis(300) },
        ];
        let started = start(
            WrapperConfig { origin: origin(), options: StreamOptions::default(), can_use_h3: true, plan },
            tracker.clone(),
        );
        let NewStreamOutcome::Pending { result, .. } = started.outcome else {
            panic!("expected a pending race");
        };

        h3_tx
            .send(Err(PoolFailure {
                reason: Error::new(Kind::RemoteConnectionFailure, None),
                connection_used: true,
            }))
            .unwrap();
        tokio::task::yield_now().await;
        h2_tx
            .send(Err(PoolFailure {
                reason: Error::new(Kind::LocalConnectionFailure, None),
                connection_used: false,
            }))
            .unwrap();

        let resolved = result.await.unwrap();
        assert!(resolved.is_err());
        assert!(!tracker.is_broken(&origin()));
    }

    #[tokio::test(start_paused = true)]
    async fn h3_disallowed_up_front_presets_the_failed_flag() {
        let (h2_pool, h2_tx) = FakePool::new(Protocol::Http2);
        let tracker: Arc<dyn H3StatusTracker> =
            Arc::new(crate::grid::h3_tracker::InMemoryH3StatusTracker::new());

        // No H3 pool in the plan at all, matching a grid that decided not to
        // attempt H3 for this request (e.g. the caller opted out).
        let plan = vec![PlannedAttempt { pool: h2_pool, start_after: Duration::ZERO }];
        let started = start(
            WrapperConfig { origin: origin(), options: StreamOptions::default(), can_use_h3: false, plan },
            tracker.clone(),
        );
        let NewStreamOutcome::Pending { result, .. } = started.outcome else {
            panic!("expected a pending race");
        };

        h2_tx.send(Ok(stream_ready(Protocol::Http2))).unwrap();
        let resolved = result.await.unwrap().unwrap();
        assert_eq!(resolved.protocol, Protocol::Http2);
        assert!(tracker.is_broken(&origin()));
    }

    #[tokio::test(start_paused = true)]
    async fn s5_caller_cancel_with_close_excess_stops_pending_attempts() {
        let (h3_pool, _h3_tx) = FakePool::new(Protocol::Http3);
        let tracker: Arc<dyn H3StatusTracker> =
            Arc::new(crate::grid::h3_tracker::InMemoryH3StatusTracker::new());

        let plan = vec![PlannedAttempt { pool: h3_pool, start_after: Duration::ZERO }];
        let started = start(
            WrapperConfig { origin: origin(), options: StreamOptions::default(), can_use_h3: true, plan },
            tracker,
        );
        let NewStreamOutcome::Pending { handle, result } = started.outcome else {
            panic!("expected a pending race");
        };

        handle.cancel(CancelPolicy::CloseExcess);
        let resolved = result.await.expect("wrapper delivers a cancellation error");
        assert!(resolved.is_err());
    }
}
