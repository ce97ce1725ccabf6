//! One protocol's connection attempt, wrapped for racing.
//!
//! Envoy's `ConnectionAttemptCallbacks` is a self-owning object removed
//! from a list on completion; here an `Attempt` is a spawned task plus a
//! cancel handle, and completion is reported back over a channel instead
//! of a virtual callback. The `now_or_never` check below is what
//! preserves the "Immediate" case from the original design: a pool that
//! already has a warm connection resolves before the caller ever sees a
//! spawned task at all.

use std::sync::Arc;

use futures_util::future::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error;
use crate::grid::origin::Origin;
use crate::grid::pool::{
    CancelPolicy, PoolFailure, PoolHandle, Protocol, StreamOptions, StreamReady,
};

pub(crate) struct AttemptOutcome {
    pub protocol: Protocol,
    pub result: Result<StreamReady, PoolFailure>,
}

pub(crate) enum AttemptStart {
    /// The pool resolved the stream before yielding once; no task was
    /// spawned and there is nothing to cancel.
    Immediate(Result<StreamReady, PoolFailure>),
    Pending(Attempt),
}

/// A connection attempt running in the background.
pub(crate) struct Attempt {
    pub protocol: Protocol,
    cancel_tx: Option<oneshot::Sender<CancelPolicy>>,
    join: JoinHandle<()>,
}

impl Attempt {
    pub fn start(
        pool: Arc<dyn PoolHandle>,
        origin: Origin,
        options: StreamOptions,
        outcome_tx: mpsc::UnboundedSender<AttemptOutcome>,
    ) -> AttemptStart {
        let protocol = pool.protocol();
        let mut fut = pool.new_stream(&origin, options);

        if let Some(result) = fut.as_mut().now_or_never() {
            log::trace!("{origin}: {protocol} attempt resolved immediately");
            return AttemptStart::Immediate(result);
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                policy = cancel_rx => match policy {
                    Ok(CancelPolicy::CloseExcess) => Err(PoolFailure {
                        reason: error::teardown(),
                        connection_used: false,
                    }),
                    Ok(CancelPolicy::Default) | Err(_) => fut.await,
                },
                result = &mut fut => result,
            };
            // The wrapper may already be gone (grid torn down, caller
            // cancelled with CloseExcess and nobody's listening); a
            // dropped receiver here is not an error.
            let _ = outcome_tx.send(AttemptOutcome { protocol, result });
        });

        AttemptStart::Pending(Attempt {
            protocol,
            cancel_tx: Some(cancel_tx),
            join,
        })
    }

    /// Request that the attempt stop. `CancelPolicy::Default` is a no-op
    /// signal-wise (the background task keeps running so a late success
    /// still reaches the pool's idle cache); `CloseExcess` causes the task
    /// to drop the pool future immediately.
    pub fn cancel(&mut self, policy: CancelPolicy) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(policy);
        }
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        // An `Attempt` whose handle was simply dropped (not explicitly
        // cancelled) keeps running with `CancelPolicy::Default` semantics;
        // we still send it so the task doesn't sit blocked on a recv it
        // will never otherwise see resolve.
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(CancelPolicy::Default);
        }
    }
}
