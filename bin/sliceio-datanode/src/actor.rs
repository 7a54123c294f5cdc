//! Actor pool: spawn N, wait for all, stop all
//!
//! Datanodes run a pool of buckets and buckets run a pool of channels. Both
//! use the same lifecycle: every child runs as its own task and reports
//! `Ready` once started and `Over` when it returns; the parent can wait for
//! all children to finish or broadcast a stop signal and join them.

use async_trait::async_trait;
use sliceio_common::{Error, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A long-running child of an [`ActorPool`]
#[async_trait]
pub trait Actor: Send + 'static {
    /// Name used in logs
    fn name(&self) -> String;

    /// Run until done or until `ctx.stopped()` resolves.
    ///
    /// Implementations call `ctx.ready()` once started.
    async fn run(self, ctx: ActorContext) -> Result<()>;
}

#[derive(Debug)]
enum ActorEvent {
    Ready(usize),
    Over { index: usize, failed: bool },
}

/// Handle given to each actor
#[derive(Clone)]
pub struct ActorContext {
    index: usize,
    events: mpsc::UnboundedSender<ActorEvent>,
    stop: watch::Receiver<bool>,
}

impl ActorContext {
    /// Position of the actor in its pool
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Report that the actor has started
    pub fn ready(&self) {
        let _ = self.events.send(ActorEvent::Ready(self.index));
    }

    /// Resolves once the pool asks its actors to stop
    pub async fn stopped(&self) {
        let mut stop = self.stop.clone();
        // A dropped pool counts as a stop request
        let _ = stop.wait_for(|stopped| *stopped).await;
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Reports `Over` when an actor task ends, whether it returned, panicked or
/// was aborted
struct OverGuard {
    index: usize,
    failed: bool,
    events: mpsc::UnboundedSender<ActorEvent>,
}

impl Drop for OverGuard {
    fn drop(&mut self) {
        let _ = self.events.send(ActorEvent::Over {
            index: self.index,
            failed: self.failed,
        });
    }
}

/// A fixed set of running actors
pub struct ActorPool {
    name: String,
    stop: watch::Sender<bool>,
    events: mpsc::UnboundedReceiver<ActorEvent>,
    handles: Vec<JoinHandle<Result<()>>>,
    over: Vec<bool>,
}

impl ActorPool {
    /// Start every actor and wait until each is ready (or already over)
    pub async fn spawn<A: Actor>(name: impl Into<String>, actors: Vec<A>) -> Result<Self> {
        let name = name.into();
        let total = actors.len();
        let (stop, stop_rx) = watch::channel(false);
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let mut handles = Vec::with_capacity(total);
        for (index, actor) in actors.into_iter().enumerate() {
            let ctx = ActorContext {
                index,
                events: events_tx.clone(),
                stop: stop_rx.clone(),
            };
            let mut over_guard = OverGuard {
                index,
                failed: true,
                events: events_tx.clone(),
            };
            handles.push(tokio::spawn(async move {
                let actor_name = actor.name();
                let result = actor.run(ctx).await;
                if let Err(e) = &result {
                    error!(actor = %actor_name, error = %e, "Actor failed");
                }
                over_guard.failed = result.is_err();
                result
            }));
        }
        drop(events_tx);

        let mut ready = vec![false; total];
        let mut over = vec![false; total];
        let mut started = 0;
        while started < total {
            let Some(event) = events.recv().await else {
                break;
            };
            match event {
                ActorEvent::Ready(index) => {
                    if !ready[index] && !over[index] {
                        started += 1;
                    }
                    ready[index] = true;
                }
                ActorEvent::Over { index, failed } => {
                    if !ready[index] && !over[index] {
                        started += 1;
                    }
                    over[index] = true;
                    debug!(pool = %name, index, failed, "Actor exited during startup");
                }
            }
        }

        info!(pool = %name, actors = total, "Actor pool started");
        Ok(Self {
            name,
            stop,
            events,
            handles,
            over,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait until every actor has finished on its own
    pub async fn wait(&mut self) {
        while self.over.iter().any(|over| !over) {
            match self.events.recv().await {
                Some(ActorEvent::Over { index, .. }) => self.over[index] = true,
                Some(ActorEvent::Ready(_)) => {}
                None => break,
            }
        }
    }

    /// Ask every actor to stop and join them all; returns the first failure
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(true);

        let mut first_error = None;
        for handle in self.handles {
            let result = handle
                .await
                .map_err(|e| Error::internal(format!("actor task panicked: {e}")))
                .and_then(|result| result);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        info!(pool = %self.name, "Actor pool stopped");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Sleeper {
        started: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Actor for Sleeper {
        fn name(&self) -> String {
            "sleeper".to_string()
        }

        async fn run(self, ctx: ActorContext) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            ctx.ready();
            ctx.stopped().await;
            assert!(ctx.is_stopped());
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct OneShot {
        fail: bool,
    }

    #[async_trait]
    impl Actor for OneShot {
        fn name(&self) -> String {
            "one-shot".to_string()
        }

        async fn run(self, ctx: ActorContext) -> Result<()> {
            if ctx.index() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            if self.fail {
                return Err(Error::internal("boom"));
            }
            ctx.ready();
            Ok(())
        }
    }

    struct Panicker;

    #[async_trait]
    impl Actor for Panicker {
        fn name(&self) -> String {
            "panicker".to_string()
        }

        async fn run(self, _ctx: ActorContext) -> Result<()> {
            panic!("actor blew up before starting");
        }
    }

    #[tokio::test]
    async fn test_panic_before_ready_does_not_block_spawn() {
        let pool = tokio::time::timeout(
            Duration::from_secs(1),
            ActorPool::spawn("panicking", vec![Panicker, Panicker]),
        )
        .await
        .unwrap()
        .unwrap();

        let err = pool.shutdown().await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_spawn_waits_for_ready_and_shutdown_joins() {
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let actors = (0..4)
            .map(|_| Sleeper {
                started: Arc::clone(&started),
                finished: Arc::clone(&finished),
            })
            .collect();

        let pool = ActorPool::spawn("sleepers", actors).await.unwrap();
        assert_eq!(pool.len(), 4);
        assert_eq!(started.load(Ordering::SeqCst), 4);
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        pool.shutdown().await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_wait_returns_when_all_over() {
        let actors = (0..3).map(|_| OneShot { fail: false }).collect();
        let mut pool = ActorPool::spawn("one-shots", actors).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), pool.wait())
            .await
            .unwrap();
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_reported_on_shutdown() {
        let actors = vec![OneShot { fail: true }, OneShot { fail: false }];
        let pool = ActorPool::spawn("failing", actors).await.unwrap();
        let err = pool.shutdown().await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
