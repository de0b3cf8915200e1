//! Drives fragment roots on a bounded pool of executor permits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tessel_common::{Error, Result};
use tessel_engine::{ExecContext, Operator, Ready};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Calls to `next_ready` a driver makes before giving its permit back.
const QUANTUM: usize = 64;

/// A fragment root together with the context it was opened with.
pub struct Fragment {
    pub index: usize,
    pub root: Box<dyn Operator>,
    pub ctx: ExecContext,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentStats {
    pub index: usize,
    pub root_name: &'static str,
    pub tuples: i64,
    pub batches: i64,
    pub busy: Duration,
}

/// Bounds how many fragments run operator code at the same time.
#[derive(Clone)]
pub struct ExecutorPool {
    permits: Arc<Semaphore>,
    idle_recheck: Duration,
}

impl ExecutorPool {
    pub fn new(threads: usize, idle_recheck: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(threads.max(1))),
            idle_recheck,
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Runs `fragment` to end of stream, cancellation or error. The root is
    /// always closed.
    pub fn spawn(
        &self,
        fragment: Fragment,
        cancel: watch::Receiver<Option<String>>,
        profiling: bool,
    ) -> JoinHandle<Result<FragmentStats>> {
        let pool = self.clone();
        tokio::spawn(async move { pool.drive(fragment, cancel, profiling).await })
    }

    async fn drive(
        &self,
        mut fragment: Fragment,
        mut cancel: watch::Receiver<Option<String>>,
        profiling: bool,
    ) -> Result<FragmentStats> {
        let mut stats = FragmentStats {
            index: fragment.index,
            root_name: fragment.root.name(),
            ..FragmentStats::default()
        };
        let result = self
            .run_to_end(&mut fragment, &mut cancel, profiling, &mut stats)
            .await;
        if let Err(e) = fragment.root.close() {
            debug!(query_id = fragment.ctx.query_id, fragment = fragment.index, error = %e, "close failed");
        }
        match &result {
            Ok(()) => debug!(
                query_id = fragment.ctx.query_id,
                fragment = fragment.index,
                tuples = stats.tuples,
                "fragment finished"
            ),
            Err(Error::Cancelled(_)) => debug!(
                query_id = fragment.ctx.query_id,
                fragment = fragment.index,
                "fragment cancelled"
            ),
            Err(e) => error!(
                query_id = fragment.ctx.query_id,
                fragment = fragment.index,
                root = stats.root_name,
                error = %e,
                "fragment failed"
            ),
        }
        result.map(|()| stats)
    }

    async fn run_to_end(
        &self,
        fragment: &mut Fragment,
        cancel: &mut watch::Receiver<Option<String>>,
        profiling: bool,
        stats: &mut FragmentStats,
    ) -> Result<()> {
        let waker = fragment.ctx.waker.clone();
        loop {
            if let Some(cause) = cancel.borrow().clone() {
                return Err(Error::Cancelled(cause));
            }
            let finished = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| Error::execution("executor pool is closed"))?;
                let started = profiling.then(Instant::now);
                let step = run_quantum(fragment.root.as_mut(), stats);
                if let Some(started) = started {
                    stats.busy += started.elapsed();
                }
                step?
            };
            match finished {
                Quantum::Finished => return Ok(()),
                Quantum::Yielded => tokio::task::yield_now().await,
                Quantum::Idle => {
                    trace!(query_id = fragment.ctx.query_id, fragment = fragment.index, "fragment idle");
                    tokio::select! {
                        _ = waker.notified() => {}
                        changed = cancel.changed() => {
                            if changed.is_err() {
                                return Err(Error::Cancelled("query partition dropped".to_string()));
                            }
                        }
                        _ = tokio::time::sleep(self.idle_recheck) => {}
                    }
                }
            }
        }
    }
}

enum Quantum {
    Finished,
    Yielded,
    Idle,
}

fn run_quantum(root: &mut dyn Operator, stats: &mut FragmentStats) -> Result<Quantum> {
    for _ in 0..QUANTUM {
        match root.next_ready()? {
            Ready::Batch(batch) => {
                stats.tuples += batch.num_rows() as i64;
                stats.batches += 1;
            }
            Ready::EndOfIteration => {}
            Ready::NotReady => return Ok(Quantum::Idle),
            Ready::EndOfStream => return Ok(Quantum::Finished),
        }
    }
    Ok(Quantum::Yielded)
}
