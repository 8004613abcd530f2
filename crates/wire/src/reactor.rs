//! Single-threaded cooperative reactor.
//!
//! One reactor per worker process. Each registered source is a local task
//! holding a registration guard; the loop runs until every guard is dropped
//! (task finished or aborted) or [`ReactorHandle::stop`] is called. All tasks
//! share one thread, so handlers run to completion without preemption and
//! must not block.

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;

use tokio::sync::Notify;
use tokio::task::{AbortHandle, LocalSet};
use tracing::{debug, trace};

struct ReactorState {
    active: Cell<usize>,
    stopped: Cell<bool>,
    wake: Notify,
}

/// Decrements the registered-source count when its task finishes or is
/// aborted, waking the loop so it can re-check for idleness.
struct SourceGuard(Rc<ReactorState>);

impl SourceGuard {
    fn register(state: Rc<ReactorState>) -> Self {
        state.active.set(state.active.get() + 1);
        Self(state)
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.0.active.set(self.0.active.get() - 1);
        self.0.wake.notify_waiters();
    }
}

/// Clonable handle for registering sources and stopping the loop, usable
/// from inside running tasks.
#[derive(Clone)]
pub struct ReactorHandle {
    local: Rc<LocalSet>,
    state: Rc<ReactorState>,
}

impl ReactorHandle {
    /// Register a source: the loop keeps running while the task lives.
    /// Aborting the returned handle deregisters it.
    pub fn spawn_source<F>(&self, future: F) -> AbortHandle
    where
        F: Future<Output = ()> + 'static,
    {
        let guard = SourceGuard::register(self.state.clone());
        trace!(active = self.state.active.get(), "registered a source");
        self.local
            .spawn_local(async move {
                let _guard = guard;
                future.await;
            })
            .abort_handle()
    }

    /// Spawn an auxiliary task that does not keep the loop alive.
    pub fn spawn_detached<F>(&self, future: F) -> AbortHandle
    where
        F: Future<Output = ()> + 'static,
    {
        self.local.spawn_local(future).abort_handle()
    }

    /// Stop the loop even if sources remain registered.
    pub fn stop(&self) {
        debug!("reactor stop requested");
        self.state.stopped.set(true);
        self.state.wake.notify_waiters();
    }

    /// Number of currently registered sources.
    pub fn source_count(&self) -> usize {
        self.state.active.get()
    }
}

/// The per-process event loop: a current-thread tokio runtime driving a
/// [`LocalSet`].
pub struct Reactor {
    rt: tokio::runtime::Runtime,
    local: Rc<LocalSet>,
    state: Rc<ReactorState>,
}

impl Reactor {
    pub fn new() -> std::io::Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            rt,
            local: Rc::new(LocalSet::new()),
            state: Rc::new(ReactorState {
                active: Cell::new(0),
                stopped: Cell::new(false),
                wake: Notify::new(),
            }),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            local: self.local.clone(),
            state: self.state.clone(),
        }
    }

    /// Run a future to completion on the loop's thread, driving any
    /// registered sources alongside it. Used for setup phases.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.rt.block_on(self.local.run_until(future))
    }

    /// Drive the loop until no source remains registered or `stop` is
    /// called. Returns immediately when nothing is registered.
    pub fn run(&self) {
        let state = self.state.clone();
        self.rt.block_on(self.local.run_until(async move {
            loop {
                if state.stopped.get() || state.active.get() == 0 {
                    break;
                }
                state.wake.notified().await;
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_run_with_no_sources_returns() {
        let reactor = Reactor::new().expect("reactor");
        reactor.run();
    }

    #[test]
    fn test_run_until_sources_finish() {
        let reactor = Reactor::new().expect("reactor");
        let handle = reactor.handle();
        let hits = Rc::new(Cell::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            handle.spawn_source(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                hits.set(hits.get() + 1);
            });
        }

        reactor.run();
        assert_eq!(hits.get(), 3);
        assert_eq!(handle.source_count(), 0);
    }

    #[test]
    fn test_stop_interrupts_pending_sources() {
        let reactor = Reactor::new().expect("reactor");
        let handle = reactor.handle();

        handle.spawn_source(async {
            // never completes on its own
            std::future::pending::<()>().await;
        });
        let stopper = handle.clone();
        handle.spawn_detached(async move {
            stopper.stop();
        });

        reactor.run();
        assert_eq!(handle.source_count(), 1);
    }

    #[test]
    fn test_abort_deregisters_source() {
        let reactor = Reactor::new().expect("reactor");
        let handle = reactor.handle();

        let pending = handle.spawn_source(std::future::pending::<()>());
        handle.spawn_detached(async move {
            pending.abort();
        });

        reactor.run();
        assert_eq!(handle.source_count(), 0);
    }
}
