//! Worker capability roles.
//!
//! A worker implementation takes exactly one of three roles, resolved once
//! at construction time:
//!
//! - [`RawWorkerImpl`]: pull-based. Owns the master channel outright and
//!   drives it however it wants; the runtime is not involved after handoff.
//! - [`EventedWorkerImpl`]: push-based. The runtime owns all I/O and calls
//!   back on connect, message, and disconnect events. Callbacks run to
//!   completion on the reactor thread and must not block.
//! - [`SharedWorkerImpl`]: an evented worker that additionally answers the
//!   administrative control plane of a long-lived shared worker.

use async_trait::async_trait;

use ganger_wire::{Message, MessageChannel};

use crate::error::Result;
use crate::runtime::{PeerHandle, RunnerHandle};
use crate::status::WorkerStatus;

/// Pull-based worker body for dedicated mode.
#[async_trait(?Send)]
pub trait RawWorkerImpl {
    /// Runs the worker over the channel to the master process. Returning
    /// ends the worker.
    async fn run(&mut self, channel: MessageChannel) -> Result<()>;
}

/// Push-based worker callbacks. All methods have empty defaults except
/// [`on_message`](EventedWorkerImpl::on_message).
pub trait EventedWorkerImpl {
    /// Called once before any connection, with the handle the worker may
    /// keep for spawning its own sources or shutting itself down.
    fn initialize(&mut self, _runner: &RunnerHandle) -> Result<()> {
        Ok(())
    }

    /// A peer connected. In dedicated mode this is the master channel and
    /// the peer has no name.
    fn on_connect(&mut self, _peer: &PeerHandle) -> Result<()> {
        Ok(())
    }

    /// One application message arrived from `peer`.
    fn on_message(&mut self, message: Message, peer: &PeerHandle) -> Result<()>;

    /// The peer's send side closed. The handle may no longer be written to.
    fn on_disconnect(&mut self, _peer: &PeerHandle) -> Result<()> {
        Ok(())
    }

    /// Called once after the reactor drained, on the clean exit path.
    fn terminate(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Control-plane hooks of a shared (daemon) worker.
pub trait SharedWorkerImpl: EventedWorkerImpl {
    /// Answer a status query. `privileged` reports whether the query
    /// carried the configured admin cookie; unprivileged queries are still
    /// answered, with this flag false.
    fn on_query(&mut self, privileged: bool) -> WorkerStatus;

    /// A privileged stop request arrived; listening has already stopped.
    /// Existing connections stay open until the peers hang up.
    fn on_stop(&mut self) {}
}
