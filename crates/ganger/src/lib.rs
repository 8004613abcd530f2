//! Out-of-process workers: dedicated children, pools, and shared daemons.
//!
//! ganger provisions worker processes from deterministic launcher documents
//! and supervises them over typed message channels. Three shapes:
//!
//! - [`Worker`]: a dedicated child wired to its parent over stdin/stdout.
//! - [`WorkerPool`]: N dedicated workers with a unioned receive.
//! - [`SharedWorker`]: a connection to a long-lived daemon serving many
//!   clients on one unix or TCP socket, with a cookie-authenticated stop and
//!   query control plane, a kill-switch file, and stale-socket recovery on
//!   bind.
//!
//! Worker implementations are written against the role traits
//! ([`RawWorkerImpl`], [`EventedWorkerImpl`], [`SharedWorkerImpl`]),
//! registered in a [`WorkerRegistry`], and hosted by any binary that calls
//! [`bootstrap::run_worker_from_args`] first thing in `main`.

pub mod address;
pub mod admin;
pub mod bootstrap;
pub mod client;
pub mod config;
pub mod error;
pub mod kill_switch;
pub mod launcher;
pub mod lock;
pub mod range;
pub mod roles;
pub mod runtime;
pub mod socket;
pub mod status;

pub use address::SocketAddress;
pub use bootstrap::BootstrapProfile;
pub use client::{SharedWorker, Worker, WorkerFactory, WorkerPool};
pub use config::ProfileConfig;
pub use error::{Result, WorkerError};
pub use kill_switch::KillSwitch;
pub use range::Range;
pub use roles::{EventedWorkerImpl, RawWorkerImpl, SharedWorkerImpl};
pub use runtime::{
    PeerHandle, RunnerHandle, RunnerOptions, WorkerInstance, WorkerRegistry, WorkerRunner,
};
pub use status::{WorkerCounter, WorkerStatus};

pub use ganger_wire::{Encoding, Message, MessageChannel};
