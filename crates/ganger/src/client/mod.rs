//! Client-side provisioning: dedicated children, pools, shared daemons.

mod factory;
mod pool;
mod shared;
mod worker;

pub use factory::WorkerFactory;
pub use pool::WorkerPool;
pub use shared::SharedWorker;
pub use worker::Worker;
