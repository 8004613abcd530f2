//! Locating the executable that will run launched workers.
//!
//! There is no separate interpreter: workers run inside the embedding
//! binary itself, re-invoked with a marker flag and the path of a launcher
//! document. A profile may override both the executable and the leading
//! arguments, for setups where a dedicated host binary serves the workers.

use std::path::PathBuf;

use crate::error::{Result, WorkerError};

/// Marker flag that switches an embedding binary into worker mode.
pub const WORKER_FLAG: &str = "--ganger-worker";

/// The default runner executable: the current binary.
pub fn find_runner() -> Result<PathBuf> {
    std::env::current_exe().map_err(|err| {
        WorkerError::Runtime(format!("unable to find the runner executable: {err}"))
    })
}

/// Arguments placed before the launcher document path.
pub fn default_arguments() -> Vec<String> {
    vec![WORKER_FLAG.to_owned()]
}
