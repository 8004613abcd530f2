//! Bootstrap: launcher-document generation and the worker-side entry point.
//!
//! The master side uses a [`BootstrapProfile`] to render and compile
//! launcher documents, then starts the runner executable on them. The
//! worker side calls [`run_worker_from_args`] first thing in `main`: when
//! the process was started with the worker marker flag, it executes the
//! document and never returns to the embedding binary's own logic.

use std::ffi::OsString;
use std::path::PathBuf;

use tracing::debug;

use crate::error::{Result, WorkerError};
use crate::launcher::LauncherScript;
use crate::runtime::WorkerRegistry;

mod locator;
mod profile;

pub use locator::{WORKER_FLAG, default_arguments, find_runner};
pub use profile::{BootstrapProfile, CompiledScript};

/// Runs this process as a worker if its command line says so.
///
/// Returns `Ok(false)` when the process was started normally, `Ok(true)`
/// after a complete worker run. Embedding binaries call this before their
/// own argument handling:
///
/// ```no_run
/// # fn build_registry() -> ganger::WorkerRegistry { ganger::WorkerRegistry::new() }
/// fn main() -> anyhow::Result<()> {
///     let mut registry = build_registry();
///     if ganger::bootstrap::run_worker_from_args(&mut registry)? {
///         return Ok(());
///     }
///     // normal program
///     Ok(())
/// }
/// ```
pub fn run_worker_from_args(registry: &mut WorkerRegistry) -> Result<bool> {
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    run_worker_with_args(registry, &args)
}

/// [`run_worker_from_args`] over an explicit argument list.
pub fn run_worker_with_args(registry: &mut WorkerRegistry, args: &[OsString]) -> Result<bool> {
    let Some(flag) = args.first() else {
        return Ok(false);
    };
    if flag != WORKER_FLAG {
        return Ok(false);
    }
    let Some(script) = args.get(1) else {
        return Err(WorkerError::Config(
            "worker invocation without a launcher document path".to_owned(),
        ));
    };
    let path = PathBuf::from(script);
    debug!(path = %path.display(), "running launcher document");
    let text = std::fs::read_to_string(&path)?;
    LauncherScript::parse(&text)?.execute(registry, Some(&path))?;
    Ok(true)
}
