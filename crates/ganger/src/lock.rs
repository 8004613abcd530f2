//! Cross-process mutual exclusion around listen-or-recover sequences.
//!
//! One exclusive advisory file lock per machine, wrapped in a process-wide
//! counter: the first acquisition in this process takes the OS lock
//! (blocking until obtained), nested acquisitions only bump the counter,
//! and the OS lock is dropped when the counter returns to zero. Release is
//! tied to guard drop, so every exit path unlocks.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;

use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;

const LOCK_FILE_NAME: &str = "ganger-workers.lock";

struct LockState {
    flock: Option<Flock<File>>,
    count: usize,
}

static STATE: Mutex<LockState> = Mutex::new(LockState {
    flock: None,
    count: 0,
});

fn lock_file_path() -> PathBuf {
    std::env::temp_dir().join(LOCK_FILE_NAME)
}

/// Scoped handle on the machine-wide worker lock.
#[derive(Debug)]
pub struct Lock {
    held: bool,
}

impl Lock {
    /// Acquires the lock, blocking the calling thread until the OS-level
    /// lock is obtained when this process does not already hold it.
    pub fn acquire() -> Result<Self> {
        let mut state = STATE.lock();
        if state.count == 0 {
            let path = lock_file_path();
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            let flock = Flock::lock(file, FlockArg::LockExclusive)
                .map_err(|(_, errno)| io::Error::from(errno))?;
            state.flock = Some(flock);
        }
        state.count += 1;
        Ok(Self { held: true })
    }

    /// Explicit early release; dropping the guard does the same.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        let mut state = STATE.lock();
        state.count -= 1;
        if state.count == 0 {
            if let Some(flock) = state.flock.take() {
                if let Err((_, errno)) = flock.unlock() {
                    debug!(%errno, "could not release the worker lock file");
                }
            }
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.release();
    }
}
