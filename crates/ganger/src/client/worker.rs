//! Dedicated worker client: one child process, one channel.
//!
//! Construction is atomic. If anything fails after the child is spawned but
//! before its pipes are wired into a channel, the child is killed and reaped
//! and a freshly written launcher document is removed, so a failed
//! construction leaks neither a process nor a temp file.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::process::Child;
use tracing::debug;

use ganger_wire::{Encoding, Message, MessageChannel};

use crate::bootstrap::BootstrapProfile;
use crate::error::{Result, WorkerError};

/// A spawned dedicated worker, talking over its stdin/stdout pair.
pub struct Worker {
    child: Child,
    channel: MessageChannel,
}

impl Worker {
    /// Spawns a worker constructed from `type_name` with the profile's
    /// configured arguments.
    pub async fn spawn(profile: &BootstrapProfile, type_name: &str) -> Result<Self> {
        Self::spawn_with_expression(profile, &profile.generate_expression(type_name)).await
    }

    pub async fn spawn_with_expression(
        profile: &BootstrapProfile,
        expression: &str,
    ) -> Result<Self> {
        let compiled = profile.compile_script_with_expression(expression, None)?;
        match Self::spawn_from_script(profile, &compiled.path).await {
            Ok(worker) => Ok(worker),
            Err(err) => {
                if compiled.delete_on_error {
                    remove_script(&compiled.path);
                }
                Err(err)
            }
        }
    }

    async fn spawn_from_script(profile: &BootstrapProfile, script: &Path) -> Result<Self> {
        let mut command = profile.runner_command(script)?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        debug!(script = %script.display(), pid = child.id(), "spawned a dedicated worker");
        match wire_channel(&mut child, profile.encoding()) {
            Ok(channel) => Ok(Self { child, channel }),
            Err(err) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(err)
            }
        }
    }

    /// The OS process id, while the child has not been reaped.
    pub fn process_id(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn send_message(&mut self, message: Message) -> Result<()> {
        Ok(self.channel.send(message).await?)
    }

    pub async fn receive_message(&mut self) -> Result<Message> {
        Ok(self.channel.recv().await?)
    }

    /// Closes the channel and waits for the worker to exit. A dedicated
    /// worker sees the closed stdin as its disconnect and terminates.
    pub async fn join(self) -> Result<ExitStatus> {
        let Self { mut child, channel } = self;
        drop(channel);
        Ok(child.wait().await?)
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

fn wire_channel(child: &mut Child, encoding: Encoding) -> Result<MessageChannel> {
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| WorkerError::Runtime("the worker process has no stdin pipe".to_owned()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| WorkerError::Runtime("the worker process has no stdout pipe".to_owned()))?;
    Ok(MessageChannel::from_pair(stdout, stdin, encoding))
}

pub(crate) fn remove_script(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        debug!(script = %path.display(), %err, "could not remove the launcher document");
    }
}

#[cfg(test)]
mod tests {
    use ganger_wire::WireError;

    use super::*;

    #[tokio::test]
    async fn test_failed_spawn_keeps_precompiled_documents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cached = dir.path().join("invoice.launch");
        let mut profile = BootstrapProfile::new();
        profile
            .set_runner_executable(dir.path().join("missing-runner"))
            .set_runner_arguments(Some(Vec::new()))
            .add_precompiled_script("Invoice", &cached, None);

        let err = Worker::spawn(&profile, "Invoice")
            .await
            .expect_err("runner does not exist");
        assert!(matches!(err, WorkerError::Io(_)));
        assert!(cached.exists());
    }

    #[tokio::test]
    async fn test_worker_exit_reports_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut profile = BootstrapProfile::new();
        profile
            .set_runner_executable("/bin/true")
            .set_runner_arguments(Some(Vec::new()))
            .add_precompiled_script_with_expression(
                "new Nothing()",
                dir.path().join("nothing.launch"),
                None,
            );

        let mut worker = Worker::spawn_with_expression(&profile, "new Nothing()")
            .await
            .expect("spawn");
        let err = worker
            .receive_message()
            .await
            .expect_err("child wrote nothing");
        assert!(matches!(err, WorkerError::Wire(WireError::Closed)));

        let status = worker.join().await.expect("join");
        assert!(status.success());
    }
}
