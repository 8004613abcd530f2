//! A fixed-size fan of dedicated workers with a unioned receive.

use std::ops::Index;

use futures::future::select_all;

use ganger_wire::Message;

use crate::bootstrap::BootstrapProfile;
use crate::client::Worker;
use crate::error::{Result, WorkerError};

/// A read-only collection of dedicated workers sharing one implementation.
///
/// Workers are addressed by index for sending; [`WorkerPool::receive_message`]
/// races all members and yields whichever message arrives first.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawns `count` workers of `type_name`, defaulting to one per
    /// available processor.
    pub async fn spawn(
        profile: &BootstrapProfile,
        type_name: &str,
        count: Option<usize>,
    ) -> Result<Self> {
        Self::spawn_with_expression(profile, &profile.generate_expression(type_name), count).await
    }

    pub async fn spawn_with_expression(
        profile: &BootstrapProfile,
        expression: &str,
        count: Option<usize>,
    ) -> Result<Self> {
        let count = match count {
            Some(count) => count,
            None => processor_count()?,
        };
        if count == 0 {
            return Err(WorkerError::Config(
                "the worker count must be strictly positive".to_owned(),
            ));
        }
        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            workers.push(Worker::spawn_with_expression(profile, expression).await?);
        }
        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Worker> {
        self.workers.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Worker> {
        self.workers.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Worker> {
        self.workers.iter_mut()
    }

    /// Receives one message from whichever worker delivers first, returning
    /// its index alongside the message. The tie-break among simultaneously
    /// ready workers is arbitrary.
    pub async fn receive_message(&mut self) -> Result<(usize, Message)> {
        let receives = self
            .workers
            .iter_mut()
            .map(|worker| Box::pin(worker.receive_message()));
        let (result, index, _) = select_all(receives).await;
        Ok((index, result?))
    }

    /// Closes every channel and waits for all workers to exit.
    pub async fn join(self) -> Result<()> {
        for worker in self.workers {
            worker.join().await?;
        }
        Ok(())
    }
}

impl Index<usize> for WorkerPool {
    type Output = Worker;

    fn index(&self, index: usize) -> &Worker {
        &self.workers[index]
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

fn processor_count() -> Result<usize> {
    let count = std::thread::available_parallelism().map_err(|err| {
        WorkerError::Runtime(format!("unable to determine the processor count: {err}"))
    })?;
    Ok(count.get())
}
