//! Resource management

use std::sync::Arc;

use crate::error::ReductionError;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// [crate::resource_manager::ResourceManager] provides a simple way to allocate various resources
/// to tasks. Resource management is performed using a Tokio Semaphore for each type of resource.
///
/// Permits are owned so that they can travel with a spawned task and are released when the task
/// finishes or is aborted.
#[derive(Debug)]
pub struct ResourceManager {
    /// Optional semaphore for memory (bytes).
    memory: Option<Arc<Semaphore>>,

    /// Optional total memory pool in bytes.
    total_memory: Option<usize>,

    /// Optional semaphore for in-flight tasks.
    tasks: Option<Arc<Semaphore>>,
}

/// Resources held by one in-flight task.
#[derive(Debug)]
pub struct Permits {
    _task: Option<OwnedSemaphorePermit>,
    _memory: Option<OwnedSemaphorePermit>,
}

impl ResourceManager {
    /// Returns a new ResourceManager object.
    pub fn new(memory_limit: Option<usize>, task_limit: Option<usize>) -> Self {
        Self {
            memory: memory_limit.map(|n| Arc::new(Semaphore::new(n))),
            total_memory: memory_limit,
            tasks: task_limit.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// Acquire memory resource.
    pub async fn memory(
        &self,
        bytes: usize,
    ) -> Result<Option<OwnedSemaphorePermit>, ReductionError> {
        if let Some(total_memory) = self.total_memory {
            if bytes > total_memory {
                return Err(ReductionError::InsufficientMemory {
                    requested: bytes,
                    total: total_memory,
                });
            };
        };
        optional_acquire(&self.memory, bytes).await
    }

    /// Acquire a task resource.
    pub async fn task(&self) -> Result<Option<OwnedSemaphorePermit>, ReductionError> {
        optional_acquire(&self.tasks, 1).await
    }

    /// Acquire a task slot, then the memory for a block of `bytes`.
    pub async fn permits(&self, bytes: usize) -> Result<Permits, ReductionError> {
        let task = self.task().await?;
        let memory = self.memory(bytes).await?;
        Ok(Permits {
            _task: task,
            _memory: memory,
        })
    }
}

/// Acquire permits on an optional Semaphore, if present.
async fn optional_acquire(
    sem: &Option<Arc<Semaphore>>,
    n: usize,
) -> Result<Option<OwnedSemaphorePermit>, ReductionError> {
    let n = n.try_into()?;
    if let Some(sem) = sem {
        sem.clone()
            .acquire_many_owned(n)
            .await
            .map(Some)
            .map_err(|err| err.into())
    } else {
        Ok(None)
    }
}
