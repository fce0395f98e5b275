use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the number of concurrently running one-shot child commands.
///
/// Everything else the engine does (manifest reads, hashing, cache copies)
/// is limited only by the file-descriptor budget; the pool exists so a wide
/// graph cannot fork-bomb the machine.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    /// `limit` of `None` means effectively unbounded (`WIREIT_PARALLEL=infinity`).
    pub fn new(limit: Option<usize>) -> Self {
        let permits = limit
            .unwrap_or(Semaphore::MAX_PERMITS)
            .min(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// The default limit: four workers per CPU.
    pub fn default_limit() -> usize {
        std::thread::available_parallelism()
            .map(|cores| cores.get() * 4)
            .unwrap_or(4)
    }

    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore is never closed")
    }

    /// Permits currently available; used by tests to observe the bound.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
