//! Filesystem plumbing shared by the fingerprint and executor crates.
//!
//! Three concerns live here: ordered glob matching over a package directory
//! (`!pattern` excludes, later patterns win), streamed sha256 hashing of file
//! contents, and a process-wide file-descriptor budget so that hashing many
//! inputs concurrently cannot exhaust the fd table.

mod glob;
mod hashing;

use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::{Semaphore, SemaphorePermit};

pub use glob::{expand_globs, GlobError, MatchedFile, PatternMatcher};
pub use hashing::{hash_file, hash_file_blocking, ContentHash};

const FD_BUDGET: usize = 128;

static FD_SEMAPHORE: Lazy<Arc<Semaphore>> = Lazy::new(|| Arc::new(Semaphore::new(FD_BUDGET)));

/// Acquire a slot from the process-wide file-descriptor budget.
///
/// Every open-file operation that can fan out per input file (hashing,
/// cache copies) holds one of these for the duration of the open handle.
pub async fn fd_permit() -> SemaphorePermit<'static> {
    FD_SEMAPHORE
        .acquire()
        .await
        .expect("fd semaphore is never closed")
}
