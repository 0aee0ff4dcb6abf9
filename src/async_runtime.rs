//! A thin wrapper around the single IO executor that drives every
//! accept/read/write completion, timer and lifecycle transition in a
//! participant process.

use crate::error::{Error, ErrorKind, Result};

pub type JoinHandle<T> = tokio::task::JoinHandle<T>;
pub type Runtime = tokio::runtime::Runtime;

/// Builds the multi-thread Tokio runtime used as the crate's IO executor.
///
/// `worker_threads` mirrors `InitConfig::async_threads`: the number of OS
/// threads backing the executor. User step handlers, unless registered as
/// async, also run on this executor.
pub fn build(worker_threads: usize) -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads.max(1))
        .thread_name("cosim-io")
        .enable_all()
        .build()
        .map_err(|e| Error::wrapped(ErrorKind::Configuration, e))
}

/// Spawns a future onto the ambient Tokio executor.
///
/// Must be called from within a runtime context (i.e. while a [`Runtime`]
/// built by [`build`] is entered).
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future)
}
