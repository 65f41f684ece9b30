use std::future::Future;
use std::pin::Pin;

use crate::error::UnsError;

/// A named unit of work started by the orchestrator.
///
/// Variants: heartbeat, cache, history, acquisition. The orchestrator spawns
/// `run()` as a dedicated task and treats its return (Ok or Err) as the end
/// of that run.
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// Run until cancelled. Returning means the worker stopped on its own.
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>>;

    /// Release resources after the run future has been dropped on shutdown.
    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}
