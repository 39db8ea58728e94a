use std::panic::{self, AssertUnwindSafe};

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::panic_message;

/// A unit of work to run on the delivery context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The context all [`Target`](super::Target) callbacks run on.
///
/// Implementations must run jobs one at a time, in the order they were dispatched.
pub trait Dispatcher: Send + Sync + 'static {
    /// Schedules `job` to run after every previously dispatched job.
    fn dispatch(&self, job: Job);
}

/// The default [`Dispatcher`]: a single task draining a queue of jobs.
///
/// A panicking job is logged and does not affect the jobs after it.
#[derive(Debug, Clone)]
pub struct SerialDispatcher {
    sender: mpsc::UnboundedSender<Job>,
}

impl SerialDispatcher {
    /// Spawns the delivery task on `runtime`.
    ///
    /// The task ends once every clone of the dispatcher has been dropped and the queue is empty.
    pub fn spawn(runtime: &Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        runtime.spawn(async move {
            while let Some(job) = receiver.recv().await {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    tracing::error!(
                        panic = %panic_message(panic.as_ref()),
                        "Target callback panicked"
                    );
                }
            }
            tracing::trace!("Delivery context shut down");
        });
        Self { sender }
    }
}

impl Dispatcher for SerialDispatcher {
    fn dispatch(&self, job: Job) {
        if self.sender.send(job).is_err() {
            tracing::debug!("Delivery context is gone, dropping job");
        }
    }
}
