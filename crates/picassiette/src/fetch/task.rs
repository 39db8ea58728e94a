use std::collections::TryReserveError;
use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use super::target::{Target, TaskTicket};
use super::{FetchContext, panic_message};

/// An error a producer can return to signal that the process is running out of memory.
///
/// Returning this error, or any error caused by it or by a [`TryReserveError`], makes the fetch
/// coordinator evict the whole in-memory cache before delivering `None`.
#[derive(Debug, Default, Clone, Copy, Error)]
#[error("resource exhausted")]
pub struct ResourceExhausted;

/// Why a fetch did not produce a value.
#[derive(Debug, Error)]
pub(crate) enum FetchError {
    #[error("producer failed")]
    Producer(#[source] anyhow::Error),
    #[error("producer panicked: {0}")]
    Panicked(String),
    #[error("resource exhausted")]
    ResourceExhausted(#[source] anyhow::Error),
}

impl FetchError {
    fn from_producer(error: anyhow::Error) -> Self {
        let exhausted = error
            .chain()
            .any(|cause| cause.is::<ResourceExhausted>() || cause.is::<TryReserveError>());
        if exhausted {
            Self::ResourceExhausted(error)
        } else {
            Self::Producer(error)
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::Producer(_) => "error",
            Self::Panicked(_) => "panic",
            Self::ResourceExhausted(_) => "resource_exhausted",
        }
    }
}

/// Counts a task in the `fetch.running` gauge for as long as it is alive.
///
/// Dropping the guard also covers tasks whose future is dropped before completion.
struct RunningGuard<'a>(&'a AtomicU64);

impl<'a> RunningGuard<'a> {
    fn enter(running: &'a AtomicU64) -> Self {
        let now = running.fetch_add(1, Ordering::Relaxed) + 1;
        metric!(gauge("fetch.running") = now);
        Self(running)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let now = self.0.fetch_sub(1, Ordering::Relaxed) - 1;
        metric!(gauge("fetch.running") = now);
    }
}

/// The lifecycle of a [`FetchTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One in-flight fetch on behalf of a [`Target`].
pub(crate) struct FetchTask<P, A> {
    ticket: TaskTicket,
    params: Arc<A>,
    target: Weak<dyn Target<P, A>>,
    context: Arc<FetchContext<P, A>>,
    state: TaskState,
}

impl<P, A> FetchTask<P, A>
where
    P: Clone + Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    pub fn new(
        ticket: TaskTicket,
        params: Arc<A>,
        target: Weak<dyn Target<P, A>>,
        context: Arc<FetchContext<P, A>>,
    ) -> Self {
        Self {
            ticket,
            params,
            target,
            context,
            state: TaskState::Created,
        }
    }

    fn transition(&mut self, state: TaskState) {
        tracing::trace!(
            task = self.ticket.id,
            key = &*self.ticket.key,
            from = %self.state,
            to = %state,
            "Fetch task state changed"
        );
        self.state = state;
    }

    /// Runs the task to completion and hands the result to the delivery context.
    ///
    /// Every terminal state ends up in the same guarded delivery.
    pub async fn run(mut self) {
        let context = Arc::clone(&self.context);
        let _running = RunningGuard::enter(&context.running);

        self.transition(TaskState::Running);
        let (state, value) = self.resolve().await;
        self.transition(state);
        self.deliver(value);
    }

    async fn resolve(&self) -> (TaskState, Option<P>) {
        let key = &*self.ticket.key;
        let token = &self.ticket.token;

        let _permit = match &self.context.limiter {
            Some(limiter) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return (TaskState::Cancelled, None),
                    permit = limiter.clone().acquire_owned() => permit.ok(),
                }
            }
            None => None,
        };
        if token.is_cancelled() {
            tracing::debug!(key, "Skipping producer of cancelled fetch");
            return (TaskState::Cancelled, None);
        }

        metric!(counter("fetch.computation") += 1);
        let producer = self.context.producer.clone();
        let params = self.params.clone();
        let owned_key = self.ticket.key.clone();
        let result = self
            .context
            .runtime
            .spawn_blocking(move || producer(&*owned_key, &*params))
            .await;

        let outcome = match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(FetchError::from_producer(error)),
            Err(error) if error.is_panic() => {
                Err(FetchError::Panicked(panic_message(error.into_panic().as_ref())))
            }
            Err(error) => Err(FetchError::Panicked(error.to_string())),
        };

        match outcome {
            Ok(value) => {
                if let (Some(cache), Some(value)) = (&self.context.cache, &value) {
                    cache.store(key.to_owned(), value.clone());
                }
                if token.is_cancelled() {
                    tracing::debug!(key, "Fetch was cancelled while running the producer");
                    return (TaskState::Cancelled, None);
                }
                (TaskState::Completed, value)
            }
            Err(error) => {
                metric!(counter("fetch.failed") += 1, "reason" => error.reason());
                tracing::warn!(error = &error as &dyn std::error::Error, key, "Fetch failed");

                if let FetchError::ResourceExhausted(_) = error {
                    metric!(counter("fetch.resource_exhausted") += 1);
                    if let Some(cache) = &self.context.cache {
                        tracing::warn!("Evicting the in-memory cache to free resources");
                        cache.evict_all();
                        cache.flush().await;
                    }
                }
                (TaskState::Failed, None)
            }
        }
    }

    /// Delivers `value` if the target is still bound to this task and the task was not cancelled.
    fn deliver(self, value: Option<P>) {
        let Self {
            ticket,
            target,
            context,
            state,
            ..
        } = self;

        context.dispatcher.dispatch(Box::new(move || {
            let Some(target) = target.upgrade() else {
                tracing::trace!(key = &*ticket.key, "Target is gone, dropping result");
                return;
            };
            let current = target.handle().finish(ticket.id);
            if !current || ticket.token.is_cancelled() {
                metric!(counter("fetch.superseded") += 1);
                tracing::debug!(
                    key = &*ticket.key,
                    %state,
                    "Discarding result of superseded fetch"
                );
                return;
            }
            metric!(counter("fetch.delivered") += 1);
            target.on_receive(value);
        }));
    }
}
