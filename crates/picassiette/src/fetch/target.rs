use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// An observer of [`Picassiette::fetch`](crate::Picassiette::fetch).
///
/// All callbacks are invoked on the delivery context, one at a time and in the order they were
/// scheduled. Targets are held weakly while a fetch is running, so a dropped target silently drops
/// its deliveries. Keep it alive in whatever owns it, like a view holder, for as long as it should
/// receive results.
pub trait Target<P, A = ()>: Send + Sync + 'static {
    /// The handle that tracks the fetch this target is currently bound to.
    fn handle(&self) -> &TargetHandle;

    /// Called before a new fetch begins, and before its result is delivered.
    ///
    /// This is the place to reset whatever the result will be bound to. `params` are the same
    /// params that were passed to `fetch`.
    fn on_pre_receive(&self, key: &str, params: &A) {
        let _ = (key, params);
    }

    /// Called with the result of the fetch this target is currently bound to.
    ///
    /// `None` means the producer had no value, or failed. Results of fetches this target was
    /// rebound away from are never delivered.
    fn on_receive(&self, value: Option<P>);
}

/// Identifies the fetch task a [`Target`] is bound to.
#[derive(Debug, Clone)]
pub(crate) struct TaskTicket {
    pub id: u64,
    pub key: Arc<str>,
    pub token: CancellationToken,
}

/// What [`TargetHandle::begin`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    /// A fetch for the same key is already running, and will deliver to this target.
    AlreadyFetching,
    /// A new request was registered. It has to be resolved from the persistent store or bound to
    /// a new task with [`TargetHandle::bind`].
    Pending(u64),
}

#[derive(Debug, Default)]
struct HandleState {
    ticket: Option<TaskTicket>,
    /// Bumped on every request, so that results of older requests can be recognized.
    request: u64,
}

/// The per-target state of the fetch coordinator.
///
/// Every [`Target`] embeds one of these and returns it from [`Target::handle`]. It holds at most
/// one ticket, naming the task whose result the target is waiting for, and the number of the
/// latest request made on behalf of the target.
#[derive(Debug, Default)]
pub struct TargetHandle {
    state: Mutex<HandleState>,
}

impl TargetHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The key of the fetch this target is currently waiting for.
    pub fn current_key(&self) -> Option<Arc<str>> {
        let state = self.state.lock().unwrap();
        state
            .ticket
            .as_ref()
            .filter(|ticket| !ticket.token.is_cancelled())
            .map(|ticket| Arc::clone(&ticket.key))
    }

    /// Cancels the current task, if any, and supersedes every pending request.
    pub(crate) fn cancel_current(&self) {
        let mut state = self.state.lock().unwrap();
        state.request += 1;
        if let Some(ticket) = state.ticket.take() {
            tracing::debug!(key = &*ticket.key, "Cancelling fetch of rebound target");
            ticket.token.cancel();
        }
    }

    /// Registers a request for `key`.
    ///
    /// If the target is already waiting for a task fetching `key`, nothing changes. Otherwise the
    /// current task is cancelled (without waiting for it) and a new request number is handed out.
    /// A cancelled task counts as no task at all.
    pub(crate) fn begin(&self, key: &str) -> Request {
        let mut state = self.state.lock().unwrap();
        if let Some(ticket) = state.ticket.take() {
            if !ticket.token.is_cancelled() {
                if &*ticket.key == key {
                    state.ticket = Some(ticket);
                    return Request::AlreadyFetching;
                }
                tracing::debug!(
                    previous = &*ticket.key,
                    key,
                    "Cancelling fetch of rebound target"
                );
                ticket.token.cancel();
            }
        }
        state.request += 1;
        Request::Pending(state.request)
    }

    /// Whether `request` is the latest request, and no task was bound for it yet.
    pub(crate) fn is_current(&self, request: u64) -> bool {
        let state = self.state.lock().unwrap();
        state.request == request && state.ticket.is_none()
    }

    /// Binds the task created by `start` to `request`.
    ///
    /// Returns `None` without calling `start` if a newer request was made in the meantime.
    pub(crate) fn bind(
        &self,
        request: u64,
        start: impl FnOnce() -> TaskTicket,
    ) -> Option<TaskTicket> {
        let mut state = self.state.lock().unwrap();
        if state.request != request || state.ticket.is_some() {
            return None;
        }
        let ticket = start();
        state.ticket = Some(ticket.clone());
        Some(ticket)
    }

    /// Releases the ticket of task `id`.
    ///
    /// Returns `false` if the target has been rebound to another task in the meantime, in which
    /// case the ticket is left alone.
    pub(crate) fn finish(&self, id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.ticket.as_ref() {
            Some(ticket) if ticket.id == id => {
                state.ticket = None;
                true
            }
            _ => false,
        }
    }
}
