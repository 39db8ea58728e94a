//! Helpers for testing the cache and the fetch coordinator.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. The persistent store creates its directory again lazily after it
//!    has been deleted, which would leak it. To avoid this, assign it to a variable in the test
//!    function (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - Producers run on the blocking pool. A [`Gate`] holds them there until the test releases it,
//!    which is how tests observe a fetch "while it is running". Always use a multi-threaded
//!    runtime for tests that block on a [`Gate`].

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// How long a [`Gate`] blocks at most before giving up, so a broken test fails instead of hanging.
const GATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `picassiette` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("picassiette=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    arrivals: usize,
}

/// A latch that blocks threads until it is opened.
///
/// Threads calling [`pass`](Self::pass) are counted as they arrive, so a test can wait until a
/// certain number of producers is blocked before changing the state under test.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks the current thread until the gate is open.
    ///
    /// # Panics
    ///
    /// Panics if the gate stays closed for too long.
    pub fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        state.arrivals += 1;
        self.changed.notify_all();

        let (state, _) = self
            .changed
            .wait_timeout_while(state, GATE_TIMEOUT, |state| !state.open)
            .unwrap();
        assert!(state.open, "gate was never opened");
    }

    /// Opens the gate, releasing every blocked thread and letting later ones pass immediately.
    pub fn open(&self) {
        self.state.lock().unwrap().open = true;
        self.changed.notify_all();
    }

    /// The number of threads that have arrived at the gate so far.
    pub fn arrivals(&self) -> usize {
        self.state.lock().unwrap().arrivals
    }

    /// Blocks the current thread until at least `count` threads have arrived at the gate.
    ///
    /// # Panics
    ///
    /// Panics if they do not arrive in time.
    pub fn wait_for_arrivals(&self, count: usize) {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, GATE_TIMEOUT, |state| state.arrivals < count)
            .unwrap();
        assert!(
            state.arrivals >= count,
            "expected {count} arrivals, got {}",
            state.arrivals
        );
    }
}

/// Counts invocations per key.
#[derive(Debug, Default)]
pub struct CallCounter {
    calls: Mutex<HashMap<String, usize>>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call for `key` and returns how many calls there were for it, including this one.
    pub fn record(&self, key: &str) -> usize {
        let mut calls = self.calls.lock().unwrap();
        let count = calls.entry(key.to_owned()).or_default();
        *count += 1;
        *count
    }

    pub fn get(&self, key: &str) -> usize {
        self.calls.lock().unwrap().get(key).copied().unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}
