//! Helpers for testing the cache and the tools built on it.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Tests exercising blocking behavior should run their body through [`run_with_timeout`], so
//!    that a deadlock shows up as a failing test instead of a hanging test run.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `infocache` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("infocache=trace,infocache_stress=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Runs `f` on a separate thread and returns its result.
///
/// # Panics
///
/// Panics if `f` does not finish within `timeout`, or if `f` itself panics. The thread running
/// `f` is leaked in the first case.
pub fn run_with_timeout<F, R>(timeout: Duration, f: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    let handle = thread::spawn(move || {
        sender.send(f()).ok();
    });

    match receiver.recv_timeout(timeout) {
        Ok(result) => {
            handle.join().ok();
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => panic!("did not finish within {timeout:?}"),
        Err(mpsc::RecvTimeoutError::Disconnected) => match handle.join() {
            Err(panic) => std::panic::resume_unwind(panic),
            Ok(()) => unreachable!("the result was sent before the thread finished"),
        },
    }
}
