// src/db/monitor.rs
//
// Background maintenance thread with cooperative shutdown.
//
// The thread sleeps on a stop signal instead of `thread::sleep`, so a stop
// request interrupts the wait and `stop()` returns within one work cycle.

use log::{debug, warn};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One-shot stop flag that sleepers can wait on.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.wake.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`. Returns true if the signal was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = self
            .wake
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }
}

/// Handle to a running monitor thread. Dropping it stops and joins the thread.
#[derive(Debug)]
pub struct MonitorHandle {
    signal: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Spawn `task` every `interval` until stopped or until `task` returns false.
    pub fn spawn<F>(name: &str, interval: Duration, mut task: F) -> std::io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let signal = Arc::new(StopSignal::new());
        let thread_signal = Arc::clone(&signal);
        let thread_name = name.to_string();

        let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!("{} started (interval {:?})", thread_name, interval);
            loop {
                if thread_signal.wait_timeout(interval) {
                    break;
                }
                if !task() {
                    break;
                }
            }
            debug!("{} stopped", thread_name);
        })?;

        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Raise the stop signal and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.signal.stop();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                // Stopping from inside the task: the loop exits on its own.
                return;
            }
            if thread.join().is_err() {
                warn!("monitor thread panicked before shutdown");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
