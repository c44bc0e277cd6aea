//! Processing stages: dedicated threads connected by bounded queues.
//!
//! A [`Stage`] is a unit of work that runs on its own OS thread. The thread
//! is owned by a [`StageHandle`]: starting the handle runs [`Stage::init`] on
//! the caller's thread, then spawns a named thread that calls
//! [`Stage::execute`] until the handle is stopped, and [`Stage::finalize`]
//! once the loop exits. Stopping is cooperative: `execute` is expected to
//! return within roughly one poll timeout, typically by blocking on a
//! channel with [`Receiver::recv_timeout`].
//!
//! Stages are connected by [`pipe`]s, bounded crossbeam channels. Producers
//! enqueue with [`offer`], which applies a [`Backpressure`] policy when the
//! queue is full.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TrySendError};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error};

/// How long a stage blocks on its input before re-checking the active flag.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// A unit of work run by a dedicated thread.
pub trait Stage: Send + 'static {
    /// Runs once on the starting thread, before the worker thread exists.
    fn init(&mut self) {}

    /// One iteration of the loop. Should block at most about `poll` so a stop
    /// request is noticed promptly.
    fn execute(&mut self, poll: Duration);

    /// Runs once on the worker thread after the loop exits.
    fn finalize(&mut self) {}
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to spawn stage thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Owner of a running stage thread.
///
/// Dropping the handle stops the stage and joins its thread.
pub struct StageHandle {
    name: String,
    active: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StageHandle {
    /// Initializes `stage` and spawns its worker thread.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Spawn`] when the OS refuses to create the thread.
    pub fn start<S>(name: impl Into<String>, mut stage: S, poll: Duration) -> Result<Self, PipelineError>
    where
        S: Stage,
    {
        let name = name.into();
        stage.init();

        let active = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&active);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    stage.execute(poll);
                }
                stage.finalize();
            })
            .map_err(|source| PipelineError::Spawn {
                name: name.clone(),
                source,
            })?;

        debug!(stage = %name, "stage started");
        Ok(Self {
            name,
            active,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True until a stop has been requested.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Asks the loop to exit after the current iteration. Does not wait.
    pub fn signal_stop(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Signals the stage and waits for its thread to finish `finalize`.
    pub fn stop(&mut self) {
        self.signal_stop();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.join().is_err() {
            error!(stage = %self.name, "stage thread panicked");
        } else {
            debug!(stage = %self.name, "stage stopped");
        }
    }
}

impl Drop for StageHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for StageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageHandle")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Creates a bounded queue between two stages.
pub fn pipe<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    channel::bounded(capacity)
}

/// What a producer does when the downstream queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Backpressure {
    /// Fail immediately.
    Reject,
    /// Wait up to `timeout_ms` for room, then fail.
    Block { timeout_ms: u64 },
}

impl Default for Backpressure {
    fn default() -> Self {
        Self::Block { timeout_ms: 50 }
    }
}

/// A rejected enqueue. Carries the item back to the caller.
pub enum OfferError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> OfferError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Disconnected(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl<T> fmt::Debug for OfferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Disconnected(_) => f.write_str("Disconnected(..)"),
        }
    }
}

impl<T> fmt::Display for OfferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("queue is full"),
            Self::Disconnected(_) => f.write_str("queue is closed"),
        }
    }
}

impl<T> std::error::Error for OfferError<T> {}

/// Enqueues `item` according to `policy`.
pub fn offer<T>(tx: &Sender<T>, item: T, policy: Backpressure) -> Result<(), OfferError<T>> {
    match policy {
        Backpressure::Reject => tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(item) => OfferError::Full(item),
            TrySendError::Disconnected(item) => OfferError::Disconnected(item),
        }),
        Backpressure::Block { timeout_ms } => tx
            .send_timeout(item, Duration::from_millis(timeout_ms))
            .map_err(|e| match e {
                SendTimeoutError::Timeout(item) => OfferError::Full(item),
                SendTimeoutError::Disconnected(item) => OfferError::Disconnected(item),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct Counter {
        events: Arc<Mutex<Vec<&'static str>>>,
        ticks: Arc<AtomicUsize>,
    }

    impl Stage for Counter {
        fn init(&mut self) {
            self.events.lock().unwrap().push("init");
        }

        fn execute(&mut self, poll: Duration) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            thread::sleep(poll);
        }

        fn finalize(&mut self) {
            self.events.lock().unwrap().push("finalize");
        }
    }

    #[test]
    fn lifecycle_runs_init_loop_finalize() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let ticks = Arc::new(AtomicUsize::new(0));
        let stage = Counter {
            events: Arc::clone(&events),
            ticks: Arc::clone(&ticks),
        };

        let mut handle = StageHandle::start("counter", stage, Duration::from_millis(5)).unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["init"]);
        assert!(handle.is_active());

        while ticks.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
        assert!(!handle.is_active());
        assert_eq!(*events.lock().unwrap(), vec!["init", "finalize"]);

        // second stop is a no-op
        handle.stop();
    }

    #[test]
    fn drop_joins_the_thread() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let stage = Counter {
            events: Arc::clone(&events),
            ticks: Arc::new(AtomicUsize::new(0)),
        };
        drop(StageHandle::start("dropped", stage, Duration::from_millis(5)).unwrap());
        assert_eq!(*events.lock().unwrap(), vec!["init", "finalize"]);
    }

    #[test]
    fn reject_fails_fast_on_full_queue() {
        let (tx, rx) = pipe(1);
        offer(&tx, 1, Backpressure::Reject).unwrap();
        let err = offer(&tx, 2, Backpressure::Reject).unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 2);
        assert_eq!(rx.recv().unwrap(), 1);
    }

    #[test]
    fn block_waits_for_room() {
        let (tx, rx) = pipe(1);
        offer(&tx, 1, Backpressure::Reject).unwrap();

        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            (rx.recv().unwrap(), rx.recv().unwrap())
        });
        offer(&tx, 2, Backpressure::Block { timeout_ms: 2_000 }).unwrap();
        assert_eq!(consumer.join().unwrap(), (1, 2));
    }

    #[test]
    fn block_times_out() {
        let (tx, _rx) = pipe(1);
        offer(&tx, 1, Backpressure::Reject).unwrap();
        let err = offer(&tx, 2, Backpressure::Block { timeout_ms: 10 }).unwrap_err();
        assert!(err.is_full());
    }

    #[test]
    fn closed_queue_reports_disconnected() {
        let (tx, rx) = pipe::<u8>(1);
        drop(rx);
        let err = offer(&tx, 7, Backpressure::Reject).unwrap_err();
        assert!(!err.is_full());
        assert_eq!(err.to_string(), "queue is closed");
    }

    #[test]
    fn backpressure_deserializes() {
        let p: Backpressure = serde_json::from_str(r#"{"mode":"reject"}"#).unwrap();
        assert_eq!(p, Backpressure::Reject);
        let p: Backpressure = serde_json::from_str(r#"{"mode":"block","timeout_ms":5}"#).unwrap();
        assert_eq!(p, Backpressure::Block { timeout_ms: 5 });
    }
}
