#![forbid(unsafe_code)]

//! Dynamic field providers.
//!
//! A [`FieldKeySource`] runs on a background thread and delivers batches of
//! keys for a record (the list of skills a user can tick, for example). The
//! engine drains deliveries on [`tick`](crate::FormEngine::tick) and adds one
//! control per unseen key from the record's entry template; existing entries
//! are never touched.
//!
//! # How it works
//!
//! 1. [`FormEngine::connect_field_source`](crate::FormEngine::connect_field_source)
//!    spawns the source with a [`FieldKeySender`] bound to the record path
//! 2. The source sends zero or more batches, then returns or waits for stop
//! 3. Dropping the engine (or disconnecting) raises the [`StopSignal`]

use std::sync::{Arc, Condvar, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use reform_core::path::FormPath;
use tracing::debug;

use crate::events::SubId;

/// A batch of keys for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyDelivery {
    pub(crate) record: FormPath,
    pub(crate) keys: Vec<String>,
}

/// Sending half handed to a running source.
#[derive(Debug, Clone)]
pub struct FieldKeySender {
    record: FormPath,
    tx: mpsc::Sender<KeyDelivery>,
}

impl FieldKeySender {
    /// The record this sender feeds.
    #[must_use]
    pub fn record(&self) -> &FormPath {
        &self.record
    }

    /// Deliver a batch. Returns `false` once the engine is gone.
    pub fn send(&self, keys: Vec<String>) -> bool {
        self.tx
            .send(KeyDelivery {
                record: self.record.clone(),
                keys,
            })
            .is_ok()
    }
}

/// An external source of record keys.
///
/// `run` is called on a background thread. Implementations should return
/// when done, when `send` reports the engine gone, or when `stop` fires.
pub trait FieldKeySource: Send + 'static {
    fn run(&self, sender: FieldKeySender, stop: StopSignal);
}

/// Signal for stopping a source.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub(crate) fn new() -> (Self, StopTrigger) {
        let inner = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Self {
            inner: Arc::clone(&inner),
        };
        (signal, StopTrigger { inner })
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for either the stop signal or a timeout.
    ///
    /// Returns `true` if stopped, `false` if timed out.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = cvar
            .wait_timeout_while(guard, duration, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

pub(crate) struct StopTrigger {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopTrigger {
    pub(crate) fn stop(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }
}

/// A running source thread.
pub(crate) struct RunningSource {
    pub(crate) id: SubId,
    trigger: StopTrigger,
    thread: Option<thread::JoinHandle<()>>,
}

impl RunningSource {
    pub(crate) fn spawn(
        id: SubId,
        source: Box<dyn FieldKeySource>,
        sender: FieldKeySender,
    ) -> Self {
        let (signal, trigger) = StopSignal::new();
        let record = sender.record().clone();
        let thread = thread::spawn(move || {
            source.run(sender, signal);
            debug!(sub_id = id, %record, "field source finished");
        });
        Self {
            id,
            trigger,
            thread: Some(thread),
        }
    }

    /// Stop the source and join its thread.
    pub(crate) fn stop(mut self) {
        self.trigger.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RunningSource {
    fn drop(&mut self) {
        self.trigger.stop();
    }
}

impl std::fmt::Debug for RunningSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningSource")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

pub(crate) fn channel(record: FormPath, tx: &mpsc::Sender<KeyDelivery>) -> FieldKeySender {
    FieldKeySender {
        record,
        tx: tx.clone(),
    }
}

/// Delivers a fixed key list once, after an optional delay.
#[derive(Debug, Clone)]
pub struct StaticFieldKeys {
    keys: Vec<String>,
    delay: Duration,
}

impl StaticFieldKeys {
    #[must_use]
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
        }
    }

    /// Wait this long before delivering (simulated network delay).
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl FieldKeySource for StaticFieldKeys {
    fn run(&self, sender: FieldKeySender, stop: StopSignal) {
        if !self.delay.is_zero() && stop.wait_timeout(self.delay) {
            return;
        }
        sender.send(self.keys.clone());
    }
}
