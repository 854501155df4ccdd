//! Event delivery: how transport events reach the engine and the callbacks.
//!
//! # Two strategies (for beginners)
//!
//! Transports report events from their own threads.  The session never runs
//! application callbacks on those threads.  Instead every event is queued and
//! later handed to the engine by one of two strategies:
//!
//! - [`PushDelivery`] (asynchronous mode) owns a dedicated `ncl-dispatch`
//!   thread that drains the queue as soon as events arrive.
//! - [`PullDelivery`] (synchronous mode) keeps the queue until the
//!   application calls `update`, then processes the batch on the caller's
//!   thread.
//!
//! Either way, events are processed one at a time, in the order the
//! transport submitted them.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use ncl_core::NclError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::application::lock;
use crate::application::transport::TransportEvent;

/// Which thread runs the callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Callbacks run on the session's dispatch thread.
    #[default]
    Asynchronous,
    /// Callbacks run inside `update`, on the caller's thread.
    Synchronous,
}

/// Result of one synchronous drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing arrived before the timeout.
    Idle,
    /// This many events were processed.
    Dispatched(usize),
}

/// Handler the dispatch thread calls for every event.
pub type EventHandler = Box<dyn Fn(TransportEvent) + Send + 'static>;

/// A strategy for moving transport events to the engine.
pub trait EventDelivery: Send + Sync {
    fn mode(&self) -> DeliveryMode;

    /// Queues one event.  Never blocks; events after shutdown are dropped.
    fn submit(&self, event: TransportEvent);

    /// Processes queued events on the calling thread.
    ///
    /// # Errors
    ///
    /// [`NclError::WrongState`] in asynchronous mode or when called from a
    /// callback; [`NclError::Busy`] if another thread is draining.
    fn drain(&self, timeout: Duration, handler: &mut dyn FnMut(TransportEvent)) -> Result<DrainOutcome, NclError>;

    /// Returns `true` if the current thread is running callbacks.
    fn is_dispatch_thread(&self) -> bool;

    /// Stops delivery.  Returns once no callback can run any more, unless
    /// called from the dispatch thread itself.
    fn shutdown(&self);
}

// ── Asynchronous ──────────────────────────────────────────────────────────────

enum Envelope {
    Event(TransportEvent),
    Stop,
}

/// Delivery through a dedicated dispatch thread.
pub struct PushDelivery {
    tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl PushDelivery {
    /// Spawns the dispatch thread.
    ///
    /// # Errors
    ///
    /// Returns [`NclError::NclFailed`] if the thread cannot be spawned.
    pub fn spawn(handler: EventHandler) -> Result<Self, NclError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = thread::Builder::new()
            .name("ncl-dispatch".to_string())
            .spawn(move || dispatch_loop(rx, handler))
            .map_err(|err| NclError::NclFailed(format!("failed to spawn dispatch thread: {err}")))?;
        let worker_id = worker.thread().id();
        debug!("dispatch thread started");
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }
}

fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Envelope>, handler: EventHandler) {
    while let Some(envelope) = rx.blocking_recv() {
        let event = match envelope {
            Envelope::Event(event) => event,
            Envelope::Stop => break,
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            error!("event handler panicked; continuing with the next event");
        }
    }
    debug!("dispatch thread stopped");
}

impl EventDelivery for PushDelivery {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Asynchronous
    }

    fn submit(&self, event: TransportEvent) {
        if let Some(tx) = lock(&self.tx).as_ref() {
            if tx.send(Envelope::Event(event)).is_err() {
                trace!("dispatch thread gone; event dropped");
            }
        }
    }

    fn drain(&self, _timeout: Duration, _handler: &mut dyn FnMut(TransportEvent)) -> Result<DrainOutcome, NclError> {
        Err(NclError::wrong_state(
            "update",
            "events are delivered by the dispatch thread in asynchronous mode",
        ))
    }

    fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    fn shutdown(&self) {
        if let Some(tx) = lock(&self.tx).take() {
            // The worker may already have exited.
            let _ = tx.send(Envelope::Stop);
        }
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        if self.is_dispatch_thread() {
            debug!("dispatch thread shutting itself down; not joining");
            return;
        }
        if worker.join().is_err() {
            error!("dispatch thread terminated abnormally");
        }
    }
}

// ── Synchronous ───────────────────────────────────────────────────────────────

/// Delivery on the application's thread, inside `update`.
///
/// Events wait in an unbounded channel.  A drain with a non-zero timeout
/// parks on the channel inside a short-lived current-thread runtime, so
/// `update` must not be called from within an async task.
pub struct PullDelivery {
    tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    rx: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    drainer: Mutex<Option<ThreadId>>,
}

impl PullDelivery {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            drainer: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        lock(&self.rx).len()
    }

    /// Waits up to `timeout` for the first event.  `None` on timeout or after
    /// shutdown.
    fn first(
        &self,
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
        timeout: Duration,
    ) -> Result<Option<TransportEvent>, NclError> {
        match rx.try_recv() {
            Ok(event) => return Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Disconnected) => return Ok(None),
            Err(mpsc::error::TryRecvError::Empty) if timeout.is_zero() => return Ok(None),
            Err(mpsc::error::TryRecvError::Empty) => {}
        }
        let clock = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|err| NclError::NclFailed(format!("failed to start the update timer: {err}")))?;
        Ok(clock.block_on(async { tokio::time::timeout(timeout, rx.recv()).await.ok().flatten() }))
    }
}

impl Default for PullDelivery {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the drainer mark even if a handler panics.
struct DrainGuard<'a> {
    drainer: &'a Mutex<Option<ThreadId>>,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        *lock(self.drainer) = None;
    }
}

impl EventDelivery for PullDelivery {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Synchronous
    }

    fn submit(&self, event: TransportEvent) {
        let sent = match lock(&self.tx).as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        };
        if !sent {
            trace!("delivery closed; event dropped");
        }
    }

    fn drain(&self, timeout: Duration, handler: &mut dyn FnMut(TransportEvent)) -> Result<DrainOutcome, NclError> {
        let current = thread::current().id();
        {
            let mut drainer = lock(&self.drainer);
            match *drainer {
                Some(owner) if owner == current => {
                    return Err(NclError::wrong_state("update", "called from inside a callback"));
                }
                Some(_) => return Err(NclError::Busy("another thread is running update".to_string())),
                None => *drainer = Some(current),
            }
        }
        let _guard = DrainGuard { drainer: &self.drainer };

        // Only what is queued now; events raised while handling wait for the next drain.
        let batch = {
            let mut rx = lock(&self.rx);
            let Some(first) = self.first(&mut rx, timeout)? else {
                return Ok(DrainOutcome::Idle);
            };
            let mut batch = vec![first];
            while let Ok(event) = rx.try_recv() {
                batch.push(event);
            }
            batch
        };

        let count = batch.len();
        for event in batch {
            handler(event);
        }
        trace!(count, "drained events");
        Ok(DrainOutcome::Dispatched(count))
    }

    fn is_dispatch_thread(&self) -> bool {
        *lock(&self.drainer) == Some(thread::current().id())
    }

    fn shutdown(&self) {
        // Dropping the sender wakes a drain that is waiting.
        lock(&self.tx).take();
        let mut rx = lock(&self.rx);
        rx.close();
        while rx.try_recv().is_ok() {}
    }
}
