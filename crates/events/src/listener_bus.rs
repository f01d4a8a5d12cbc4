//! Statically-registered observer bus.
//!
//! Listeners are handed to [`ListenerBusBuilder`] once at process start.
//! Each listener gets a dedicated dispatcher thread fed by a FIFO channel, so
//! a single publisher's events reach every listener in publication order.
//!
//! `publish` is synchronous: it hands the event to every lane and waits for
//! the acknowledgements, but never longer than the configured delivery
//! timeout. A wedged listener therefore delays a publisher by at most that
//! timeout and keeps receiving (late) events afterwards.

use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::bus::{EventBus, Subscription};

pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_millis(1000);

/// A consumer registered on a [`ListenerBus`].
pub trait EventListener<M>: Send + Sync {
    /// Used in log output.
    fn name(&self) -> &str;

    fn on_event(&self, event: &M) -> Result<(), ListenerError>;
}

/// Failure reported by a listener. Logged by the bus, never propagated.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ListenerError(String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,

    #[error("event bus lock poisoned")]
    Poisoned,

    #[error("failed to spawn listener thread: {0}")]
    Spawn(String),
}

struct Delivery<M> {
    event: Arc<M>,
    lane: usize,
    ack: Sender<usize>,
}

struct Lane<M> {
    name: String,
    sender: Sender<Delivery<M>>,
}

pub struct ListenerBusBuilder<M> {
    listeners: Vec<Arc<dyn EventListener<M>>>,
    delivery_timeout: Duration,
}

impl<M> Default for ListenerBusBuilder<M> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

impl<M> ListenerBusBuilder<M>
where
    M: Send + Sync + 'static,
{
    pub fn listener<L>(self, listener: L) -> Self
    where
        L: EventListener<M> + 'static,
    {
        self.shared_listener(Arc::new(listener))
    }

    pub fn shared_listener(mut self, listener: Arc<dyn EventListener<M>>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ListenerBus<M>, BusError> {
        let mut lanes = Vec::with_capacity(self.listeners.len());
        let mut workers = Vec::with_capacity(self.listeners.len());

        for listener in self.listeners {
            let name = listener.name().to_string();
            let (tx, rx) = mpsc::channel::<Delivery<M>>();

            let handle = std::thread::Builder::new()
                .name(format!("listener-{name}"))
                .spawn(move || dispatch(listener, rx))
                .map_err(|e| BusError::Spawn(e.to_string()))?;

            lanes.push(Lane { name, sender: tx });
            workers.push(handle);
        }

        Ok(ListenerBus {
            lanes: Mutex::new(lanes),
            subscribers: Mutex::new(Vec::new()),
            workers: Mutex::new(workers),
            delivery_timeout: self.delivery_timeout,
            closed: AtomicBool::new(false),
        })
    }
}

/// In-process bus over a fixed list of listeners plus ad-hoc subscriptions.
pub struct ListenerBus<M> {
    lanes: Mutex<Vec<Lane<M>>>,
    subscribers: Mutex<Vec<Sender<M>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    delivery_timeout: Duration,
    closed: AtomicBool,
}

impl<M> core::fmt::Debug for ListenerBus<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let listeners: Vec<String> = self
            .lanes
            .lock()
            .map(|lanes| lanes.iter().map(|l| l.name.clone()).collect())
            .unwrap_or_default();
        f.debug_struct("ListenerBus")
            .field("listeners", &listeners)
            .field("delivery_timeout", &self.delivery_timeout)
            .finish()
    }
}

impl<M> ListenerBus<M>
where
    M: Send + Sync + 'static,
{
    pub fn builder() -> ListenerBusBuilder<M> {
        ListenerBusBuilder::default()
    }

    pub fn listener_names(&self) -> Vec<String> {
        match self.lanes.lock() {
            Ok(lanes) => lanes.iter().map(|l| l.name.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Closes every lane and waits for the dispatchers to drain.
    ///
    /// Publishing after shutdown fails with [`BusError::Closed`].
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut lanes) = self.lanes.lock() {
            lanes.clear();
        }
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.clear();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for handle in workers {
            let _ = handle.join();
        }
    }

    fn deliver(&self, event: Arc<M>) -> Result<(), BusError> {
        let lanes: Vec<(String, Sender<Delivery<M>>)> = {
            let lanes = self.lanes.lock().map_err(|_| BusError::Poisoned)?;
            lanes.iter().map(|l| (l.name.clone(), l.sender.clone())).collect()
        };
        if lanes.is_empty() {
            return Ok(());
        }

        let (ack_tx, ack_rx) = mpsc::channel();
        let mut pending = BTreeSet::new();
        for (index, (name, sender)) in lanes.iter().enumerate() {
            let delivery = Delivery {
                event: Arc::clone(&event),
                lane: index,
                ack: ack_tx.clone(),
            };
            if sender.send(delivery).is_ok() {
                pending.insert(index);
            } else {
                warn!(listener = %name, "listener lane closed, event dropped");
            }
        }
        drop(ack_tx);

        let deadline = Instant::now() + self.delivery_timeout;
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match ack_rx.recv_timeout(remaining) {
                Ok(lane) => {
                    pending.remove(&lane);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if !pending.is_empty() {
            let slow: Vec<&str> = pending.iter().map(|i| lanes[*i].0.as_str()).collect();
            warn!(
                listeners = ?slow,
                timeout_ms = self.delivery_timeout.as_millis() as u64,
                "listeners did not finish within the delivery timeout"
            );
        }
        Ok(())
    }
}

impl<M> EventBus<M> for ListenerBus<M>
where
    M: Clone + Send + Sync + 'static,
{
    type Error = BusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        {
            let mut subs = self.subscribers.lock().map_err(|_| BusError::Poisoned)?;
            subs.retain(|tx| tx.send(message.clone()).is_ok());
        }

        self.deliver(Arc::new(message))
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        Subscription::new(rx)
    }
}

impl<M> Drop for ListenerBus<M> {
    fn drop(&mut self) {
        // Closing the senders lets each dispatcher thread run out.
        if let Ok(mut lanes) = self.lanes.lock() {
            lanes.clear();
        }
    }
}

fn dispatch<M>(listener: Arc<dyn EventListener<M>>, deliveries: Receiver<Delivery<M>>) {
    while let Ok(delivery) = deliveries.recv() {
        let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(&delivery.event)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(listener = listener.name(), error = %err, "event listener failed");
            }
            Err(_) => {
                error!(listener = listener.name(), "event listener panicked");
            }
        }
        let _ = delivery.ack.send(delivery.lane);
    }
    debug!(listener = listener.name(), "listener lane closed");
}
