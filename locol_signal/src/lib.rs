//! One-shot phase signalling for locol.
//!
//! The ingestion engine runs several long-lived tasks -- the listener accept
//! loop, each of its connections, scrapers, the ingestion router -- and all of
//! them must stop when asked. This crate provides the mechanism: a single
//! `Broadcaster` and any number of `Watcher` instances. Signalling is a
//! one-time event.
//!
//! Watchers come in two flavours. A watcher obtained from [`signal`] or
//! [`Watcher::register`] is *registered*: the `Broadcaster` counts it as a peer
//! and [`Broadcaster::signal_and_wait`] blocks until it has received the
//! signal or been dropped. A watcher obtained by `clone` is unregistered and is
//! never waited on.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Notify, watch};
use tracing::{debug, info};

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    let peers = Arc::new(AtomicU32::new(1));
    let notify = Arc::new(Notify::new());

    let w = Watcher {
        receiver,
        peers: Arc::clone(&peers),
        notify: Arc::clone(&notify),
        signal_received: false,
        peer_count_decreased: false,
        registered: true,
    };

    let b = Broadcaster {
        sender,
        peers,
        notify,
    };

    (w, b)
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that a phase has been
/// achieved.
pub struct Broadcaster {
    /// Flipped to `true` exactly once. Dropping the sender is also observed as
    /// the signal by every `Watcher`.
    sender: watch::Sender<bool>,
    /// Count of registered `Watcher` instances that have not yet observed the
    /// signal.
    peers: Arc<AtomicU32>,
    /// Woken whenever a registered peer drops off.
    notify: Arc<Notify>,
}

impl Broadcaster {
    /// Send the signal through any `Watcher` instances.
    ///
    /// Function will NOT block until all peers have ack'ed the signal.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Send the signal through to any `Watcher` instances.
    ///
    /// Function WILL block until all registered peers have ack'ed the signal.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);

        // Register for notification before checking the peer count, otherwise
        // a peer dropping off between the check and the await is a lost wakeup.
        loop {
            let notified = self.notify.notified();
            let peers = self.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            debug!("Waiting for {peers} peers");
            notified.await;
        }
    }

    /// Send the signal and wait at most `grace` for peers to ack it.
    ///
    /// Returns `true` if every registered peer acknowledged in time, `false`
    /// if the grace period elapsed first.
    pub async fn signal_and_wait_timeout(self, grace: Duration) -> bool {
        let peers = Arc::clone(&self.peers);
        if tokio::time::timeout(grace, self.signal_and_wait())
            .await
            .is_ok()
        {
            true
        } else {
            let remaining = peers.load(Ordering::SeqCst);
            info!("{remaining} peers did not acknowledge shutdown within {grace:?}");
            false
        }
    }

    /// Number of registered peers still outstanding.
    #[must_use]
    pub fn peers(&self) -> u32 {
        self.peers.load(Ordering::SeqCst)
    }
}

/// Errors for `Watcher::try_recv`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum TryRecvError {
    /// The signal has been received and yet `try_recv` was called.
    #[error("signal has been received")]
    SignalReceived,
}

/// Errors for `Watcher::register`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum RegisterError {
    /// The signal has been received and yet `register` was called.
    #[error("signal has been received")]
    SignalReceived,
}

#[derive(Debug)]
/// Mechanism to watch for phase changes, typically used to control shutdown.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
    peers: Arc<AtomicU32>,
    notify: Arc<Notify>,
    /// Set once this instance has observed the signal.
    signal_received: bool,
    /// Set once this instance has removed itself from the peer count.
    peer_count_decreased: bool,
    /// Whether the `Broadcaster` waits on this instance.
    registered: bool,
}

impl Watcher {
    fn decrease_peer_count(&mut self) {
        if !self.registered || self.peer_count_decreased {
            return;
        }

        // fetch_sub wraps at zero, we'd rather saturate.
        let mut old = self.peers.load(Ordering::Relaxed);
        while old > 0 {
            match self.peers.compare_exchange_weak(
                old,
                old - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.notify.notify_waiters();
                    break;
                }
                Err(x) => old = x,
            }
        }
        self.peer_count_decreased = true;
    }

    fn observed(&self) -> bool {
        // A closed channel means the `Broadcaster` was dropped, which we
        // treat the same as an explicit signal.
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Receive the signal. This function will block if the signal has not
    /// already been sent.
    pub async fn recv(mut self) {
        if self.signal_received {
            tokio::task::yield_now().await;
            return;
        }

        // Err here means the sender is gone, also a signal.
        let _ = self.receiver.wait_for(|signalled| *signalled).await;
        self.decrease_peer_count();
        self.signal_received = true;
    }

    /// Check if the signal has been sent without blocking.
    ///
    /// Returns `Ok(false)` while the signal is pending and `Ok(true)` the first
    /// time it is observed.
    ///
    /// # Errors
    ///
    /// Returns `TryRecvError::SignalReceived` on every call after the signal
    /// has been observed.
    pub fn try_recv(&mut self) -> Result<bool, TryRecvError> {
        if self.signal_received {
            return Err(TryRecvError::SignalReceived);
        }
        if self.observed() {
            self.decrease_peer_count();
            self.signal_received = true;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Register with the `Broadcaster`, returning a new registered `Watcher`.
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::SignalReceived` if this watcher has already
    /// observed the signal.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.signal_received {
            return Err(RegisterError::SignalReceived);
        }

        self.peers.fetch_add(1, Ordering::SeqCst);

        Ok(Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            notify: Arc::clone(&self.notify),
            signal_received: false,
            peer_count_decreased: false,
            registered: true,
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.decrease_peer_count();
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            notify: Arc::clone(&self.notify),
            signal_received: self.signal_received,
            peer_count_decreased: false,
            registered: false,
        }
    }
}
