//! Outbound write queue
//!
//! Every packet bound for the device goes through one FIFO. A single drain
//! task performs the writes one at a time, so packets from the tick driver
//! and from mode commands never interleave on the air.

use crate::infrastructure::bluetooth::transport::{BleTransport, Endpoint, TransportError};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error(transparent)]
    Write(#[from] TransportError),

    /// Dropped from the queue by a link teardown before it was written
    #[error("Write abandoned after link teardown")]
    Abandoned,
}

struct QueueEntry {
    endpoint: Endpoint,
    payload: Vec<u8>,
    done: oneshot::Sender<Result<(), SendError>>,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    draining: bool,
}

/// Resolves once the queued write has been attempted
pub struct Completion {
    rx: oneshot::Receiver<Result<(), SendError>>,
}

impl Future for Completion {
    type Output = Result<(), SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SendError::Abandoned)))
    }
}

/// Single-flight FIFO in front of the transport
#[derive(Clone)]
pub struct SendScheduler {
    transport: Arc<dyn BleTransport>,
    state: Arc<Mutex<QueueState>>,
}

impl SendScheduler {
    pub fn new(transport: Arc<dyn BleTransport>) -> Self {
        Self {
            transport,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Queue a write and start draining if idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, endpoint: Endpoint, payload: Vec<u8>) -> Completion {
        let (done, rx) = oneshot::channel();
        let start_drain = {
            let mut state = self.lock();
            state.entries.push_back(QueueEntry {
                endpoint,
                payload,
                done,
            });
            trace!("Queued write, {} pending", state.entries.len());
            !std::mem::replace(&mut state.draining, true)
        };

        if start_drain {
            tokio::spawn(drain(self.transport.clone(), self.state.clone()));
        }

        Completion { rx }
    }

    /// Drop every pending entry. An in-flight write still runs to completion.
    pub fn clear(&self) {
        let mut state = self.lock();
        if !state.entries.is_empty() {
            debug!("Abandoning {} queued writes", state.entries.len());
        }
        state.entries.clear();
    }

    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn drain(transport: Arc<dyn BleTransport>, state: Arc<Mutex<QueueState>>) {
    loop {
        let entry = {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.entries.pop_front() {
                Some(entry) => entry,
                None => {
                    state.draining = false;
                    return;
                }
            }
        };

        let result = transport
            .write(&entry.endpoint, &entry.payload)
            .await
            .map_err(SendError::from);
        if let Err(e) = &result {
            warn!("Write to {:?} failed: {}", entry.endpoint.kind, e);
        }
        // Caller may have stopped waiting
        let _ = entry.done.send(result);
    }
}
