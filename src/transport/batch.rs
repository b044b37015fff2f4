//! Batching append pipeline
//!
//! Appends accumulate in an actor and go out as one pipelined batch when the
//! window elapses, when the batch is full, or when someone asks for a flush.
//!
//! ```text
//! Writer 1 ──┐
//! Writer 2 ──┤──► BatchActor ──► append_batch ──► resolve acks (in order)
//! Writer 3 ──┘        ▲
//!                     └── window timer / Flush / Cancel
//! ```
//!
//! `Cancel` clears the timer and fails every pending ack with `Cancelled`;
//! it is how a stale flush towards a parent that just went away is dropped.

use super::backend::{AppendRequest, Backend, EntryId};
use crate::error::TransportError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type Ack = oneshot::Sender<Result<EntryId, TransportError>>;

pub enum BatchMessage {
    Append {
        request: AppendRequest,
        ack_tx: Ack,
    },
    Flush {
        response_tx: oneshot::Sender<()>,
    },
    Cancel {
        response_tx: oneshot::Sender<usize>,
    },
    /// Final flush, then stop
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

struct BatchActor {
    backend: Arc<dyn Backend>,
    window: Duration,
    max_entries: usize,
    rx: mpsc::UnboundedReceiver<BatchMessage>,
    pending: Vec<(AppendRequest, Ack)>,
    deadline: Option<Instant>,
}

impl BatchActor {
    async fn run(mut self) {
        loop {
            let msg = tokio::select! {
                msg = self.rx.recv() => msg,
                _ = sleep_until_deadline(self.deadline), if self.deadline.is_some() => {
                    self.flush().await;
                    continue;
                }
            };

            let Some(msg) = msg else {
                // Every handle dropped: nobody can flush anymore
                self.flush().await;
                break;
            };

            match msg {
                BatchMessage::Append { request, ack_tx } => {
                    self.pending.push((request, ack_tx));
                    if self.deadline.is_none() {
                        self.deadline = Some(Instant::now() + self.window);
                    }
                    if self.pending.len() >= self.max_entries {
                        self.flush().await;
                    }
                }
                BatchMessage::Flush { response_tx } => {
                    self.flush().await;
                    let _ = response_tx.send(());
                }
                BatchMessage::Cancel { response_tx } => {
                    let dropped = self.cancel();
                    let _ = response_tx.send(dropped);
                }
                BatchMessage::Shutdown { response_tx } => {
                    self.flush().await;
                    info!(endpoint = %self.backend.endpoint(), "batch pipeline shutting down");
                    let _ = response_tx.send(());
                    break;
                }
            }
        }
    }

    async fn flush(&mut self) {
        self.deadline = None;
        if self.pending.is_empty() {
            return;
        }

        let (requests, acks): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending).into_iter().unzip();
        let count = requests.len();
        let results = self.backend.append_batch(requests).await;
        debug!(endpoint = %self.backend.endpoint(), count, "batch flushed");

        let mut results = results.into_iter();
        for ack in acks {
            let result = results.next().unwrap_or(Err(TransportError::Closed));
            if let Err(e) = &result {
                warn!(endpoint = %self.backend.endpoint(), error = %e, "batched append failed");
            }
            let _ = ack.send(result);
        }
    }

    fn cancel(&mut self) -> usize {
        self.deadline = None;
        let dropped = self.pending.len();
        for (_, ack) in self.pending.drain(..) {
            let _ = ack.send(Err(TransportError::Cancelled));
        }
        if dropped > 0 {
            info!(endpoint = %self.backend.endpoint(), dropped, "pending batch cancelled");
        }
        dropped
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Handle to a batch actor; cheap to clone
#[derive(Clone)]
pub struct BatchHandle {
    tx: mpsc::UnboundedSender<BatchMessage>,
}

impl BatchHandle {
    pub fn spawn(backend: Arc<dyn Backend>, window: Duration, max_entries: usize) -> BatchHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = BatchActor {
            backend,
            window,
            max_entries: max_entries.max(1),
            rx,
            pending: Vec::with_capacity(64),
            deadline: None,
        };
        tokio::spawn(actor.run());
        BatchHandle { tx }
    }

    /// Queue an append without awaiting. Entries queued from one task are
    /// written in the order they were queued.
    pub fn enqueue(&self, request: AppendRequest) -> oneshot::Receiver<Result<EntryId, TransportError>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(BatchMessage::Append { ack_tx, .. })) =
            self.tx.send(BatchMessage::Append { request, ack_tx })
        {
            let _ = ack_tx.send(Err(TransportError::Closed));
        }
        ack_rx
    }

    pub async fn append(&self, request: AppendRequest) -> Result<EntryId, TransportError> {
        self.enqueue(request)
            .await
            .unwrap_or(Err(TransportError::Closed))
    }

    pub async fn flush(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(BatchMessage::Flush { response_tx }).is_ok() {
            let _ = response_rx.await;
        }
    }

    /// Drop everything pending; returns how many entries were dropped
    pub async fn cancel(&self) -> usize {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(BatchMessage::Cancel { response_tx }).is_err() {
            return 0;
        }
        response_rx.await.unwrap_or(0)
    }

    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(BatchMessage::Shutdown { response_tx }).is_ok() {
            let _ = response_rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
