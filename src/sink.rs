//! Data handlers: where the dispatch worker delivers capture batches.

use crate::audio::{Decimator, SampleBatch};
use crate::server::protocol::format_samples;
use anyhow::Result;
use crossbeam_channel::{Sender, TrySendError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The current sink. Exactly one is attached to the controller at a time.
pub enum DataHandler {
    /// No client attached; batches are dropped.
    Discard,
    Socket(SocketSink),
}

impl DataHandler {
    pub fn is_attached(&self) -> bool {
        matches!(self, DataHandler::Socket(_))
    }

    pub fn handle(&self, batch: &SampleBatch) -> Result<()> {
        match self {
            DataHandler::Discard => Ok(()),
            DataHandler::Socket(sink) => sink.handle(batch),
        }
    }

    /// Called when the capture device could not be opened or started.
    pub fn on_init_fail(&self, message: &str) {
        match self {
            DataHandler::Discard => {
                tracing::warn!("input device failed to initialise with no client attached: {message}")
            }
            DataHandler::Socket(sink) => {
                tracing::warn!("input device failed to initialise for {}: {message}", sink.peer)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            DataHandler::Discard => "discard".to_string(),
            DataHandler::Socket(sink) => sink.peer.to_string(),
        }
    }
}

/// Forwards decimated batches to one connected client.
pub struct SocketSink {
    peer: SocketAddr,
    outbound: Outbound,
    decimator: Arc<Decimator>,
}

impl SocketSink {
    pub fn new(peer: SocketAddr, outbound: Outbound, decimator: Arc<Decimator>) -> Self {
        Self {
            peer,
            outbound,
            decimator,
        }
    }

    /// Decimate the batch and queue one `DAT` line. A batch that fails to
    /// decimate produces no line at all.
    fn handle(&self, batch: &SampleBatch) -> Result<()> {
        if batch.status != 0 {
            tracing::warn!(
                "capture status {:#x} reported for batch sent to {}",
                batch.status,
                self.peer
            );
        }
        let decimated = self.decimator.decimate(batch)?;
        tracing::trace!(
            "decimated {} frames to {} samples for {}",
            batch.frame_count,
            decimated.len(),
            self.peer
        );
        if !self.outbound.offer(format_samples(&decimated)) {
            tracing::debug!("outbound queue for {} is full; dropped a data line", self.peer);
        }
        Ok(())
    }
}

/// Producer side of a session's bounded outgoing line queue.
#[derive(Clone)]
pub struct Outbound {
    tx: Sender<String>,
    dropped: Arc<AtomicU64>,
}

impl Outbound {
    pub fn new(tx: Sender<String>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue a status reply, waiting for room. Returns `false` once the
    /// writer has gone away.
    pub fn reply(&self, line: String) -> bool {
        self.tx.send(line).is_ok()
    }

    /// Queue a data line without waiting; slow clients lose lines.
    pub fn offer(&self, line: String) -> bool {
        match self.tx.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
