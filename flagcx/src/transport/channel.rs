//! Directed channels between two ranks of one group.
//!
//! A [`SendChannel`] owns an outbox drained by a writer task; the first frame
//! triggers the dial, later frames reuse the same ordered QUIC stream. A
//! [`RecvChannel`] matches incoming frames against posted receives per
//! [`FrameKey`], first in first out, and buffers frames nobody has asked for
//! yet. Posting and enqueueing are synchronous, so the order in which an
//! operation is issued is the order in which it matches on the wire.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{FlagcxError, Result};
use crate::protocol::FrameKey;
use crate::protocol::codec::{read_frame, write_frame};
use crate::types::Rank;

/// A dialed channel: the connection must outlive the stream.
pub struct DialedStream {
    pub conn: quinn::Connection,
    pub stream: quinn::SendStream,
}

enum Outgoing {
    Frame {
        key: FrameKey,
        payload: Vec<u8>,
        done: oneshot::Sender<Result<()>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

enum SendInner {
    Remote {
        tx: mpsc::UnboundedSender<Outgoing>,
        writer: JoinHandle<()>,
    },
    Loopback(Arc<RecvChannel>),
}

pub struct SendChannel {
    peer: Rank,
    inner: SendInner,
}

/// Completion of one enqueued frame.
pub struct PendingSend {
    peer: Rank,
    rx: Option<oneshot::Receiver<Result<()>>>,
}

impl PendingSend {
    /// Wait until the frame has been handed to the transport.
    pub async fn wait(self, operation: &'static str, timeout: Duration) -> Result<()> {
        let Some(rx) = self.rx else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FlagcxError::transfer(
                operation,
                self.peer,
                "channel closed before the frame was written",
            )),
            Err(_) => Err(FlagcxError::transfer(
                operation,
                self.peer,
                format!("send timed out after {}s", timeout.as_secs()),
            )),
        }
    }
}

impl SendChannel {
    /// Channel to a remote peer. `dial` runs on the first enqueued frame.
    pub(crate) fn remote(
        peer: Rank,
        dial: BoxFuture<'static, Result<DialedStream>>,
        on_failure: Arc<dyn Fn(&FlagcxError) + Send + Sync>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(peer, dial, rx, on_failure));
        Self {
            peer,
            inner: SendInner::Remote { tx, writer },
        }
    }

    /// Channel to ourselves: frames are delivered without a network hop.
    pub(crate) fn loopback(target: Arc<RecvChannel>) -> Self {
        Self {
            peer: target.peer(),
            inner: SendInner::Loopback(target),
        }
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }

    /// Queue one frame. Never blocks; frames leave in enqueue order.
    pub fn enqueue(&self, key: FrameKey, payload: Vec<u8>) -> PendingSend {
        match &self.inner {
            SendInner::Loopback(target) => {
                target.deliver(key, payload);
                PendingSend {
                    peer: self.peer,
                    rx: None,
                }
            }
            SendInner::Remote { tx, .. } => {
                let (done, rx) = oneshot::channel();
                if let Err(mpsc::error::SendError(Outgoing::Frame { done, .. })) =
                    tx.send(Outgoing::Frame { key, payload, done })
                {
                    let _ = done.send(Err(FlagcxError::transfer(
                        "send",
                        self.peer,
                        "channel has been closed",
                    )));
                }
                PendingSend {
                    peer: self.peer,
                    rx: Some(rx),
                }
            }
        }
    }

    /// Flush queued frames, finish the stream and wait (bounded) for the
    /// peer to consume it.
    pub(crate) async fn close(&self, timeout: Duration) {
        if let SendInner::Remote { tx, writer } = &self.inner {
            let (done, rx) = oneshot::channel();
            if tx.send(Outgoing::Close { done }).is_ok()
                && tokio::time::timeout(timeout, rx).await.is_err()
            {
                tracing::warn!(peer = self.peer, "channel did not drain before close");
            }
            writer.abort();
        }
    }
}

impl Drop for SendChannel {
    fn drop(&mut self) {
        if let SendInner::Remote { writer, .. } = &self.inner {
            writer.abort();
        }
    }
}

async fn run_writer(
    peer: Rank,
    dial: BoxFuture<'static, Result<DialedStream>>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    on_failure: Arc<dyn Fn(&FlagcxError) + Send + Sync>,
) {
    // Nothing is dialed until there is something to send.
    let Some(first) = rx.recv().await else {
        return;
    };
    let first = match first {
        Outgoing::Close { done } => {
            let _ = done.send(());
            return;
        }
        frame => frame,
    };

    let mut dialed = match dial.await {
        Ok(dialed) => dialed,
        Err(e) => {
            on_failure(&e);
            let reason = e.to_string();
            fail_outgoing(first, peer, &reason, true);
            while let Some(next) = rx.recv().await {
                fail_outgoing(next, peer, &reason, true);
            }
            return;
        }
    };
    tracing::debug!(peer, "send channel established");

    let mut pending = Some(first);
    loop {
        let next = match pending.take() {
            Some(next) => next,
            None => match rx.recv().await {
                Some(next) => next,
                None => break,
            },
        };
        match next {
            Outgoing::Frame { key, payload, done } => {
                tracing::trace!(peer, tag = key.tag, bytes = payload.len(), "writing frame");
                if let Err(e) = write_frame(&mut dialed.stream, key, &payload).await {
                    let err = FlagcxError::transfer("send", peer, e.to_string());
                    on_failure(&err);
                    let reason = err.to_string();
                    let _ = done.send(Err(err));
                    while let Some(rest) = rx.recv().await {
                        fail_outgoing(rest, peer, &reason, false);
                    }
                    return;
                }
                let _ = done.send(Ok(()));
            }
            Outgoing::Close { done } => {
                let _ = dialed.stream.finish();
                let _ = dialed.stream.stopped().await;
                dialed.conn.close(0u32.into(), b"channel closed");
                let _ = done.send(());
                return;
            }
        }
    }
}

fn fail_outgoing(item: Outgoing, peer: Rank, reason: &str, connect: bool) {
    match item {
        Outgoing::Frame { done, .. } => {
            let err = if connect {
                FlagcxError::connect(peer, reason)
            } else {
                FlagcxError::transfer("send", peer, reason)
            };
            let _ = done.send(Err(err));
        }
        Outgoing::Close { done } => {
            let _ = done.send(());
        }
    }
}

type PostedTx = oneshot::Sender<Result<Vec<u8>>>;

#[derive(Default)]
struct Slot {
    arrived: VecDeque<Vec<u8>>,
    posted: VecDeque<PostedTx>,
}

#[derive(Default)]
struct Mailboxes {
    slots: HashMap<FrameKey, Slot>,
    closed: Option<String>,
}

pub struct RecvChannel {
    peer: Rank,
    state: Mutex<Mailboxes>,
}

/// A receive that has been matched into the channel's queue.
pub struct PostedRecv {
    peer: Rank,
    rx: oneshot::Receiver<Result<Vec<u8>>>,
}

impl PostedRecv {
    pub async fn wait(self, operation: &'static str, timeout: Duration) -> Result<Vec<u8>> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(e))) => Err(match e {
                FlagcxError::Transfer { reason, .. } => {
                    FlagcxError::transfer(operation, self.peer, reason)
                }
                other => other,
            }),
            Ok(Err(_)) => Err(FlagcxError::transfer(
                operation,
                self.peer,
                "channel dropped before data arrived",
            )),
            Err(_) => Err(FlagcxError::transfer(
                operation,
                self.peer,
                format!("recv timed out after {}s", timeout.as_secs()),
            )),
        }
    }
}

impl RecvChannel {
    pub(crate) fn new(peer: Rank) -> Self {
        Self {
            peer,
            state: Mutex::new(Mailboxes::default()),
        }
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }

    /// Register interest in the next frame for `key`.
    pub fn post(&self, key: FrameKey) -> PostedRecv {
        let (tx, rx) = oneshot::channel();
        let peer = self.peer;
        let Ok(mut state) = self.state.lock() else {
            let _ = tx.send(Err(FlagcxError::transfer("recv", peer, "mailbox poisoned")));
            return PostedRecv { peer, rx };
        };
        let state = &mut *state;

        let slot = state.slots.entry(key).or_default();
        if let Some(payload) = slot.arrived.pop_front() {
            if slot.arrived.is_empty() && slot.posted.is_empty() {
                state.slots.remove(&key);
            }
            let _ = tx.send(Ok(payload));
        } else if let Some(reason) = &state.closed {
            let reason = reason.clone();
            state.slots.remove(&key);
            let _ = tx.send(Err(FlagcxError::transfer("recv", peer, reason)));
        } else {
            slot.posted.push_back(tx);
        }
        PostedRecv { peer, rx }
    }

    pub(crate) fn deliver(&self, key: FrameKey, payload: Vec<u8>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let state = &mut *state;
        let slot = state.slots.entry(key).or_default();
        match slot.posted.pop_front() {
            Some(tx) => {
                // An abandoned receive still consumes its frame.
                let _ = tx.send(Ok(payload));
                if slot.arrived.is_empty() && slot.posted.is_empty() {
                    state.slots.remove(&key);
                }
            }
            None => slot.arrived.push_back(payload),
        }
    }

    /// Fail every posted receive; frames already buffered stay readable.
    pub(crate) fn close(&self, reason: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.closed.is_none() {
            state.closed = Some(reason.to_string());
        }
        for slot in state.slots.values_mut() {
            for tx in slot.posted.drain(..) {
                let _ = tx.send(Err(FlagcxError::transfer("recv", self.peer, reason)));
            }
        }
        state.slots.retain(|_, slot| !slot.arrived.is_empty());
    }

    /// Frames received but not yet matched.
    pub fn unexpected_frames(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.slots.values().map(|slot| slot.arrived.len()).sum())
            .unwrap_or(0)
    }
}

/// Pump frames from an accepted stream into `channel` until it ends.
pub(crate) async fn run_reader(mut stream: quinn::RecvStream, channel: Arc<RecvChannel>) {
    let peer = channel.peer();
    let reason = loop {
        match read_frame(&mut stream).await {
            Ok(Some((key, payload))) => {
                tracing::trace!(peer, tag = key.tag, bytes = payload.len(), "frame received");
                channel.deliver(key, payload);
            }
            Ok(None) => break "peer closed the channel".to_string(),
            Err(e) => {
                tracing::warn!(peer, error = %e, "receive channel failed");
                break e.to_string();
            }
        }
    };
    channel.close(&reason);
}
