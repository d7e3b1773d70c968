//! Point-to-point transfers between members of a group.
//!
//! Peers are group ranks. Sends and receives between a pair of ranks match
//! in issue order: the n-th send from A to B fills the n-th receive B posts
//! for A. Issue never waits on the peer. A send queues its data and a
//! receive registers itself before the call returns, so symmetric patterns
//! (everyone sends to the next rank while receiving from the previous) make
//! progress in any issue order.

mod batch;

use std::sync::Arc;

use crate::error::{FlagcxError, Result};
use crate::group::ProcessGroup;
use crate::memory::Buffer;
use crate::protocol::FrameKey;
use crate::transport::{RecvChannel, SendChannel};
use crate::types::Rank;
use crate::work::Work;

pub use batch::{P2PKind, P2POp, plan_batch};

/// Point-to-point frames share one tag; matching is by order alone.
const P2P_TAG: u64 = 0;

impl ProcessGroup {
    /// Send `buf` to `peer` and wait until it is on the wire.
    ///
    /// # Safety
    /// `buf` must be valid for reads for the duration of the call.
    pub async unsafe fn send(&self, buf: Buffer, peer: Rank) -> Result<()> {
        unsafe { self.isend(buf, peer)? }.wait().await
    }

    /// Receive from `peer` into `buf`, waiting for the data.
    ///
    /// # Safety
    /// `buf` must be valid for writes for the duration of the call.
    pub async unsafe fn recv(&self, buf: Buffer, peer: Rank) -> Result<()> {
        unsafe { self.irecv(buf, peer)? }.wait().await
    }

    /// Non-blocking send. The contents of `buf` are captured before this
    /// returns.
    ///
    /// # Safety
    /// `buf` must be valid for reads until this call returns.
    pub unsafe fn isend(&self, buf: Buffer, peer: Rank) -> Result<Work> {
        self.check_p2p(peer)?;
        let staged = unsafe { self.prepare(P2PKind::Send, buf, peer)? };
        Ok(self.commit(staged))
    }

    /// Non-blocking receive.
    ///
    /// # Safety
    /// `buf` must stay valid and untouched until the returned work completes.
    pub unsafe fn irecv(&self, buf: Buffer, peer: Rank) -> Result<Work> {
        self.check_p2p(peer)?;
        let staged = unsafe { self.prepare(P2PKind::Recv, buf, peer)? };
        Ok(self.commit(staged))
    }

    /// Issue a list of sends and receives together.
    ///
    /// Every entry is checked, its channel resolved and every send buffer
    /// staged before anything is queued, so a failure leaves no
    /// half-issued batch behind. Returns one work per entry, in list order.
    ///
    /// # Safety
    /// Every receive buffer must stay valid and untouched until its work
    /// completes; send buffers must be valid until this call returns.
    pub unsafe fn batch_issue(&self, ops: &[P2POp]) -> Result<Vec<Work>> {
        self.comm.health.check()?;
        for op in ops {
            self.comm.check_rank(op.peer())?;
        }

        let mut staged = Vec::with_capacity(ops.len());
        for op in ops {
            staged.push(Some(unsafe { self.prepare(op.kind(), op.buffer(), op.peer())? }));
        }

        let mut slots: Vec<Option<Work>> = (0..ops.len()).map(|_| None).collect();
        for idx in plan_batch(ops) {
            if let Some(entry) = staged[idx].take() {
                slots[idx] = Some(self.commit(entry));
            }
        }
        tracing::trace!(group = %self.comm.label, ops = ops.len(), "batch issued");
        Ok(slots.into_iter().flatten().collect())
    }

    fn check_p2p(&self, peer: Rank) -> Result<()> {
        self.comm.health.check()?;
        self.comm.check_rank(peer)
    }

    /// Everything that can fail before a transfer is queued: the channel
    /// lookup and, for sends, staging the data off the device. Fatal errors
    /// are recorded against the group.
    unsafe fn prepare(&self, kind: P2PKind, buf: Buffer, peer: Rank) -> Result<Staged> {
        let comm = &self.comm;
        let staged = match kind {
            P2PKind::Send => comm.fabric.send_channel(peer).and_then(|channel| {
                let data = unsafe { comm.adapter.stage_for_send(buf.ptr(), buf.len_bytes())? };
                Ok(Staged::Send { channel, data, peer })
            }),
            P2PKind::Recv => comm
                .fabric
                .recv_channel(peer)
                .map(|channel| Staged::Recv { channel, buf }),
        };
        staged.map_err(|e| comm.health.observe(e))
    }

    /// Queue a prepared transfer and wrap its completion in a [`Work`].
    fn commit(&self, staged: Staged) -> Work {
        let comm = &self.comm;
        let timeout = comm.config.transfer_timeout;
        match staged {
            Staged::Send { channel, data, peer } => {
                tracing::trace!(group = %comm.label, peer, bytes = data.len(), "send issued");
                let pending = channel.enqueue(FrameKey::p2p(P2P_TAG), data);
                self.spawn_work("send", async move { pending.wait("send", timeout).await })
            }
            Staged::Recv { channel, buf } => {
                let posted = channel.post(FrameKey::p2p(P2P_TAG));
                let adapter = Arc::clone(&comm.adapter);
                self.spawn_work("recv", async move {
                    let data = posted.wait("recv", timeout).await?;
                    if data.len() != buf.len_bytes() {
                        return Err(FlagcxError::BufferSizeMismatch {
                            expected: buf.len_bytes(),
                            actual: data.len(),
                        });
                    }
                    unsafe { adapter.receive_to_device(&data, buf.ptr()) }
                })
            }
        }
    }
}

/// A transfer that passed every fallible step and only needs queueing.
enum Staged {
    Send {
        channel: Arc<SendChannel>,
        data: Vec<u8>,
        peer: Rank,
    },
    Recv {
        channel: Arc<RecvChannel>,
        buf: Buffer,
    },
}
