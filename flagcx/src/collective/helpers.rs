use crate::error::{FlagcxError, Result};
use crate::group::Communicator;
use crate::protocol::FrameKey;
use crate::reduce::scale_slice;
use crate::types::{DataType, Rank, ReduceOp};

/// Split `count` elements into `parts` contiguous chunks. The first
/// `count % parts` chunks hold one extra element.
pub(crate) struct ChunkLayout {
    pub(crate) offsets: Vec<usize>,
    counts: Vec<usize>,
}

impl ChunkLayout {
    pub(crate) fn new(count: usize, parts: usize) -> Self {
        let base = count / parts;
        let extra = count % parts;
        let counts: Vec<usize> = (0..parts)
            .map(|i| base + usize::from(i < extra))
            .collect();
        let mut offsets = Vec::with_capacity(parts);
        let mut off = 0;
        for c in &counts {
            offsets.push(off);
            off += c;
        }
        Self { offsets, counts }
    }

    pub(crate) fn chunk_count(&self, idx: usize) -> usize {
        self.counts[idx]
    }

    /// Byte range of chunk `idx` for elements of `elem_size` bytes.
    pub(crate) fn bytes(&self, idx: usize, elem_size: usize) -> std::ops::Range<usize> {
        let start = self.offsets[idx] * elem_size;
        start..start + self.counts[idx] * elem_size
    }
}

/// Integer ceiling of log2(n). Returns 0 for n <= 1.
pub(crate) fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        return 0;
    }
    u32::BITS - (n - 1).leading_zeros()
}

/// Send one frame of collective `seq` to group rank `dest` and wait until it
/// is on the wire.
pub(crate) async fn collective_send(
    comm: &Communicator,
    dest: Rank,
    data: &[u8],
    operation: &'static str,
    seq: u64,
) -> Result<()> {
    comm.fabric
        .send_channel(dest)?
        .enqueue(FrameKey::collective(seq), data.to_vec())
        .wait(operation, comm.config.transfer_timeout)
        .await
}

/// Receive the next frame of collective `seq` from group rank `src`.
pub(crate) async fn collective_recv(
    comm: &Communicator,
    src: Rank,
    operation: &'static str,
    seq: u64,
) -> Result<Vec<u8>> {
    comm.fabric
        .recv_channel(src)?
        .post(FrameKey::collective(seq))
        .wait(operation, comm.config.transfer_timeout)
        .await
}

/// Frames carry no dtype; a length mismatch means the ranks disagree on
/// the call.
pub(crate) fn expect_len(received: &[u8], expected: usize) -> Result<()> {
    if received.len() != expected {
        return Err(FlagcxError::BufferSizeMismatch {
            expected,
            actual: received.len(),
        });
    }
    Ok(())
}

/// Apply the final division of an `Avg` reduction over `n` contributions.
pub(crate) fn finish_avg(
    data: &mut [u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    n: usize,
) -> Result<()> {
    if op == ReduceOp::Avg {
        scale_slice(data, count, dtype, n)?;
    }
    Ok(())
}
