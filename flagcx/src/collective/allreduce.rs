use crate::collective::helpers::{
    ChunkLayout, collective_recv, collective_send, expect_len, finish_avg,
};
use crate::error::{FlagcxError, Result};
use crate::group::Communicator;
use crate::memory::Buffer;
use crate::reduce::reduce_slice;
use crate::types::{DataType, ReduceOp};

const OP: &str = "all_reduce";

/// In-place allreduce of `buf` across the group.
///
/// # Safety
/// `buf` must stay valid and untouched until the operation completes.
pub(crate) async unsafe fn all_reduce(
    comm: &Communicator,
    buf: Buffer,
    op: ReduceOp,
    seq: u64,
) -> Result<()> {
    let world = comm.size() as usize;
    if world <= 1 || buf.is_empty() {
        return Ok(());
    }
    let mut data = unsafe { comm.adapter.stage_for_send(buf.ptr(), buf.len_bytes())? };
    allreduce_host(comm, &mut data, buf.count(), buf.dtype(), op, seq).await?;
    finish_avg(&mut data, buf.count(), buf.dtype(), op, world)?;
    unsafe { comm.adapter.receive_to_device(&data, buf.ptr()) }
}

/// Allreduce several buffers of one dtype as a single message.
///
/// # Safety
/// Every buffer must stay valid and untouched until the operation completes.
pub(crate) async unsafe fn all_reduce_coalesced(
    comm: &Communicator,
    bufs: &[Buffer],
    op: ReduceOp,
    seq: u64,
) -> Result<()> {
    let world = comm.size() as usize;
    let Some(first) = bufs.first() else {
        return Ok(());
    };
    let dtype = first.dtype();
    if world <= 1 {
        return Ok(());
    }

    let total: usize = bufs.iter().map(Buffer::count).sum();
    let mut packed = Vec::with_capacity(total * dtype.size_in_bytes());
    for b in bufs {
        packed.extend(unsafe { comm.adapter.stage_for_send(b.ptr(), b.len_bytes())? });
    }

    allreduce_host(comm, &mut packed, total, dtype, op, seq).await?;
    finish_avg(&mut packed, total, dtype, op, world)?;

    let mut off = 0;
    for b in bufs {
        let len = b.len_bytes();
        unsafe { comm.adapter.receive_to_device(&packed[off..off + len], b.ptr())? };
        off += len;
    }
    Ok(())
}

/// Reject buffer lists `all_reduce_coalesced` cannot pack.
pub(crate) fn check_coalesced(bufs: &[Buffer]) -> Result<()> {
    if let Some(first) = bufs.first()
        && let Some(other) = bufs.iter().find(|b| b.dtype() != first.dtype())
    {
        return Err(FlagcxError::UnsupportedDType {
            dtype: other.dtype(),
            op: "all_reduce_coalesced",
        });
    }
    Ok(())
}

/// Reduce a staged host copy across the group. Leaves `Avg` unscaled.
///
/// Small groups use the ring, larger ones halving-doubling; both are
/// deterministic for a fixed group size.
pub(crate) async fn allreduce_host(
    comm: &Communicator,
    data: &mut [u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    seq: u64,
) -> Result<()> {
    if comm.size() as usize <= comm.config.ring_max_world {
        ring_allreduce(comm, data, count, dtype, op, seq).await
    } else {
        halving_doubling_allreduce(comm, data, count, dtype, op, seq).await
    }
}

/// Ring allreduce: a reduce-scatter pass then an allgather pass, N-1 rounds
/// each. Every round sends one chunk to the next rank and receives one from
/// the previous, so no rank ever has more than one inbound transfer.
async fn ring_allreduce(
    comm: &Communicator,
    buf: &mut [u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    seq: u64,
) -> Result<()> {
    let world = comm.size() as usize;
    let rank = comm.rank as usize;
    let elem_size = dtype.size_in_bytes();
    let layout = ChunkLayout::new(count, world);
    let next = ((rank + 1) % world) as u32;
    let prev = ((rank + world - 1) % world) as u32;

    for step in 0..(world - 1) {
        let send_idx = (rank + world - step) % world;
        let recv_idx = (rank + world - step - 1) % world;
        let send = buf[layout.bytes(send_idx, elem_size)].to_vec();

        let (_, received) = tokio::try_join!(
            collective_send(comm, next, &send, OP, seq),
            collective_recv(comm, prev, OP, seq),
        )?;

        let range = layout.bytes(recv_idx, elem_size);
        expect_len(&received, range.len())?;
        reduce_slice(&mut buf[range], &received, layout.chunk_count(recv_idx), dtype, op)?;
    }

    for step in 0..(world - 1) {
        let send_idx = (rank + world + 1 - step) % world;
        let recv_idx = (rank + world - step) % world;
        let send = buf[layout.bytes(send_idx, elem_size)].to_vec();

        let (_, received) = tokio::try_join!(
            collective_send(comm, next, &send, OP, seq),
            collective_recv(comm, prev, OP, seq),
        )?;

        let range = layout.bytes(recv_idx, elem_size);
        expect_len(&received, range.len())?;
        buf[range].copy_from_slice(&received);
    }
    Ok(())
}

/// Recursive halving-doubling: 2*log2(P) rounds over the largest power of
/// two P <= N. The N-P excess ranks first fold their data into a partner
/// below P and get the result back at the end.
async fn halving_doubling_allreduce(
    comm: &Communicator,
    buf: &mut [u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    seq: u64,
) -> Result<()> {
    let world = comm.size() as usize;
    let rank = comm.rank as usize;
    let elem_size = dtype.size_in_bytes();
    let total_bytes = buf.len();

    let p2 = if world.is_power_of_two() {
        world
    } else {
        world.next_power_of_two() >> 1
    };
    let excess = world - p2;

    let active = if rank < excess {
        let received = collective_recv(comm, (rank + p2) as u32, OP, seq).await?;
        expect_len(&received, total_bytes)?;
        reduce_slice(buf, &received, count, dtype, op)?;
        true
    } else if rank >= p2 {
        collective_send(comm, (rank - p2) as u32, buf, OP, seq).await?;
        false
    } else {
        true
    };

    if active {
        let rounds = p2.trailing_zeros() as usize;
        let mut start = 0usize;
        let mut len = count;

        for round in 0..rounds {
            let partner = rank ^ (1 << round);
            let half = len / 2;
            // Lower rank keeps the lower half.
            let (send_start, send_len, keep_start, keep_len) = if rank < partner {
                (start + half, len - half, start, half)
            } else {
                (start, half, start + half, len - half)
            };

            let send = buf[send_start * elem_size..(send_start + send_len) * elem_size].to_vec();
            let (_, received) = tokio::try_join!(
                collective_send(comm, partner as u32, &send, OP, seq),
                collective_recv(comm, partner as u32, OP, seq),
            )?;

            let keep = keep_start * elem_size..(keep_start + keep_len) * elem_size;
            expect_len(&received, keep.len())?;
            reduce_slice(&mut buf[keep], &received, keep_len, dtype, op)?;
            start = keep_start;
            len = keep_len;
        }

        for round in (0..rounds).rev() {
            let partner = rank ^ (1 << round);
            let send = buf[start * elem_size..(start + len) * elem_size].to_vec();
            let (_, received) = tokio::try_join!(
                collective_send(comm, partner as u32, &send, OP, seq),
                collective_recv(comm, partner as u32, OP, seq),
            )?;

            if received.len() % elem_size != 0 {
                return Err(FlagcxError::BufferSizeMismatch {
                    expected: received.len() / elem_size * elem_size,
                    actual: received.len(),
                });
            }
            let recv_len = received.len() / elem_size;
            let recv_start = if rank < partner {
                Some(start + len)
            } else {
                start.checked_sub(recv_len)
            };
            let dst = match recv_start {
                Some(s) if (s + recv_len) * elem_size <= total_bytes => {
                    s * elem_size..(s + recv_len) * elem_size
                }
                _ => {
                    return Err(FlagcxError::BufferSizeMismatch {
                        expected: len * elem_size,
                        actual: received.len(),
                    });
                }
            };
            let recv_start = dst.start / elem_size;
            buf[dst].copy_from_slice(&received);
            start = start.min(recv_start);
            len += recv_len;
        }
    }

    if rank < excess {
        collective_send(comm, (rank + p2) as u32, buf, OP, seq).await?;
    } else if rank >= p2 {
        let received = collective_recv(comm, (rank - p2) as u32, OP, seq).await?;
        expect_len(&received, total_bytes)?;
        buf.copy_from_slice(&received);
    }
    Ok(())
}
