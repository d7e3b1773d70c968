use crate::collective::helpers::{collective_recv, collective_send, expect_len, finish_avg};
use crate::error::Result;
use crate::group::Communicator;
use crate::memory::Buffer;
use crate::reduce::reduce_slice;
use crate::types::{Rank, ReduceOp};

const OP: &str = "reduce";

/// Reduce every member's `buf` into `root`'s `buf`. Other members' buffers
/// are left as they were.
///
/// Binomial tree: in round k a rank whose virtual rank has bit k set sends
/// its partial result to the rank 2^k below and drops out, so the root
/// receives at most ceil(log2(N)) messages.
///
/// # Safety
/// `buf` must stay valid and untouched until the operation completes.
pub(crate) async unsafe fn reduce(
    comm: &Communicator,
    buf: Buffer,
    op: ReduceOp,
    root: Rank,
    seq: u64,
) -> Result<()> {
    let world = comm.size();
    if world <= 1 || buf.is_empty() {
        return Ok(());
    }
    let (count, dtype) = (buf.count(), buf.dtype());
    let vrank = (comm.rank + world - root) % world;
    let physical = |v: Rank| (v + root) % world;

    if vrank == 0 {
        // The root accumulates straight into its own buffer.
        let mut mask = 1;
        while mask < world {
            let received = collective_recv(comm, physical(mask), OP, seq).await?;
            expect_len(&received, buf.len_bytes())?;
            unsafe {
                comm.adapter
                    .reduce_inplace(buf.ptr(), &received, count, dtype, op)?
            };
            mask <<= 1;
        }
        if op == ReduceOp::Avg {
            let mut data = unsafe { comm.adapter.stage_for_send(buf.ptr(), buf.len_bytes())? };
            finish_avg(&mut data, count, dtype, op, world as usize)?;
            unsafe { comm.adapter.receive_to_device(&data, buf.ptr())? };
        }
        return Ok(());
    }

    let mut acc = unsafe { comm.adapter.stage_for_send(buf.ptr(), buf.len_bytes())? };
    let mut mask = 1;
    while mask < world {
        if vrank & mask != 0 {
            collective_send(comm, physical(vrank - mask), &acc, OP, seq).await?;
            break;
        }
        if vrank + mask < world {
            let received = collective_recv(comm, physical(vrank + mask), OP, seq).await?;
            expect_len(&received, acc.len())?;
            reduce_slice(&mut acc, &received, count, dtype, op)?;
        }
        mask <<= 1;
    }
    Ok(())
}
