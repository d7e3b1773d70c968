use crate::collective::helpers::{collective_recv, collective_send, expect_len, finish_avg};
use crate::error::Result;
use crate::group::Communicator;
use crate::memory::Buffer;
use crate::reduce::reduce_slice;
use crate::types::ReduceOp;

const OP: &str = "reduce_scatter";

/// Reduce `input` (`size()` equal blocks) across the group; group rank `i`
/// receives the reduced block `i` in `output`.
///
/// # Safety
/// Both buffers must stay valid and untouched until the operation completes,
/// and must not overlap.
pub(crate) async unsafe fn reduce_scatter(
    comm: &Communicator,
    output: Buffer,
    input: Buffer,
    op: ReduceOp,
    seq: u64,
) -> Result<()> {
    let world = comm.size() as usize;
    let rank = comm.rank as usize;
    let count = output.count();
    let dtype = output.dtype();
    let block = output.len_bytes();

    let mut buf = unsafe { comm.adapter.stage_for_send(input.ptr(), input.len_bytes())? };

    let next = ((rank + 1) % world) as u32;
    let prev = ((rank + world - 1) % world) as u32;

    // Shifted by one against the allreduce ring so the block a rank
    // finishes with is its own.
    for step in 0..world.saturating_sub(1) {
        let send_idx = (rank + 2 * world - step - 1) % world;
        let recv_idx = (rank + 2 * world - step - 2) % world;
        let send = buf[send_idx * block..(send_idx + 1) * block].to_vec();

        let (_, received) = tokio::try_join!(
            collective_send(comm, next, &send, OP, seq),
            collective_recv(comm, prev, OP, seq),
        )?;
        expect_len(&received, block)?;
        reduce_slice(
            &mut buf[recv_idx * block..(recv_idx + 1) * block],
            &received,
            count,
            dtype,
            op,
        )?;
    }

    let result = &mut buf[rank * block..(rank + 1) * block];
    finish_avg(result, count, dtype, op, world)?;
    unsafe { comm.adapter.receive_to_device(result, output.ptr()) }
}
