use crate::collective::helpers::{collective_recv, collective_send, expect_len};
use crate::error::Result;
use crate::group::Communicator;
use crate::memory::Buffer;

const OP: &str = "all_to_all";

/// Block `j` of `input` on rank `i` lands in block `i` of `output` on rank
/// `j`. Blocks are equal, `input.count() / size()` elements each.
///
/// Pairwise exchange: in round s every rank sends to `rank + s` and receives
/// from `rank - s`, one transfer each way per round.
///
/// # Safety
/// Both buffers must stay valid and untouched until the operation completes,
/// and must not overlap.
pub(crate) async unsafe fn all_to_all(
    comm: &Communicator,
    output: Buffer,
    input: Buffer,
    seq: u64,
) -> Result<()> {
    let world = comm.size() as usize;
    let rank = comm.rank as usize;
    let block = input.len_bytes() / world;
    let at = |base: u64, idx: usize| base + (idx * block) as u64;

    unsafe {
        comm.adapter
            .copy_local(at(output.ptr(), rank), at(input.ptr(), rank), block)?
    };

    for step in 1..world {
        let send_to = (rank + step) % world;
        let recv_from = (rank + world - step) % world;
        let send = unsafe { comm.adapter.stage_for_send(at(input.ptr(), send_to), block)? };

        let (_, received) = tokio::try_join!(
            collective_send(comm, send_to as u32, &send, OP, seq),
            collective_recv(comm, recv_from as u32, OP, seq),
        )?;
        expect_len(&received, block)?;
        unsafe {
            comm.adapter
                .receive_to_device(&received, at(output.ptr(), recv_from))?
        };
    }
    Ok(())
}
