use crate::collective::helpers::{collective_recv, collective_send, expect_len};
use crate::error::Result;
use crate::group::Communicator;
use crate::memory::Buffer;

const OP: &str = "all_gather";

/// Gather every member's `input` into `output`, ordered by group rank.
/// `output` holds `size() * input.count()` elements.
///
/// Ring: in each of N-1 rounds a rank forwards the block it received last.
///
/// # Safety
/// Both buffers must stay valid and untouched until the operation completes,
/// and must not overlap.
pub(crate) async unsafe fn all_gather(
    comm: &Communicator,
    output: Buffer,
    input: Buffer,
    seq: u64,
) -> Result<()> {
    let world = comm.size() as usize;
    let rank = comm.rank as usize;
    let block = input.len_bytes();

    let mut buf = vec![0u8; block * world];
    let own = unsafe { comm.adapter.stage_for_send(input.ptr(), block)? };
    buf[rank * block..(rank + 1) * block].copy_from_slice(&own);

    let next = ((rank + 1) % world) as u32;
    let prev = ((rank + world - 1) % world) as u32;

    for step in 0..world.saturating_sub(1) {
        let send_idx = (rank + world - step) % world;
        let recv_idx = (rank + world - step - 1) % world;
        let send = buf[send_idx * block..(send_idx + 1) * block].to_vec();

        let (_, received) = tokio::try_join!(
            collective_send(comm, next, &send, OP, seq),
            collective_recv(comm, prev, OP, seq),
        )?;
        expect_len(&received, block)?;
        buf[recv_idx * block..(recv_idx + 1) * block].copy_from_slice(&received);
    }

    unsafe { comm.adapter.receive_to_device(&buf, output.ptr()) }
}
