use futures::future::try_join_all;

use crate::collective::helpers::{collective_recv, collective_send, expect_len};
use crate::error::Result;
use crate::group::Communicator;
use crate::memory::Buffer;
use crate::types::Rank;

const OP: &str = "gather";

/// Collect every member's `input` at `root`, ordered by group rank.
/// `output` is only read on the root.
///
/// # Safety
/// Buffers must stay valid and untouched until the operation completes, and
/// must not overlap.
pub(crate) async unsafe fn gather(
    comm: &Communicator,
    input: Buffer,
    output: Option<Buffer>,
    root: Rank,
    seq: u64,
) -> Result<()> {
    let block = input.len_bytes();
    let Some(output) = output.filter(|_| comm.rank == root) else {
        let data = unsafe { comm.adapter.stage_for_send(input.ptr(), block)? };
        return collective_send(comm, root, &data, OP, seq).await;
    };

    let own = output.ptr() + (root as usize * block) as u64;
    unsafe { comm.adapter.copy_local(own, input.ptr(), block)? };

    let peers: Vec<Rank> = (0..comm.size()).filter(|&r| r != root).collect();
    let blocks = try_join_all(peers.iter().map(|&src| collective_recv(comm, src, OP, seq))).await?;
    for (&src, data) in peers.iter().zip(&blocks) {
        expect_len(data, block)?;
        let dst = output.ptr() + (src as usize * block) as u64;
        unsafe { comm.adapter.receive_to_device(data, dst)? };
    }
    Ok(())
}
