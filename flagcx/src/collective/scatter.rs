use futures::future::try_join_all;

use crate::collective::helpers::{collective_recv, collective_send, expect_len};
use crate::error::Result;
use crate::group::Communicator;
use crate::memory::Buffer;
use crate::types::Rank;

const OP: &str = "scatter";

/// Hand block `i` of the root's `input` to group rank `i`'s `output`.
/// `input` is only read on the root.
///
/// # Safety
/// Buffers must stay valid and untouched until the operation completes, and
/// must not overlap.
pub(crate) async unsafe fn scatter(
    comm: &Communicator,
    input: Option<Buffer>,
    output: Buffer,
    root: Rank,
    seq: u64,
) -> Result<()> {
    let block = output.len_bytes();
    let Some(input) = input.filter(|_| comm.rank == root) else {
        let received = collective_recv(comm, root, OP, seq).await?;
        expect_len(&received, block)?;
        return unsafe { comm.adapter.receive_to_device(&received, output.ptr()) };
    };

    let data = unsafe { comm.adapter.stage_for_send(input.ptr(), input.len_bytes())? };
    let peers: Vec<Rank> = (0..comm.size()).filter(|&r| r != root).collect();
    try_join_all(peers.iter().map(|&dst| {
        let off = dst as usize * block;
        collective_send(comm, dst, &data[off..off + block], OP, seq)
    }))
    .await?;

    let own = input.ptr() + (root as usize * block) as u64;
    unsafe { comm.adapter.copy_local(output.ptr(), own, block) }
}
