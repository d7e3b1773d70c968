use futures::future::try_join_all;

use crate::collective::helpers::{collective_recv, collective_send, expect_len};
use crate::error::Result;
use crate::group::Communicator;
use crate::memory::Buffer;
use crate::types::Rank;

const OP: &str = "broadcast";

/// Below this group size the root sends to everyone directly.
const TREE_BROADCAST_THRESHOLD: u32 = 4;

/// Copy `buf` from `root` to every member.
///
/// Binary tree rooted at `root`, so a rank forwards to at most two children.
///
/// # Safety
/// `buf` must stay valid and untouched until the operation completes.
pub(crate) async unsafe fn broadcast(
    comm: &Communicator,
    buf: Buffer,
    root: Rank,
    seq: u64,
) -> Result<()> {
    let world = comm.size();
    if world <= 1 {
        return Ok(());
    }
    if world < TREE_BROADCAST_THRESHOLD {
        return unsafe { flat_broadcast(comm, buf, root, seq).await };
    }

    let logical = (comm.rank + world - root) % world;
    let physical = |l: Rank| (l + root) % world;

    let data = if logical == 0 {
        unsafe { comm.adapter.stage_for_send(buf.ptr(), buf.len_bytes())? }
    } else {
        let parent = physical((logical - 1) / 2);
        let received = collective_recv(comm, parent, OP, seq).await?;
        expect_len(&received, buf.len_bytes())?;
        unsafe { comm.adapter.receive_to_device(&received, buf.ptr())? };
        received
    };

    let children: Vec<Rank> = [2 * logical + 1, 2 * logical + 2]
        .into_iter()
        .filter(|&c| c < world)
        .map(physical)
        .collect();
    try_join_all(
        children
            .iter()
            .map(|&child| collective_send(comm, child, &data, OP, seq)),
    )
    .await?;
    Ok(())
}

async unsafe fn flat_broadcast(comm: &Communicator, buf: Buffer, root: Rank, seq: u64) -> Result<()> {
    if comm.rank == root {
        let data = unsafe { comm.adapter.stage_for_send(buf.ptr(), buf.len_bytes())? };
        let peers: Vec<Rank> = (0..comm.size()).filter(|&r| r != root).collect();
        try_join_all(
            peers
                .iter()
                .map(|&peer| collective_send(comm, peer, &data, OP, seq)),
        )
        .await?;
    } else {
        let received = collective_recv(comm, root, OP, seq).await?;
        expect_len(&received, buf.len_bytes())?;
        unsafe { comm.adapter.receive_to_device(&received, buf.ptr())? };
    }
    Ok(())
}
