use crate::collective::helpers::{ceil_log2, collective_recv, collective_send};
use crate::error::Result;
use crate::group::Communicator;

const OP: &str = "barrier";

/// Dissemination barrier: in round k every rank signals `rank + 2^k` and
/// waits for `rank - 2^k`. After ceil(log2(N)) rounds each rank has heard,
/// directly or transitively, from every other.
pub(crate) async fn barrier(comm: &Communicator, seq: u64) -> Result<()> {
    let world = comm.size();
    let rank = comm.rank;
    for k in 0..ceil_log2(world) {
        let dist = 1u32 << k;
        let to = (rank + dist) % world;
        let from = (rank + world - dist) % world;
        tokio::try_join!(
            collective_send(comm, to, &[], OP, seq),
            collective_recv(comm, from, OP, seq),
        )?;
    }
    Ok(())
}
