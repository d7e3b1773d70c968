//! Two process groups over the same ranks, driven the way a training job
//! would drive them.
//!
//! Each rank creates two groups over the whole world, runs two allreduces
//! on each, a ring exchange batched in reversed order on odd ranks, and an
//! even-sends/odd-receives round, then destroys both groups.
//!
//! Without launcher variables all ranks run in this process:
//!
//! ```bash
//! cargo run --example two_groups
//! ```
//!
//! With one process per rank, rank 0 also hosts the rendezvous store:
//!
//! ```bash
//! RANK=0 WORLD_SIZE=2 MASTER_ADDR=127.0.0.1 MASTER_PORT=29500 cargo run --example two_groups
//! RANK=1 WORLD_SIZE=2 MASTER_ADDR=127.0.0.1 MASTER_PORT=29500 cargo run --example two_groups
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use flagcx::{
    Buffer, DeviceKind, FlagcxConfig, FlagcxError, P2POp, ProcessGroup, Rank, ReduceOp,
    StoreServer, TcpStore, World, select_adapter, wait_all,
};
use tracing_subscriber::EnvFilter;

const LOCAL_WORLD_SIZE: u32 = 4;
const COUNT: usize = 8;

struct Launch {
    rank: Rank,
    world_size: u32,
    master_addr: String,
    master_port: u16,
}

impl Launch {
    fn from_env() -> Option<Self> {
        let var = |name: &str| std::env::var(name).ok();
        Some(Self {
            rank: var("RANK")?.parse().ok()?,
            world_size: var("WORLD_SIZE")?.parse().ok()?,
            master_addr: var("MASTER_ADDR")?,
            master_port: var("MASTER_PORT")?.parse().ok()?,
        })
    }
}

#[tokio::main]
async fn main() -> flagcx::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Launch::from_env() {
        Some(launch) => {
            let (world, _server) = join_world(launch).await?;
            run_rank(world).await
        }
        None => {
            let handles: Vec<_> = World::bootstrap_local(LOCAL_WORLD_SIZE)?
                .into_iter()
                .map(|world| tokio::spawn(run_rank(world)))
                .collect();
            for h in handles {
                h.await
                    .map_err(|e| FlagcxError::config(format!("rank task failed: {e}")))??;
            }
            Ok(())
        }
    }
}

/// Connect to the rendezvous store, starting it first on rank 0.
async fn join_world(launch: Launch) -> flagcx::Result<(World, Option<tokio::task::JoinHandle<flagcx::Result<()>>>)> {
    let config = FlagcxConfig::from_env();
    let master: SocketAddr = tokio::net::lookup_host((launch.master_addr.as_str(), launch.master_port))
        .await?
        .next()
        .ok_or_else(|| FlagcxError::config(format!("cannot resolve {}", launch.master_addr)))?;

    let server = if launch.rank == 0 {
        Some(StoreServer::bind(master).await?.spawn())
    } else {
        None
    };
    let store = TcpStore::connect(master, config.store_timeout).await?;
    let world = World::init(
        launch.rank,
        launch.world_size,
        Arc::new(store),
        select_adapter(DeviceKind::Host, 0)?,
        config,
    )?;
    Ok((world, server))
}

async fn run_rank(world: World) -> flagcx::Result<()> {
    let ranks = world.all_ranks();
    let first = world.new_group(&ranks).await?;
    let second = world.new_group(&ranks).await?;
    let rank = first.rank();
    tracing::info!(rank, backend = %first.backend_name(), "groups ready");

    for (name, pg) in [("first", &first), ("second", &second)] {
        let mut data = vec![1.0f32; COUNT];
        for _ in 0..2 {
            unsafe { pg.all_reduce(Buffer::from_slice(&mut data), ReduceOp::Sum)? }
                .wait()
                .await?;
            tracing::info!(rank, group = name, value = data[0], "all_reduce");
        }
    }

    ring_exchange(&first).await?;
    pairwise_round(&second).await?;

    second.barrier()?.wait().await?;
    first.destroy().await?;
    second.destroy().await?;
    tracing::info!(rank, "done");
    Ok(())
}

/// Everyone sends to the next rank and receives from the previous one.
/// Odd ranks list the receive first; the batch completes either way.
async fn ring_exchange(pg: &ProcessGroup) -> flagcx::Result<()> {
    let (rank, size) = (pg.rank(), pg.size());
    let next = (rank + 1) % size;
    let prev = (rank + size - 1) % size;

    let mut out = vec![rank as f32; COUNT];
    let mut inbox = vec![0.0f32; COUNT];
    let mut ops = vec![
        P2POp::send(Buffer::from_slice(&mut out), next),
        P2POp::recv(Buffer::from_slice(&mut inbox), prev),
    ];
    if rank % 2 == 1 {
        ops.reverse();
    }
    wait_all(unsafe { pg.batch_issue(&ops)? }).await?;
    tracing::info!(rank, from = prev, value = inbox[0], "ring exchange");
    Ok(())
}

/// Even ranks send to the odd rank above them.
async fn pairwise_round(pg: &ProcessGroup) -> flagcx::Result<()> {
    let rank = pg.rank();
    let mut data = vec![rank as f32 * 10.0; COUNT];
    if rank % 2 == 0 {
        if rank + 1 < pg.size() {
            unsafe { pg.send(Buffer::from_slice(&mut data), rank + 1).await? };
        }
    } else {
        unsafe { pg.recv(Buffer::from_slice(&mut data), rank - 1).await? };
        tracing::info!(rank, from = rank - 1, value = data[0], "pairwise receive");
    }
    Ok(())
}
