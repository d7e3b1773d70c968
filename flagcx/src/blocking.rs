//! Blocking front end for callers without an async context.

use std::sync::Arc;

use crate::error::Result;
use crate::group::{ProcessGroup, World};
use crate::memory::Buffer;
use crate::p2p::P2POp;
use crate::types::{Rank, ReduceOp};
use crate::work::wait_all;

/// Blocking wrapper around [`World`].
///
/// Owns a tokio runtime; groups created through it run their tasks there
/// and keep it alive.
pub struct SyncWorld {
    world: World,
    rt: Arc<tokio::runtime::Runtime>,
}

impl SyncWorld {
    /// Wrap a world with a fresh runtime.
    pub fn from_async(world: World) -> Result<Self> {
        Ok(Self {
            world,
            rt: Arc::new(tokio::runtime::Runtime::new()?),
        })
    }

    /// Every rank of an in-process world, one runtime per rank so each can
    /// be driven from its own thread.
    pub fn bootstrap_local(world_size: u32) -> Result<Vec<Self>> {
        World::bootstrap_local(world_size)?
            .into_iter()
            .map(Self::from_async)
            .collect()
    }

    pub fn rank(&self) -> Rank {
        self.world.rank()
    }

    pub fn world_size(&self) -> u32 {
        self.world.world_size()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn new_group(&self, ranks: &[Rank]) -> Result<SyncGroup> {
        let group = self.rt.block_on(self.world.new_group(ranks))?;
        Ok(self.wrap(group))
    }

    pub fn new_group_with_label(&self, label: &str, ranks: &[Rank]) -> Result<SyncGroup> {
        let group = self
            .rt
            .block_on(self.world.new_group_with_label(label, ranks))?;
        Ok(self.wrap(group))
    }

    fn wrap(&self, group: ProcessGroup) -> SyncGroup {
        SyncGroup {
            group,
            rt: Arc::clone(&self.rt),
        }
    }
}

/// Blocking wrapper around [`ProcessGroup`]. Every call returns once the
/// operation has completed on this rank.
pub struct SyncGroup {
    group: ProcessGroup,
    rt: Arc<tokio::runtime::Runtime>,
}

impl SyncGroup {
    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn rank(&self) -> Rank {
        self.group.rank()
    }

    pub fn size(&self) -> u32 {
        self.group.size()
    }

    /// # Safety
    /// `buf` must be valid for reads and writes for the duration of the call.
    pub unsafe fn all_reduce(&self, buf: Buffer, op: ReduceOp) -> Result<()> {
        self.rt
            .block_on(async { unsafe { self.group.all_reduce(buf, op)? }.wait().await })
    }

    /// # Safety
    /// `buf` must be valid for reads and writes for the duration of the call.
    pub unsafe fn broadcast(&self, buf: Buffer, root: Rank) -> Result<()> {
        self.rt
            .block_on(async { unsafe { self.group.broadcast(buf, root)? }.wait().await })
    }

    pub fn barrier(&self) -> Result<()> {
        self.rt
            .block_on(async { self.group.barrier()?.wait().await })
    }

    /// # Safety
    /// `buf` must be valid for reads for the duration of the call.
    pub unsafe fn send(&self, buf: Buffer, peer: Rank) -> Result<()> {
        self.rt.block_on(unsafe { self.group.send(buf, peer) })
    }

    /// # Safety
    /// `buf` must be valid for writes for the duration of the call.
    pub unsafe fn recv(&self, buf: Buffer, peer: Rank) -> Result<()> {
        self.rt.block_on(unsafe { self.group.recv(buf, peer) })
    }

    /// Issue `ops` as one batch and wait for all of them.
    ///
    /// # Safety
    /// Every buffer must be valid for the duration of the call.
    pub unsafe fn batch_issue(&self, ops: &[P2POp]) -> Result<()> {
        self.rt.block_on(async {
            let works = unsafe { self.group.batch_issue(ops)? };
            wait_all(works).await
        })
    }

    pub fn destroy(&self) -> Result<()> {
        self.rt.block_on(self.group.destroy())
    }
}
