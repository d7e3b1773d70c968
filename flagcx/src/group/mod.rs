//! Process groups: ordered subsets of a world with their own channels and
//! their own collective sequence.

mod membership;
mod world;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::FlagcxConfig;
use crate::device::DeviceAdapter;
use crate::error::{FlagcxError, Result};
use crate::fabric::{Channel, ChannelKey, Direction, Fabric, GroupHealth, GroupState};
use crate::store::{PrefixStore, Store};
use crate::types::{GroupId, Rank};
use crate::work::Work;

pub use world::World;

/// Backend identifier appended to the device prefix in [`ProcessGroup::backend_name`].
pub const BACKEND_NAME: &str = "flagcx";

/// Everything a member needs to run operations on one group.
pub(crate) struct Communicator {
    pub(crate) label: String,
    pub(crate) id: GroupId,
    /// This member's rank within the group.
    pub(crate) rank: Rank,
    /// World ranks, indexed by group rank.
    pub(crate) members: Vec<Rank>,
    pub(crate) fabric: Fabric,
    pub(crate) adapter: Arc<dyn DeviceAdapter>,
    pub(crate) config: FlagcxConfig,
    pub(crate) health: Arc<GroupHealth>,
    pub(crate) store: PrefixStore,
    seq: AtomicU64,
}

impl Communicator {
    pub(crate) fn size(&self) -> u32 {
        self.members.len() as u32
    }

    /// Claim the tag for the next collective. Every member claims tags in
    /// call order, so the K-th collective on each rank gets the same tag.
    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank >= self.size() {
            return Err(FlagcxError::InvalidRank {
                rank,
                size: self.size(),
            });
        }
        Ok(())
    }
}

/// Handle to a process group. Cheap to clone; clones share the group.
///
/// Peers in every operation are group ranks, `0..size()`, in the order of
/// the membership list the group was created with.
#[derive(Clone)]
pub struct ProcessGroup {
    pub(crate) comm: Arc<Communicator>,
}

impl ProcessGroup {
    pub fn label(&self) -> &str {
        &self.comm.label
    }

    pub fn id(&self) -> GroupId {
        self.comm.id
    }

    /// This member's rank within the group.
    pub fn rank(&self) -> Rank {
        self.comm.rank
    }

    pub fn size(&self) -> u32 {
        self.comm.size()
    }

    /// World ranks of the members, in group-rank order.
    pub fn members(&self) -> &[Rank] {
        &self.comm.members
    }

    /// World rank of group rank `group_rank`.
    pub fn global_rank(&self, group_rank: Rank) -> Result<Rank> {
        self.comm.check_rank(group_rank)?;
        Ok(self.comm.members[group_rank as usize])
    }

    /// Group rank of world rank `global`, if it is a member.
    pub fn group_rank(&self, global: Rank) -> Option<Rank> {
        self.comm
            .members
            .iter()
            .position(|&r| r == global)
            .map(|i| i as Rank)
    }

    pub fn state(&self) -> GroupState {
        self.comm.health.state()
    }

    /// Tag the next collective issued on this group will carry.
    pub fn sequence_number(&self) -> u64 {
        self.comm.seq.load(Ordering::Relaxed)
    }

    /// `"<device>:flagcx"`, the name the group registers under.
    pub fn backend_name(&self) -> String {
        format!("{}:{BACKEND_NAME}", self.comm.adapter.kind().prefix())
    }

    pub fn config(&self) -> &FlagcxConfig {
        &self.comm.config
    }

    /// Look up or lazily create the channel to `peer` in `direction`.
    pub fn get_or_create_channel(&self, peer: Rank, direction: Direction) -> Result<Channel> {
        self.comm.health.check()?;
        self.comm.fabric.get_or_create_channel(ChannelKey {
            group: self.comm.id,
            local: self.comm.rank,
            peer,
            direction,
        })
    }

    /// Channels currently held by this member, both directions.
    pub fn channel_count(&self) -> usize {
        self.comm.fabric.channel_count()
    }

    /// Tear the group down.
    ///
    /// Collective: members wait for each other (bounded by the store
    /// timeout) so nobody closes channels a peer is still draining. Then
    /// every channel and the endpoint are closed and outstanding receives
    /// fail. Any later use of this handle, or a clone of it, fails with
    /// `GroupDestroyed`. Works still in flight must be waited before
    /// destroying.
    pub async fn destroy(&self) -> Result<()> {
        let comm = &self.comm;
        if !comm.health.mark_destroyed() {
            return Err(FlagcxError::GroupDestroyed {
                group: comm.label.clone(),
            });
        }

        if let Err(e) = exit_barrier(comm).await {
            tracing::warn!(
                group = %comm.label,
                rank = comm.rank,
                error = %e,
                "exit barrier incomplete, closing anyway"
            );
        }

        comm.fabric
            .shutdown("process group destroyed", comm.config.keep_alive)
            .await;
        tracing::info!(group = %comm.label, rank = comm.rank, "process group destroyed");
        Ok(())
    }

    /// Issue an operation as a [`Work`]. Fails fast if the group is not
    /// active; otherwise claims the next collective tag and spawns `body`.
    pub(crate) fn launch<F, Fut>(&self, operation: &'static str, body: F) -> Result<Work>
    where
        F: FnOnce(Arc<Communicator>, u64) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.comm.health.check()?;
        let seq = self.comm.next_seq();
        tracing::trace!(group = %self.comm.label, rank = self.comm.rank, seq, operation, "issue");
        let fut = body(Arc::clone(&self.comm), seq);
        Ok(self.spawn_work(operation, fut))
    }

    /// Wrap an already validated future in a [`Work`] without claiming a
    /// collective tag.
    pub(crate) fn spawn_work<Fut>(&self, operation: &'static str, fut: Fut) -> Work
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Work::spawn(
            operation,
            self.comm.rank,
            Arc::clone(&self.comm.health),
            Arc::clone(&self.comm.adapter),
            fut,
        )
    }
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("label", &self.comm.label)
            .field("rank", &self.comm.rank)
            .field("members", &self.comm.members)
            .field("state", &self.state())
            .finish()
    }
}

async fn exit_barrier(comm: &Communicator) -> Result<()> {
    comm.store.put(&exit_key(comm.rank), &[1]).await?;
    for r in 0..comm.size() {
        comm.store
            .get(&exit_key(r), comm.config.store_timeout)
            .await?;
    }
    Ok(())
}

pub(crate) fn exit_key(rank: Rank) -> String {
    format!("exit/{rank}")
}

pub(crate) fn ready_key(rank: Rank) -> String {
    format!("ready/{rank}")
}
