use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::membership;
use super::{Communicator, ProcessGroup, ready_key};
use crate::config::FlagcxConfig;
use crate::device::{DeviceAdapter, HostAdapter};
use crate::error::{FlagcxError, Result};
use crate::fabric::{Fabric, GroupHealth, endpoint_key};
use crate::protocol::WireMessage;
use crate::store::{InMemoryStore, PrefixStore, Store};
use crate::types::{GroupId, Rank};

/// This process's view of the world: its rank, the rendezvous store and the
/// device adapter every group it creates will share.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct World {
    inner: Arc<WorldInner>,
}

struct WorldInner {
    rank: Rank,
    world_size: u32,
    store: Arc<dyn Store>,
    adapter: Arc<dyn DeviceAdapter>,
    config: FlagcxConfig,
    /// Groups created so far per membership list, for automatic labels.
    created: Mutex<HashMap<Vec<Rank>, u64>>,
}

impl World {
    /// Describe this process's place in a world of `world_size` ranks.
    ///
    /// Rank and size come from whatever launched the process; the store must
    /// be shared by every rank.
    pub fn init(
        rank: Rank,
        world_size: u32,
        store: Arc<dyn Store>,
        adapter: Arc<dyn DeviceAdapter>,
        config: FlagcxConfig,
    ) -> Result<Self> {
        if world_size == 0 {
            return Err(FlagcxError::config("world size must be at least 1"));
        }
        if rank >= world_size {
            return Err(FlagcxError::InvalidRank {
                rank,
                size: world_size,
            });
        }
        tracing::debug!(rank, world_size, device = %adapter.kind(), "world initialised");
        Ok(Self {
            inner: Arc::new(WorldInner {
                rank,
                world_size,
                store,
                adapter,
                config,
                created: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// All ranks of a world inside this process, sharing an in-memory store
    /// and using host memory. Useful for tests and single-node runs.
    pub fn bootstrap_local(world_size: u32) -> Result<Vec<World>> {
        Self::bootstrap_local_with(world_size, Arc::new(HostAdapter::new()), FlagcxConfig::default())
    }

    /// Like [`bootstrap_local`](Self::bootstrap_local) with a chosen adapter
    /// and configuration.
    pub fn bootstrap_local_with(
        world_size: u32,
        adapter: Arc<dyn DeviceAdapter>,
        config: FlagcxConfig,
    ) -> Result<Vec<World>> {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        (0..world_size)
            .map(|rank| {
                World::init(
                    rank,
                    world_size,
                    Arc::clone(&store),
                    Arc::clone(&adapter),
                    config.clone(),
                )
            })
            .collect()
    }

    pub fn rank(&self) -> Rank {
        self.inner.rank
    }

    pub fn world_size(&self) -> u32 {
        self.inner.world_size
    }

    pub fn adapter(&self) -> &Arc<dyn DeviceAdapter> {
        &self.inner.adapter
    }

    pub fn config(&self) -> &FlagcxConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// Every rank of the world, in order.
    pub fn all_ranks(&self) -> Vec<Rank> {
        (0..self.inner.world_size).collect()
    }

    /// Create a group over `ranks`, in that order.
    ///
    /// Every listed rank must call this with the same list, and must create
    /// its groups over that list in the same order as the other members:
    /// the n-th group over a membership gets the same label everywhere.
    pub async fn new_group(&self, ranks: &[Rank]) -> Result<ProcessGroup> {
        membership::validate(ranks, self.inner.world_size, self.inner.rank)?;
        let nth = {
            let mut created = self
                .inner
                .created
                .lock()
                .map_err(|_| FlagcxError::config("group counter lock poisoned"))?;
            let counter = created.entry(ranks.to_vec()).or_insert(0);
            let nth = *counter;
            *counter += 1;
            nth
        };
        self.create(membership::auto_label(ranks, nth), ranks).await
    }

    /// Create a group under an explicit label.
    ///
    /// The first member to register the label fixes the membership; a member
    /// arriving with a different list fails with `GroupConfig` and leaves the
    /// registered group untouched. Labels cannot be reused after destroy.
    pub async fn new_group_with_label(&self, label: &str, ranks: &[Rank]) -> Result<ProcessGroup> {
        if label.is_empty() || label.contains('/') {
            return Err(FlagcxError::config(format!(
                "group label '{label}' must be non-empty and contain no '/'"
            )));
        }
        self.create(label.to_string(), ranks).await
    }

    async fn create(&self, label: String, ranks: &[Rank]) -> Result<ProcessGroup> {
        let inner = &self.inner;
        let group_rank = membership::validate(ranks, inner.world_size, inner.rank)?;
        let size = ranks.len() as u32;
        let store = PrefixStore::new(format!("flagcx/group/{label}"), Arc::clone(&inner.store));

        if store.get(&super::exit_key(group_rank), Duration::ZERO).await.is_ok() {
            return Err(FlagcxError::config(format!(
                "group '{label}' was already created and destroyed"
            )));
        }

        let ours = membership::encode(ranks);
        let registered = store.put_if_absent("members", &ours).await?;
        if registered != ours {
            return Err(membership::mismatch(&label, ranks, &registered));
        }

        let id = GroupId::from_label(&label);
        let health = Arc::new(GroupHealth::new(&label));
        let fabric = Fabric::bind(
            id,
            group_rank,
            size,
            store.clone(),
            inner.config.clone(),
            Arc::clone(&health),
        )?;
        store
            .put(&endpoint_key(group_rank), &fabric.endpoint_record().encode()?)
            .await?;

        store.put(&ready_key(group_rank), &[1]).await?;
        for r in 0..size {
            store
                .get(&ready_key(r), inner.config.store_timeout)
                .await
                .map_err(|e| match e {
                    FlagcxError::StoreTimeout { timeout_ms, .. } => FlagcxError::config(format!(
                        "group '{label}': rank {} did not join within {timeout_ms}ms",
                        ranks[r as usize]
                    )),
                    other => other,
                })?;
        }

        tracing::info!(
            group = %label,
            %id,
            rank = group_rank,
            world_rank = inner.rank,
            size,
            "process group created"
        );
        Ok(ProcessGroup {
            comm: Arc::new(Communicator {
                label,
                id,
                rank: group_rank,
                members: ranks.to_vec(),
                fabric,
                adapter: Arc::clone(&inner.adapter),
                config: inner.config.clone(),
                health,
                store,
                seq: AtomicU64::new(0),
            }),
        })
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("rank", &self.inner.rank)
            .field("world_size", &self.inner.world_size)
            .field("device", &self.inner.adapter.kind())
            .finish()
    }
}
