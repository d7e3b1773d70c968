//! Connection fabric: the per-group cache of directed channels.
//!
//! Channels are keyed by `(group, local rank, peer rank, direction)` and
//! created lazily on first request; the same key always yields the same
//! channel until the group is torn down. A send channel dials its peer only
//! when the first frame is queued, looking up the peer's endpoint record in
//! the group's store scope. A receive channel exists as soon as either side
//! needs it: the accept loop creates it when a peer dials in, a receive
//! creates it when posted first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::FlagcxConfig;
use crate::error::{FlagcxError, Result};
use crate::protocol::{ChannelHello, EndpointRecord, WireMessage};
use crate::store::{PrefixStore, Store};
use crate::transport::endpoint::{GroupEndpoint, HelloVerdict, judge_hello};
use crate::transport::{RecvChannel, SendChannel, channel::run_reader};
use crate::types::{GroupId, PROTOCOL_VERSION, Rank};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub group: GroupId,
    pub local: Rank,
    pub peer: Rank,
    pub direction: Direction,
}

#[derive(Clone)]
pub enum Channel {
    Send(Arc<SendChannel>),
    Recv(Arc<RecvChannel>),
}

/// Lifecycle state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Active,
    /// A channel, device or transfer failure happened; the group must be
    /// destroyed and not reused.
    Broken,
    Destroyed,
}

const ACTIVE: u8 = 0;
const BROKEN: u8 = 1;
const DESTROYED: u8 = 2;

pub(crate) struct GroupHealth {
    label: String,
    state: AtomicU8,
    reason: Mutex<Option<String>>,
}

impl GroupHealth {
    pub(crate) fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: AtomicU8::new(ACTIVE),
            reason: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> GroupState {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => GroupState::Active,
            BROKEN => GroupState::Broken,
            _ => GroupState::Destroyed,
        }
    }

    /// `Ok` only while the group is active.
    pub(crate) fn check(&self) -> Result<()> {
        match self.state() {
            GroupState::Active => Ok(()),
            GroupState::Destroyed => Err(FlagcxError::GroupDestroyed {
                group: self.label.clone(),
            }),
            GroupState::Broken => Err(FlagcxError::GroupUnusable {
                group: self.label.clone(),
                reason: self
                    .reason
                    .lock()
                    .ok()
                    .and_then(|r| r.clone())
                    .unwrap_or_default(),
            }),
        }
    }

    pub(crate) fn mark_broken(&self, reason: &str) {
        if self
            .state
            .compare_exchange(ACTIVE, BROKEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Ok(mut r) = self.reason.lock() {
                *r = Some(reason.to_string());
            }
            tracing::warn!(group = %self.label, reason, "process group is no longer usable");
        }
    }

    /// Returns false if the group was already destroyed.
    pub(crate) fn mark_destroyed(&self) -> bool {
        self.state.swap(DESTROYED, Ordering::AcqRel) != DESTROYED
    }

    /// Record `err` against the group if it is fatal, then hand it back.
    pub(crate) fn observe(&self, err: FlagcxError) -> FlagcxError {
        if err.is_fatal_to_group() {
            self.mark_broken(&err.to_string());
        }
        err
    }
}

type RecvMap = Arc<Mutex<HashMap<Rank, Arc<RecvChannel>>>>;

pub struct Fabric {
    group: GroupId,
    rank: Rank,
    size: u32,
    endpoint: Arc<GroupEndpoint>,
    store: PrefixStore,
    config: FlagcxConfig,
    health: Arc<GroupHealth>,
    send: Mutex<HashMap<Rank, Arc<SendChannel>>>,
    recv: RecvMap,
    accept_task: JoinHandle<()>,
}

impl Fabric {
    /// Bind this member's endpoint and start accepting channels.
    ///
    /// The endpoint record still has to be published (see
    /// [`endpoint_record`](Self::endpoint_record)) before peers can dial.
    pub(crate) fn bind(
        group: GroupId,
        rank: Rank,
        size: u32,
        store: PrefixStore,
        config: FlagcxConfig,
        health: Arc<GroupHealth>,
    ) -> Result<Self> {
        let endpoint = Arc::new(GroupEndpoint::bind(config.bind_addr, config.keep_alive)?);
        let recv: RecvMap = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&endpoint),
            Arc::clone(&recv),
            group,
            rank,
            size,
        ));
        tracing::debug!(%group, rank, addr = %endpoint.local_addr(), "group endpoint bound");
        Ok(Self {
            group,
            rank,
            size,
            endpoint,
            store,
            config,
            health,
            send: Mutex::new(HashMap::new()),
            recv,
            accept_task,
        })
    }

    pub fn endpoint_record(&self) -> EndpointRecord {
        self.endpoint.record()
    }

    /// Look up or lazily create the channel for `key`. Idempotent.
    pub fn get_or_create_channel(&self, key: ChannelKey) -> Result<Channel> {
        if key.group != self.group || key.local != self.rank {
            return Err(FlagcxError::config(format!(
                "channel key {key:?} does not belong to group {} rank {}",
                self.group, self.rank
            )));
        }
        match key.direction {
            Direction::Send => self.send_channel(key.peer).map(Channel::Send),
            Direction::Recv => self.recv_channel(key.peer).map(Channel::Recv),
        }
    }

    pub(crate) fn send_channel(&self, peer: Rank) -> Result<Arc<SendChannel>> {
        self.check_peer(peer)?;
        let mut send = self.send.lock().map_err(|_| poisoned(peer))?;
        if let Some(ch) = send.get(&peer) {
            return Ok(Arc::clone(ch));
        }
        let ch = if peer == self.rank {
            Arc::new(SendChannel::loopback(self.recv_channel(peer)?))
        } else {
            let health = Arc::clone(&self.health);
            Arc::new(SendChannel::remote(
                peer,
                Box::pin(dial_peer(
                    Arc::clone(&self.endpoint),
                    self.store.clone(),
                    self.config.clone(),
                    ChannelHello {
                        protocol_version: PROTOCOL_VERSION,
                        group_id: self.group.0,
                        src_rank: self.rank,
                        dst_rank: peer,
                    },
                )),
                Arc::new(move |e: &FlagcxError| health.mark_broken(&e.to_string())),
            ))
        };
        send.insert(peer, Arc::clone(&ch));
        Ok(ch)
    }

    pub(crate) fn recv_channel(&self, peer: Rank) -> Result<Arc<RecvChannel>> {
        self.check_peer(peer)?;
        let mut recv = self.recv.lock().map_err(|_| poisoned(peer))?;
        Ok(Arc::clone(
            recv.entry(peer)
                .or_insert_with(|| Arc::new(RecvChannel::new(peer))),
        ))
    }

    fn check_peer(&self, peer: Rank) -> Result<()> {
        if peer >= self.size {
            return Err(FlagcxError::InvalidRank {
                rank: peer,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Number of channels currently cached, both directions.
    pub fn channel_count(&self) -> usize {
        let send = self.send.lock().map(|s| s.len()).unwrap_or(0);
        let recv = self.recv.lock().map(|r| r.len()).unwrap_or(0);
        send + recv
    }

    /// Drain and close every channel, then the endpoint. Outstanding
    /// receives fail with `reason`.
    pub(crate) async fn shutdown(&self, reason: &str, drain_timeout: Duration) {
        let sends: Vec<Arc<SendChannel>> = self
            .send
            .lock()
            .map(|mut s| s.drain().map(|(_, ch)| ch).collect())
            .unwrap_or_default();
        futures::future::join_all(sends.iter().map(|ch| ch.close(drain_timeout))).await;

        let recvs: Vec<Arc<RecvChannel>> = self
            .recv
            .lock()
            .map(|mut r| r.drain().map(|(_, ch)| ch).collect())
            .unwrap_or_default();
        for ch in &recvs {
            ch.close(reason);
        }

        self.accept_task.abort();
        self.endpoint.close();
        self.endpoint.wait_idle(drain_timeout).await;
        tracing::debug!(group = %self.group, rank = self.rank, "fabric shut down");
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.endpoint.close();
    }
}

fn poisoned(peer: Rank) -> FlagcxError {
    FlagcxError::connect(peer, "channel table lock poisoned")
}

pub(crate) fn endpoint_key(rank: Rank) -> String {
    format!("endpoint/{rank}")
}

async fn dial_peer(
    endpoint: Arc<GroupEndpoint>,
    store: PrefixStore,
    config: FlagcxConfig,
    hello: ChannelHello,
) -> Result<crate::transport::channel::DialedStream> {
    let peer = hello.dst_rank;
    let raw = store
        .get(&endpoint_key(peer), config.store_timeout)
        .await
        .map_err(|e| FlagcxError::connect(peer, format!("endpoint lookup failed: {e}")))?;
    let record = EndpointRecord::decode(&raw)?;
    tracing::debug!(peer, addr = %record.addr, "dialing peer");
    match tokio::time::timeout(config.connect_timeout, endpoint.dial(&record, &hello)).await {
        Ok(result) => result,
        Err(_) => Err(FlagcxError::connect(
            peer,
            format!(
                "handshake timed out after {}s",
                config.connect_timeout.as_secs()
            ),
        )),
    }
}

async fn accept_loop(
    endpoint: Arc<GroupEndpoint>,
    recv: RecvMap,
    group: GroupId,
    rank: Rank,
    size: u32,
) {
    while let Some(next) = endpoint.accept().await {
        let recv = Arc::clone(&recv);
        tokio::spawn(async move {
            let inbound = match next {
                Ok(inbound) => inbound,
                Err(e) => {
                    tracing::warn!(%group, rank, error = %e, "inbound channel handshake failed");
                    return;
                }
            };
            let src = inbound.hello.src_rank;
            let verdict = judge_hello(&inbound.hello, group.0, rank, size);
            if verdict != HelloVerdict::Accepted {
                tracing::warn!(%group, rank, src, ?verdict, "rejecting inbound channel");
            }
            let (conn, stream) = match inbound.answer(verdict).await {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(%group, rank, src, error = %e, "failed to answer inbound channel");
                    return;
                }
            };
            let channel = match recv.lock() {
                Ok(mut map) => Arc::clone(
                    map.entry(src)
                        .or_insert_with(|| Arc::new(RecvChannel::new(src))),
                ),
                Err(_) => return,
            };
            tracing::debug!(%group, rank, src, "receive channel established");
            run_reader(stream, channel).await;
            drop(conn);
        });
    }
}
