//! Multi-group collective communication over QUIC.
//!
//! A [`World`] describes this process's rank and how to reach the others
//! (a shared [`Store`]). From it, any number of [`ProcessGroup`]s can be
//! created over ordered subsets of the world; each group owns its own
//! endpoint, channels and collective sequence, so groups over the same
//! ranks never see each other's traffic.
//!
//! Collectives and non-blocking point-to-point calls return a [`Work`].
//! Device memory is reached through a [`DeviceAdapter`] chosen once per
//! world.

pub mod blocking;
pub mod collective;
pub mod config;
pub mod device;
pub mod error;
pub mod fabric;
pub mod group;
pub mod memory;
pub mod p2p;
pub mod protocol;
pub mod reduce;
pub mod store;
pub mod transport;
pub mod types;
pub mod work;

pub use blocking::{SyncGroup, SyncWorld};
pub use config::FlagcxConfig;
pub use device::{DeviceAdapter, DeviceCapabilities, DeviceKind, HostAdapter, select_adapter};
pub use error::{FlagcxError, Result};
pub use fabric::{Channel, ChannelKey, Direction, GroupState};
pub use group::{BACKEND_NAME, ProcessGroup, World};
pub use memory::{Buffer, Element};
pub use p2p::{P2PKind, P2POp, plan_batch};
pub use store::{InMemoryStore, PrefixStore, Store, StoreServer, TcpStore};
pub use types::{DataType, GroupId, Rank, ReduceOp};
pub use work::{Work, WorkStatus, wait_all};
