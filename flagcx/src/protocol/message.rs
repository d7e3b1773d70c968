use crate::error::{FlagcxError, Result};
use crate::types::Rank;

/// Request/response traffic between a [`TcpStore`](crate::store::TcpStore)
/// client and its [`StoreServer`](crate::store::StoreServer).
///
/// Every request carries a `req_id` echoed by the response, so one connection
/// can have several blocking `Get`s outstanding at once.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum StoreMessage {
    Put {
        req_id: u64,
        key: String,
        value: Vec<u8>,
    },
    /// Wait up to `timeout_ms` for `key` to exist.
    Get {
        req_id: u64,
        key: String,
        timeout_ms: u64,
    },
    PutIfAbsent {
        req_id: u64,
        key: String,
        value: Vec<u8>,
    },
    Done {
        req_id: u64,
    },
    Value {
        req_id: u64,
        value: Vec<u8>,
    },
    TimedOut {
        req_id: u64,
    },
    Failed {
        req_id: u64,
        reason: String,
    },
}

impl StoreMessage {
    pub fn req_id(&self) -> u64 {
        match self {
            StoreMessage::Put { req_id, .. }
            | StoreMessage::Get { req_id, .. }
            | StoreMessage::PutIfAbsent { req_id, .. }
            | StoreMessage::Done { req_id }
            | StoreMessage::Value { req_id, .. }
            | StoreMessage::TimedOut { req_id }
            | StoreMessage::Failed { req_id, .. } => *req_id,
        }
    }
}

/// First message on every data channel, written by the dialing side.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub struct ChannelHello {
    pub protocol_version: u16,
    pub group_id: u64,
    /// Group rank of the sender.
    pub src_rank: Rank,
    /// Group rank the sender believes it dialed.
    pub dst_rank: Rank,
}

/// Where a group member's endpoint listens, published through the group's
/// store scope.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub struct EndpointRecord {
    pub addr: String,
    /// DER of the endpoint's self-signed certificate; dialers trust exactly this.
    pub cert_der: Vec<u8>,
}

/// rkyv encoding for control messages.
pub trait WireMessage: Sized {
    fn encode(&self) -> Result<Vec<u8>>;
    fn decode(bytes: &[u8]) -> Result<Self>;
}

macro_rules! impl_wire_message {
    ($($ty:ty),*) => {
        $(
            impl WireMessage for $ty {
                fn encode(&self) -> Result<Vec<u8>> {
                    rkyv::to_bytes::<rkyv::rancor::Error>(self)
                        .map(|bytes| bytes.to_vec())
                        .map_err(|e| FlagcxError::EncodeFailed(e.to_string()))
                }

                fn decode(bytes: &[u8]) -> Result<Self> {
                    rkyv::from_bytes::<$ty, rkyv::rancor::Error>(bytes)
                        .map_err(|e| FlagcxError::DecodeFailed(e.to_string()))
                }
            }
        )*
    };
}

impl_wire_message!(StoreMessage, ChannelHello, EndpointRecord);
