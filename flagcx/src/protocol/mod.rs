pub mod codec;
pub mod message;

pub use codec::{FrameKey, Lane};
pub use message::{ChannelHello, EndpointRecord, StoreMessage, WireMessage};
