pub mod channel;
pub mod endpoint;
pub mod tls;

pub use channel::{PendingSend, PostedRecv, RecvChannel, SendChannel};
pub use endpoint::GroupEndpoint;
