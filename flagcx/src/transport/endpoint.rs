use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rustls::pki_types::CertificateDer;

use crate::error::{FlagcxError, Result};
use crate::protocol::codec::{read_prefixed, write_prefixed};
use crate::protocol::{ChannelHello, EndpointRecord, WireMessage};
use crate::transport::channel::DialedStream;
use crate::transport::tls::{
    SERVER_NAME, generate_self_signed_cert, make_client_config, make_server_config,
};
use crate::types::{PROTOCOL_VERSION, Rank};

/// Handshake verdicts written back to the dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HelloVerdict {
    Accepted = 0,
    WrongGroup = 1,
    WrongRank = 2,
    VersionMismatch = 3,
}

impl HelloVerdict {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Accepted),
            1 => Some(Self::WrongGroup),
            2 => Some(Self::WrongRank),
            3 => Some(Self::VersionMismatch),
            _ => None,
        }
    }
}

/// A channel a peer opened towards us, after its hello was read.
pub struct InboundChannel {
    pub hello: ChannelHello,
    pub conn: quinn::Connection,
    pub stream: quinn::RecvStream,
    ack: quinn::SendStream,
}

impl InboundChannel {
    /// Tell the dialer whether the channel is accepted. Rejected channels
    /// are closed.
    pub async fn answer(mut self, verdict: HelloVerdict) -> Result<Option<(quinn::Connection, quinn::RecvStream)>> {
        self.ack
            .write_all(&[verdict as u8])
            .await
            .map_err(|e| FlagcxError::connect(self.hello.src_rank, e.to_string()))?;
        let _ = self.ack.finish();
        if verdict == HelloVerdict::Accepted {
            Ok(Some((self.conn, self.stream)))
        } else {
            self.conn.close(1u32.into(), b"channel rejected");
            Ok(None)
        }
    }
}

/// One QUIC endpoint per group member. It both accepts channels from peers
/// and dials channels to them.
pub struct GroupEndpoint {
    endpoint: quinn::Endpoint,
    cert_der: CertificateDer<'static>,
    local_addr: SocketAddr,
    keep_alive: Duration,
}

impl GroupEndpoint {
    /// Bind on an ephemeral port of `ip` with a freshly generated certificate.
    pub fn bind(ip: IpAddr, keep_alive: Duration) -> Result<Self> {
        let (cert_der, key_der) = generate_self_signed_cert()?;
        let server_config = make_server_config(cert_der.clone(), key_der, keep_alive)?;
        let endpoint = quinn::Endpoint::server(server_config, SocketAddr::new(ip, 0))?;
        let local_addr = endpoint.local_addr()?;
        Ok(Self {
            endpoint,
            cert_der,
            local_addr,
            keep_alive,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// What peers need to dial us.
    pub fn record(&self) -> EndpointRecord {
        EndpointRecord {
            addr: self.local_addr.to_string(),
            cert_der: self.cert_der.to_vec(),
        }
    }

    /// Dial `record`, send `hello` and wait for the verdict.
    pub async fn dial(&self, record: &EndpointRecord, hello: &ChannelHello) -> Result<DialedStream> {
        let peer = hello.dst_rank;
        let fail = |reason: String| FlagcxError::connect(peer, reason);

        let addr: SocketAddr = record
            .addr
            .parse()
            .map_err(|e| fail(format!("bad endpoint address '{}': {e}", record.addr)))?;
        let client_config =
            make_client_config(CertificateDer::from(record.cert_der.clone()), self.keep_alive)?;

        let conn = self
            .endpoint
            .connect_with(client_config, addr, SERVER_NAME)
            .map_err(|e| fail(e.to_string()))?
            .await
            .map_err(|e| fail(e.to_string()))?;
        let (mut stream, mut verdict_stream) =
            conn.open_bi().await.map_err(|e| fail(e.to_string()))?;

        write_prefixed(&mut stream, &hello.encode()?)
            .await
            .map_err(|e| fail(e.to_string()))?;
        let mut verdict = [0u8; 1];
        verdict_stream
            .read_exact(&mut verdict)
            .await
            .map_err(|e| fail(format!("no handshake verdict: {e}")))?;

        match HelloVerdict::from_u8(verdict[0]) {
            Some(HelloVerdict::Accepted) => Ok(DialedStream { conn, stream }),
            other => {
                conn.close(1u32.into(), b"handshake rejected");
                Err(fail(format!("peer rejected handshake: {other:?}")))
            }
        }
    }

    /// Wait for the next peer to open a channel. `None` once the endpoint
    /// is closed.
    pub async fn accept(&self) -> Option<Result<InboundChannel>> {
        let incoming = self.endpoint.accept().await?;
        Some(accept_one(incoming).await)
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"group destroyed");
    }

    /// Wait (bounded) for connections to finish closing.
    pub async fn wait_idle(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.endpoint.wait_idle()).await;
    }
}

async fn accept_one(incoming: quinn::Incoming) -> Result<InboundChannel> {
    let conn = incoming
        .await
        .map_err(|e| FlagcxError::connect(Rank::MAX, e.to_string()))?;
    let (ack, mut stream) = conn
        .accept_bi()
        .await
        .map_err(|e| FlagcxError::connect(Rank::MAX, e.to_string()))?;
    let body = read_prefixed(&mut stream)
        .await?
        .ok_or_else(|| FlagcxError::connect(Rank::MAX, "stream ended before hello"))?;
    let hello = ChannelHello::decode(&body)?;
    Ok(InboundChannel {
        hello,
        conn,
        stream,
        ack,
    })
}

/// Decide whether a hello belongs on this endpoint.
pub fn judge_hello(hello: &ChannelHello, group_id: u64, local_rank: Rank, group_size: u32) -> HelloVerdict {
    if hello.protocol_version != PROTOCOL_VERSION {
        HelloVerdict::VersionMismatch
    } else if hello.group_id != group_id {
        HelloVerdict::WrongGroup
    } else if hello.dst_rank != local_rank || hello.src_rank >= group_size {
        HelloVerdict::WrongRank
    } else {
        HelloVerdict::Accepted
    }
}
