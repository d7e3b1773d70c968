//! Stream framing shared by the store protocol and data channels.
//!
//! Control messages are `[len u32 LE][rkyv payload]`. Data frames carry a
//! fixed 17-byte header `[lane u8][tag u64 LE][len u64 LE]` followed by the
//! raw payload, so tensor bytes never pass through rkyv.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FlagcxError, Result};

/// Upper bound on a control message body.
pub const MAX_CONTROL_BYTES: usize = 16 * 1024 * 1024;

pub const FRAME_HEADER_SIZE: usize = 17;

/// Which matching space a data frame belongs to. Collective traffic and
/// point-to-point traffic never match each other even with equal tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Lane {
    Collective = 0,
    P2p = 1,
}

impl Lane {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Lane::Collective),
            1 => Some(Lane::P2p),
            _ => None,
        }
    }
}

/// Key used to match an incoming frame with a posted receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub lane: Lane,
    pub tag: u64,
}

impl FrameKey {
    pub const fn collective(seq: u64) -> Self {
        Self {
            lane: Lane::Collective,
            tag: seq,
        }
    }

    pub const fn p2p(tag: u64) -> Self {
        Self {
            lane: Lane::P2p,
            tag,
        }
    }
}

pub fn encode_frame_header(key: FrameKey, len: usize) -> [u8; FRAME_HEADER_SIZE] {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header[0] = key.lane as u8;
    header[1..9].copy_from_slice(&key.tag.to_le_bytes());
    header[9..17].copy_from_slice(&(len as u64).to_le_bytes());
    header
}

pub fn decode_frame_header(header: &[u8; FRAME_HEADER_SIZE]) -> Result<(FrameKey, usize)> {
    let lane = Lane::from_u8(header[0])
        .ok_or_else(|| FlagcxError::DecodeFailed(format!("unknown lane {}", header[0])))?;
    let mut tag = [0u8; 8];
    tag.copy_from_slice(&header[1..9]);
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[9..17]);
    let len = usize::try_from(u64::from_le_bytes(len))
        .map_err(|_| FlagcxError::DecodeFailed("frame length overflows usize".into()))?;
    Ok((
        FrameKey {
            lane,
            tag: u64::from_le_bytes(tag),
        },
        len,
    ))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    key: FrameKey,
    payload: &[u8],
) -> Result<()> {
    writer
        .write_all(&encode_frame_header(key, payload.len()))
        .await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Read one data frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<(FrameKey, Vec<u8>)>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let (key, len) = decode_frame_header(&header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((key, payload)))
}

pub async fn write_prefixed<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_CONTROL_BYTES {
        return Err(FlagcxError::EncodeFailed(format!(
            "control message of {} bytes exceeds {MAX_CONTROL_BYTES}",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(body).await?;
    Ok(())
}

/// Read one length-prefixed control message. `Ok(None)` on a clean end of stream.
pub async fn read_prefixed<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_CONTROL_BYTES {
        return Err(FlagcxError::DecodeFailed(format!(
            "control message of {len} bytes exceeds {MAX_CONTROL_BYTES}"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}
