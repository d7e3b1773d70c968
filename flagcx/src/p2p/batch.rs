use crate::memory::Buffer;
use crate::types::Rank;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum P2PKind {
    Send,
    Recv,
}

/// One entry of a batched point-to-point exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct P2POp {
    kind: P2PKind,
    buf: Buffer,
    peer: Rank,
}

impl P2POp {
    /// Send `buf` to group rank `peer`.
    pub fn send(buf: Buffer, peer: Rank) -> Self {
        Self {
            kind: P2PKind::Send,
            buf,
            peer,
        }
    }

    /// Receive into `buf` from group rank `peer`.
    pub fn recv(buf: Buffer, peer: Rank) -> Self {
        Self {
            kind: P2PKind::Recv,
            buf,
            peer,
        }
    }

    pub fn kind(&self) -> P2PKind {
        self.kind
    }

    pub fn buffer(&self) -> Buffer {
        self.buf
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }
}

/// Order in which [`batch_issue`](crate::ProcessGroup::batch_issue) hands
/// the entries of `ops` to the channels, as indices into `ops`.
///
/// Sends go first, then receives, each in list order. Issuing never waits
/// on the peer, so any order is free of deadlock; keeping list order within
/// a direction keeps the per-peer FIFO that matches a send with its receive.
pub fn plan_batch(ops: &[P2POp]) -> Vec<usize> {
    let sends = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.kind == P2PKind::Send)
        .map(|(i, _)| i);
    let recvs = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.kind == P2PKind::Recv)
        .map(|(i, _)| i);
    sends.chain(recvs).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_puts_sends_first_and_keeps_list_order() {
        let mut a = [0f32; 2];
        let mut b = [0f32; 2];
        let ba = Buffer::from_slice(&mut a);
        let bb = Buffer::from_slice(&mut b);
        let ops = [
            P2POp::recv(ba, 1),
            P2POp::send(bb, 3),
            P2POp::recv(ba, 2),
            P2POp::send(bb, 1),
        ];
        assert_eq!(plan_batch(&ops), vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_plan_empty() {
        assert!(plan_batch(&[]).is_empty());
    }

    #[test]
    fn test_op_accessors() {
        let mut a = [0u8; 4];
        let op = P2POp::send(Buffer::from_slice(&mut a), 5);
        assert_eq!(op.kind(), P2PKind::Send);
        assert_eq!(op.peer(), 5);
        assert_eq!(op.buffer().count(), 4);
    }
}
