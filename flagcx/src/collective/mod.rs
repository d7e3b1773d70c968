//! Collective operations on a [`ProcessGroup`].
//!
//! Every collective claims the group's next sequence number when issued and
//! tags its frames with it. Ranks therefore match collectives by call order:
//! the K-th collective issued on a group on one rank pairs with the K-th on
//! every other member. Issuing collectives in different orders on different
//! ranks is a caller error the engine cannot detect; it ends in a transfer
//! timeout or a size mismatch.
//!
//! All entry points are `unsafe` because the buffers are raw device or host
//! addresses that must outlive the returned [`Work`].

mod allgather;
mod allreduce;
mod alltoall;
mod barrier;
mod broadcast;
mod gather;
mod helpers;
mod reduce;
mod reduce_scatter;
mod scatter;

use crate::error::{FlagcxError, Result};
use crate::group::ProcessGroup;
use crate::memory::Buffer;
use crate::types::{Rank, ReduceOp};
use crate::work::Work;

impl ProcessGroup {
    /// Reduce `buf` across every member, in place. After `wait`, every
    /// member holds the same result.
    ///
    /// # Safety
    /// `buf` must stay valid and untouched until the returned work completes.
    pub unsafe fn all_reduce(&self, buf: Buffer, op: ReduceOp) -> Result<Work> {
        self.launch("all_reduce", move |comm, seq| async move {
            unsafe { allreduce::all_reduce(&comm, buf, op, seq).await }
        })
    }

    /// One allreduce over several buffers of the same dtype, sent as a
    /// single message.
    ///
    /// # Safety
    /// Every buffer must stay valid and untouched until the returned work
    /// completes.
    pub unsafe fn all_reduce_coalesced(&self, bufs: &[Buffer], op: ReduceOp) -> Result<Work> {
        allreduce::check_coalesced(bufs)?;
        let bufs = bufs.to_vec();
        self.launch("all_reduce_coalesced", move |comm, seq| async move {
            unsafe { allreduce::all_reduce_coalesced(&comm, &bufs, op, seq).await }
        })
    }

    /// Copy `root`'s `buf` into every member's `buf`.
    ///
    /// # Safety
    /// `buf` must stay valid and untouched until the returned work completes.
    pub unsafe fn broadcast(&self, buf: Buffer, root: Rank) -> Result<Work> {
        self.comm.check_rank(root)?;
        self.launch("broadcast", move |comm, seq| async move {
            unsafe { broadcast::broadcast(&comm, buf, root, seq).await }
        })
    }

    /// Reduce every member's `buf` into `root`'s `buf`.
    ///
    /// # Safety
    /// `buf` must stay valid and untouched until the returned work completes.
    pub unsafe fn reduce(&self, buf: Buffer, root: Rank, op: ReduceOp) -> Result<Work> {
        self.comm.check_rank(root)?;
        self.launch("reduce", move |comm, seq| async move {
            unsafe { reduce::reduce(&comm, buf, op, root, seq).await }
        })
    }

    /// Concatenate every member's `input` into `output`, by group rank.
    ///
    /// # Safety
    /// Both buffers must stay valid and untouched until the returned work
    /// completes, and must not overlap.
    pub unsafe fn all_gather(&self, output: Buffer, input: Buffer) -> Result<Work> {
        self.check_blocks(output, input)?;
        self.launch("all_gather", move |comm, seq| async move {
            unsafe { allgather::all_gather(&comm, output, input, seq).await }
        })
    }

    /// Reduce `input` across members and leave block `rank()` of the result
    /// in `output`.
    ///
    /// # Safety
    /// Both buffers must stay valid and untouched until the returned work
    /// completes, and must not overlap.
    pub unsafe fn reduce_scatter(&self, output: Buffer, input: Buffer, op: ReduceOp) -> Result<Work> {
        self.check_blocks(input, output)?;
        self.launch("reduce_scatter", move |comm, seq| async move {
            unsafe { reduce_scatter::reduce_scatter(&comm, output, input, op, seq).await }
        })
    }

    /// Collect every member's `input` into `root`'s `output`. Only the root
    /// passes an output buffer.
    ///
    /// # Safety
    /// Buffers must stay valid and untouched until the returned work
    /// completes, and must not overlap.
    pub unsafe fn gather(&self, input: Buffer, output: Option<Buffer>, root: Rank) -> Result<Work> {
        self.comm.check_rank(root)?;
        if self.rank() == root {
            let output = output
                .ok_or_else(|| FlagcxError::config("gather root must provide an output buffer"))?;
            self.check_blocks(output, input)?;
        }
        self.launch("gather", move |comm, seq| async move {
            unsafe { gather::gather(&comm, input, output, root, seq).await }
        })
    }

    /// Split `root`'s `input` into `size()` blocks and send block `i` to
    /// group rank `i`. Only the root passes an input buffer.
    ///
    /// # Safety
    /// Buffers must stay valid and untouched until the returned work
    /// completes, and must not overlap.
    pub unsafe fn scatter(&self, input: Option<Buffer>, output: Buffer, root: Rank) -> Result<Work> {
        self.comm.check_rank(root)?;
        if self.rank() == root {
            let input = input
                .ok_or_else(|| FlagcxError::config("scatter root must provide an input buffer"))?;
            self.check_blocks(input, output)?;
        }
        self.launch("scatter", move |comm, seq| async move {
            unsafe { scatter::scatter(&comm, input, output, root, seq).await }
        })
    }

    /// Exchange equal blocks between every pair of members.
    ///
    /// # Safety
    /// Both buffers must stay valid and untouched until the returned work
    /// completes, and must not overlap.
    pub unsafe fn all_to_all(&self, output: Buffer, input: Buffer) -> Result<Work> {
        let size = self.size() as usize;
        if input.count() % size != 0 {
            return Err(FlagcxError::IndivisibleCount {
                count: input.count(),
                size,
                operation: "all_to_all",
            });
        }
        if output.dtype() != input.dtype() || output.count() != input.count() {
            return Err(FlagcxError::BufferSizeMismatch {
                expected: input.len_bytes(),
                actual: output.len_bytes(),
            });
        }
        self.launch("all_to_all", move |comm, seq| async move {
            unsafe { alltoall::all_to_all(&comm, output, input, seq).await }
        })
    }

    /// Complete only once every member has entered the barrier.
    pub fn barrier(&self) -> Result<Work> {
        self.launch("barrier", |comm, seq| async move {
            barrier::barrier(&comm, seq).await
        })
    }

    /// `whole` must hold exactly `size()` blocks shaped like `block`.
    fn check_blocks(&self, whole: Buffer, block: Buffer) -> Result<()> {
        let expected = block.len_bytes() * self.size() as usize;
        if whole.dtype() != block.dtype() || whole.len_bytes() != expected {
            return Err(FlagcxError::BufferSizeMismatch {
                expected,
                actual: whole.len_bytes(),
            });
        }
        Ok(())
    }
}
