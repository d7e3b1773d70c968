//! Peer failure: operations against a member that has gone away fail with a
//! transfer or connect error instead of hanging, and the group stops
//! accepting work afterwards.

use std::sync::Arc;
use std::time::Duration;

use flagcx::{
    Buffer, Channel, DataType, DeviceAdapter, DeviceCapabilities, DeviceKind, Direction,
    FlagcxConfig, FlagcxError, GroupState, HostAdapter, P2POp, ProcessGroup, ReduceOp, World,
};
use tokio::sync::Barrier;

/// Short timeouts so a dead peer is noticed quickly.
fn fast_config() -> FlagcxConfig {
    FlagcxConfig {
        transfer_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        store_timeout: Duration::from_secs(5),
        ..FlagcxConfig::default()
    }
}

fn bootstrap_fast(world_size: u32) -> Vec<World> {
    let adapter: Arc<dyn DeviceAdapter> = Arc::new(HostAdapter::new());
    World::bootstrap_local_with(world_size, adapter, fast_config()).unwrap()
}

/// Every rank joins a group over the whole world; `dead` then drops its
/// handle, closing its endpoint. Survivors run `f` once that has happened.
async fn with_dead_peer<F, Fut>(world_size: u32, dead: u32, f: F)
where
    F: Fn(ProcessGroup) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let f = Arc::new(f);
    let gate = Arc::new(Barrier::new(world_size as usize));
    let handles: Vec<_> = bootstrap_fast(world_size)
        .into_iter()
        .map(|world| {
            let f = Arc::clone(&f);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let pg = world.new_group(&world.all_ranks()).await.unwrap();
                if pg.rank() == dead {
                    drop(pg);
                    gate.wait().await;
                } else {
                    gate.wait().await;
                    f(pg).await;
                }
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }
}

fn assert_peer_failure(err: &FlagcxError) {
    assert!(
        matches!(err, FlagcxError::Transfer { .. } | FlagcxError::Connect { .. }),
        "expected a transfer or connect error, got {err:?}"
    );
}

fn assert_unusable(pg: &ProcessGroup) {
    assert_eq!(pg.state(), GroupState::Broken);
    let err = pg.barrier().unwrap_err();
    assert!(matches!(err, FlagcxError::GroupUnusable { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_all_reduce_with_dead_peer_breaks_group() {
    with_dead_peer(3, 2, |pg| async move {
        let mut data = vec![1.0f32; 4];
        let work = unsafe { pg.all_reduce(Buffer::from_slice(&mut data), ReduceOp::Sum) }.unwrap();
        let err = work.wait().await.unwrap_err();
        assert_peer_failure(&err);
        assert!(err.is_fatal_to_group());
        assert_unusable(&pg);

        let mut again = vec![1.0f32; 4];
        let err = unsafe { pg.all_reduce(Buffer::from_slice(&mut again), ReduceOp::Sum) }.unwrap_err();
        assert!(matches!(err, FlagcxError::GroupUnusable { .. }));
    })
    .await;
}

#[tokio::test]
async fn test_recv_from_dead_peer_breaks_group() {
    with_dead_peer(2, 1, |pg| async move {
        let mut buf = vec![0u32; 8];
        let err = unsafe { pg.recv(Buffer::from_slice(&mut buf), 1).await }.unwrap_err();
        assert!(matches!(err, FlagcxError::Transfer { peer: 1, .. }), "got {err:?}");
        assert_unusable(&pg);

        let mut out = vec![7u32; 8];
        let err = unsafe { pg.isend(Buffer::from_slice(&mut out), 1) }.unwrap_err();
        assert!(matches!(err, FlagcxError::GroupUnusable { .. }));
    })
    .await;
}

#[tokio::test]
async fn test_send_to_dead_peer_breaks_group() {
    with_dead_peer(2, 0, |pg| async move {
        let mut out = vec![3i64; 4];
        let err = unsafe { pg.send(Buffer::from_slice(&mut out), 0).await }.unwrap_err();
        assert_peer_failure(&err);
        assert_unusable(&pg);
    })
    .await;
}

/// Host memory, except that staging from address 0 fails like a device
/// runtime error.
struct FailingStage(HostAdapter);

impl DeviceAdapter for FailingStage {
    fn kind(&self) -> DeviceKind {
        self.0.kind()
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.0.capabilities()
    }

    unsafe fn stage_for_send(&self, ptr: u64, size_bytes: usize) -> flagcx::Result<Vec<u8>> {
        if ptr == 0 {
            return Err(FlagcxError::device("copy from device failed"));
        }
        unsafe { self.0.stage_for_send(ptr, size_bytes) }
    }

    unsafe fn receive_to_device(&self, data: &[u8], dst_ptr: u64) -> flagcx::Result<()> {
        unsafe { self.0.receive_to_device(data, dst_ptr) }
    }

    unsafe fn reduce_inplace(
        &self,
        dst_ptr: u64,
        src: &[u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> flagcx::Result<()> {
        unsafe { self.0.reduce_inplace(dst_ptr, src, count, dtype, op) }
    }
}

#[tokio::test]
async fn test_batch_with_failing_stage_queues_nothing() {
    let adapter: Arc<dyn DeviceAdapter> = Arc::new(FailingStage(HostAdapter::new()));
    let world = World::bootstrap_local_with(1, adapter, fast_config())
        .unwrap()
        .remove(0);
    let pg = world.new_group(&[0]).await.unwrap();
    let Channel::Recv(inbox) = pg.get_or_create_channel(0, Direction::Recv).unwrap() else {
        panic!("expected a receive channel");
    };

    let mut good = vec![1u32; 4];
    let bad = unsafe { Buffer::from_raw(0, 4, DataType::U32) };
    let mut sink = vec![0u32; 4];
    let ops = [
        P2POp::send(Buffer::from_slice(&mut good), 0),
        P2POp::recv(Buffer::from_slice(&mut sink), 0),
        P2POp::send(bad, 0),
    ];
    let err = unsafe { pg.batch_issue(&ops) }.unwrap_err();
    assert!(matches!(err, FlagcxError::Device { .. }), "got {err:?}");

    // The good send staged fine but was never queued.
    assert_eq!(inbox.unexpected_frames(), 0);
    assert_eq!(sink, vec![0u32; 4]);
    assert_unusable(&pg);
}
