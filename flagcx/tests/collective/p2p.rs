use flagcx::{Buffer, FlagcxError, P2POp, WorkStatus, wait_all};

use super::helpers::run_collective;

#[tokio::test]
async fn test_send_recv_round_trip() {
    run_collective(2, |pg| async move {
        if pg.rank() == 0 {
            let mut out = vec![1.0f32, 2.0, 3.0];
            unsafe { pg.send(Buffer::from_slice(&mut out), 1).await }.unwrap();
            let mut back = vec![0.0f32; 3];
            unsafe { pg.recv(Buffer::from_slice(&mut back), 1).await }.unwrap();
            assert_eq!(back, vec![2.0f32, 4.0, 6.0]);
        } else {
            let mut buf = vec![0.0f32; 3];
            unsafe { pg.recv(Buffer::from_slice(&mut buf), 0).await }.unwrap();
            for v in &mut buf {
                *v *= 2.0;
            }
            unsafe { pg.send(Buffer::from_slice(&mut buf), 0).await }.unwrap();
        }
    })
    .await;
}

#[tokio::test]
async fn test_messages_between_a_pair_arrive_in_order() {
    run_collective(2, |pg| async move {
        if pg.rank() == 0 {
            let mut works = Vec::new();
            for i in 0..5u64 {
                let mut v = vec![i; 2];
                works.push(unsafe { pg.isend(Buffer::from_slice(&mut v), 1) }.unwrap());
            }
            wait_all(works).await.unwrap();
        } else {
            for i in 0..5u64 {
                let mut v = vec![u64::MAX; 2];
                unsafe { pg.recv(Buffer::from_slice(&mut v), 0).await }.unwrap();
                assert_eq!(v, vec![i; 2]);
            }
        }
    })
    .await;
}

#[tokio::test]
async fn test_ring_batch_with_reversed_order_on_odd_ranks() {
    for world in [2u32, 3, 4] {
        run_collective(world, move |pg| async move {
            let rank = pg.rank();
            let next = (rank + 1) % world;
            let prev = (rank + world - 1) % world;

            let mut out = vec![rank as f32; 8];
            let mut inbox = vec![-1.0f32; 8];
            let mut ops = vec![
                P2POp::send(Buffer::from_slice(&mut out), next),
                P2POp::recv(Buffer::from_slice(&mut inbox), prev),
            ];
            if rank % 2 == 1 {
                ops.reverse();
            }
            let works = unsafe { pg.batch_issue(&ops) }.unwrap();
            assert_eq!(works.len(), 2);
            wait_all(works).await.unwrap();
            assert_eq!(inbox, vec![prev as f32; 8], "rank {rank} of {world}");
        })
        .await;
    }
}

#[tokio::test]
async fn test_even_ranks_send_odd_ranks_receive() {
    run_collective(4, |pg| async move {
        let rank = pg.rank();
        let mut data = vec![rank as i32 * 100; 3];
        let work = if rank % 2 == 0 {
            unsafe { pg.isend(Buffer::from_slice(&mut data), rank + 1) }
        } else {
            unsafe { pg.irecv(Buffer::from_slice(&mut data), rank - 1) }
        }
        .unwrap();
        work.wait().await.unwrap();
        let from = rank - rank % 2;
        assert_eq!(data, vec![from as i32 * 100; 3]);
    })
    .await;
}

#[tokio::test]
async fn test_irecv_status_progression() {
    run_collective(2, |pg| async move {
        if pg.rank() == 1 {
            let mut buf = vec![0u8; 4];
            let work = unsafe { pg.irecv(Buffer::from_slice(&mut buf), 0) }.unwrap();
            assert!(!work.is_completed());
            assert_ne!(work.status(), WorkStatus::Completed);
            // Tell rank 0 we have posted, then wait for the data.
            let mut go = [1u8];
            unsafe { pg.send(Buffer::from_slice(&mut go), 0).await }.unwrap();
            work.wait().await.unwrap();
            assert_eq!(buf, vec![9u8; 4]);
        } else {
            let mut go = [0u8];
            unsafe { pg.recv(Buffer::from_slice(&mut go), 1).await }.unwrap();
            let mut data = vec![9u8; 4];
            unsafe { pg.send(Buffer::from_slice(&mut data), 1).await }.unwrap();
        }
    })
    .await;
}

#[tokio::test]
async fn test_send_to_self() {
    run_collective(1, |pg| async move {
        let mut out = vec![5i64, 6];
        let mut back = vec![0i64; 2];
        let ops = [
            P2POp::recv(Buffer::from_slice(&mut back), 0),
            P2POp::send(Buffer::from_slice(&mut out), 0),
        ];
        wait_all(unsafe { pg.batch_issue(&ops) }.unwrap()).await.unwrap();
        assert_eq!(back, vec![5, 6]);
    })
    .await;
}

#[tokio::test]
async fn test_batch_with_bad_peer_issues_nothing() {
    run_collective(2, |pg| async move {
        let mut a = vec![0u8; 2];
        let ops = [
            P2POp::send(Buffer::from_slice(&mut a), 1 - pg.rank()),
            P2POp::recv(Buffer::from_slice(&mut a), 7),
        ];
        let err = unsafe { pg.batch_issue(&ops) }.unwrap_err();
        assert!(matches!(err, FlagcxError::InvalidRank { rank: 7, .. }));
        assert_eq!(pg.channel_count(), 0);
    })
    .await;
}

#[tokio::test]
async fn test_recv_into_wrong_size_buffer() {
    run_collective(2, |pg| async move {
        if pg.rank() == 0 {
            let mut data = vec![1u32; 4];
            unsafe { pg.send(Buffer::from_slice(&mut data), 1).await }.unwrap();
        } else {
            let mut small = vec![0u32; 2];
            let err = unsafe { pg.recv(Buffer::from_slice(&mut small), 0).await }.unwrap_err();
            assert!(matches!(err, FlagcxError::BufferSizeMismatch { expected: 8, actual: 16 }));
        }
    })
    .await;
}
