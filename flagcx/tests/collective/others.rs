use flagcx::{Buffer, FlagcxError, ReduceOp};

use super::helpers::run_collective;

#[tokio::test]
async fn test_broadcast_flat_and_tree() {
    for world in [2u32, 5] {
        run_collective(world, move |pg| async move {
            let root = world - 1;
            let mut data = if pg.rank() == root {
                vec![7.5f32, -1.0, 3.25]
            } else {
                vec![0.0f32; 3]
            };
            unsafe { pg.broadcast(Buffer::from_slice(&mut data), root) }
                .unwrap()
                .wait()
                .await
                .unwrap();
            assert_eq!(data, vec![7.5f32, -1.0, 3.25], "rank {}", pg.rank());
        })
        .await;
    }
}

#[tokio::test]
async fn test_broadcast_rejects_bad_root() {
    run_collective(2, |pg| async move {
        let mut data = vec![0u8; 1];
        let err = unsafe { pg.broadcast(Buffer::from_slice(&mut data), 2) }.unwrap_err();
        assert!(matches!(err, FlagcxError::InvalidRank { rank: 2, size: 2 }));
    })
    .await;
}

#[tokio::test]
async fn test_reduce_to_non_zero_root() {
    run_collective(5, |pg| async move {
        let rank = pg.rank();
        let mut data = vec![(rank + 1) as i32; 4];
        unsafe { pg.reduce(Buffer::from_slice(&mut data), 2, ReduceOp::Sum) }
            .unwrap()
            .wait()
            .await
            .unwrap();
        if rank == 2 {
            assert_eq!(data, vec![15; 4]);
        } else {
            assert_eq!(data, vec![(rank + 1) as i32; 4], "non-root buffer changed");
        }
    })
    .await;
}

#[tokio::test]
async fn test_all_gather() {
    run_collective(3, |pg| async move {
        let rank = pg.rank() as u64;
        let mut input = vec![rank * 10, rank * 10 + 1];
        let mut output = vec![0u64; 6];
        unsafe {
            pg.all_gather(Buffer::from_slice(&mut output), Buffer::from_slice(&mut input))
        }
        .unwrap()
        .wait()
        .await
        .unwrap();
        assert_eq!(output, vec![0, 1, 10, 11, 20, 21]);
    })
    .await;
}

#[tokio::test]
async fn test_reduce_scatter_gives_each_rank_its_block() {
    run_collective(4, |pg| async move {
        let rank = pg.rank();
        // Block b on rank r holds r + b.
        let mut input: Vec<f32> = (0..8).map(|i| (rank + i / 2) as f32).collect();
        let mut output = vec![0.0f32; 2];
        unsafe {
            pg.reduce_scatter(
                Buffer::from_slice(&mut output),
                Buffer::from_slice(&mut input),
                ReduceOp::Sum,
            )
        }
        .unwrap()
        .wait()
        .await
        .unwrap();
        // sum over r of (r + rank) = 6 + 4 * rank
        let expected = (6 + 4 * rank) as f32;
        assert_eq!(output, vec![expected; 2], "rank {rank}");
    })
    .await;
}

#[tokio::test]
async fn test_reduce_scatter_size_mismatch() {
    run_collective(2, |pg| async move {
        let mut input = vec![0.0f32; 5];
        let mut output = vec![0.0f32; 2];
        let err = unsafe {
            pg.reduce_scatter(
                Buffer::from_slice(&mut output),
                Buffer::from_slice(&mut input),
                ReduceOp::Sum,
            )
        }
        .unwrap_err();
        assert!(matches!(err, FlagcxError::BufferSizeMismatch { .. }));
    })
    .await;
}

#[tokio::test]
async fn test_gather_and_scatter() {
    run_collective(3, |pg| async move {
        let rank = pg.rank();
        let root = 1;

        let mut input = vec![rank as i8; 2];
        let mut gathered = vec![-1i8; 6];
        let output = (rank == root).then(|| Buffer::from_slice(&mut gathered));
        unsafe { pg.gather(Buffer::from_slice(&mut input), output, root) }
            .unwrap()
            .wait()
            .await
            .unwrap();
        if rank == root {
            assert_eq!(gathered, vec![0, 0, 1, 1, 2, 2]);
        }

        let mut source: Vec<i8> = vec![10, 11, 20, 21, 30, 31];
        let mut mine = vec![0i8; 2];
        let input = (rank == root).then(|| Buffer::from_slice(&mut source));
        unsafe { pg.scatter(input, Buffer::from_slice(&mut mine), root) }
            .unwrap()
            .wait()
            .await
            .unwrap();
        let base = 10 * (rank as i8 + 1);
        assert_eq!(mine, vec![base, base + 1]);
    })
    .await;
}

#[tokio::test]
async fn test_gather_root_needs_output() {
    run_collective(1, |pg| async move {
        let mut input = vec![0u8; 1];
        let err = unsafe { pg.gather(Buffer::from_slice(&mut input), None, 0) }.unwrap_err();
        assert!(matches!(err, FlagcxError::GroupConfig { .. }));
    })
    .await;
}

#[tokio::test]
async fn test_all_to_all() {
    run_collective(3, |pg| async move {
        let rank = pg.rank();
        // Block j on rank r carries 10 * r + j.
        let mut input: Vec<u32> = (0..3).map(|j| 10 * rank + j).collect();
        let mut output = vec![0u32; 3];
        unsafe {
            pg.all_to_all(Buffer::from_slice(&mut output), Buffer::from_slice(&mut input))
        }
        .unwrap()
        .wait()
        .await
        .unwrap();
        let expected: Vec<u32> = (0..3).map(|r| 10 * r + rank).collect();
        assert_eq!(output, expected, "rank {rank}");
    })
    .await;
}

#[tokio::test]
async fn test_all_to_all_indivisible() {
    run_collective(2, |pg| async move {
        let mut input = vec![0u32; 3];
        let mut output = vec![0u32; 3];
        let err = unsafe {
            pg.all_to_all(Buffer::from_slice(&mut output), Buffer::from_slice(&mut input))
        }
        .unwrap_err();
        assert!(matches!(err, FlagcxError::IndivisibleCount { .. }));
    })
    .await;
}

#[tokio::test]
async fn test_barrier() {
    run_collective(5, |pg| async move {
        for _ in 0..3 {
            pg.barrier().unwrap().wait().await.unwrap();
        }
    })
    .await;
}
