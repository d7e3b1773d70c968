use flagcx::{Buffer, ReduceOp};

use super::helpers::run_collective;

#[tokio::test]
async fn test_allreduce_2_ranks_f32() {
    run_collective(2, |pg| async move {
        let rank = pg.rank();
        let mut data = vec![(rank + 1) as f32; 4];
        unsafe { pg.all_reduce(Buffer::from_slice(&mut data), ReduceOp::Sum) }
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(data, vec![3.0f32; 4], "rank {rank} allreduce failed");
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_3_ranks_uneven_count() {
    run_collective(3, |pg| async move {
        let rank = pg.rank();
        let mut data: Vec<i32> = (0..7).map(|i| i * 10 + rank as i32).collect();
        unsafe { pg.all_reduce(Buffer::from_slice(&mut data), ReduceOp::Sum) }
            .unwrap()
            .wait()
            .await
            .unwrap();
        let expected: Vec<i32> = (0..7).map(|i| i * 30 + 3).collect();
        assert_eq!(data, expected, "rank {rank} allreduce failed");
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_repeated_on_same_buffer() {
    // Ones over four ranks: 4 after the first call, 16 after the second.
    run_collective(4, |pg| async move {
        let mut data = vec![1.0f32; 16];
        for expected in [4.0f32, 16.0] {
            unsafe { pg.all_reduce(Buffer::from_slice(&mut data), ReduceOp::Sum) }
                .unwrap()
                .wait()
                .await
                .unwrap();
            assert_eq!(data, vec![expected; 16], "rank {}", pg.rank());
        }
        assert_eq!(pg.sequence_number(), 2);
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_max_min_prod() {
    run_collective(3, |pg| async move {
        let v = (pg.rank() + 2) as i64;
        for (op, expected) in [(ReduceOp::Max, 4i64), (ReduceOp::Min, 2), (ReduceOp::Prod, 24)] {
            let mut data = vec![v; 5];
            unsafe { pg.all_reduce(Buffer::from_slice(&mut data), op) }
                .unwrap()
                .wait()
                .await
                .unwrap();
            assert_eq!(data, vec![expected; 5], "{op:?} on rank {}", pg.rank());
        }
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_avg() {
    run_collective(4, |pg| async move {
        let mut data = vec![(pg.rank() * 2) as f64; 3];
        unsafe { pg.all_reduce(Buffer::from_slice(&mut data), ReduceOp::Avg) }
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(data, vec![3.0f64; 3]);
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_count_smaller_than_group() {
    run_collective(4, |pg| async move {
        let mut data = vec![pg.rank() as u32 + 1; 2];
        unsafe { pg.all_reduce(Buffer::from_slice(&mut data), ReduceOp::Sum) }
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(data, vec![10u32; 2]);
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_halving_doubling_non_power_of_two() {
    // ring_max_world defaults to 8, so 10 ranks take the halving-doubling path.
    run_collective(10, |pg| async move {
        let rank = pg.rank();
        let mut data: Vec<f32> = (0..13).map(|i| (i + rank) as f32).collect();
        unsafe { pg.all_reduce(Buffer::from_slice(&mut data), ReduceOp::Sum) }
            .unwrap()
            .wait()
            .await
            .unwrap();
        let expected: Vec<f32> = (0..13).map(|i| (10 * i + 45) as f32).collect();
        assert_eq!(data, expected, "rank {rank}");
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_coalesced() {
    run_collective(3, |pg| async move {
        let r = pg.rank() as f32;
        let mut a = vec![r; 2];
        let mut b = vec![r + 1.0; 5];
        let bufs = [Buffer::from_slice(&mut a), Buffer::from_slice(&mut b)];
        unsafe { pg.all_reduce_coalesced(&bufs, ReduceOp::Sum) }
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(a, vec![3.0f32; 2]);
        assert_eq!(b, vec![6.0f32; 5]);
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_half_precision() {
    use half::f16;
    run_collective(2, |pg| async move {
        let mut data = vec![f16::from_f32(1.5); 4];
        unsafe { pg.all_reduce(Buffer::from_slice(&mut data), ReduceOp::Sum) }
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(data.iter().all(|v| v.to_f32() == 3.0));
    })
    .await;
}
