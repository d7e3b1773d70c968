use flagcx::{Buffer, Direction, FlagcxError, GroupState, ReduceOp, World, wait_all};

use super::helpers::run_world;

#[tokio::test]
async fn test_two_groups_over_same_ranks_are_independent() {
    run_world(4, |world| async move {
        let ranks = world.all_ranks();
        let g1 = world.new_group(&ranks).await.unwrap();
        let g2 = world.new_group(&ranks).await.unwrap();
        assert_ne!(g1.id(), g2.id());

        let mut a = vec![1.0f32; 8];
        let mut b = vec![10.0f32; 8];
        // Odd ranks issue on the groups in the opposite order.
        let works = if world.rank() % 2 == 0 {
            let wa = unsafe { g1.all_reduce(Buffer::from_slice(&mut a), ReduceOp::Sum) }.unwrap();
            let wb = unsafe { g2.all_reduce(Buffer::from_slice(&mut b), ReduceOp::Sum) }.unwrap();
            vec![wa, wb]
        } else {
            let wb = unsafe { g2.all_reduce(Buffer::from_slice(&mut b), ReduceOp::Sum) }.unwrap();
            let wa = unsafe { g1.all_reduce(Buffer::from_slice(&mut a), ReduceOp::Sum) }.unwrap();
            vec![wb, wa]
        };
        wait_all(works).await.unwrap();
        assert_eq!(a, vec![4.0f32; 8]);
        assert_eq!(b, vec![40.0f32; 8]);

        g1.destroy().await.unwrap();
        // The other group keeps working after its twin is gone.
        unsafe { g2.all_reduce(Buffer::from_slice(&mut b), ReduceOp::Sum) }
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(b, vec![160.0f32; 8]);
        g2.destroy().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_subset_group_uses_group_ranks() {
    run_world(4, |world| async move {
        // Members are world ranks 3 and 1, in that order.
        let members = [3, 1];
        let Some(pos) = members.iter().position(|&r| r == world.rank()) else {
            return;
        };
        let pg = world.new_group(&members).await.unwrap();
        assert_eq!(pg.rank() as usize, pos);
        assert_eq!(pg.size(), 2);
        assert_eq!(pg.global_rank(0).unwrap(), 3);
        assert_eq!(pg.group_rank(1), Some(1));
        assert_eq!(pg.group_rank(0), None);

        let mut data = vec![world.rank() as u64; 2];
        unsafe { pg.all_reduce(Buffer::from_slice(&mut data), ReduceOp::Sum) }
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(data, vec![4u64; 2]);
        pg.destroy().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_destroyed_group_rejects_use() {
    run_world(2, |world| async move {
        let pg = world.new_group(&world.all_ranks()).await.unwrap();
        let peer = 1 - pg.rank();
        let mut data = vec![1.0f32; 4];
        unsafe { pg.all_reduce(Buffer::from_slice(&mut data), ReduceOp::Sum) }
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(pg.channel_count() > 0);

        pg.destroy().await.unwrap();
        assert_eq!(pg.state(), GroupState::Destroyed);
        assert_eq!(pg.channel_count(), 0);

        let err = unsafe { pg.all_reduce(Buffer::from_slice(&mut data), ReduceOp::Sum) }.unwrap_err();
        assert!(matches!(err, FlagcxError::GroupDestroyed { .. }));
        let err = unsafe { pg.isend(Buffer::from_slice(&mut data), peer) }.unwrap_err();
        assert!(matches!(err, FlagcxError::GroupDestroyed { .. }));
        assert!(pg.get_or_create_channel(peer, Direction::Send).is_err());
        assert!(matches!(
            pg.destroy().await,
            Err(FlagcxError::GroupDestroyed { .. })
        ));
    })
    .await;
}

#[tokio::test]
async fn test_mismatched_membership_under_one_label() {
    let worlds = World::bootstrap_local(3).unwrap();
    let (w0, w1, w2) = (worlds[0].clone(), worlds[1].clone(), worlds[2].clone());

    // Ranks 0 and 1 register "shared" as [0, 1] first.
    let (g0, g1) = tokio::join!(
        w0.new_group_with_label("shared", &[0, 1]),
        w1.new_group_with_label("shared", &[0, 1]),
    );
    let (g0, g1) = (g0.unwrap(), g1.unwrap());

    // Rank 2 arrives with a different membership and is turned away.
    let err = w2
        .new_group_with_label("shared", &[0, 1, 2])
        .await
        .unwrap_err();
    match err {
        FlagcxError::GroupConfig { reason } => assert!(reason.contains("2 ranks"), "{reason}"),
        other => panic!("unexpected error {other:?}"),
    }

    // The registered group is unaffected.
    let mut a = vec![1i32; 3];
    let mut b = vec![2i32; 3];
    let wa = unsafe { g0.all_reduce(Buffer::from_slice(&mut a), ReduceOp::Sum) }.unwrap();
    let wb = unsafe { g1.all_reduce(Buffer::from_slice(&mut b), ReduceOp::Sum) }.unwrap();
    wait_all([wa, wb]).await.unwrap();
    assert_eq!(a, vec![3; 3]);
    assert_eq!(b, vec![3; 3]);

    let (d0, d1) = tokio::join!(g0.destroy(), g1.destroy());
    d0.unwrap();
    d1.unwrap();
}

#[tokio::test]
async fn test_invalid_membership_is_rejected() {
    let worlds = World::bootstrap_local(2).unwrap();
    for ranks in [&[][..], &[0, 0][..], &[0, 5][..]] {
        let err = worlds[0].new_group(ranks).await.unwrap_err();
        assert!(matches!(err, FlagcxError::GroupConfig { .. }), "{ranks:?}");
    }
}

#[tokio::test]
async fn test_channel_lookup_is_idempotent() {
    run_world(2, |world| async move {
        let pg = world.new_group(&world.all_ranks()).await.unwrap();
        let peer = 1 - pg.rank();
        let first = pg.get_or_create_channel(peer, Direction::Recv).unwrap();
        let second = pg.get_or_create_channel(peer, Direction::Recv).unwrap();
        match (first, second) {
            (flagcx::Channel::Recv(a), flagcx::Channel::Recv(b)) => {
                assert!(std::sync::Arc::ptr_eq(&a, &b))
            }
            _ => panic!("expected receive channels"),
        }
        assert!(matches!(
            pg.get_or_create_channel(9, Direction::Send),
            Err(FlagcxError::InvalidRank { .. })
        ));
        pg.destroy().await.unwrap();
    })
    .await;
}
