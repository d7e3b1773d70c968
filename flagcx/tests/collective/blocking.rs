use flagcx::{Buffer, P2POp, ReduceOp, SyncWorld};

#[test]
fn test_sync_group_round() {
    let worlds = SyncWorld::bootstrap_local(3).unwrap();
    let handles: Vec<_> = worlds
        .into_iter()
        .map(|world| {
            std::thread::spawn(move || {
                let rank = world.rank();
                let size = world.world_size();
                let ranks: Vec<u32> = (0..size).collect();
                let pg = world.new_group(&ranks).unwrap();

                let mut data = vec![1.0f32; 6];
                unsafe { pg.all_reduce(Buffer::from_slice(&mut data), ReduceOp::Sum) }.unwrap();
                assert_eq!(data, vec![3.0f32; 6]);

                let mut root_val = vec![if rank == 0 { 42u32 } else { 0 }; 2];
                unsafe { pg.broadcast(Buffer::from_slice(&mut root_val), 0) }.unwrap();
                assert_eq!(root_val, vec![42u32; 2]);

                let next = (rank + 1) % size;
                let prev = (rank + size - 1) % size;
                let mut out = vec![rank as i64; 4];
                let mut inbox = vec![-1i64; 4];
                let ops = [
                    P2POp::send(Buffer::from_slice(&mut out), next),
                    P2POp::recv(Buffer::from_slice(&mut inbox), prev),
                ];
                unsafe { pg.batch_issue(&ops) }.unwrap();
                assert_eq!(inbox, vec![prev as i64; 4]);

                if rank == 0 {
                    let mut v = vec![7u8; 3];
                    unsafe { pg.send(Buffer::from_slice(&mut v), 1) }.unwrap();
                } else if rank == 1 {
                    let mut v = vec![0u8; 3];
                    unsafe { pg.recv(Buffer::from_slice(&mut v), 0) }.unwrap();
                    assert_eq!(v, vec![7u8; 3]);
                }

                pg.barrier().unwrap();
                pg.destroy().unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
