use std::future::Future;
use std::sync::Arc;

use flagcx::{ProcessGroup, World};

/// Run `f` on every rank of an in-process world, each on its own task.
pub async fn run_world<F, Fut>(world_size: u32, f: F)
where
    F: Fn(World) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let worlds = World::bootstrap_local(world_size).unwrap();
    let f = Arc::new(f);
    let handles: Vec<_> = worlds
        .into_iter()
        .map(|w| {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f(w).await })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }
}

/// Run `f` on every rank against a group spanning the whole world, then
/// destroy the group.
pub async fn run_collective<F, Fut>(world_size: u32, f: F)
where
    F: Fn(ProcessGroup) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let f = Arc::new(f);
    run_world(world_size, move |world| {
        let f = Arc::clone(&f);
        async move {
            let pg = world.new_group(&world.all_ranks()).await.unwrap();
            f(pg.clone()).await;
            pg.destroy().await.unwrap();
        }
    })
    .await;
}
