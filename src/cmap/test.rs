use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use super::{
    establish::ConnectionEstablisher,
    options::ConnectionPoolOptions,
    Connection,
    ConnectionPool,
};
use crate::{
    client::options::ServerAddress,
    error::{Error, ErrorKind},
    runtime,
    sdam::TopologyUpdater,
};

/// An establisher that completes immediately with a sink-stream connection, counting opens.
fn instant_establisher() -> (ConnectionEstablisher, Arc<AtomicU32>) {
    let opens = Arc::new(AtomicU32::new(0));
    let opens_clone = opens.clone();
    let establisher = ConnectionEstablisher::mock(move |pending| {
        opens_clone.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Ok(Connection::new_testing(
                pending.id,
                pending.address,
                pending.generation,
            ))
        })
    });
    (establisher, opens)
}

/// An establisher whose opens never complete, wedging the pool's open permits.
fn wedged_establisher() -> ConnectionEstablisher {
    ConnectionEstablisher::mock(|_pending| Box::pin(std::future::pending()))
}

fn pool_options() -> ConnectionPoolOptions {
    ConnectionPoolOptions {
        ready: Some(true),
        // Keep the background interval out of the way; tests drive maintenance explicitly.
        maintenance_frequency: Some(Duration::from_secs(3600)),
        ..Default::default()
    }
}

fn new_pool(establisher: ConnectionEstablisher, options: ConnectionPoolOptions) -> ConnectionPool {
    ConnectionPool::new(
        ServerAddress::default(),
        establisher,
        TopologyUpdater::channel().0,
        Some(options),
    )
}

#[tokio::test]
async fn waiters_are_served_in_fifo_order() {
    let (establisher, _) = instant_establisher();
    let mut options = pool_options();
    options.max_pool_size = Some(1);
    let pool = new_pool(establisher, options);

    let held = pool.check_out().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for i in 0..5 {
        let pool = pool.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            let conn = pool.check_out().await.unwrap();
            order.lock().unwrap().push(i);
            drop(conn);
        }));
        // Give each waiter time to enter the wait queue before the next arrives.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    drop(held);
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hand_over_keeps_checkouts_live_while_opens_are_wedged() {
    const CYCLES: usize = 5000;
    const BATCH: u32 = 7;

    let mut options = pool_options();
    // Exactly enough room for the two wedged opens plus the populated connections, so no
    // further opens can ever start.
    options.max_pool_size = Some(BATCH + super::MAX_CONCURRENT_OPENS);
    let pool = new_pool(wedged_establisher(), options);

    // Wedge both open permits with checkouts that can only be satisfied by establishment.
    let mut wedged = Vec::new();
    for _ in 0..super::MAX_CONCURRENT_OPENS {
        let pool = pool.clone();
        wedged.push(runtime::spawn(async move { pool.check_out().await }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let known_ids: HashSet<u32> = (100..100 + BATCH).collect();
    for id in known_ids.iter() {
        pool.populate_connection(Connection::new_testing(
            *id,
            ServerAddress::default(),
            0,
        ));
    }

    let mut held = Vec::new();
    for _ in 0..BATCH {
        held.push(pool.check_out().await.unwrap());
    }

    // Every subsequent checkout can only complete via hand-over of a concurrent check-in.
    let mut tasks = Vec::new();
    for conn in held {
        let pool = pool.clone();
        let known_ids = known_ids.clone();
        tasks.push(tokio::spawn(async move {
            let mut conn = conn;
            for _ in 0..CYCLES {
                let checked_in_id = conn.id;
                drop(conn);
                conn = pool
                    .check_out()
                    .await
                    .expect("checkout must complete while all open permits are held");
                assert!(known_ids.contains(&conn.id));
                let _ = checked_in_id;
            }
        }));
    }

    crate::runtime::timeout(Duration::from_secs(30), futures::future::join_all(tasks))
        .await
        .expect("hand-over failed to keep checkouts live")
        .into_iter()
        .for_each(|result| result.unwrap());

    for handle in wedged {
        handle.abort();
    }
}

#[tokio::test]
async fn expired_connections_are_replaced_after_maintenance() {
    let (establisher, opens) = instant_establisher();
    let mut options = pool_options();
    options.max_connection_life_time = Some(Duration::from_millis(20));
    let pool = new_pool(establisher, options);

    let first = pool.check_out().await.unwrap();
    let first_id = first.id;
    let first_created = first.time_created();
    drop(first);

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.do_maintenance().await;

    let second = pool.check_out().await.unwrap();
    assert_ne!(second.id, first_id);
    assert!(second.time_created() > first_created);
    assert!(opens.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn cleared_pool_fails_fast_until_ready() {
    let (establisher, _) = instant_establisher();
    let pool = new_pool(establisher, pool_options());
    let mut subscriber = pool.generation_subscriber();

    pool.clear(Error::network_timeout());
    assert_eq!(
        subscriber
            .wait_for_generation_change(Duration::from_secs(1))
            .await,
        Some(1)
    );

    let err = pool.check_out().await.unwrap_err();
    assert!(matches!(
        err.kind.as_ref(),
        ErrorKind::ConnectionPoolCleared { .. }
    ));
    assert!(err.is_read_retryable());
    assert!(err.is_write_retryable());

    pool.ready().await;
    pool.check_out().await.unwrap();
}

#[tokio::test]
async fn stale_connections_are_discarded_on_check_in() {
    let (establisher, opens) = instant_establisher();
    let pool = new_pool(establisher, pool_options());
    let mut subscriber = pool.generation_subscriber();

    let conn = pool.check_out().await.unwrap();
    let first_id = conn.id;

    pool.clear(Error::network_timeout());
    subscriber
        .wait_for_generation_change(Duration::from_secs(1))
        .await;
    pool.ready().await;

    // Returning the old-generation connection must close it rather than pool it.
    drop(conn);

    let second = pool.check_out().await.unwrap();
    assert_ne!(second.id, first_id);
    assert_eq!(opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn wait_queue_timeout_surfaces() {
    let (establisher, _) = instant_establisher();
    let mut options = pool_options();
    options.max_pool_size = Some(1);
    options.wait_queue_timeout = Some(Duration::from_millis(50));
    let pool = new_pool(establisher, options);

    let _held = pool.check_out().await.unwrap();
    let err = pool.check_out().await.unwrap_err();
    assert!(matches!(
        err.kind.as_ref(),
        ErrorKind::WaitQueueTimeout { .. }
    ));
}

#[tokio::test]
async fn callback_checkout_is_invoked_exactly_once() {
    let (establisher, _) = instant_establisher();
    let pool = new_pool(establisher, pool_options());

    let (sender, receiver) = tokio::sync::oneshot::channel();
    pool.check_out_with_callback(move |result| {
        // A second invocation would panic on the consumed sender.
        sender.send(result.map(|conn| conn.id)).unwrap();
    });
    let id = receiver.await.unwrap().unwrap();
    assert_eq!(id, 1);
}

#[tokio::test]
async fn closed_pool_rejects_checkouts() {
    let (establisher, _) = instant_establisher();
    let pool = new_pool(establisher, pool_options());

    pool.close().await;
    let err = pool.check_out().await.unwrap_err();
    assert!(matches!(
        err.kind.as_ref(),
        ErrorKind::ConnectionPoolClosed { .. }
    ));
}

#[tokio::test]
async fn checkouts_from_a_new_pool_fail_until_marked_ready() {
    let (establisher, _) = instant_establisher();
    let mut options = pool_options();
    options.ready = None;
    let pool = new_pool(establisher, options);

    assert!(pool.check_out().await.is_err());
    pool.ready().await;
    pool.check_out().await.unwrap();
}

#[tokio::test]
async fn pinned_connections_return_to_their_holder() {
    let (establisher, opens) = instant_establisher();
    let pool = new_pool(establisher, pool_options());

    let mut conn = pool.check_out().await.unwrap();
    let id = conn.id;
    let handle = conn.pin().unwrap();

    // Dropping a pinned connection routes it to the pin holder, not the idle set.
    drop(conn);
    let conn = handle.take_connection(pool.manager.clone()).await.unwrap();
    assert_eq!(conn.id, id);
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    // Once the handle is gone, the connection drains back into the pool.
    drop(handle);
    drop(conn);
    let conn = pool.check_out().await.unwrap();
    assert_eq!(conn.id, id);
    assert_eq!(opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn min_pool_size_is_restored_by_maintenance() {
    let (establisher, opens) = instant_establisher();
    let mut options = pool_options();
    options.min_pool_size = Some(3);
    let pool = new_pool(establisher, options);

    pool.do_maintenance().await;
    // Establishments run in background tasks; give them a moment to land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.do_maintenance().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(opens.load(Ordering::SeqCst) >= 3);
}
