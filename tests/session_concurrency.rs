//! Concurrent use of one array session

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use storage_backend_plugins::array::SimulatedArray;
use storage_backend_plugins::domain::ArrayModel;
use storage_backend_plugins::{ArraySession, Error};
use tokio_test::assert_ok;

const HOLDERS: usize = 32;

fn session(array: &Arc<SimulatedArray>) -> Arc<ArraySession> {
    ArraySession::new("san-a", array.client("san-a"))
}

#[tokio::test]
async fn test_overlapping_holders_share_one_login() {
    let array = SimulatedArray::new("SN-1", ArrayModel::DoradoV6);
    array.set_latency(Duration::from_millis(5));
    let session = session(&array);

    let leases = join_all((0..HOLDERS).map(|_| {
        let session = Arc::clone(&session);
        async move { session.acquire().await }
    }))
    .await;

    let mut held = Vec::with_capacity(HOLDERS);
    for lease in leases {
        held.push(assert_ok!(lease));
    }
    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.holders, HOLDERS as u32);
    assert!(snapshot.online);
    assert_eq!(array.login_count(), 1);

    // Every holder talks to the array through the shared login
    let systems = join_all(held.iter().map(|lease| lease.client().get_system())).await;
    for system in systems {
        assert_ok!(system);
    }

    join_all(held.into_iter().map(|lease| lease.release())).await;
    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.holders, 0);
    assert!(!snapshot.online);
    assert_eq!(array.login_count(), 1);
    assert_eq!(array.logout_count(), 1);
}

#[tokio::test]
async fn test_interleaved_tasks_balance_logins_and_logouts() {
    let array = SimulatedArray::new("SN-1", ArrayModel::DoradoV6);
    array.set_latency(Duration::from_millis(1));
    let session = session(&array);

    let tasks: Vec<_> = (0..HOLDERS)
        .map(|_| {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let lease = session.acquire().await?;
                lease.client().get_features().await?;
                lease.release().await;
                Ok::<_, Error>(())
            })
        })
        .collect();
    for task in join_all(tasks).await {
        assert_ok!(assert_ok!(task));
    }

    // Holders may drain to zero between tasks; each login is paired with a logout
    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.holders, 0);
    assert!(array.login_count() >= 1);
    assert_eq!(array.login_count(), array.logout_count());
    assert_eq!(snapshot.logins, array.login_count());
}

#[tokio::test]
async fn test_failed_login_leaves_no_holder() {
    let array = SimulatedArray::new("SN-1", ArrayModel::DoradoV6);
    array.set_fail_login(true);
    let session = session(&array);

    let results = join_all((0..4).map(|_| session.acquire())).await;
    for result in results {
        assert!(result.is_err());
    }
    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.holders, 0);
    assert!(!session.is_online());

    array.set_fail_login(false);
    let lease = assert_ok!(session.acquire().await);
    assert!(session.is_online());
    lease.release().await;
    assert_eq!(array.login_count(), 1);
    assert_eq!(array.logout_count(), 1);
}

#[tokio::test]
async fn test_terminate_ends_resident_hold() {
    let array = SimulatedArray::new("SN-1", ArrayModel::DoradoV6);
    let session = session(&array);

    assert_ok!(session.acquire().await).into_resident();
    let lease = assert_ok!(session.acquire().await);
    lease.release().await;
    assert!(session.is_online());
    assert_eq!(array.logout_count(), 0);

    session.terminate().await;
    assert!(!session.is_online());
    assert_eq!(session.snapshot().await.holders, 0);
    assert_eq!(array.logout_count(), 1);
}
