//! Thread-scoped sessions, leak detection and the datasource registry.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::thread;

use dbpool::{
    DataSources, Pool, PoolConfig, PoolError, Session, check_connection_leak, open_sessions,
};
use dbpool_testing::{MockConnector, test_config};

fn pool(config: PoolConfig) -> (Pool, MockConnector) {
    let driver = MockConnector::new();
    let pool = Pool::new(config, driver.clone()).unwrap();
    (pool, driver)
}

#[test]
fn test_acquire_inside_session_returns_bound_connection() {
    let (pool, driver) = pool(test_config("shared"));
    let session = Session::new(&pool);
    session.begin().unwrap();

    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    let bound = session.connection().unwrap();
    assert!(a.same_connection(&b));
    assert!(a.same_connection(&bound));
    assert_eq!(driver.connect_count(), 1);

    drop((a, b, bound));
    session.end().unwrap();
}

#[test]
fn test_nested_begin_rejected() {
    let (pool, _driver) = pool(test_config("nested"));
    let session = Session::new(&pool);
    session.begin().unwrap();

    assert!(matches!(
        session.begin(),
        Err(PoolError::NestedSession { ref datasource }) if datasource == "nested"
    ));
    let other = Session::new(&pool);
    let err = other.begin().unwrap_err();
    assert!(err.is_session_error());
    assert!(!other.is_active());

    session.end().unwrap();
    other.begin().unwrap();
    other.end().unwrap();
}

#[test]
fn test_operations_require_active_session() {
    let (pool, _driver) = pool(test_config("inactive"));
    let session = Session::new(&pool);

    assert!(matches!(session.commit(), Err(PoolError::SessionNotActive { .. })));
    assert!(matches!(session.rollback(), Err(PoolError::SessionNotActive { .. })));
    assert!(matches!(session.end(), Err(PoolError::SessionNotActive { .. })));
    assert!(session.connection().is_err());

    session.begin().unwrap();
    session.end().unwrap();
    assert!(matches!(session.end(), Err(PoolError::SessionNotActive { .. })));
}

#[test]
fn test_close_inside_session_keeps_connection() {
    let (pool, driver) = pool(test_config("sticky"));
    let session = Session::new(&pool);
    session.begin().unwrap();

    let conn = pool.acquire().unwrap();
    conn.execute("INSERT INTO orders VALUES (1)").unwrap();
    conn.close().unwrap();

    assert_eq!(pool.status().in_use, 1);
    assert_eq!(driver.remote(0).unwrap().rollbacks(), 0);

    session.commit().unwrap();
    session.end().unwrap();
    assert_eq!(pool.status().in_use, 0);
    assert_eq!(pool.status().available, 1);
}

#[test]
fn test_auto_commit_forced_off_and_restored() {
    let (pool, driver) = pool(test_config("autocommit").auto_commit(true));
    let session = Session::new(&pool);
    session.begin().unwrap();

    let remote = driver.remote(0).unwrap();
    assert!(!remote.auto_commit());

    let conn = pool.acquire().unwrap();
    conn.set_auto_commit(true).unwrap();
    assert!(!remote.auto_commit());
    drop(conn);

    session.end().unwrap();
    assert!(remote.auto_commit());
}

#[test]
fn test_end_rolls_back_uncommitted_work() {
    let (pool, driver) = pool(test_config("undo"));
    let session = Session::new(&pool);
    session.begin().unwrap();
    pool.acquire()
        .unwrap()
        .execute("DELETE FROM orders")
        .unwrap();

    session.end().unwrap();

    let remote = driver.remote(0).unwrap();
    assert!(remote.rollbacks() >= 1);
    assert_eq!(remote.commits(), 0);
}

#[test]
fn test_end_failure_still_ends_session() {
    let (pool, driver) = pool(test_config("end-fails"));
    let session = Session::new(&pool);
    session.begin().unwrap();
    driver.remote(0).unwrap().fail_rollback(true);

    let err = session.end().unwrap_err();
    assert!(matches!(err, PoolError::SessionEnd { ref datasource, .. } if datasource == "end-fails"));
    assert!(!session.is_active());
    assert!(open_sessions().is_empty());
    assert_eq!(pool.status().in_use, 0);
}

#[test]
fn test_stale_session_connection_cannot_be_used() {
    let (pool, _driver) = pool(test_config("stale"));
    let session = Session::new(&pool);
    session.begin().unwrap();
    let kept = pool.acquire().unwrap();
    session.end().unwrap();

    let fresh = pool.acquire().unwrap();
    assert!(fresh.same_connection(&kept));
    assert!(matches!(
        kept.execute("SELECT 1"),
        Err(PoolError::LeaseEnded { .. })
    ));
    drop(kept);
    assert_eq!(pool.status().in_use, 1);
}

#[test]
fn test_leak_check_ends_forgotten_sessions() {
    let (orders, orders_driver) = pool(test_config("orders"));
    let (billing, billing_driver) = pool(test_config("billing"));

    Session::new(&orders).begin().unwrap();
    Session::new(&billing).begin().unwrap();
    assert_eq!(open_sessions(), vec!["billing".to_string(), "orders".to_string()]);
    assert_eq!(orders.status().in_use, 1);

    match check_connection_leak() {
        Err(PoolError::ConnectionLeakDetected { datasources }) => {
            assert_eq!(datasources, vec!["billing".to_string(), "orders".to_string()]);
        }
        other => panic!("expected leak detection, got {other:?}"),
    }

    assert!(open_sessions().is_empty());
    assert_eq!(orders.status().in_use, 0);
    assert_eq!(billing.status().in_use, 0);
    for driver in [&orders_driver, &billing_driver] {
        let remote = driver.remote(0).unwrap();
        assert!(remote.rollbacks() >= 1);
    }
    assert!(check_connection_leak().is_ok());
}

#[test]
fn test_sessions_are_per_thread() {
    let (pool, driver) = pool(test_config("threads").max_size(2));
    let session = Session::new(&pool);
    session.begin().unwrap();

    let other = {
        let pool = pool.clone();
        thread::spawn(move || {
            assert!(open_sessions().is_empty());
            let session = Session::new(&pool);
            session.begin().unwrap();
            let id = session.connection().unwrap().id();
            session.end().unwrap();
            id
        })
    };
    let other_id = other.join().unwrap();

    assert_ne!(other_id, session.connection().unwrap().id());
    assert_eq!(driver.connect_count(), 2);
    session.end().unwrap();
}

#[test]
fn test_close_from_other_thread_keeps_session_connection() {
    let (pool, driver) = pool(test_config("cross-thread"));
    let session = Session::new(&pool);
    session.begin().unwrap();

    let conn = pool.acquire().unwrap();
    let _statement = conn.prepare("SELECT * FROM orders").unwrap();
    thread::spawn(move || drop(conn)).join().unwrap();

    assert_eq!(pool.status().in_use, 1);
    assert_eq!(driver.remote(0).unwrap().statements_closed(), 1);
    assert!(session.is_active());
    session.end().unwrap();
}

#[test]
fn test_registry_lookup_and_sessions() {
    let (pool, _driver) = pool(test_config("registry"));
    let registry = DataSources::new();
    assert!(registry.register(pool.clone()).is_none());
    assert_eq!(registry.names(), vec!["registry".to_string()]);

    let conn = registry.connection("registry").unwrap();
    assert_eq!(conn.pool_name(), "registry");
    drop(conn);

    assert!(matches!(
        registry.connection("missing"),
        Err(PoolError::UnknownDataSource(ref name)) if name == "missing"
    ));

    let session = registry.session("registry").unwrap();
    session.begin().unwrap();
    let a = registry.connection("registry").unwrap();
    assert!(a.same_connection(&session.connection().unwrap()));
    drop(a);
    session.end().unwrap();

    registry.close_all();
    assert!(pool.is_closed());
    assert!(registry.get("registry").is_none());
}
