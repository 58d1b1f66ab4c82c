//! Statement tracking and audit.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use dbpool::properties::{DB_STATEMENT_WARNING_THRESHOLD, ENABLE_AUDIT};
use dbpool::{DataSources, Pool, PoolError, PoolProperties};
use dbpool_testing::{MockConnector, test_config};

fn audited_pool(name: &str) -> (Pool, MockConnector, PoolProperties) {
    let driver = MockConnector::new();
    let properties = PoolProperties::new();
    properties.set(ENABLE_AUDIT, "true");
    let pool = Pool::with_properties(test_config(name), driver.clone(), properties.clone()).unwrap();
    (pool, driver, properties)
}

#[test]
fn test_statements_closed_when_connection_returned() {
    let driver = MockConnector::new();
    let pool = Pool::new(test_config("stmts"), driver.clone()).unwrap();

    let conn = pool.acquire().unwrap();
    let mut first = conn.prepare("SELECT * FROM orders").unwrap();
    let mut second = conn.prepare("SELECT * FROM lines").unwrap();
    assert_eq!(first.execute().unwrap(), 1);
    assert_eq!(first.sql(), "SELECT * FROM orders");
    drop(conn);

    let remote = driver.remote(0).unwrap();
    assert_eq!(remote.statements_closed(), 2);
    assert!(first.is_closed());
    assert!(matches!(first.execute(), Err(PoolError::StatementClosed)));
    assert!(matches!(second.execute(), Err(PoolError::StatementClosed)));
}

#[test]
fn test_explicit_statement_close() {
    let driver = MockConnector::new();
    let pool = Pool::new(test_config("explicit"), driver.clone()).unwrap();

    let conn = pool.acquire().unwrap();
    let statement = conn.prepare("UPDATE t SET x = 1").unwrap();
    statement.close().unwrap();
    drop(conn);

    assert_eq!(driver.remote(0).unwrap().statements_closed(), 1);
}

#[test]
fn test_reset_closes_statements_of_leased_connections() {
    let driver = MockConnector::new();
    let pool = Pool::new(test_config("hard-close"), driver.clone()).unwrap();

    let conn = pool.acquire().unwrap();
    let statement = conn.prepare("SELECT 1").unwrap();
    pool.reset();

    assert!(statement.is_closed());
    assert_eq!(driver.remote(0).unwrap().statements_closed(), 1);
}

#[test]
fn test_audit_requires_connection_flag_and_property() {
    let (pool, _driver, properties) = audited_pool("audit");

    let conn = pool.acquire().unwrap();
    assert!(!conn.prepare("SELECT 1").unwrap().is_audited());

    conn.enable_audit(true);
    assert!(conn.prepare("SELECT 1").unwrap().is_audited());

    properties.remove(ENABLE_AUDIT);
    assert!(!conn.prepare("SELECT 1").unwrap().is_audited());
}

#[test]
fn test_audit_switched_off_on_close() {
    let (pool, _driver, _properties) = audited_pool("audit-reset");

    let conn = pool.acquire().unwrap();
    conn.enable_audit(true);
    drop(conn);

    let conn = pool.acquire().unwrap();
    assert!(!conn.prepare("SELECT 1").unwrap().is_audited());
}

#[test]
fn test_slow_audited_statement_still_succeeds() {
    let (pool, driver, properties) = audited_pool("slow");
    properties.set(DB_STATEMENT_WARNING_THRESHOLD, "1");

    let conn = pool.acquire().unwrap();
    conn.enable_audit(true);
    driver
        .remote(0)
        .unwrap()
        .set_statement_delay(Duration::from_millis(5));

    let mut statement = conn.prepare("SELECT pg_sleep(0.005)").unwrap();
    assert_eq!(statement.execute().unwrap(), 1);
    assert_eq!(
        driver.remote(0).unwrap().executed(),
        vec!["SELECT pg_sleep(0.005)".to_string()]
    );
}

#[test]
fn test_audited_failure_propagates() {
    let (pool, driver, _properties) = audited_pool("audit-error");

    let conn = pool.acquire().unwrap();
    conn.enable_audit(true);
    let mut statement = conn.prepare("SELECT 1").unwrap();
    driver.remote(0).unwrap().fail_queries(true);

    assert!(matches!(statement.execute(), Err(PoolError::Driver(_))));
}

#[test]
fn test_registry_connection_with_audit() {
    let (pool, _driver, _properties) = audited_pool("registry-audit");
    let registry = DataSources::new();
    registry.register(pool);

    let conn = registry.connection_with_audit("registry-audit", true).unwrap();
    assert!(conn.prepare("SELECT 1").unwrap().is_audited());
    drop(conn);

    let conn = registry.connection_with_audit("registry-audit", false).unwrap();
    assert!(!conn.prepare("SELECT 1").unwrap().is_audited());
}
