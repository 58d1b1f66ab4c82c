//! Sweeper validation, idle eviction and replenishment.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::thread;
use std::time::{Duration, Instant};

use dbpool::properties::DATA_SOURCE_ALARM;
use dbpool::{AlertThresholds, Pool, PoolConfig, PoolProperties, SweepReport};
use dbpool_testing::{MockConnector, test_config};

fn pool(config: PoolConfig) -> (Pool, MockConnector) {
    let driver = MockConnector::new();
    let pool = Pool::new(config, driver.clone()).unwrap();
    (pool, driver)
}

#[test]
fn test_invalid_connection_replaced() {
    let (pool, driver) = pool(test_config("invalid").min_size(2).validation_query("SELECT 1"));
    driver.remote(0).unwrap().fail_queries(true);

    let report = pool.sweep();

    assert_eq!(
        report,
        SweepReport {
            validated: 2,
            invalid_removed: 1,
            idle_removed: 0,
            created: 1,
        }
    );
    assert!(driver.remote(0).unwrap().is_closed());
    assert_eq!(driver.connect_count(), 3);
    assert_eq!(pool.status().total, 2);

    let metrics = pool.metrics();
    assert_eq!(metrics.validations_performed, 2);
    assert_eq!(metrics.validations_failed, 1);
    assert_eq!(metrics.sweeps_performed, 1);
}

#[test]
fn test_validation_query_runs_on_free_connections() {
    let (pool, driver) = pool(test_config("validated").min_size(1).validation_query("SELECT 1"));
    pool.sweep();
    assert_eq!(driver.remote(0).unwrap().executed(), vec!["SELECT 1".to_string()]);
}

#[test]
fn test_no_validation_query_means_valid() {
    let (pool, driver) = pool(test_config("unchecked").min_size(1));
    driver.remote(0).unwrap().fail_queries(true);

    let report = pool.sweep();
    assert_eq!(report.invalid_removed, 0);
    assert!(!driver.remote(0).unwrap().is_closed());
}

#[test]
fn test_leased_connections_not_examined() {
    let (pool, driver) = pool(test_config("leased").validation_query("SELECT 1"));
    let conn = pool.acquire().unwrap();
    driver.remote(0).unwrap().fail_queries(true);

    let report = pool.sweep();

    assert_eq!(report.validated, 0);
    assert_eq!(pool.status().in_use, 1);
    assert!(!conn.is_closed());
}

#[test]
fn test_idle_connections_evicted_down_to_minimum() {
    let (pool, driver) = pool(
        test_config("idle")
            .min_size(1)
            .max_size(5)
            .idle_timeout(Duration::from_millis(10)),
    );

    let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
    drop(held);
    assert_eq!(pool.status().total, 3);

    thread::sleep(Duration::from_millis(40));
    let report = pool.sweep();

    assert_eq!(report.idle_removed, 2);
    assert_eq!(pool.status().total, 1);
    assert_eq!(driver.open_count(), 1);
}

#[test]
fn test_recently_used_connections_kept() {
    let (pool, _driver) = pool(
        test_config("fresh")
            .max_size(3)
            .idle_timeout(Duration::from_secs(60)),
    );
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    drop(a);
    drop(b);

    let report = pool.sweep();
    assert_eq!(report.idle_removed, 0);
    assert_eq!(pool.status().total, 2);
}

#[test]
fn test_replenishment_failure_retried_next_cycle() {
    let (pool, driver) = pool(test_config("heal").min_size(2).validation_query("SELECT 1"));
    for remote in driver.remotes() {
        remote.fail_queries(true);
    }
    driver.refuse_connections(true);

    let report = pool.sweep();
    assert_eq!(report.invalid_removed, 2);
    assert_eq!(report.created, 0);
    assert_eq!(pool.status().total, 0);

    driver.refuse_connections(false);
    let report = pool.sweep();
    assert_eq!(report.created, 2);
    assert_eq!(pool.status().total, 2);
}

#[test]
fn test_alarm_property_refreshed_each_sweep() {
    let properties = PoolProperties::new();
    let pool = Pool::with_properties(test_config("alarm"), MockConnector::new(), properties.clone())
        .unwrap();
    assert_eq!(pool.thresholds(), AlertThresholds::new(60, 80));

    properties.set(DATA_SOURCE_ALARM, "Warning=10%,Error=20%");
    pool.sweep();
    assert_eq!(pool.thresholds(), AlertThresholds::new(10, 20));

    properties.set(DATA_SOURCE_ALARM, "loud please");
    pool.sweep();
    assert_eq!(pool.thresholds(), AlertThresholds::new(10, 20));
}

#[test]
fn test_background_sweeper_heals_pool() {
    let (pool, driver) = pool(
        test_config("background")
            .min_size(1)
            .validation_query("SELECT 1")
            .sweep_interval(Duration::from_millis(10)),
    );
    driver.remote(0).unwrap().fail_queries(true);

    let deadline = Instant::now() + Duration::from_secs(5);
    while driver.connect_count() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    assert!(driver.remote(0).unwrap().is_closed());
    assert!(driver.connect_count() >= 2);
    assert!(pool.metrics().sweeps_performed >= 1);
}

#[test]
fn test_closed_pool_is_not_swept() {
    let (pool, driver) = pool(test_config("closed").min_size(1));
    pool.close();

    let report = pool.sweep();
    assert_eq!(report, SweepReport::default());
    assert_eq!(driver.connect_count(), 1);
}
