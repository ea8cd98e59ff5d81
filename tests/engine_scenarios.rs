//! End-to-end behaviour of the engine: membership, health and round robin
//! selection working together.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::{count, engine_with, engine_with_thresholds, select_ids, server};
use pool_balancer::health::HealthThresholds;
use pool_balancer::{LoadBalancerError, LoadBalancingContext, ServerStatus};

#[test]
fn test_pool_lifecycle() {
    let (engine, _clock) = engine_with(&["a", "b", "c"]);

    let picks = select_ids(&engine, 6);
    assert_eq!(count(&picks, "a"), 2);
    assert_eq!(count(&picks, "b"), 2);
    assert_eq!(count(&picks, "c"), 2);

    engine.update_server_status("b", ServerStatus::Unhealthy).unwrap();
    let picks = select_ids(&engine, 4);
    assert_eq!(count(&picks, "a"), 2);
    assert_eq!(count(&picks, "b"), 0);
    assert_eq!(count(&picks, "c"), 2);

    let stats = engine.statistics();
    assert_eq!(stats.server("a").selected, 4);
    assert_eq!(stats.server("b").selected, 2);
    assert_eq!(stats.server("c").selected, 4);

    engine.remove_server("a").unwrap();
    assert_eq!(select_ids(&engine, 2), vec!["c", "c"]);

    engine.reset_statistics();
    let stats = engine.statistics();
    assert_eq!(stats.total_selections, 0);
    assert_eq!(stats.failed_selections, 0);
    assert!(stats.servers.values().all(|s| s.selected == 0));
    assert_eq!(stats.server_count, 2);
    assert_eq!(stats.healthy_server_count, 1);
    assert_eq!(engine.get_server("b").unwrap().status(), ServerStatus::Unhealthy);
}

#[test]
fn test_removing_unhealthy_server_keeps_rotation() {
    let (engine, _clock) = engine_with(&["a", "b", "c"]);
    engine.update_server_status("b", ServerStatus::Unhealthy).unwrap();
    engine.remove_server("b").unwrap();

    let picks = select_ids(&engine, 6);
    assert_eq!(picks, vec!["a", "c", "a", "c", "a", "c"]);
}

#[test]
fn test_duplicate_add_leaves_pool_unchanged() {
    let (engine, _clock) = engine_with(&["a", "b"]);
    assert_eq!(engine.servers().len(), 2);

    let err = engine.add_server(server("a", 9)).unwrap_err();
    assert_eq!(err, LoadBalancerError::DuplicateServer { id: "a".into() });
    assert_eq!(engine.servers().len(), 2);
    assert_eq!(engine.get_server("a").unwrap().address, "192.168.1.1");
}

#[test]
fn test_unknown_ids_are_rejected_without_side_effects() {
    let (engine, _clock) = engine_with(&["a"]);
    let before = engine.servers();

    let not_found = LoadBalancerError::ServerNotFound { id: "ghost".into() };
    assert_eq!(engine.remove_server("ghost").unwrap_err(), not_found);
    assert_eq!(engine.get_server("ghost").unwrap_err(), not_found);
    assert_eq!(
        engine.report_outcome("ghost", true, Duration::from_millis(5)).unwrap_err(),
        not_found
    );
    assert_eq!(
        engine.update_server_status("ghost", ServerStatus::Healthy).unwrap_err(),
        not_found
    );

    assert_eq!(engine.servers(), before);
    assert!(engine.statistics().servers.get("ghost").is_none());
}

#[test]
fn test_no_healthy_servers_counts_failed_selection() {
    let (engine, _clock) = engine_with(&[]);
    let ctx = LoadBalancingContext::anonymous();
    assert_eq!(engine.select_server(&ctx).unwrap_err(), LoadBalancerError::NoHealthyServers);

    engine.add_server(server("a", 1)).unwrap();
    engine.update_server_status("a", ServerStatus::Maintenance).unwrap();
    assert_eq!(engine.select_server(&ctx).unwrap_err(), LoadBalancerError::NoHealthyServers);

    let stats = engine.statistics();
    assert_eq!(stats.failed_selections, 2);
    assert_eq!(stats.total_selections, 0);
    assert_eq!(stats.total_requests(), 2);
}

#[test]
fn test_stale_metrics_demote_until_fresh_report() {
    let (engine, clock) = engine_with(&["a", "b"]);
    engine.report_outcome("a", true, Duration::from_millis(10)).unwrap();
    engine.report_outcome("b", true, Duration::from_millis(10)).unwrap();
    assert_eq!(engine.get_healthy_servers().len(), 2);

    clock.advance(Duration::from_secs(31));
    assert_eq!(engine.registry().evaluate_staleness(), 2);
    assert!(engine.get_healthy_servers().is_empty());

    let status = engine.report_outcome("b", true, Duration::from_millis(10)).unwrap();
    assert_eq!(status, ServerStatus::Healthy);
    assert_eq!(select_ids(&engine, 3), vec!["b", "b", "b"]);
}

#[test]
fn test_failures_take_server_out_of_rotation() {
    let thresholds = HealthThresholds {
        min_samples: 2,
        window: 4,
        ..HealthThresholds::default()
    };
    let (engine, _clock) = engine_with_thresholds(&["a", "b"], thresholds);

    let latency = Duration::from_millis(20);
    assert_eq!(engine.report_outcome("a", false, latency).unwrap(), ServerStatus::Healthy);
    assert_eq!(engine.report_outcome("a", false, latency).unwrap(), ServerStatus::Unhealthy);
    assert_eq!(select_ids(&engine, 2), vec!["b", "b"]);

    for _ in 0..3 {
        engine.report_outcome("a", true, latency).unwrap();
    }
    assert_eq!(engine.get_server("a").unwrap().status(), ServerStatus::Healthy);

    let stats = engine.statistics();
    assert_eq!(stats.server("a").failed, 2);
    assert_eq!(stats.server("a").succeeded, 3);
}

#[test]
fn test_lease_tracks_active_connections() {
    let (engine, _clock) = engine_with(&["a"]);
    let ctx = LoadBalancingContext::anonymous();

    let first = engine.lease(&ctx).unwrap();
    let second = engine.lease(&ctx).unwrap();
    assert_eq!(first.id(), "a");
    assert_eq!(engine.get_metrics("a").unwrap().active_connections, 2);

    drop(second);
    first.complete(true, Duration::from_millis(3)).unwrap();
    let metrics = engine.get_metrics("a").unwrap();
    assert_eq!(metrics.active_connections, 0);
    assert_eq!(metrics.successful_requests, 1);
}

#[test]
fn test_concurrent_selection_is_exactly_fair() {
    let (engine, _clock) = engine_with(&["a", "b", "c"]);
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            thread::spawn(move || select_ids(&engine, 300))
        })
        .collect();

    let picks: Vec<String> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(picks.len(), 2400);
    for id in ["a", "b", "c"] {
        assert_eq!(count(&picks, id), 800);
    }
    assert_eq!(engine.statistics().total_selections, 2400);
}

#[test]
fn test_concurrent_churn_never_selects_missing_server() {
    let (engine, _clock) = engine_with(&["a", "b", "c", "d"]);
    let engine = Arc::new(engine);

    let churn = {
        let engine = engine.clone();
        thread::spawn(move || {
            for i in 0..200 {
                let id = format!("churn-{}", i % 5);
                if engine.add_server(server(&id, 100)).is_err() {
                    engine.remove_server(&id).unwrap();
                }
                let status = if i % 2 == 0 {
                    ServerStatus::Unhealthy
                } else {
                    ServerStatus::Healthy
                };
                engine.update_server_status("b", status).unwrap();
            }
        })
    };

    let selectors: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            thread::spawn(move || {
                let ctx = LoadBalancingContext::anonymous();
                for _ in 0..500 {
                    let picked = engine.select_server(&ctx).unwrap();
                    assert!(!picked.id().is_empty());
                }
            })
        })
        .collect();

    churn.join().unwrap();
    for handle in selectors {
        handle.join().unwrap();
    }

    let stats = engine.statistics();
    assert_eq!(stats.total_selections, 2000);
    assert_eq!(stats.failed_selections, 0);
}

#[test]
fn test_random_operations_preserve_pool_invariants() {
    let mut rng = StdRng::seed_from_u64(7);
    let (engine, _clock) = engine_with(&[]);
    let ctx = LoadBalancingContext::anonymous();
    let ids = ["s0", "s1", "s2", "s3", "s4", "s5"];
    let statuses = [
        ServerStatus::Healthy,
        ServerStatus::Unhealthy,
        ServerStatus::Maintenance,
        ServerStatus::Unknown,
    ];
    let mut order: Vec<&str> = Vec::new();

    for _ in 0..2000 {
        let id = ids[rng.gen_range(0..ids.len())];
        match rng.gen_range(0..4) {
            0 => {
                if engine.add_server(server(id, 1)).is_ok() {
                    order.push(id);
                }
            }
            1 => {
                if engine.remove_server(id).is_ok() {
                    order.retain(|s| *s != id);
                }
            }
            2 => {
                let status = statuses[rng.gen_range(0..statuses.len())];
                let _ = engine.update_server_status(id, status);
            }
            _ => {
                let healthy: HashSet<String> = engine
                    .get_healthy_servers()
                    .iter()
                    .map(|s| s.id().to_string())
                    .collect();
                match engine.select_server(&ctx) {
                    Ok(picked) => assert!(healthy.contains(picked.id())),
                    Err(e) => {
                        assert_eq!(e, LoadBalancerError::NoHealthyServers);
                        assert!(healthy.is_empty());
                    }
                }
            }
        }

        let all: Vec<String> = engine.servers().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(all, order);

        let healthy = engine.get_healthy_servers();
        let mut last = 0;
        for s in &healthy {
            assert!(s.is_available() || s.status() == ServerStatus::Unknown);
            let pos = all.iter().position(|id| id == s.id()).unwrap();
            assert!(pos >= last);
            last = pos;
        }
    }
}
