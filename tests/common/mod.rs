//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pool_balancer::health::active::{Probe, ProbeError};
use pool_balancer::health::{HealthThresholds, ManualClock};
use pool_balancer::{LoadBalancingContext, LoadBalancingEngine, Server};

pub fn server(id: &str, n: u8) -> Server {
    Server::new(id, format!("192.168.1.{}", n), 8080)
}

/// Round-robin engine on a manual clock, pre-loaded with `ids` in order.
pub fn engine_with(ids: &[&str]) -> (LoadBalancingEngine, Arc<ManualClock>) {
    engine_with_thresholds(ids, HealthThresholds::default())
}

pub fn engine_with_thresholds(
    ids: &[&str],
    thresholds: HealthThresholds,
) -> (LoadBalancingEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let engine = LoadBalancingEngine::builder()
        .thresholds(thresholds)
        .clock(clock.clone())
        .build();
    for (i, id) in ids.iter().enumerate() {
        engine.add_server(server(id, i as u8 + 1)).unwrap();
    }
    (engine, clock)
}

/// Run `n` selections and return the chosen ids.
pub fn select_ids(engine: &LoadBalancingEngine, n: usize) -> Vec<String> {
    let ctx = LoadBalancingContext::anonymous();
    (0..n)
        .map(|_| engine.select_server(&ctx).unwrap().id().to_string())
        .collect()
}

pub fn count(ids: &[String], id: &str) -> usize {
    ids.iter().filter(|s| s.as_str() == id).count()
}

/// Probe whose answer per server is controlled by the test.
#[derive(Default)]
pub struct ScriptedProbe {
    down: Mutex<HashSet<String>>,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_down(&self, id: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Probe for ScriptedProbe {
    async fn probe(&self, server: &Server) -> Result<(), ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let down = self.down.lock().unwrap().contains(server.id());
        if down {
            Err(ProbeError::Unhealthy(format!("{} is down", server.id())))
        } else {
            Ok(())
        }
    }
}
