//! Parent relink DST tests
//!
//! Seed-driven simulation of a device logging while its fog parent comes and
//! goes: discovery up/down events, sentinel failovers and fogs dropping off
//! the network. Every operation is picked from a seeded RNG, so a failing
//! seed replays the same operation sequence.
//!
//! ## Invariants
//!
//! 1. After a final relink the parent holds exactly the device's entries,
//!    in the device's id order
//! 2. No fog ever holds an entry the device did not write
//!
//! ## Test Categories
//!
//! - **Calm**: link changes only
//! - **Chaos**: link changes plus fogs becoming unreachable

mod common;

use common::{eventually, start_node, PORT};
use fogsync::datastream::DataStream;
use fogsync::transport::{EntryId, MemoryHub, MemoryServer};
use fogsync::{DiscoveryEvent, Level, NodeContext, ParentLink, SourceSpec};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

const FOGS: [&str; 3] = ["fog-0", "fog-1", "fog-2"];

#[derive(Debug, Clone, Copy)]
struct RelinkConfig {
    seed: u64,
    steps: usize,
    /// Percent chance per step of toggling a non-parent fog's reachability
    flap_percent: u32,
}

impl RelinkConfig {
    fn calm(seed: u64) -> Self {
        RelinkConfig {
            seed,
            steps: 60,
            flap_percent: 0,
        }
    }

    fn chaos(seed: u64) -> Self {
        RelinkConfig {
            seed,
            steps: 60,
            flap_percent: 15,
        }
    }
}

#[derive(Debug, Default)]
struct RelinkResult {
    seed: u64,
    trace: Vec<String>,
    logged: usize,
    relinks: usize,
    failed_relinks: usize,
    violations: Vec<String>,
}

impl RelinkResult {
    fn is_success(&self) -> bool {
        self.violations.is_empty()
    }

    fn summary(&self) -> String {
        format!(
            "seed={} ops={} logged={} relinks={} failed_relinks={} violations={}",
            self.seed,
            self.trace.len(),
            self.logged,
            self.relinks,
            self.failed_relinks,
            self.violations.len()
        )
    }
}

struct RelinkHarness {
    config: RelinkConfig,
    rng: StdRng,
    hub: MemoryHub,
    fogs: Vec<Arc<MemoryServer>>,
    reachable: Vec<bool>,
    device: Arc<NodeContext>,
    stream: Arc<DataStream>,
    result: RelinkResult,
}

impl RelinkHarness {
    async fn new(config: RelinkConfig) -> Self {
        let hub = MemoryHub::new();
        let fogs = FOGS.iter().map(|host| hub.start(host, PORT)).collect();
        let device = start_node(&hub, "d1", Level::Device, "device-host").await;
        let source = device
            .data_source(SourceSpec::logger("temp", Level::Fog))
            .unwrap();
        let stream = source.get_my_data_stream().unwrap();
        RelinkHarness {
            config,
            rng: StdRng::seed_from_u64(config.seed),
            hub,
            fogs,
            reachable: vec![true; FOGS.len()],
            device,
            stream,
            result: RelinkResult {
                seed: config.seed,
                ..RelinkResult::default()
            },
        }
    }

    fn current_fog(&self) -> Option<usize> {
        let link = self.device.parent_link()?;
        FOGS.iter().position(|host| *host == link.host)
    }

    fn record_relink(&mut self, op: &str, fog: usize, ok: bool) {
        self.result.trace.push(format!("{} {} ok={}", op, FOGS[fog], ok));
        self.result.relinks += 1;
        if !ok {
            self.result.failed_relinks += 1;
        }
    }

    async fn step(&mut self) {
        let roll = self.rng.gen_range(0..100u32);
        let fog = self.rng.gen_range(0..FOGS.len());
        let link = ParentLink::new(FOGS[fog], PORT);

        if roll < self.config.flap_percent {
            if self.current_fog() != Some(fog) {
                self.reachable[fog] = !self.reachable[fog];
                self.hub.set_reachable(FOGS[fog], PORT, self.reachable[fog]);
                self.result
                    .trace
                    .push(format!("reachable {} {}", FOGS[fog], self.reachable[fog]));
            }
            return;
        }

        match roll % 20 {
            0..=8 => {
                let value = self.result.logged as i64;
                self.device_log(value).await;
            }
            9..=11 => {
                let up = DiscoveryEvent::Up {
                    level: Level::Fog,
                    link,
                };
                let ok = self.device.handle_discovery_event(up).await.is_ok();
                self.record_relink("up", fog, ok);
            }
            12..=13 => {
                let ok = self.device.failover_to(link).await.is_ok();
                self.record_relink("failover", fog, ok);
            }
            14 => {
                let down = DiscoveryEvent::Down { level: Level::Fog };
                let _ = self.device.handle_discovery_event(down).await;
                self.result.trace.push("down".to_string());
            }
            _ => {
                let ms = self.rng.gen_range(0..8);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                self.result.trace.push(format!("sleep {}", ms));
            }
        }
    }

    async fn device_log(&mut self, value: i64) {
        match self.stream.log(value).await {
            Ok(_) => {
                self.result.logged += 1;
                self.result.trace.push(format!("log {}", value));
            }
            Err(e) => self
                .result
                .violations
                .push(format!("local log failed: {}", e)),
        }
    }

    async fn run(&mut self) {
        for _ in 0..self.config.steps {
            self.step().await;
        }
    }

    /// Heal the network, fail over to one fog and check what it holds
    async fn check_invariants(&mut self) {
        for (i, host) in FOGS.iter().enumerate() {
            self.hub.set_reachable(host, PORT, true);
            self.reachable[i] = true;
        }
        let logged = self.result.logged;
        let stream = self.stream.clone();
        eventually("local cache complete", || stream.size() == logged).await;
        let local: Vec<EntryId> = stream.data().iter().map(|p| p.id).collect();

        let last = self.rng.gen_range(0..FOGS.len());
        if let Err(e) = self.device.failover_to(ParentLink::new(FOGS[last], PORT)).await {
            self.result
                .violations
                .push(format!("final relink to {} failed: {}", FOGS[last], e));
            return;
        }

        let parent = self.fogs[last].clone();
        let key = stream.key().to_string();
        let settled = {
            let mut settled = false;
            for _ in 0..400 {
                let held: Vec<EntryId> = parent.log(&key).iter().map(|r| r.id).collect();
                if held == local {
                    settled = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            settled
        };
        if !settled {
            let held: Vec<EntryId> = parent.log(&key).iter().map(|r| r.id).collect();
            self.result.violations.push(format!(
                "{} holds {:?}, device holds {:?}",
                FOGS[last], held, local
            ));
        }

        for (host, fog) in FOGS.iter().zip(&self.fogs) {
            let stray: Vec<EntryId> = fog
                .log(&key)
                .iter()
                .map(|r| r.id)
                .filter(|id| !local.contains(id))
                .collect();
            if !stray.is_empty() {
                self.result
                    .violations
                    .push(format!("{} holds foreign entries {:?}", host, stray));
            }
        }
    }

    fn result(self) -> RelinkResult {
        self.result
    }
}

async fn run_seed(config: RelinkConfig) -> RelinkResult {
    let mut harness = RelinkHarness::new(config).await;
    harness.run().await;
    harness.check_invariants().await;
    harness.result()
}

async fn run_batch(start: u64, count: u64, make: fn(u64) -> RelinkConfig) -> Vec<RelinkResult> {
    let mut results = Vec::with_capacity(count as usize);
    for seed in start..start + count {
        results.push(run_seed(make(seed)).await);
    }
    results
}

fn failed_seeds(results: &[RelinkResult]) -> Vec<String> {
    results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| format!("{}: {:?}", r.seed, r.violations))
        .collect()
}

// =============================================================================
// Single Seed Tests
// =============================================================================

#[tokio::test]
async fn test_relink_dst_single_calm() {
    let result = run_seed(RelinkConfig::calm(12345)).await;
    println!("{}", result.summary());
    assert!(result.is_success(), "violations: {:?}", result.violations);
    assert!(result.logged > 0);
}

#[tokio::test]
async fn test_relink_dst_single_chaos() {
    let result = run_seed(RelinkConfig::chaos(99999)).await;
    println!("{}", result.summary());
    assert!(result.is_success(), "violations: {:?}", result.violations);
}

// =============================================================================
// Multi-Seed Batch Tests
// =============================================================================

#[tokio::test]
async fn test_relink_dst_20_seeds_calm() {
    let results = run_batch(0, 20, RelinkConfig::calm).await;
    for r in &results {
        println!("{}", r.summary());
    }
    let failed = failed_seeds(&results);
    assert!(failed.is_empty(), "failed seeds: {:?}", failed);
    assert!(results.iter().any(|r| r.relinks > 0));
}

#[tokio::test]
async fn test_relink_dst_20_seeds_chaos() {
    let results = run_batch(1000, 20, RelinkConfig::chaos).await;
    for r in &results {
        println!("{}", r.summary());
    }
    let failed = failed_seeds(&results);
    assert!(failed.is_empty(), "failed seeds: {:?}", failed);
}

// =============================================================================
// Determinism
// =============================================================================

#[tokio::test]
async fn test_relink_dst_determinism() {
    let seed = 42424242;
    let first = run_seed(RelinkConfig::chaos(seed)).await;
    let second = run_seed(RelinkConfig::chaos(seed)).await;
    assert_eq!(
        first.trace, second.trace,
        "same seed should replay the same operations"
    );
}
