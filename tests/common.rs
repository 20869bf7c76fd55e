extern crate armada;

use std::collections::BTreeMap;
use std::sync::Arc;

use armada::agent::MockAgent;
use armada::clock::FakeClock;
use armada::cpi::MockCloud;
use armada::deploy::{Deployer, NullCompiler};
use armada::eventlog::{Event, EventLog, MemorySink, TaskState};
use armada::lock::LockManager;
use armada::update::Canceller;
use armada::{Config, Store};

/// Everything a test apply needs, with the doubles kept reachable
pub struct TestRig {
    pub deployer: Deployer,
    pub sink: MemorySink,
    pub agent: Arc<MockAgent>,
    pub cloud: Arc<MockCloud>,
    pub clock: Arc<FakeClock>,
}

pub fn rig() -> TestRig {
    let clock = Arc::new(FakeClock::at(1_500_000_000));
    let sink = MemorySink::new();
    let log = EventLog::new(Box::new(sink.clone()), clock.clone(), 1024);
    let agent = Arc::new(MockAgent::new());
    let cloud = Arc::new(MockCloud::new());
    let deployer = Deployer {
        config: Config::default(),
        store: Store::new(),
        cloud: cloud.clone(),
        agent: agent.clone(),
        compiler: Arc::new(NullCompiler),
        locks: LockManager::new(),
        clock: clock.clone(),
        log,
        cancel: Canceller::new(),
    };
    TestRig {
        deployer,
        sink,
        agent,
        cloud,
        clock,
    }
}

/// Two-job manifest: a serial db with a persistent disk, then a web tier
pub fn manifest(name: &str) -> String {
    let body = [
        "releases:",
        "- name: appcloud",
        "  version: 42",
        "networks:",
        "- name: default",
        "resource_pools:",
        "- name: small",
        "  size: 6",
        "  network: default",
        "  stemcell: {name: ubuntu, version: 2}",
        "update:",
        "  canaries: 1",
        "  max_in_flight: 2",
        "  canary_watch_time: 100-400",
        "  update_watch_time: 100-400",
        "properties:",
        "  domain: example.com",
        "jobs:",
        "- name: db",
        "  template: postgres",
        "  instances: 1",
        "  persistent_disk: 2048",
        "  resource_pool: small",
        "  networks: [default]",
        "- name: web",
        "  template: [router, app]",
        "  instances: 3",
        "  resource_pool: small",
        "  networks: [default]",
        "  update: {serial: false}",
    ].join("\n");
    format!("name: {}\n{}", name, body)
}

/// Assert the wire contract over one apply's recorded stream:
/// started first per task, at most one terminal, stable totals
pub fn assert_event_contract(events: &[Event]) {
    let mut totals: BTreeMap<&str, u32> = BTreeMap::new();
    let mut seen: BTreeMap<(&str, u32), Vec<TaskState>> = BTreeMap::new();
    for ev in events {
        let total = totals.entry(ev.stage.as_str()).or_insert(ev.total);
        assert_eq!(*total, ev.total, "total changed mid-stage in {}", ev.stage);
        if ev.index == 0 {
            assert!(ev.error.is_some(), "index 0 is reserved for stage errors");
            continue;
        }
        seen.entry((ev.stage.as_str(), ev.index))
            .or_insert_with(Vec::new)
            .push(ev.state);
    }
    for ((stage, index), states) in &seen {
        assert_eq!(
            states[0],
            TaskState::Started,
            "first event of {}/{} must be started",
            stage,
            index
        );
        let terminals = states
            .iter()
            .filter(|s| **s == TaskState::Finished || **s == TaskState::Failed)
            .count();
        assert!(terminals <= 1, "{}/{} has {} terminal events", stage, index, terminals);
    }
    // per stage: terminal count never exceeds the advertised total
    let mut terminal_per_stage: BTreeMap<&str, u32> = BTreeMap::new();
    for ev in events {
        if ev.index > 0 && (ev.state == TaskState::Finished || ev.state == TaskState::Failed) {
            *terminal_per_stage.entry(ev.stage.as_str()).or_insert(0) += 1;
        }
    }
    for (stage, terms) in terminal_per_stage {
        assert!(
            terms <= totals[stage],
            "stage {} has more terminals than its total",
            stage
        );
    }
}
