use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Mutex;

use serde_json::Value;

use super::{Error, ErrorKind, Result, ResultExt};

/// Drain flavours offered to the agent before stopping
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DrainKind {
    /// The VM is going away
    Shutdown,
    /// The job is being updated in place
    Update,
}

/// Reduced agent state as reported by `get_state`
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AgentState {
    pub job_state: String,
}

impl AgentState {
    pub fn running(&self) -> bool {
        self.job_state == "running"
    }
}

/// Request/response RPC surface of the per-VM agent
///
/// Retries are up to the caller; every method is addressed by the VM cid the
/// agent runs on.
pub trait Agent: Send + Sync {
    fn prepare(&self, vm_cid: &str, spec: &Value) -> Result<()>;
    fn apply(&self, vm_cid: &str, spec: &Value) -> Result<()>;
    fn start(&self, vm_cid: &str) -> Result<()>;
    fn stop(&self, vm_cid: &str) -> Result<()>;
    fn drain(&self, vm_cid: &str, kind: DrainKind) -> Result<i64>;
    fn get_state(&self, vm_cid: &str) -> Result<AgentState>;
    fn run_errand(&self, vm_cid: &str, name: &str) -> Result<i32>;
}

/// Envelope for agent calls
#[derive(Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    arguments: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    value: Value,
}

/// HTTP client for real agents
///
/// Posts one JSON envelope per call to `{base}/agent/{vm_cid}` and reads a
/// `{value}` reply.
pub struct HttpAgent {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl HttpAgent {
    pub fn new(base: &str) -> Result<HttpAgent> {
        Ok(HttpAgent {
            client: reqwest::Client::new(),
            base: reqwest::Url::parse(base)?,
        })
    }

    fn call(&self, vm_cid: &str, method: &str, arguments: Value) -> Result<Value> {
        let url = self.base.join(&format!("agent/{}", vm_cid))?;
        debug!("POST {} {}", url, method);
        let mkerr = || ErrorKind::AgentUnreachable(vm_cid.to_string());
        let mut res = self
            .client
            .post(url.clone())
            .json(&RpcRequest { method, arguments })
            .send()
            .chain_err(&mkerr)?;
        if !res.status().is_success() {
            let err: Error = format!("unexpected HTTP status {}", res.status()).into();
            return Err(err).chain_err(&mkerr);
        }
        let mut body = String::new();
        res.read_to_string(&mut body)?;
        let reply: RpcResponse = serde_json::from_str(&body).chain_err(&mkerr)?;
        Ok(reply.value)
    }
}

impl Agent for HttpAgent {
    fn prepare(&self, vm_cid: &str, spec: &Value) -> Result<()> {
        self.call(vm_cid, "prepare", json!([spec])).map(|_| ())
    }

    fn apply(&self, vm_cid: &str, spec: &Value) -> Result<()> {
        self.call(vm_cid, "apply", json!([spec])).map(|_| ())
    }

    fn start(&self, vm_cid: &str) -> Result<()> {
        self.call(vm_cid, "start", json!([])).map(|_| ())
    }

    fn stop(&self, vm_cid: &str) -> Result<()> {
        self.call(vm_cid, "stop", json!([])).map(|_| ())
    }

    fn drain(&self, vm_cid: &str, kind: DrainKind) -> Result<i64> {
        let v = self.call(vm_cid, "drain", json!([kind]))?;
        Ok(v.as_i64().unwrap_or(0))
    }

    fn get_state(&self, vm_cid: &str) -> Result<AgentState> {
        let v = self.call(vm_cid, "get_state", json!([]))?;
        Ok(serde_json::from_value(v).chain_err(|| ErrorKind::AgentUnreachable(vm_cid.to_string()))?)
    }

    fn run_errand(&self, vm_cid: &str, name: &str) -> Result<i32> {
        let v = self.call(vm_cid, "run_errand", json!([name]))?;
        Ok(v.as_i64().unwrap_or(0) as i32)
    }
}

#[derive(Default)]
struct MockVm {
    applied: Option<Value>,
    started: bool,
    polls: u32,
}

/// Scriptable agent double
///
/// Every VM is immediately "running" after apply + start unless the test
/// delays readiness or scripts a failing apply for a given job/index (the
/// spec carries both, which saves tests from predicting cids).
#[derive(Default)]
pub struct MockAgent {
    vms: Mutex<BTreeMap<String, MockVm>>,
    fail_apply: Mutex<BTreeSet<(String, u32)>>,
    ready_after_polls: Mutex<u32>,
    max_inflight_applies: Mutex<(u32, u32)>, // (current, high water)
}

impl MockAgent {
    pub fn new() -> MockAgent {
        MockAgent::default()
    }

    /// Make `apply` fail for one `(job, index)` slot
    pub fn fail_apply(&self, job: &str, index: u32) {
        self.fail_apply.lock().unwrap().insert((job.to_string(), index));
    }

    /// Report "starting" for the first n polls of every VM
    pub fn ready_after(&self, polls: u32) {
        *self.ready_after_polls.lock().unwrap() = polls;
    }

    /// Largest number of concurrently applying instances observed
    pub fn max_concurrent_applies(&self) -> u32 {
        self.max_inflight_applies.lock().unwrap().1
    }

    fn spec_slot(spec: &Value) -> (String, u32) {
        let job = spec["job"]["name"].as_str().unwrap_or("").to_string();
        let index = spec["index"].as_u64().unwrap_or(0) as u32;
        (job, index)
    }
}

impl Agent for MockAgent {
    fn prepare(&self, _vm_cid: &str, _spec: &Value) -> Result<()> {
        Ok(())
    }

    fn apply(&self, vm_cid: &str, spec: &Value) -> Result<()> {
        {
            let mut gauge = self.max_inflight_applies.lock().unwrap();
            gauge.0 += 1;
            if gauge.0 > gauge.1 {
                gauge.1 = gauge.0;
            }
        }
        let res = if self.fail_apply.lock().unwrap().contains(&MockAgent::spec_slot(spec)) {
            let (job, index) = MockAgent::spec_slot(spec);
            Err(ErrorKind::AgentUnreachable(format!("{}/{}", job, index)).into())
        } else {
            let mut vms = self.vms.lock().unwrap();
            let vm = vms.entry(vm_cid.to_string()).or_insert_with(MockVm::default);
            vm.applied = Some(spec.clone());
            vm.polls = 0;
            Ok(())
        };
        self.max_inflight_applies.lock().unwrap().0 -= 1;
        res
    }

    fn start(&self, vm_cid: &str) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms.entry(vm_cid.to_string()).or_insert_with(MockVm::default);
        vm.started = true;
        Ok(())
    }

    fn stop(&self, vm_cid: &str) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms.entry(vm_cid.to_string()).or_insert_with(MockVm::default);
        vm.started = false;
        Ok(())
    }

    fn drain(&self, _vm_cid: &str, _kind: DrainKind) -> Result<i64> {
        Ok(0)
    }

    fn get_state(&self, vm_cid: &str) -> Result<AgentState> {
        let delay = *self.ready_after_polls.lock().unwrap();
        let mut vms = self.vms.lock().unwrap();
        let vm = vms.entry(vm_cid.to_string()).or_insert_with(MockVm::default);
        vm.polls += 1;
        let job_state = if vm.started && vm.applied.is_some() && vm.polls > delay {
            "running"
        } else if vm.started {
            "starting"
        } else {
            "stopped"
        };
        Ok(AgentState {
            job_state: job_state.into(),
        })
    }

    fn run_errand(&self, _vm_cid: &str, _name: &str) -> Result<i32> {
        Ok(0)
    }
}
