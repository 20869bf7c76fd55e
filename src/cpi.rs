use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::Value;

use super::{ErrorKind, Result};

/// The cloud provider interface consumed by the orchestrator
///
/// Calls may be long running; retries are up to the caller. Disks are never
/// deleted through this interface, only detached.
pub trait Cloud: Send + Sync {
    fn create_vm(
        &self,
        stemcell: &(String, String),
        cloud_properties: &Value,
        networks: &[String],
        disk_cids: &[String],
    ) -> Result<String>;
    fn delete_vm(&self, vm_cid: &str) -> Result<()>;
    fn create_disk(&self, size: u64, cloud_properties: &Value) -> Result<String>;
    fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<()>;
    fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<()>;
    fn snapshot_disk(&self, disk_cid: &str) -> Result<String>;
}

/// In-process cloud returning fabricated cids
///
/// Used by the binary when no adapter is configured, and by tests, which can
/// script the next create to fail.
#[derive(Default)]
pub struct MockCloud {
    counter: AtomicUsize,
    fail_next_create: AtomicBool,
    deleted: Mutex<Vec<String>>,
}

impl MockCloud {
    pub fn new() -> MockCloud {
        MockCloud::default()
    }

    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    pub fn deleted_vms(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", prefix, n)
    }
}

impl Cloud for MockCloud {
    fn create_vm(
        &self,
        stemcell: &(String, String),
        _cloud_properties: &Value,
        _networks: &[String],
        _disk_cids: &[String],
    ) -> Result<String> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(ErrorKind::CpiError("create_vm".into(), "scripted failure".into()).into());
        }
        let cid = self.next("vm");
        debug!("created {} from stemcell {}/{}", cid, stemcell.0, stemcell.1);
        Ok(cid)
    }

    fn delete_vm(&self, vm_cid: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(vm_cid.to_string());
        Ok(())
    }

    fn create_disk(&self, size: u64, _cloud_properties: &Value) -> Result<String> {
        let cid = self.next("disk");
        debug!("created {} ({}MB)", cid, size);
        Ok(cid)
    }

    fn attach_disk(&self, _vm_cid: &str, _disk_cid: &str) -> Result<()> {
        Ok(())
    }

    fn detach_disk(&self, _vm_cid: &str, _disk_cid: &str) -> Result<()> {
        Ok(())
    }

    fn snapshot_disk(&self, disk_cid: &str) -> Result<String> {
        Ok(format!("snap-{}", disk_cid))
    }
}
