use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use super::{ErrorKind, Result};

/// Last successful state of a deployment
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DeploymentRecord {
    pub name: String,
    /// Manifest text of the last successful apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    /// Exact `(name, version)` release set used
    #[serde(default)]
    pub release_versions: BTreeSet<(String, String)>,
    /// Stemcell join rows, reconciled on successful apply
    #[serde(default)]
    pub stemcells: BTreeSet<(String, String)>,
}

/// Current truth for one `(deployment, job, index)` slot
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InstanceRecord {
    pub deployment: String,
    pub job: String,
    pub index: u32,
    /// started | stopped | detached
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_digest: Option<String>,
    #[serde(default)]
    pub networks: Vec<String>,
}

/// A VM created through the CPI
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VmRecord {
    pub cid: String,
    pub deployment: String,
    pub pool: String,
    pub stemcell: (String, String),
    /// Idle VMs belong to their pool; allocated ones to an instance
    pub idle: bool,
}

/// A persistent disk created through the CPI
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DiskRecord {
    pub cid: String,
    pub deployment: String,
    pub size: u64,
    /// Set while attached to a VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<String>,
}

/// All record tables; cloned wholesale per transaction
#[derive(Clone, Debug, Default)]
pub struct Tables {
    pub deployments: BTreeMap<String, DeploymentRecord>,
    pub releases: BTreeSet<(String, String)>,
    pub stemcells: BTreeSet<(String, String)>,
    pub instances: BTreeMap<(String, String, u32), InstanceRecord>,
    pub vms: BTreeMap<String, VmRecord>,
    pub disks: BTreeMap<String, DiskRecord>,
}

/// The orchestrator's store handle
///
/// Multi-row updates go through `transaction`, which commits the mutated
/// tables only when the closure succeeds; an error leaves the store
/// untouched. The real persistence layer behind this interface is someone
/// else's problem.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Mutex<Tables>>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tables) -> Result<T>,
    {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| ErrorKind::StoreTransactionFailed("store mutex poisoned".into()))?;
        let mut work = guard.clone();
        match f(&mut work) {
            Ok(res) => {
                *guard = work;
                Ok(res)
            }
            Err(e) => Err(e),
        }
    }

    /// Read-only snapshot access
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tables) -> T,
    {
        let guard = self
            .inner
            .lock()
            .map_err(|_| ErrorKind::StoreTransactionFailed("store mutex poisoned".into()))?;
        Ok(f(&guard))
    }

    pub fn deployment(&self, name: &str) -> Result<Option<DeploymentRecord>> {
        self.read(|t| t.deployments.get(name).cloned())
    }

    pub fn instances_of(&self, deployment: &str) -> Result<Vec<InstanceRecord>> {
        self.read(|t| {
            t.instances
                .values()
                .filter(|i| i.deployment == deployment)
                .cloned()
                .collect()
        })
    }

    pub fn idle_vms(&self, deployment: &str, pool: &str) -> Result<Vec<VmRecord>> {
        self.read(|t| {
            t.vms
                .values()
                .filter(|v| v.idle && v.deployment == deployment && v.pool == pool)
                .cloned()
                .collect()
        })
    }

    /// Register a release version; versions are immutable once present
    pub fn save_release_version(&self, name: &str, version: &str) -> Result<()> {
        self.transaction(|t| {
            t.releases.insert((name.to_string(), version.to_string()));
            Ok(())
        })
    }

    /// Delete a release version; refused while any deployment references it
    pub fn delete_release_version(&self, name: &str, version: &str) -> Result<()> {
        self.transaction(|t| {
            let key = (name.to_string(), version.to_string());
            let held = t
                .deployments
                .values()
                .any(|d| d.release_versions.contains(&key));
            if held {
                bail!("release {}/{} is still referenced by a deployment", name, version);
            }
            t.releases.remove(&key);
            Ok(())
        })
    }

    /// Rewrite a deployment's release-version set and manifest in one go
    pub fn commit_deployment(
        &self,
        name: &str,
        manifest: &str,
        releases: &BTreeSet<(String, String)>,
    ) -> Result<()> {
        self.transaction(|t| {
            for r in releases {
                t.releases.insert(r.clone());
            }
            let d = t.deployments.entry(name.to_string()).or_insert_with(|| DeploymentRecord {
                name: name.to_string(),
                ..Default::default()
            });
            d.manifest = Some(manifest.to_string());
            d.release_versions = releases.clone();
            Ok(())
        })
    }

    /// Reconcile the stemcell join rows to exactly the used set
    pub fn update_stemcell_references(
        &self,
        deployment: &str,
        used: &BTreeSet<(String, String)>,
    ) -> Result<()> {
        self.transaction(|t| {
            for s in used {
                t.stemcells.insert(s.clone());
            }
            if let Some(d) = t.deployments.get_mut(deployment) {
                let stale: Vec<_> = d.stemcells.difference(used).cloned().collect();
                for s in &stale {
                    debug!("removing stale stemcell reference {}/{}", s.0, s.1);
                }
                d.stemcells = used.clone();
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use super::Store;

    #[test]
    fn transactions_roll_back_on_error() {
        let store = Store::new();
        store.save_release_version("app", "1").unwrap();
        let res: ::Result<()> = store.transaction(|t| {
            t.releases.insert(("app".into(), "2".into()));
            bail!("nope");
        });
        assert!(res.is_err());
        let releases = store.read(|t| t.releases.clone()).unwrap();
        assert_eq!(releases.len(), 1);
        assert!(releases.contains(&("app".into(), "1".into())));
    }

    #[test]
    fn release_versions_are_refcounted_by_deployments() {
        let store = Store::new();
        let mut set = BTreeSet::new();
        set.insert(("app".to_string(), "1".to_string()));
        store.commit_deployment("prod", "name: prod", &set).unwrap();
        assert!(store.delete_release_version("app", "1").is_err());

        // drop the reference, then deletion is allowed
        store.commit_deployment("prod", "name: prod", &BTreeSet::new()).unwrap();
        assert!(store.delete_release_version("app", "1").is_ok());
    }

    #[test]
    fn stemcell_references_reconcile_to_the_used_set() {
        let store = Store::new();
        let mut old = BTreeSet::new();
        old.insert(("ubuntu".to_string(), "1".to_string()));
        old.insert(("ubuntu".to_string(), "2".to_string()));
        store.commit_deployment("prod", "m", &BTreeSet::new()).unwrap();
        store.update_stemcell_references("prod", &old).unwrap();

        let mut used = BTreeSet::new();
        used.insert(("ubuntu".to_string(), "2".to_string()));
        store.update_stemcell_references("prod", &used).unwrap();
        let d = store.deployment("prod").unwrap().unwrap();
        assert_eq!(d.stemcells, used);
    }
}
