use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use super::{ErrorKind, Result};

#[derive(Default, Debug)]
struct Held {
    deployments: BTreeSet<String>,
    releases: BTreeMap<String, u32>,
}

/// Hands out the deployment and release locks an apply needs
///
/// The deployment lock is exclusive and held for the whole apply; release
/// locks are shared and only bracket the final release-set commit. Guards
/// release on drop so finalizers cannot forget them.
#[derive(Clone, Default)]
pub struct LockManager {
    held: Arc<Mutex<Held>>,
}

impl LockManager {
    pub fn new() -> LockManager {
        LockManager::default()
    }

    /// Exclusive per-deployment lock
    pub fn deployment(&self, name: &str) -> Result<DeploymentLock> {
        let mut held = self.held.lock().unwrap();
        if !held.deployments.insert(name.to_string()) {
            return Err(ErrorKind::LockUnavailable(format!("deployment:{}", name)).into());
        }
        debug!("acquired deployment lock {}", name);
        Ok(DeploymentLock {
            held: self.held.clone(),
            name: name.to_string(),
        })
    }

    /// Shared per-release lock
    pub fn release(&self, name: &str) -> Result<ReleaseLock> {
        let mut held = self.held.lock().unwrap();
        *held.releases.entry(name.to_string()).or_insert(0) += 1;
        debug!("acquired release lock {}", name);
        Ok(ReleaseLock {
            held: self.held.clone(),
            name: name.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct DeploymentLock {
    held: Arc<Mutex<Held>>,
    name: String,
}

impl Drop for DeploymentLock {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.deployments.remove(&self.name);
            debug!("released deployment lock {}", self.name);
        }
    }
}

pub struct ReleaseLock {
    held: Arc<Mutex<Held>>,
    name: String,
}

impl Drop for ReleaseLock {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            let gone = match held.releases.get_mut(&self.name) {
                Some(n) => {
                    *n -= 1;
                    *n == 0
                }
                None => false,
            };
            if gone {
                held.releases.remove(&self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LockManager;
    use ErrorKind;

    #[test]
    fn deployment_locks_are_exclusive() {
        let locks = LockManager::new();
        let first = locks.deployment("prod").unwrap();
        match locks.deployment("prod").unwrap_err().kind() {
            ErrorKind::LockUnavailable(n) => assert_eq!(n, "deployment:prod"),
            k => panic!("wrong kind: {}", k),
        }
        drop(first);
        assert!(locks.deployment("prod").is_ok());
    }

    #[test]
    fn release_locks_are_shared() {
        let locks = LockManager::new();
        let a = locks.release("appcloud").unwrap();
        let b = locks.release("appcloud").unwrap();
        drop(a);
        drop(b);
        assert!(locks.release("appcloud").is_ok());
    }
}
