use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use sha2::{Digest, Sha256};

use eventlog::EventLog;
use plan::{properties, Action, Instance, Plan, TargetState};
use store::{InstanceRecord, Store};
use super::{ErrorKind, Result};

/// Outcome of preparing a plan against the store
pub struct Prepared {
    /// Records whose `(job, index)` is no longer in the plan
    pub obsolete: Vec<InstanceRecord>,
    pub used_stemcells: BTreeSet<(String, String)>,
}

/// The intended VM configuration for one instance
///
/// Hashing this JSON yields the spec digest; a digest change is what makes
/// an instance eligible for update.
pub fn target_spec(plan: &Plan, inst: &Instance) -> Value {
    let job = plan.job(&inst.job).expect("instances derive from jobs");
    let templates: Vec<&str> = job.templates.iter().map(|t| t.name.as_str()).collect();
    let pool = &plan.pools[&inst.pool];
    json!({
        "deployment": plan.name,
        "job": {
            "name": job.name,
            "release": job.release,
            "templates": templates,
        },
        "index": inst.index,
        "networks": inst.networks,
        "resource_pool": inst.pool,
        "stemcell": {
            "name": pool.stemcell.name,
            "version": pool.stemcell.version,
        },
        "persistent_disk": inst.persistent_disk,
        "properties": job.properties,
    })
}

pub fn spec_digest(spec: &Value) -> String {
    // object keys serialize sorted, so the digest is stable
    let text = spec.to_string();
    let mut hasher = Sha256::new();
    hasher.input(text.as_bytes());
    format!("{:x}", hasher.result())
}

/// Bind store records to the plan and classify every instance
///
/// Advertises the nine bind steps as the "Preparing deployment" stage.
/// After this the plan is read-only for the updaters.
pub fn prepare(plan: &mut Plan, store: &Store, log: &EventLog) -> Result<Prepared> {
    let stage = log.stage("Preparing deployment", 9);

    stage.track("Binding deployment", |_| bind_deployment(plan, store))?;
    stage.track("Binding releases", |_| bind_releases(plan, store))?;
    let existing = stage.track("Binding existing deployment", |_| store.instances_of(&plan.name))?;
    stage.track("Binding resource pools", |_| bind_resource_pools(plan))?;
    let used_stemcells = stage.track("Binding stemcells", |_| Ok(plan.used_stemcells()))?;
    stage.track("Binding templates", |_| bind_templates(plan))?;
    stage.track("Binding properties", |_| bind_properties(plan))?;
    stage.track("Binding unallocated VMs", |_| bind_unallocated_vms(plan, store, &existing))?;
    let obsolete = stage.track("Binding instance networks", |_| classify(plan, store, &existing))?;

    Ok(Prepared {
        obsolete,
        used_stemcells,
    })
}

fn bind_deployment(plan: &Plan, store: &Store) -> Result<()> {
    let renames: Vec<(String, String)> = plan
        .jobs
        .iter()
        .filter_map(|j| j.rename_from.clone().map(|old| (old, j.name.clone())))
        .collect();
    store.transaction(|t| {
        t.deployments
            .entry(plan.name.clone())
            .or_insert_with(|| ::store::DeploymentRecord {
                name: plan.name.clone(),
                ..Default::default()
            });
        // carry renamed job records over to their new identity
        for (old, new) in &renames {
            let moved: Vec<InstanceRecord> = t
                .instances
                .values()
                .filter(|i| i.deployment == plan.name && &i.job == old)
                .cloned()
                .collect();
            for mut rec in moved {
                t.instances.remove(&(plan.name.clone(), old.clone(), rec.index));
                rec.job = new.clone();
                t.instances.insert((plan.name.clone(), new.clone(), rec.index), rec);
            }
        }
        Ok(())
    })
}

fn bind_releases(plan: &Plan, store: &Store) -> Result<()> {
    for (name, version) in plan.release_set() {
        store.save_release_version(&name, &version)?;
    }
    Ok(())
}

// Re-check capacity now that the full plan exists; parse-time verification
// already covers the manifest, this keeps the invariant close to the data.
fn bind_resource_pools(plan: &Plan) -> Result<()> {
    let mut demand: BTreeMap<&str, u32> = BTreeMap::new();
    for inst in &plan.instances {
        *demand.entry(inst.pool.as_str()).or_insert(0) += 1;
    }
    for (pool, wanted) in demand {
        let size = plan.pools[pool].size;
        if wanted > size {
            return Err(ErrorKind::InvariantViolated(format!(
                "pool {} oversubscribed: {} > {}",
                pool, wanted, size
            )).into());
        }
    }
    Ok(())
}

fn bind_templates(plan: &Plan) -> Result<()> {
    for job in &plan.jobs {
        for t in &job.templates {
            if !plan.releases.contains_key(&t.release) {
                return Err(ErrorKind::UnknownRelease(t.release.clone()).into());
            }
        }
    }
    Ok(())
}

fn bind_properties(plan: &mut Plan) -> Result<()> {
    for i in 0..plan.jobs.len() {
        let bound = properties::bind(&plan.jobs[i], plan)?;
        plan.jobs[i].properties = bound;
    }
    Ok(())
}

// Hand idle VMs on the right stemcell to instances that have no record yet;
// ownership actually transfers when the instance updater commits.
fn bind_unallocated_vms(plan: &mut Plan, store: &Store, existing: &[InstanceRecord]) -> Result<()> {
    let known: BTreeSet<(String, u32)> = existing.iter().map(|r| (r.job.clone(), r.index)).collect();
    let mut idle: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, pool) in plan.pools.iter() {
        let vms = store.idle_vms(&plan.name, name)?;
        let good: Vec<String> = vms
            .into_iter()
            .filter(|v| v.stemcell == pool.stemcell.id())
            .map(|v| v.cid)
            .collect();
        idle.insert(name.clone(), good);
    }
    for inst in plan.instances.iter_mut() {
        if known.contains(&(inst.job.clone(), inst.index)) || inst.target == TargetState::Detached {
            continue;
        }
        if let Some(pool_idle) = idle.get_mut(&inst.pool) {
            if let Some(cid) = pool_idle.pop() {
                trace!("binding idle {} to {}", cid, inst.id());
                inst.vm = Some(cid);
            }
        }
    }
    Ok(())
}

// The last bind step settles network attachments, digests and the
// create/update/recreate/delete/noop classification.
fn classify(plan: &mut Plan, store: &Store, existing: &[InstanceRecord]) -> Result<Vec<InstanceRecord>> {
    let records: BTreeMap<(String, u32), &InstanceRecord> = existing
        .iter()
        .map(|r| ((r.job.clone(), r.index), r))
        .collect();

    let specs: Vec<(Value, String)> = plan
        .instances
        .iter()
        .map(|inst| {
            let spec = target_spec(plan, inst);
            let digest = spec_digest(&spec);
            (spec, digest)
        })
        .collect();

    for (i, inst) in plan.instances.iter_mut().enumerate() {
        inst.target_digest = Some(specs[i].1.clone());
        let rec = match records.get(&(inst.job.clone(), inst.index)) {
            None => {
                inst.action = Action::Create;
                continue;
            }
            Some(rec) => rec,
        };
        if inst.vm.is_none() {
            inst.vm = rec.vm_cid.clone();
        }
        inst.disk = rec.disk_cid.clone();
        inst.current_digest = rec.spec_digest.clone();

        let pool_stemcell = plan.pools[&inst.pool].stemcell.id();
        let stale_stemcell = match rec.vm_cid {
            Some(ref cid) => store
                .read(|t| t.vms.get(cid).map(|v| v.stemcell.clone()))?
                .map(|s| s != pool_stemcell)
                .unwrap_or(false),
            None => false,
        };

        inst.action = if inst.recreate || stale_stemcell || rec.networks != inst.networks {
            Action::Recreate
        } else if rec.spec_digest.as_ref() != Some(&specs[i].1) {
            Action::Update
        } else if rec.state != format!("{}", inst.target) {
            Action::Update
        } else {
            Action::Noop
        };
    }

    let planned: BTreeSet<(String, u32)> = plan
        .instances
        .iter()
        .map(|i| (i.job.clone(), i.index))
        .collect();
    let obsolete = existing
        .iter()
        .filter(|r| !planned.contains(&(r.job.clone(), r.index)))
        .cloned()
        .collect();
    Ok(obsolete)
}
